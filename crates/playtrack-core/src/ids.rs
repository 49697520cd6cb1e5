use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh identifier. Most identifiers in this system are
            /// assigned by the upstream media server and enter through
            /// [`from_raw`](Self::from_raw); `new` exists for imports and tests.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionKey, "play");
branded_id!(UserId, "user");
branded_id!(DeviceId, "dev");
branded_id!(MediaItemId, "media");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_has_prefix() {
        let key = SessionKey::new();
        assert!(key.as_str().starts_with("play_"), "got: {key}");
    }

    #[test]
    fn from_raw_preserves_upstream_value() {
        let key = SessionKey::from_raw("c2ff6f0a8b964d26");
        assert_eq!(key.as_str(), "c2ff6f0a8b964d26");
    }

    #[test]
    fn keys_are_unique() {
        let a = SessionKey::new();
        let b = SessionKey::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = MediaItemId::new();
        let s = id.to_string();
        let parsed: MediaItemId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_roundtrip() {
        let id = UserId::from_raw("u-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"u-42\"");
        let parsed: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
