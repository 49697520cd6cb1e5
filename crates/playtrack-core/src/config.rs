use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

/// Process-wide configuration. Loaded once at startup from compiled defaults
/// overridden by `PLAYTRACK_*` environment variables, then passed down by
/// value — immutable for the process lifetime.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Base HTTP URL of the media server.
    pub server_url: String,
    /// API token for the media server's WebSocket and REST surfaces.
    pub api_token: SecretString,
    /// SQLite database path.
    pub database_path: PathBuf,
    /// Port for the local HTTP surface (health, metrics, stats API).
    pub http_port: u16,
    /// Inactivity window after which an open session is closed by the sweep.
    pub session_timeout_minutes: u64,
    /// Retention horizon in days. 0 disables pruning entirely.
    pub retention_days: u32,
    /// How often the retention scheduler runs.
    pub aggregation_interval_hours: u64,
    /// Sessions closed within this many days compact into hourly buckets;
    /// older ones go straight to daily buckets.
    pub hourly_window_days: u32,
    /// Compaction cutoff when retention is disabled: raw sessions older than
    /// this are still folded into aggregates to bound the raw table.
    pub raw_window_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8096".into(),
            api_token: SecretString::from(""),
            database_path: PathBuf::from("./data/playtrack.db"),
            http_port: 8085,
            session_timeout_minutes: 5,
            retention_days: 180,
            aggregation_interval_hours: 24,
            hourly_window_days: 30,
            raw_window_days: 30,
        }
    }
}

impl Settings {
    /// Load settings from the process environment over compiled defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup. Unset or unparsable
    /// values fall back to the compiled default for that key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            server_url: lookup("PLAYTRACK_SERVER_URL").unwrap_or(defaults.server_url),
            api_token: lookup("PLAYTRACK_API_TOKEN")
                .map(SecretString::from)
                .unwrap_or(defaults.api_token),
            database_path: lookup("PLAYTRACK_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            http_port: parsed(&lookup, "PLAYTRACK_HTTP_PORT", defaults.http_port),
            session_timeout_minutes: parsed(
                &lookup,
                "PLAYTRACK_SESSION_TIMEOUT_MINUTES",
                defaults.session_timeout_minutes,
            ),
            retention_days: parsed(&lookup, "PLAYTRACK_RETENTION_DAYS", defaults.retention_days),
            aggregation_interval_hours: parsed(
                &lookup,
                "PLAYTRACK_AGGREGATION_INTERVAL_HOURS",
                defaults.aggregation_interval_hours,
            ),
            hourly_window_days: parsed(
                &lookup,
                "PLAYTRACK_HOURLY_WINDOW_DAYS",
                defaults.hourly_window_days,
            ),
            raw_window_days: parsed(&lookup, "PLAYTRACK_RAW_WINDOW_DAYS", defaults.raw_window_days),
        }
    }

    /// WebSocket URL for the media server event feed, derived from the HTTP
    /// URL the same way the server's own clients do.
    pub fn feed_ws_url(&self) -> String {
        let base = self
            .server_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/socket?api_key={}", base, self.api_token.expose_secret())
    }

    pub fn has_api_token(&self) -> bool {
        !self.api_token.expose_secret().is_empty()
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_timeout_minutes as i64)
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_hours * 3600)
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
