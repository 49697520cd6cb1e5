//! Wire format of the media server's event feed, and its translation into
//! [`PlaybackEvent`]s. Only the fields the tracker needs are parsed; unknown
//! message types and fields are ignored.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use playtrack_core::events::{PlaybackEvent, SessionDims};
use playtrack_core::ids::{DeviceId, MediaItemId, SessionKey, UserId};
use playtrack_core::FeedError;

/// Server ticks are 100ns units.
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Subscription message sent after connect: session snapshots every 2s.
pub const SUBSCRIBE_SESSIONS: &str = r#"{"MessageType":"SessionsStart","Data":"0,2000"}"#;

#[derive(Debug, Deserialize)]
pub struct FeedEnvelope {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(default, rename = "Data")]
    pub data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct WirePlayState {
    #[serde(default, rename = "PositionTicks")]
    pub position_ticks: Option<i64>,
    #[serde(default, rename = "IsPaused")]
    pub is_paused: bool,
}

#[derive(Debug, Deserialize)]
pub struct WireItem {
    #[serde(default, rename = "Id")]
    pub id: String,
    #[serde(default, rename = "Name")]
    pub name: String,
    #[serde(default, rename = "Type")]
    pub item_type: String,
    #[serde(default, rename = "SeriesName")]
    pub series_name: Option<String>,
    #[serde(default, rename = "ParentIndexNumber")]
    pub season_number: Option<i64>,
    #[serde(default, rename = "IndexNumber")]
    pub episode_number: Option<i64>,
    #[serde(default, rename = "RunTimeTicks")]
    pub runtime_ticks: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WireSession {
    #[serde(default, rename = "Id")]
    pub id: String,
    #[serde(default, rename = "UserId")]
    pub user_id: String,
    #[serde(default, rename = "UserName")]
    pub user_name: Option<String>,
    #[serde(default, rename = "DeviceId")]
    pub device_id: String,
    #[serde(default, rename = "DeviceName")]
    pub device_name: Option<String>,
    #[serde(default, rename = "Client")]
    pub client: Option<String>,
    #[serde(default, rename = "NowPlayingItem")]
    pub now_playing: Option<WireItem>,
    #[serde(default, rename = "PlayState")]
    pub play_state: Option<WirePlayState>,
}

#[derive(Debug, Deserialize)]
pub struct WirePlaybackStart {
    #[serde(default, rename = "SessionId")]
    pub session_id: String,
    #[serde(default, rename = "UserId")]
    pub user_id: String,
    #[serde(default, rename = "Username")]
    pub user_name: Option<String>,
    #[serde(default, rename = "DeviceId")]
    pub device_id: String,
    #[serde(default, rename = "DeviceName")]
    pub device_name: Option<String>,
    #[serde(default, rename = "Client")]
    pub client: Option<String>,
    #[serde(default, rename = "Item")]
    pub item: Option<WireItem>,
}

#[derive(Debug, Deserialize)]
pub struct WirePlaybackStopped {
    #[serde(default, rename = "SessionId")]
    pub session_id: String,
    #[serde(default, rename = "PlayState")]
    pub play_state: Option<WirePlayState>,
}

fn ticks_to_seconds(ticks: Option<i64>) -> Option<i64> {
    ticks.map(|t| t / TICKS_PER_SECOND)
}

fn dims_from(
    user_id: &str,
    user_name: Option<&str>,
    device_id: &str,
    device_name: Option<&str>,
    client: Option<&str>,
    item: &WireItem,
) -> SessionDims {
    SessionDims {
        user_id: UserId::from_raw(user_id),
        user_name: user_name.unwrap_or("Unknown").to_string(),
        device_id: DeviceId::from_raw(device_id),
        device_name: device_name.unwrap_or("Unknown").to_string(),
        client_name: client.unwrap_or("Unknown").to_string(),
        media_id: MediaItemId::from_raw(item.id.as_str()),
        media_title: if item.name.is_empty() { "Unknown".into() } else { item.name.clone() },
        media_type: if item.item_type.is_empty() { "Unknown".into() } else { item.item_type.clone() },
        series_name: item.series_name.clone(),
        season_number: item.season_number,
        episode_number: item.episode_number,
        runtime_seconds: ticks_to_seconds(item.runtime_ticks),
    }
}

/// Stateful translator from wire messages to playback events. Remembers the
/// set of sessions seen playing in the previous snapshot so a session that
/// vanishes produces an implied stop, the way the upstream feed signals most
/// playback ends.
#[derive(Default)]
pub struct FeedDecoder {
    last_active: HashSet<SessionKey>,
}

impl FeedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one raw text frame into zero or more events.
    pub fn decode(&mut self, raw: &str, at: DateTime<Utc>) -> Result<Vec<PlaybackEvent>, FeedError> {
        let envelope: FeedEnvelope =
            serde_json::from_str(raw).map_err(|e| FeedError::Parse(e.to_string()))?;

        match envelope.message_type.as_str() {
            "Sessions" => {
                let sessions: Vec<WireSession> = serde_json::from_value(envelope.data)
                    .map_err(|e| FeedError::Parse(format!("sessions payload: {e}")))?;
                Ok(self.decode_snapshot(&sessions, at))
            }
            "PlaybackStart" => {
                let start: WirePlaybackStart = serde_json::from_value(envelope.data)
                    .map_err(|e| FeedError::Parse(format!("playback start payload: {e}")))?;
                Ok(self.decode_playback_start(&start, at))
            }
            "PlaybackStopped" => {
                let stopped: WirePlaybackStopped = serde_json::from_value(envelope.data)
                    .map_err(|e| FeedError::Parse(format!("playback stopped payload: {e}")))?;
                Ok(self.decode_playback_stopped(&stopped, at))
            }
            // KeepAlive, ForceKeepAlive, library updates, ...
            _ => Ok(Vec::new()),
        }
    }

    /// Decode a full session snapshot (from the feed or the REST refresh):
    /// a progress event per playing session, plus implied stops for sessions
    /// that were playing last time and are gone now.
    pub fn decode_snapshot(
        &mut self,
        sessions: &[WireSession],
        at: DateTime<Utc>,
    ) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        let mut active = HashSet::new();

        for session in sessions {
            let Some(item) = &session.now_playing else { continue };
            if session.id.is_empty() {
                continue;
            }
            let key = SessionKey::from_raw(session.id.as_str());
            active.insert(key.clone());

            let play_state = session.play_state.as_ref();
            events.push(PlaybackEvent::Progress {
                session_key: key,
                at,
                dims: dims_from(
                    &session.user_id,
                    session.user_name.as_deref(),
                    &session.device_id,
                    session.device_name.as_deref(),
                    session.client.as_deref(),
                    item,
                ),
                position_seconds: ticks_to_seconds(play_state.and_then(|p| p.position_ticks))
                    .unwrap_or(0),
                paused: play_state.map(|p| p.is_paused).unwrap_or(false),
            });
        }

        for gone in self.last_active.difference(&active) {
            events.push(PlaybackEvent::Stop {
                session_key: gone.clone(),
                at,
                position_seconds: None,
            });
        }

        self.last_active = active;
        events
    }

    fn decode_playback_start(
        &mut self,
        start: &WirePlaybackStart,
        at: DateTime<Utc>,
    ) -> Vec<PlaybackEvent> {
        let Some(item) = &start.item else { return Vec::new() };
        if start.session_id.is_empty() {
            return Vec::new();
        }
        let key = SessionKey::from_raw(start.session_id.as_str());
        self.last_active.insert(key.clone());
        vec![PlaybackEvent::Start {
            session_key: key,
            at,
            dims: dims_from(
                &start.user_id,
                start.user_name.as_deref(),
                &start.device_id,
                start.device_name.as_deref(),
                start.client.as_deref(),
                item,
            ),
            position_seconds: 0,
            paused: false,
        }]
    }

    fn decode_playback_stopped(
        &mut self,
        stopped: &WirePlaybackStopped,
        at: DateTime<Utc>,
    ) -> Vec<PlaybackEvent> {
        if stopped.session_id.is_empty() {
            return Vec::new();
        }
        let key = SessionKey::from_raw(stopped.session_id.as_str());
        self.last_active.remove(&key);
        vec![PlaybackEvent::Stop {
            session_key: key,
            at,
            position_seconds: ticks_to_seconds(
                stopped.play_state.as_ref().and_then(|p| p.position_ticks),
            ),
        }]
    }
}
