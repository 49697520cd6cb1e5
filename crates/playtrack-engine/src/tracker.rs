use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use playtrack_core::events::{PlaybackEvent, SessionDims};
use playtrack_core::ids::SessionKey;
use playtrack_core::Settings;
use playtrack_store::sessions::{SessionRecord, SessionRepo};

use crate::health::HealthState;

/// Play-time credit tolerance over position advancement, to absorb feed
/// timing slack without crediting seeks or stalls as watch time.
const SEEK_TOLERANCE_SECS: i64 = 10;

/// A session is considered watched to completion when it closes at or past
/// this fraction of the item runtime.
const COMPLETION_THRESHOLD_NUM: i64 = 9;
const COMPLETION_THRESHOLD_DEN: i64 = 10;

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// No progress within this window closes the session on the next sweep.
    pub inactivity_timeout: chrono::Duration,
    /// How often the idle sweep ticks.
    pub sweep_interval: Duration,
    /// Total attempts for a single store write before the event is dropped.
    pub write_attempts: u32,
    /// Base delay for write retries (doubles per attempt).
    pub write_retry_base: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: chrono::Duration::minutes(5),
            sweep_interval: Duration::from_secs(60),
            write_attempts: 3,
            write_retry_base: Duration::from_millis(200),
        }
    }
}

impl TrackerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            inactivity_timeout: settings.session_timeout(),
            ..Default::default()
        }
    }
}

/// In-memory state of one open session.
#[derive(Clone, Debug)]
struct LiveSession {
    dims: SessionDims,
    started_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    position_seconds: i64,
    play_seconds: i64,
    paused_seconds: i64,
    last_paused: bool,
}

impl LiveSession {
    fn fresh(dims: SessionDims, at: DateTime<Utc>, position_seconds: i64, paused: bool) -> Self {
        Self {
            dims,
            started_at: at,
            last_seen_at: at,
            position_seconds,
            play_seconds: 0,
            paused_seconds: 0,
            last_paused: paused,
        }
    }

    /// Rebuild from a stored open row (tracker restart mid-session).
    fn from_record(record: &SessionRecord) -> Self {
        Self {
            dims: SessionDims {
                user_id: record.user_id.clone(),
                user_name: record.user_name.clone(),
                device_id: record.device_id.clone(),
                device_name: record.device_name.clone(),
                client_name: record.client_name.clone(),
                media_id: record.media_id.clone(),
                media_title: record.media_title.clone(),
                media_type: record.media_type.clone(),
                series_name: record.series_name.clone(),
                season_number: record.season_number,
                episode_number: record.episode_number,
                runtime_seconds: record.runtime_seconds,
            },
            started_at: record.started_at,
            last_seen_at: record.last_seen_at,
            position_seconds: record.position_seconds,
            play_seconds: record.play_seconds,
            paused_seconds: record.paused_seconds,
            last_paused: record.last_paused,
        }
    }

    /// Move the observation anchor without crediting the gap. Used when
    /// adopting a stored session after a restart.
    fn reanchor(&mut self, at: DateTime<Utc>, position_seconds: i64, paused: bool) {
        self.last_seen_at = at;
        self.position_seconds = position_seconds;
        self.last_paused = paused;
    }

    /// Apply a progress observation: the time since the previous observation
    /// goes to the paused accumulator if the session was paused, else to play
    /// time bounded by position advancement. An observation older than the
    /// current anchor is dropped whole — moving the anchor backwards would
    /// let the next event re-count an already-credited span.
    fn advance(&mut self, at: DateTime<Utc>, position_seconds: i64, paused: bool) {
        if at < self.last_seen_at {
            return;
        }
        let elapsed = (at - self.last_seen_at).num_seconds();
        if self.last_paused {
            self.paused_seconds += elapsed;
        } else {
            let position_delta = (position_seconds - self.position_seconds).max(0);
            self.play_seconds += elapsed.min(position_delta + SEEK_TOLERANCE_SECS);
        }
        self.position_seconds = position_seconds;
        self.last_paused = paused;
        self.last_seen_at = at;
    }

    /// Apply a stop observation and produce the final immutable record.
    fn close(mut self, key: &SessionKey, at: DateTime<Utc>, position_seconds: Option<i64>) -> SessionRecord {
        let elapsed = (at - self.last_seen_at).num_seconds().max(0);
        if self.last_paused {
            self.paused_seconds += elapsed;
        } else {
            let credit = match position_seconds {
                Some(position) => {
                    let position_delta = (position - self.position_seconds).max(0);
                    elapsed.min(position_delta + SEEK_TOLERANCE_SECS)
                }
                None => elapsed,
            };
            self.play_seconds += credit;
        }
        if let Some(position) = position_seconds {
            self.position_seconds = position;
        }
        self.last_seen_at = at;

        let completed = self
            .dims
            .runtime_seconds
            .map(|runtime| {
                runtime > 0
                    && self.position_seconds * COMPLETION_THRESHOLD_DEN
                        >= runtime * COMPLETION_THRESHOLD_NUM
            })
            .unwrap_or(false);

        let mut record = self.record(key, false);
        record.ended_at = Some(at);
        record.completed = completed;
        record
    }

    fn record(&self, key: &SessionKey, is_open: bool) -> SessionRecord {
        SessionRecord {
            session_key: key.clone(),
            user_id: self.dims.user_id.clone(),
            user_name: self.dims.user_name.clone(),
            device_id: self.dims.device_id.clone(),
            device_name: self.dims.device_name.clone(),
            client_name: self.dims.client_name.clone(),
            media_id: self.dims.media_id.clone(),
            media_title: self.dims.media_title.clone(),
            media_type: self.dims.media_type.clone(),
            series_name: self.dims.series_name.clone(),
            season_number: self.dims.season_number,
            episode_number: self.dims.episode_number,
            runtime_seconds: self.dims.runtime_seconds,
            started_at: self.started_at,
            last_seen_at: self.last_seen_at,
            ended_at: None,
            position_seconds: self.position_seconds,
            play_seconds: self.play_seconds,
            paused_seconds: self.paused_seconds,
            last_paused: self.last_paused,
            completed: false,
            is_open,
        }
    }

    fn open_record(&self, key: &SessionKey) -> SessionRecord {
        self.record(key, true)
    }
}

/// Consumes the ordered event stream and reconciles it into the store.
/// Owns the only map of open sessions; every state-changing transition
/// issues exactly one full-row upsert computed from that state.
pub struct Tracker {
    sessions: HashMap<SessionKey, LiveSession>,
    repo: SessionRepo,
    config: TrackerConfig,
    health: Arc<HealthState>,
}

impl Tracker {
    pub fn new(repo: SessionRepo, config: TrackerConfig, health: Arc<HealthState>) -> Self {
        Self {
            sessions: HashMap::new(),
            repo,
            config,
            health,
        }
    }

    pub fn open_len(&self) -> usize {
        self.sessions.len()
    }

    /// Run until the channel closes or cancellation. The idle sweep ticks
    /// inside this loop, so all state mutation stays single-threaded.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PlaybackEvent>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.reset(); // skip the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep_idle(Utc::now()).await,
            }
        }
        info!(open = self.sessions.len(), "tracker stopped");
    }

    #[instrument(skip(self, event), fields(session_key = %event.session_key(), kind = event.kind()))]
    pub async fn handle_event(&mut self, event: PlaybackEvent) {
        metrics::counter!("playtrack_tracker_events_total", "type" => event.kind()).increment(1);

        let record = match event {
            PlaybackEvent::Start { session_key, at, dims, position_seconds, paused } => {
                self.apply_start(session_key, at, dims, position_seconds, paused)
            }
            PlaybackEvent::Progress { session_key, at, dims, position_seconds, paused } => {
                self.apply_progress(session_key, at, dims, position_seconds, paused)
            }
            PlaybackEvent::Stop { session_key, at, position_seconds } => {
                self.apply_stop(session_key, at, position_seconds)
            }
        };

        if let Some(record) = record {
            self.persist(record).await;
        }
    }

    /// Close sessions with no progress inside the inactivity window. The end
    /// time is the last observation, so no phantom time is credited.
    pub async fn sweep_idle(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.config.inactivity_timeout;
        let stale: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, live)| live.last_seen_at < cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            if let Some(live) = self.sessions.remove(&key) {
                let last_seen = live.last_seen_at;
                let record = live.close(&key, last_seen, None);
                info!(session_key = %key, "session timed out");
                metrics::counter!("playtrack_sessions_timed_out_total").increment(1);
                self.persist(record).await;
            }
        }
    }

    fn apply_start(
        &mut self,
        key: SessionKey,
        at: DateTime<Utc>,
        dims: SessionDims,
        position_seconds: i64,
        paused: bool,
    ) -> Option<SessionRecord> {
        if self.sessions.contains_key(&key) {
            // Replayed start for a session we already track.
            return None;
        }
        let live = LiveSession::fresh(dims, at, position_seconds, paused);
        let record = live.open_record(&key);
        info!(session_key = %key, user = %record.user_name, media = %record.media_title, "session started");
        self.sessions.insert(key, live);
        Some(record)
    }

    fn apply_progress(
        &mut self,
        key: SessionKey,
        at: DateTime<Utc>,
        dims: SessionDims,
        position_seconds: i64,
        paused: bool,
    ) -> Option<SessionRecord> {
        if !self.sessions.contains_key(&key) {
            // Implicit start. If the store still has this session open (we
            // restarted mid-session), adopt it with its accumulators intact
            // and re-anchor so the unobserved gap is not credited.
            let live = match self.repo.get(&key) {
                Ok(record) if record.is_open => {
                    debug!(session_key = %key, "adopting open session from store");
                    let mut live = LiveSession::from_record(&record);
                    live.reanchor(at, position_seconds, paused);
                    live
                }
                _ => {
                    info!(session_key = %key, user = %dims.user_name, media = %dims.media_title, "session started");
                    LiveSession::fresh(dims, at, position_seconds, paused)
                }
            };
            let record = live.open_record(&key);
            self.sessions.insert(key, live);
            return Some(record);
        }

        let live = self.sessions.get_mut(&key)?;
        live.advance(at, position_seconds, paused);
        Some(live.open_record(&key))
    }

    fn apply_stop(
        &mut self,
        key: SessionKey,
        at: DateTime<Utc>,
        position_seconds: Option<i64>,
    ) -> Option<SessionRecord> {
        if let Some(live) = self.sessions.remove(&key) {
            let record = live.close(&key, at, position_seconds);
            info!(session_key = %key, play_seconds = record.play_seconds, "session ended");
            return Some(record);
        }

        // Unknown key: only meaningful if the store has an open row left
        // over from before a restart. A stop for an already-closed or
        // never-seen session is a replay and changes nothing.
        match self.repo.get(&key) {
            Ok(record) if record.is_open => {
                let live = LiveSession::from_record(&record);
                // Cap the unobserved gap at the inactivity window.
                let gap_limit = record.last_seen_at + self.config.inactivity_timeout;
                let end = at.min(gap_limit).max(record.last_seen_at);
                let closed = live.close(&key, end, position_seconds);
                info!(session_key = %key, "closed stored session on stop");
                Some(closed)
            }
            _ => {
                debug!(session_key = %key, "ignoring stop for unknown session");
                None
            }
        }
    }

    async fn persist(&mut self, record: SessionRecord) {
        let mut attempt: u32 = 0;
        loop {
            match self.repo.upsert(&record) {
                Ok(()) => {
                    self.health.record_store_success();
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.write_attempts {
                        let consecutive = self.health.record_store_failure();
                        metrics::counter!("playtrack_store_write_failures_total").increment(1);
                        error!(
                            error = %e,
                            session_key = %record.session_key,
                            consecutive,
                            "dropping session write after retries"
                        );
                        return;
                    }
                    let delay = self.config.write_retry_base * 2u32.pow(attempt - 1);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
