use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use playtrack_core::{FeedError, PlaybackEvent, Settings};

use crate::protocol::{FeedDecoder, WireSession, SUBSCRIBE_SESSIONS};

/// Reconnect backoff configuration.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay for a reconnect attempt: exponential backoff + jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        let final_ms = (capped + jitter).max(100.0);

        Duration::from_millis(final_ms as u64)
    }
}

/// Simple non-cryptographic random u64 using thread-local state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        );
    }

    STATE.with(|s| {
        // xorshift64
        let mut x = s.get().max(1);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

/// Shared feed liveness state, read by health and metrics.
#[derive(Default)]
pub struct FeedStatus {
    connected: AtomicBool,
    last_event_unix_ms: AtomicI64,
}

#[derive(Clone, Copy, Debug)]
pub struct FeedStatusSnapshot {
    pub connected: bool,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl FeedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn touch(&self, at: DateTime<Utc>) {
        self.last_event_unix_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FeedStatusSnapshot {
        let ms = self.last_event_unix_ms.load(Ordering::Relaxed);
        FeedStatusSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            last_event_at: (ms > 0)
                .then(|| Utc.timestamp_millis_opt(ms).single())
                .flatten(),
        }
    }
}

/// Long-lived event feed consumer. Connects to the media server's WebSocket,
/// subscribes to session snapshots, translates frames into [`PlaybackEvent`]s
/// and pushes them into the tracker's bounded channel. Reconnects with
/// backoff forever; the in-memory tracker state is untouched by reconnects.
pub struct FeedClient {
    settings: Settings,
    http: reqwest::Client,
    tx: mpsc::Sender<PlaybackEvent>,
    status: Arc<FeedStatus>,
    decoder: FeedDecoder,
    retry: RetryConfig,
}

impl FeedClient {
    pub fn new(settings: Settings, tx: mpsc::Sender<PlaybackEvent>, status: Arc<FeedStatus>) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
            tx,
            status,
            decoder: FeedDecoder::new(),
            retry: RetryConfig::default(),
        }
    }

    /// Run until cancelled or a fatal (non-retryable) error.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.connect_and_stream(&cancel, &mut attempt).await {
                Ok(()) => break,
                Err(FeedError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "event feed failed fatally, giving up");
                    break;
                }
                Err(e) => {
                    let delay = self.retry.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "event feed dropped, reconnecting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.status.set_connected(false);
    }

    async fn connect_and_stream(
        &mut self,
        cancel: &CancellationToken,
        attempt: &mut u32,
    ) -> Result<(), FeedError> {
        let url = self.settings.feed_ws_url();
        let (mut ws, _) = connect_async(url)
            .await
            .map_err(|e| FeedError::ConnectFailed(e.to_string()))?;

        self.status.set_connected(true);
        *attempt = 0;
        info!("connected to event feed");

        ws.send(Message::text(SUBSCRIBE_SESSIONS))
            .await
            .map_err(|e| FeedError::Disconnected(format!("subscribe: {e}")))?;

        // Adopt sessions that started while we were away.
        if let Err(e) = self.refresh_sessions().await {
            warn!(error = %e, "session refresh after connect failed");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    self.status.set_connected(false);
                    return Ok(());
                }
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(raw))) => self.handle_frame(raw.as_str()).await?,
                    Some(Ok(Message::Ping(payload))) => {
                        ws.send(Message::Pong(payload))
                            .await
                            .map_err(|e| FeedError::Disconnected(format!("pong: {e}")))?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.status.set_connected(false);
                        return Err(FeedError::Disconnected("server closed connection".into()));
                    }
                    Some(Ok(_)) => {} // binary / pong frames
                    Some(Err(e)) => {
                        self.status.set_connected(false);
                        return Err(FeedError::Disconnected(e.to_string()));
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, raw: &str) -> Result<(), FeedError> {
        let now = Utc::now();
        let events = match self.decoder.decode(raw, now) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "skipping unparseable feed message");
                return Ok(());
            }
        };
        self.status.touch(now);
        self.forward(events).await
    }

    async fn forward(&self, events: Vec<PlaybackEvent>) -> Result<(), FeedError> {
        for event in events {
            metrics::counter!("playtrack_feed_events_total", "type" => event.kind()).increment(1);
            if self.tx.send(event).await.is_err() {
                // Tracker is gone — the process is shutting down.
                return Err(FeedError::Cancelled);
            }
        }
        Ok(())
    }

    /// REST catch-up: fetch the live session list and feed it through the
    /// decoder as a snapshot.
    async fn refresh_sessions(&mut self) -> Result<(), FeedError> {
        let url = format!("{}/Sessions", self.settings.server_url);
        let response = self
            .http
            .get(&url)
            .query(&[("api_key", self.settings.api_token.expose_secret())])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| FeedError::Http { status: 0, body: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::from_status(status.as_u16(), body));
        }

        let sessions: Vec<WireSession> = response
            .json()
            .await
            .map_err(|e| FeedError::Parse(e.to_string()))?;

        let events = self.decoder.decode_snapshot(&sessions, Utc::now());
        self.forward(events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_snapshot_roundtrip() {
        let status = FeedStatus::new();
        let snap = status.snapshot();
        assert!(!snap.connected);
        assert!(snap.last_event_at.is_none());

        let now = Utc::now();
        status.set_connected(true);
        status.touch(now);
        let snap = status.snapshot();
        assert!(snap.connected);
        assert_eq!(
            snap.last_event_at.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[test]
    fn retry_delay_exponential_without_jitter() {
        let retry = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        };
        assert_eq!(retry.delay(0).as_millis(), 100);
        assert_eq!(retry.delay(1).as_millis(), 200);
        assert_eq!(retry.delay(2).as_millis(), 400);
    }

    #[test]
    fn retry_delay_capped_at_max() {
        let retry = RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.0,
        };
        assert_eq!(retry.delay(10).as_millis(), 5000);
    }

    #[test]
    fn retry_delay_has_floor() {
        let retry = RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_factor: 0.0,
        };
        assert_eq!(retry.delay(0).as_millis(), 100);
    }
}
