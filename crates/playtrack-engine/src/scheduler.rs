use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use playtrack_core::ids::SessionKey;
use playtrack_core::Settings;
use playtrack_store::aggregates::{AggregateDelta, AggregateKey, AggregateRepo, Granularity};
use playtrack_store::sessions::{SessionFilters, SessionRecord, SessionRepo};

use crate::error::EngineError;
use crate::health::HealthState;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Retention horizon in days; 0 disables pruning.
    pub retention_days: u32,
    /// Time between runs.
    pub interval: Duration,
    /// The interval expressed in hours, used in the cutoff formula.
    pub aggregation_interval_hours: u64,
    /// Sessions closed within this window compact into hourly buckets;
    /// older ones compact straight into daily buckets.
    pub hourly_window: chrono::Duration,
    /// Compaction cutoff when retention is disabled.
    pub raw_window: chrono::Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retention_days: settings.retention_days,
            interval: settings.aggregation_interval(),
            aggregation_interval_hours: settings.aggregation_interval_hours,
            hourly_window: chrono::Duration::days(settings.hourly_window_days as i64),
            raw_window: chrono::Duration::days(settings.raw_window_days as i64),
        }
    }
}

/// Outcome of one scheduler run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunReport {
    /// Another run was already in flight; this trigger was coalesced away.
    pub skipped: bool,
    /// Cancellation arrived mid-run; remaining units are left for next time.
    pub aborted: bool,
    pub compacted_sessions: usize,
    pub buckets_touched: usize,
    pub pruned_buckets: usize,
}

impl RunReport {
    fn skipped() -> Self {
        Self { skipped: true, ..Default::default() }
    }
}

/// One merge-then-delete unit: a bucket key, its summed totals, and the raw
/// rows it supersedes.
struct CompactionUnit {
    key: AggregateKey,
    delta: AggregateDelta,
    session_keys: Vec<SessionKey>,
}

/// Periodic retention and aggregation. Folds old raw sessions into hourly or
/// daily buckets (merge-then-delete per unit, each unit one transaction) and
/// prunes buckets beyond the retention horizon. At most one run at a time:
/// an overlapping trigger is skipped, never queued.
pub struct RetentionScheduler {
    sessions: SessionRepo,
    aggregates: AggregateRepo,
    config: SchedulerConfig,
    health: Arc<HealthState>,
    running: AtomicBool,
}

impl RetentionScheduler {
    pub fn new(
        sessions: SessionRepo,
        aggregates: AggregateRepo,
        config: SchedulerConfig,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            sessions,
            aggregates,
            config,
            health,
            running: AtomicBool::new(false),
        }
    }

    /// Run on the configured interval until cancelled. An in-flight unit is
    /// never aborted mid-transaction; cancellation is honored between units.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.run_once(Utc::now(), &cancel) {
                        Ok(report) if report.skipped => {
                            debug!("retention run already in flight, trigger coalesced");
                        }
                        Ok(report) => {
                            self.health.record_scheduler_success();
                            metrics::counter!("playtrack_retention_runs_total", "status" => "ok")
                                .increment(1);
                            info!(
                                compacted = report.compacted_sessions,
                                buckets = report.buckets_touched,
                                pruned = report.pruned_buckets,
                                aborted = report.aborted,
                                "retention run complete"
                            );
                        }
                        Err(e) => {
                            let consecutive = self.health.record_scheduler_failure();
                            metrics::counter!("playtrack_retention_runs_total", "status" => "error")
                                .increment(1);
                            error!(error = %e, consecutive, "retention run failed");
                        }
                    }
                }
            }
        }
        info!("retention scheduler stopped");
    }

    /// Execute one run now, unless one is already in flight. Committed units
    /// stay committed on failure; the next run retries the remainder.
    #[instrument(skip(self, cancel))]
    pub fn run_once(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(RunReport::skipped());
        }
        let result = self.run_locked(now, cancel);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_locked(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let mut report = RunReport::default();
        let cutoff = self.aggregation_cutoff(now);

        let rows = self
            .sessions
            .query_closed(cutoff, None, &SessionFilters::default())?;
        let units = group_into_units(rows, now, self.config.hourly_window)?;

        for unit in units {
            if cancel.is_cancelled() {
                report.aborted = true;
                break;
            }
            let deleted =
                self.aggregates
                    .compact_group(&unit.key, &unit.delta, &unit.session_keys)?;
            report.compacted_sessions += deleted;
            report.buckets_touched += 1;
            metrics::counter!("playtrack_compacted_sessions_total").increment(deleted as u64);
        }

        if !report.aborted && self.config.retention_days > 0 {
            let horizon = now - chrono::Duration::days(self.config.retention_days as i64);
            report.pruned_buckets = self.aggregates.prune_older_than(horizon)?;
            metrics::counter!("playtrack_pruned_buckets_total")
                .increment(report.pruned_buckets as u64);
        }

        Ok(report)
    }

    /// Sessions closed before this instant are eligible for compaction.
    /// With retention enabled, raw detail is kept until one aggregation
    /// interval short of the horizon; with retention disabled, the raw
    /// window bounds the raw table instead.
    fn aggregation_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.config.retention_days > 0 {
            let horizon = chrono::Duration::days(self.config.retention_days as i64);
            let interval = chrono::Duration::hours(self.config.aggregation_interval_hours as i64);
            (now - (horizon - interval)).min(now - interval)
        } else {
            now - self.config.raw_window
        }
    }
}

fn group_into_units(
    rows: Vec<SessionRecord>,
    now: DateTime<Utc>,
    hourly_window: chrono::Duration,
) -> Result<Vec<CompactionUnit>, EngineError> {
    let hourly_boundary = now - hourly_window;
    let mut groups: HashMap<AggregateKey, (AggregateDelta, Vec<SessionKey>, HashSet<String>)> =
        HashMap::new();

    for row in rows {
        // A session is attributed entirely to the bucket containing its
        // closed timestamp, even when its play time spans the boundary.
        let Some(ended_at) = row.ended_at else { continue };
        let (granularity, bucket_start) = if ended_at >= hourly_boundary {
            (
                Granularity::Hour,
                ended_at
                    .duration_trunc(chrono::Duration::hours(1))
                    .map_err(|e| EngineError::Time(e.to_string()))?,
            )
        } else {
            (
                Granularity::Day,
                ended_at
                    .duration_trunc(chrono::Duration::days(1))
                    .map_err(|e| EngineError::Time(e.to_string()))?,
            )
        };

        let key = AggregateKey {
            granularity,
            bucket_start,
            user_id: row.user_id.clone(),
            device_id: row.device_id.clone(),
            media_type: row.media_type.clone(),
        };
        let (delta, keys, media) = groups.entry(key).or_default();
        delta.session_count += 1;
        delta.play_seconds += row.play_seconds;
        delta.paused_seconds += row.paused_seconds;
        delta.user_name = row.user_name;
        delta.device_name = row.device_name;
        media.insert(row.media_id.as_str().to_string());
        keys.push(row.session_key);
    }

    let mut units: Vec<CompactionUnit> = groups
        .into_iter()
        .map(|(key, (mut delta, session_keys, media))| {
            delta.distinct_media = media.len() as i64;
            CompactionUnit { key, delta, session_keys }
        })
        .collect();
    units.sort_by(|a, b| a.key.bucket_start.cmp(&b.key.bucket_start));
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use playtrack_core::ids::{DeviceId, MediaItemId, UserId};
    use playtrack_store::Database;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn config(retention_days: u32) -> SchedulerConfig {
        SchedulerConfig {
            retention_days,
            interval: Duration::from_secs(3600),
            aggregation_interval_hours: 24,
            hourly_window: chrono::Duration::days(30),
            raw_window: chrono::Duration::days(30),
        }
    }

    fn setup(retention_days: u32) -> (Arc<RetentionScheduler>, SessionRepo, AggregateRepo, Database) {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let aggregates = AggregateRepo::new(db.clone());
        let scheduler = Arc::new(scheduler_over(&db, retention_days));
        (scheduler, sessions, aggregates, db)
    }

    fn scheduler_over(db: &Database, retention_days: u32) -> RetentionScheduler {
        RetentionScheduler::new(
            SessionRepo::new(db.clone()),
            AggregateRepo::new(db.clone()),
            config(retention_days),
            Arc::new(HealthState::new()),
        )
    }

    fn closed(key: &str, user: &str, media: &str, ended_at: DateTime<Utc>, play: i64) -> SessionRecord {
        SessionRecord {
            session_key: SessionKey::from_raw(key),
            user_id: UserId::from_raw(user),
            user_name: user.to_uppercase(),
            device_id: DeviceId::from_raw("d1"),
            device_name: "Living Room TV".into(),
            client_name: "TV App".into(),
            media_id: MediaItemId::from_raw(media),
            media_title: "Some Movie".into(),
            media_type: "Movie".into(),
            series_name: None,
            season_number: None,
            episode_number: None,
            runtime_seconds: None,
            started_at: ended_at - chrono::Duration::seconds(play),
            last_seen_at: ended_at,
            ended_at: Some(ended_at),
            position_seconds: play,
            play_seconds: play,
            paused_seconds: 0,
            last_paused: false,
            completed: false,
            is_open: false,
        }
    }

    #[test]
    fn old_session_folds_into_daily_bucket_and_rerun_is_noop() {
        let (scheduler, sessions, _, _db) = setup(180);
        let ended = now() - chrono::Duration::days(200);
        sessions.upsert(&closed("s1", "u1", "m1", ended, 5400)).unwrap();

        let report = scheduler.run_once(now(), &CancellationToken::new()).unwrap();
        assert_eq!(report.compacted_sessions, 1);
        assert_eq!(report.buckets_touched, 1);

        // Raw row gone, folded into its daily bucket, and that bucket is
        // already past the horizon, so the same run pruned it.
        assert!(sessions.get(&SessionKey::from_raw("s1")).is_err());
        assert_eq!(report.pruned_buckets, 1);

        let rerun = scheduler.run_once(now(), &CancellationToken::new()).unwrap();
        assert_eq!(rerun.compacted_sessions, 0);
        assert_eq!(rerun.pruned_buckets, 0);
    }

    #[test]
    fn bucket_totals_equal_raw_sums() {
        let (scheduler, sessions, aggregates, _db) = setup(0);
        let ended = now() - chrono::Duration::days(40);
        sessions.upsert(&closed("s1", "u1", "m1", ended, 600)).unwrap();
        sessions.upsert(&closed("s2", "u1", "m2", ended + chrono::Duration::minutes(5), 300)).unwrap();
        sessions.upsert(&closed("s3", "u2", "m1", ended, 900)).unwrap();

        scheduler.run_once(now(), &CancellationToken::new()).unwrap();

        let rows = aggregates.list(Some(Granularity::Day)).unwrap();
        assert_eq!(rows.len(), 2); // per-user buckets

        let u1 = rows.iter().find(|r| r.user_id.as_str() == "u1").unwrap();
        assert_eq!(u1.session_count, 2);
        assert_eq!(u1.play_seconds, 900);
        assert_eq!(u1.distinct_media, 2);

        let u2 = rows.iter().find(|r| r.user_id.as_str() == "u2").unwrap();
        assert_eq!(u2.play_seconds, 900);
        assert_eq!(u2.distinct_media, 1);
    }

    #[test]
    fn recent_sessions_stay_raw() {
        let (scheduler, sessions, aggregates, _db) = setup(180);
        let ended = now() - chrono::Duration::days(10);
        sessions.upsert(&closed("s1", "u1", "m1", ended, 600)).unwrap();

        let report = scheduler.run_once(now(), &CancellationToken::new()).unwrap();
        assert_eq!(report.compacted_sessions, 0);
        assert!(sessions.get(&SessionKey::from_raw("s1")).is_ok());
        assert!(aggregates.list(None).unwrap().is_empty());
    }

    #[test]
    fn retention_zero_compacts_but_never_prunes() {
        let (scheduler, sessions, aggregates, _db) = setup(0);
        let ended = now() - chrono::Duration::days(400);
        sessions.upsert(&closed("s1", "u1", "m1", ended, 600)).unwrap();

        let report = scheduler.run_once(now(), &CancellationToken::new()).unwrap();
        assert_eq!(report.compacted_sessions, 1);
        assert_eq!(report.pruned_buckets, 0);

        // Repeated runs never delete anything further.
        for _ in 0..3 {
            let rerun = scheduler.run_once(now(), &CancellationToken::new()).unwrap();
            assert_eq!(rerun.pruned_buckets, 0);
        }
        assert_eq!(aggregates.list(None).unwrap().len(), 1);
    }

    #[test]
    fn shrunk_horizon_prunes_old_buckets_without_resplitting() {
        let (scheduler, sessions, _, db) = setup(180);
        sessions
            .upsert(&closed("s1", "u1", "m1", now() - chrono::Duration::days(200), 600))
            .unwrap();
        sessions
            .upsert(&closed("s2", "u1", "m1", now() - chrono::Duration::days(100), 300))
            .unwrap();
        scheduler.run_once(now(), &CancellationToken::new()).unwrap();
        // The 100d session is inside the raw window for 180d retention and
        // stays raw for now.
        assert!(sessions.get(&SessionKey::from_raw("s2")).is_ok());

        // Policy change: a new process with a 90-day horizon.
        let tightened = scheduler_over(&db, 90);
        let report = tightened.run_once(now(), &CancellationToken::new()).unwrap();
        // s2 (100d) is now past the cutoff: folded into a daily bucket, and
        // that bucket is pruned in the same run as beyond the horizon.
        assert_eq!(report.compacted_sessions, 1);
        assert!(sessions.get(&SessionKey::from_raw("s2")).is_err());
        assert_eq!(report.pruned_buckets, 1);
    }

    #[test]
    fn hourly_granularity_for_recent_compaction() {
        // 25-day horizon: the cutoff lands 24 days back, inside the 30-day
        // hourly window, so eligible sessions get hourly buckets.
        let (scheduler, sessions, aggregates, _db) = setup(25);
        let ended = Utc.with_ymd_and_hms(2026, 2, 5, 0, 40, 0).unwrap();
        sessions.upsert(&closed("s1", "u1", "m1", ended, 600)).unwrap();

        let report = scheduler.run_once(now(), &CancellationToken::new()).unwrap();
        assert_eq!(report.compacted_sessions, 1);
        assert_eq!(report.pruned_buckets, 0);

        let rows = aggregates.list(Some(Granularity::Hour)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].bucket_start,
            Utc.with_ymd_and_hms(2026, 2, 5, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn empty_run_is_a_successful_noop() {
        let (scheduler, _, _, _db) = setup(180);
        let report = scheduler.run_once(now(), &CancellationToken::new()).unwrap();
        assert_eq!(report.compacted_sessions, 0);
        assert_eq!(report.pruned_buckets, 0);
        assert!(!report.skipped);
    }

    #[test]
    fn overlapping_trigger_is_coalesced() {
        let (scheduler, _, _, _db) = setup(180);
        scheduler.running.store(true, Ordering::SeqCst);
        let report = scheduler.run_once(now(), &CancellationToken::new()).unwrap();
        assert!(report.skipped);

        scheduler.running.store(false, Ordering::SeqCst);
        let report = scheduler.run_once(now(), &CancellationToken::new()).unwrap();
        assert!(!report.skipped);
    }

    #[test]
    fn cancellation_aborts_between_units() {
        let (scheduler, sessions, _, _db) = setup(180);
        let ended = now() - chrono::Duration::days(200);
        sessions.upsert(&closed("s1", "u1", "m1", ended, 600)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = scheduler.run_once(now(), &cancel).unwrap();
        assert!(report.aborted);
        // The unit was never started, so the raw row is intact for next run.
        assert!(sessions.get(&SessionKey::from_raw("s1")).is_ok());
    }

    #[test]
    fn cutoff_formula() {
        let (scheduler, _, _, _db) = setup(180);
        let cutoff = scheduler.aggregation_cutoff(now());
        assert_eq!(cutoff, now() - (chrono::Duration::days(180) - chrono::Duration::hours(24)));

        let (zero, _, _, _db2) = setup(0);
        assert_eq!(zero.aggregation_cutoff(now()), now() - chrono::Duration::days(30));
    }
}
