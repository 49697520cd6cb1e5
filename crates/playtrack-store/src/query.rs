use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::sessions::{collect_sessions, SessionFilters, SessionRecord, SESSION_COLUMNS};

/// Read-only composition over raw sessions and aggregate buckets. Callers
/// never see the compaction boundary: every series UNIONs both tables, so a
/// window that crosses into compacted history still adds up.
pub struct QueryFacade {
    db: Database,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SummaryStats {
    pub total_sessions: i64,
    pub unique_users: i64,
    pub unique_media: i64,
    pub play_seconds: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct DailyStat {
    pub date: String,
    pub session_count: i64,
    pub play_seconds: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct UserWatchtime {
    pub user_id: String,
    pub user_name: String,
    pub session_count: i64,
    pub play_seconds: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TopMedia {
    pub media_key: String,
    pub media_title: String,
    pub media_type: String,
    pub play_count: i64,
    pub play_seconds: i64,
}

impl QueryFacade {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Cheap liveness probe for health checks.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    /// Count of currently open sessions.
    pub fn open_count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM sessions WHERE is_open = 1", [], |row| {
                row.get(0)
            })
            .map_err(Into::into)
        })
    }

    /// Total tracked sessions, raw plus compacted.
    pub fn total_sessions(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let raw: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
            let compacted: i64 = conn.query_row(
                "SELECT COALESCE(SUM(session_count), 0) FROM session_aggregates",
                [],
                |row| row.get(0),
            )?;
            Ok(raw + compacted)
        })
    }

    /// Currently open sessions, newest first.
    pub fn active_sessions(&self, filters: &SessionFilters) -> Result<Vec<SessionRecord>, StoreError> {
        let (filter_sql, params) = filters.clause();
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE is_open = 1{filter_sql}
             ORDER BY started_at DESC"
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            collect_sessions(&mut stmt, rusqlite::params_from_iter(params.iter()))
        })
    }

    /// Totals since `since`: sessions, unique users, unique media, play time.
    #[instrument(skip(self, filters))]
    pub fn summary(
        &self,
        since: DateTime<Utc>,
        filters: &SessionFilters,
    ) -> Result<SummaryStats, StoreError> {
        let (filter_sql, filter_params) = filters.clause();
        let since_raw = since.to_rfc3339();

        self.db.with_conn(|conn| {
            let totals_sql = format!(
                "SELECT COALESCE(SUM(sessions), 0), COALESCE(SUM(play_seconds), 0) FROM (
                     SELECT COUNT(*) AS sessions, COALESCE(SUM(play_seconds), 0) AS play_seconds
                     FROM sessions WHERE started_at >= ?{filter_sql}
                     UNION ALL
                     SELECT COALESCE(SUM(session_count), 0), COALESCE(SUM(play_seconds), 0)
                     FROM session_aggregates WHERE bucket_start >= ?{filter_sql}
                 )"
            );
            let mut params: Vec<String> = vec![since_raw.clone()];
            params.extend(filter_params.iter().cloned());
            params.push(since_raw.clone());
            params.extend(filter_params.iter().cloned());
            let (total_sessions, play_seconds): (i64, i64) = conn.query_row(
                &totals_sql,
                rusqlite::params_from_iter(params.iter()),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let users_sql = format!(
                "SELECT COUNT(DISTINCT user_id) FROM (
                     SELECT user_id FROM sessions WHERE started_at >= ?{filter_sql}
                     UNION
                     SELECT user_id FROM session_aggregates WHERE bucket_start >= ?{filter_sql}
                 )"
            );
            let unique_users: i64 = conn.query_row(
                &users_sql,
                rusqlite::params_from_iter(params.iter()),
                |row| row.get(0),
            )?;

            // Aggregates do not retain media identity; the compacted share of
            // the distinct count is the merged per-bucket figure.
            let raw_media_sql = format!(
                "SELECT COUNT(DISTINCT media_id) FROM sessions WHERE started_at >= ?{filter_sql}"
            );
            let mut raw_params: Vec<String> = vec![since_raw.clone()];
            raw_params.extend(filter_params.iter().cloned());
            let raw_media: i64 = conn.query_row(
                &raw_media_sql,
                rusqlite::params_from_iter(raw_params.iter()),
                |row| row.get(0),
            )?;
            let agg_media_sql = format!(
                "SELECT COALESCE(SUM(distinct_media), 0) FROM session_aggregates
                 WHERE bucket_start >= ?{filter_sql}"
            );
            let agg_media: i64 = conn.query_row(
                &agg_media_sql,
                rusqlite::params_from_iter(raw_params.iter()),
                |row| row.get(0),
            )?;

            Ok(SummaryStats {
                total_sessions,
                unique_users,
                unique_media: raw_media + agg_media,
                play_seconds,
            })
        })
    }

    /// Per-day session counts and play time, oldest day first.
    #[instrument(skip(self, filters))]
    pub fn daily_series(
        &self,
        since: DateTime<Utc>,
        filters: &SessionFilters,
    ) -> Result<Vec<DailyStat>, StoreError> {
        let (filter_sql, filter_params) = filters.clause();
        let since_raw = since.to_rfc3339();
        let sql = format!(
            "SELECT day, SUM(session_count), SUM(play_seconds) FROM (
                 SELECT date(COALESCE(ended_at, started_at)) AS day,
                        COUNT(*) AS session_count,
                        COALESCE(SUM(play_seconds), 0) AS play_seconds
                 FROM sessions
                 WHERE COALESCE(ended_at, started_at) >= ?{filter_sql}
                 GROUP BY day
                 UNION ALL
                 SELECT date(bucket_start), SUM(session_count), SUM(play_seconds)
                 FROM session_aggregates
                 WHERE bucket_start >= ?{filter_sql}
                 GROUP BY date(bucket_start)
             )
             GROUP BY day ORDER BY day"
        );
        let mut params: Vec<String> = vec![since_raw.clone()];
        params.extend(filter_params.iter().cloned());
        params.push(since_raw);
        params.extend(filter_params);

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(DailyStat {
                    date: row.get(0)?,
                    session_count: row.get(1)?,
                    play_seconds: row.get(2)?,
                });
            }
            Ok(results)
        })
    }

    /// Watch time per user, most-watched first.
    #[instrument(skip(self, filters))]
    pub fn user_watchtime(
        &self,
        since: DateTime<Utc>,
        filters: &SessionFilters,
    ) -> Result<Vec<UserWatchtime>, StoreError> {
        let (filter_sql, filter_params) = filters.clause();
        let since_raw = since.to_rfc3339();
        let sql = format!(
            "SELECT user_id, MAX(user_name), SUM(session_count), SUM(play_seconds) FROM (
                 SELECT user_id, user_name,
                        COUNT(*) AS session_count,
                        COALESCE(SUM(play_seconds), 0) AS play_seconds
                 FROM sessions WHERE started_at >= ?{filter_sql}
                 GROUP BY user_id, user_name
                 UNION ALL
                 SELECT user_id, user_name, SUM(session_count), SUM(play_seconds)
                 FROM session_aggregates WHERE bucket_start >= ?{filter_sql}
                 GROUP BY user_id, user_name
             )
             GROUP BY user_id
             ORDER BY SUM(play_seconds) DESC"
        );
        let mut params: Vec<String> = vec![since_raw.clone()];
        params.extend(filter_params.iter().cloned());
        params.push(since_raw);
        params.extend(filter_params);

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(UserWatchtime {
                    user_id: row.get(0)?,
                    user_name: row.get(1)?,
                    session_count: row.get(2)?,
                    play_seconds: row.get(3)?,
                });
            }
            Ok(results)
        })
    }

    /// Most-watched media in the raw window, episodes folded into their
    /// series. Aggregates do not retain media identity, so compacted history
    /// does not contribute here.
    #[instrument(skip(self, filters))]
    pub fn top_media(
        &self,
        since: DateTime<Utc>,
        limit: u32,
        filters: &SessionFilters,
    ) -> Result<Vec<TopMedia>, StoreError> {
        let (filter_sql, filter_params) = filters.clause();
        let sql = format!(
            "WITH base AS (
                 SELECT
                     CASE WHEN media_type = 'Episode' AND series_name IS NOT NULL
                          THEN series_name ELSE media_id END AS media_key,
                     CASE WHEN media_type = 'Episode' AND series_name IS NOT NULL
                          THEN series_name ELSE media_title END AS media_title,
                     media_type,
                     play_seconds
                 FROM sessions
                 WHERE started_at >= ?{filter_sql}
             )
             SELECT media_key, media_title, media_type, COUNT(*), SUM(play_seconds)
             FROM base
             GROUP BY media_key, media_title, media_type
             ORDER BY SUM(play_seconds) DESC
             LIMIT ?"
        );
        let mut params: Vec<String> = vec![since.to_rfc3339()];
        params.extend(filter_params);
        params.push(limit.to_string());

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(TopMedia {
                    media_key: row.get(0)?,
                    media_title: row.get(1)?,
                    media_type: row.get(2)?,
                    play_count: row.get(3)?,
                    play_seconds: row.get(4)?,
                });
            }
            Ok(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::{AggregateDelta, AggregateKey, AggregateRepo, Granularity};
    use crate::sessions::fixtures::{at, closed_session, open_session};
    use crate::sessions::SessionRepo;
    use playtrack_core::ids::{DeviceId, UserId};

    fn setup() -> (SessionRepo, AggregateRepo, QueryFacade) {
        let db = Database::in_memory().unwrap();
        (
            SessionRepo::new(db.clone()),
            AggregateRepo::new(db.clone()),
            QueryFacade::new(db),
        )
    }

    fn merge_bucket(aggregates: &AggregateRepo, bucket: DateTime<Utc>, sessions: i64, play: i64) {
        aggregates
            .merge(
                &AggregateKey {
                    granularity: Granularity::Day,
                    bucket_start: bucket,
                    user_id: UserId::from_raw("u1"),
                    device_id: DeviceId::from_raw("d1"),
                    media_type: "Movie".into(),
                },
                &AggregateDelta {
                    user_name: "U1".into(),
                    device_name: "Living Room TV".into(),
                    session_count: sessions,
                    play_seconds: play,
                    paused_seconds: 0,
                    distinct_media: 1,
                },
            )
            .unwrap();
    }

    #[test]
    fn ping_succeeds() {
        let (_, _, facade) = setup();
        facade.ping().unwrap();
    }

    #[test]
    fn open_count_matches_open_rows() {
        let (sessions, _, facade) = setup();
        sessions.upsert(&open_session("s1", "u1", at(2026, 3, 1, 12, 0, 0))).unwrap();
        sessions.upsert(&closed_session("s2", "u1", at(2026, 3, 1, 11, 0, 0), 60)).unwrap();
        assert_eq!(facade.open_count().unwrap(), 1);
    }

    #[test]
    fn summary_composes_raw_and_aggregates() {
        let (sessions, aggregates, facade) = setup();
        sessions.upsert(&closed_session("s1", "u1", at(2026, 3, 1, 12, 0, 0), 600)).unwrap();
        sessions.upsert(&closed_session("s2", "u2", at(2026, 3, 2, 12, 0, 0), 300)).unwrap();
        merge_bucket(&aggregates, at(2026, 2, 1, 0, 0, 0), 5, 4000);

        let summary = facade
            .summary(at(2026, 1, 1, 0, 0, 0), &SessionFilters::default())
            .unwrap();
        assert_eq!(summary.total_sessions, 7);
        assert_eq!(summary.play_seconds, 4900);
        assert_eq!(summary.unique_users, 2); // u1 appears in both tiers
        assert_eq!(summary.unique_media, 2); // 1 raw media + 1 merged distinct
    }

    #[test]
    fn summary_window_excludes_older_data() {
        let (sessions, aggregates, facade) = setup();
        sessions.upsert(&closed_session("s1", "u1", at(2026, 3, 1, 12, 0, 0), 600)).unwrap();
        merge_bucket(&aggregates, at(2025, 6, 1, 0, 0, 0), 5, 4000);

        let summary = facade
            .summary(at(2026, 1, 1, 0, 0, 0), &SessionFilters::default())
            .unwrap();
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.play_seconds, 600);
    }

    #[test]
    fn daily_series_merges_same_day_tiers() {
        let (sessions, aggregates, facade) = setup();
        // Raw session closed on the same day an aggregate bucket starts.
        sessions.upsert(&closed_session("s1", "u1", at(2026, 2, 1, 18, 0, 0), 600)).unwrap();
        merge_bucket(&aggregates, at(2026, 2, 1, 0, 0, 0), 2, 1000);
        merge_bucket(&aggregates, at(2026, 2, 3, 0, 0, 0), 1, 500);

        let series = facade
            .daily_series(at(2026, 1, 1, 0, 0, 0), &SessionFilters::default())
            .unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].date, "2026-02-01");
        assert_eq!(series[0].session_count, 3);
        assert_eq!(series[0].play_seconds, 1600);
        assert_eq!(series[1].date, "2026-02-03");
    }

    #[test]
    fn user_watchtime_orders_by_play_time() {
        let (sessions, aggregates, facade) = setup();
        sessions.upsert(&closed_session("s1", "u2", at(2026, 3, 1, 12, 0, 0), 300)).unwrap();
        sessions.upsert(&closed_session("s2", "u1", at(2026, 3, 1, 13, 0, 0), 100)).unwrap();
        merge_bucket(&aggregates, at(2026, 2, 1, 0, 0, 0), 2, 900); // u1

        let watchtime = facade
            .user_watchtime(at(2026, 1, 1, 0, 0, 0), &SessionFilters::default())
            .unwrap();
        assert_eq!(watchtime.len(), 2);
        assert_eq!(watchtime[0].user_id, "u1");
        assert_eq!(watchtime[0].play_seconds, 1000);
        assert_eq!(watchtime[0].session_count, 3);
        assert_eq!(watchtime[1].user_id, "u2");
    }

    #[test]
    fn top_media_folds_episodes_into_series() {
        let (sessions, _, facade) = setup();
        let mut ep1 = closed_session("s1", "u1", at(2026, 3, 1, 12, 0, 0), 1200);
        ep1.media_type = "Episode".into();
        ep1.media_title = "Pilot".into();
        ep1.series_name = Some("Some Show".into());
        let mut ep2 = closed_session("s2", "u1", at(2026, 3, 1, 13, 0, 0), 1300);
        ep2.media_type = "Episode".into();
        ep2.media_title = "Episode Two".into();
        ep2.series_name = Some("Some Show".into());
        let movie = closed_session("s3", "u1", at(2026, 3, 1, 14, 0, 0), 900);
        sessions.upsert(&ep1).unwrap();
        sessions.upsert(&ep2).unwrap();
        sessions.upsert(&movie).unwrap();

        let top = facade
            .top_media(at(2026, 1, 1, 0, 0, 0), 10, &SessionFilters::default())
            .unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].media_title, "Some Show");
        assert_eq!(top[0].play_count, 2);
        assert_eq!(top[0].play_seconds, 2500);
        assert_eq!(top[1].media_title, "Some Movie");
    }

    #[test]
    fn filters_restrict_all_series() {
        let (sessions, _, facade) = setup();
        sessions.upsert(&closed_session("s1", "u1", at(2026, 3, 1, 12, 0, 0), 600)).unwrap();
        sessions.upsert(&closed_session("s2", "u2", at(2026, 3, 1, 12, 0, 0), 300)).unwrap();

        let filters = SessionFilters { user_id: Some("u1".into()), ..Default::default() };
        let summary = facade.summary(at(2026, 1, 1, 0, 0, 0), &filters).unwrap();
        assert_eq!(summary.total_sessions, 1);

        let watchtime = facade.user_watchtime(at(2026, 1, 1, 0, 0, 0), &filters).unwrap();
        assert_eq!(watchtime.len(), 1);
        assert_eq!(watchtime[0].user_id, "u1");
    }
}
