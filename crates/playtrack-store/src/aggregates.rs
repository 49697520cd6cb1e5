use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use playtrack_core::ids::{DeviceId, SessionKey, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Bucket width for an aggregate row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

/// Natural key of an aggregate bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub media_type: String,
}

/// Additive totals merged into a bucket. Display names ride along and are
/// refreshed to the latest value on merge.
#[derive(Clone, Debug, Default)]
pub struct AggregateDelta {
    pub user_name: String,
    pub device_name: String,
    pub session_count: i64,
    pub play_seconds: i64,
    pub paused_seconds: i64,
    pub distinct_media: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct AggregateRow {
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub user_id: UserId,
    pub user_name: String,
    pub device_id: DeviceId,
    pub device_name: String,
    pub media_type: String,
    pub session_count: i64,
    pub play_seconds: i64,
    pub paused_seconds: i64,
    pub distinct_media: i64,
}

pub struct AggregateRepo {
    db: Database,
}

impl AggregateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Merge a delta into its bucket: insert, or additively update on the
    /// natural key. Never overwrites totals with stale values.
    #[instrument(skip(self, key, delta), fields(bucket = %key.bucket_start, granularity = %key.granularity))]
    pub fn merge(&self, key: &AggregateKey, delta: &AggregateDelta) -> Result<(), StoreError> {
        self.db.with_conn(|conn| merge_in(conn, key, delta))
    }

    /// One compaction unit: merge the group's totals into its bucket, then
    /// delete the source raw rows, inside a single transaction. The commit
    /// is the compaction point — a failure before it leaves every raw row in
    /// place for the next run, so re-running is idempotent per session.
    #[instrument(skip(self, key, delta, session_keys), fields(bucket = %key.bucket_start, sessions = session_keys.len()))]
    pub fn compact_group(
        &self,
        key: &AggregateKey,
        delta: &AggregateDelta,
        session_keys: &[SessionKey],
    ) -> Result<usize, StoreError> {
        if session_keys.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; session_keys.len()].join(", ");
        self.db.with_tx(|tx| {
            merge_in(tx, key, delta)?;
            let deleted = tx.execute(
                &format!("DELETE FROM sessions WHERE session_key IN ({placeholders})"),
                rusqlite::params_from_iter(session_keys.iter().map(|k| k.as_str())),
            )?;
            Ok(deleted)
        })
    }

    /// Delete aggregate buckets (all granularities) starting before `cutoff`.
    #[instrument(skip(self))]
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let pruned = conn.execute(
                "DELETE FROM session_aggregates WHERE bucket_start < ?1",
                [cutoff.to_rfc3339()],
            )?;
            Ok(pruned)
        })
    }

    /// All buckets ordered by start time, optionally restricted to one
    /// granularity. Used by queries and tests.
    pub fn list(&self, granularity: Option<Granularity>) -> Result<Vec<AggregateRow>, StoreError> {
        let mut sql = String::from(
            "SELECT granularity, bucket_start, user_id, user_name, device_id, device_name,
                    media_type, session_count, play_seconds, paused_seconds, distinct_media
             FROM session_aggregates",
        );
        let mut params: Vec<String> = Vec::new();
        if let Some(g) = granularity {
            sql.push_str(" WHERE granularity = ?");
            params.push(g.to_string());
        }
        sql.push_str(" ORDER BY bucket_start ASC");

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                match row_to_aggregate(row) {
                    Ok(aggregate) => results.push(aggregate),
                    Err(StoreError::CorruptRow { table, column, detail }) => {
                        tracing::warn!(table, column, detail, "skipping corrupt aggregate row");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(results)
        })
    }
}

fn merge_in(
    conn: &rusqlite::Connection,
    key: &AggregateKey,
    delta: &AggregateDelta,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO session_aggregates (granularity, bucket_start, user_id, user_name,
                                         device_id, device_name, media_type, session_count,
                                         play_seconds, paused_seconds, distinct_media)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(granularity, bucket_start, user_id, device_id, media_type) DO UPDATE SET
             session_count = session_count + excluded.session_count,
             play_seconds = play_seconds + excluded.play_seconds,
             paused_seconds = paused_seconds + excluded.paused_seconds,
             distinct_media = distinct_media + excluded.distinct_media,
             user_name = excluded.user_name,
             device_name = excluded.device_name",
        rusqlite::params![
            key.granularity.to_string(),
            key.bucket_start.to_rfc3339(),
            key.user_id.as_str(),
            delta.user_name,
            key.device_id.as_str(),
            delta.device_name,
            key.media_type,
            delta.session_count,
            delta.play_seconds,
            delta.paused_seconds,
            delta.distinct_media,
        ],
    )?;
    Ok(())
}

fn row_to_aggregate(row: &rusqlite::Row<'_>) -> Result<AggregateRow, StoreError> {
    let granularity_raw: String = row_helpers::get(row, 0, "session_aggregates", "granularity")?;
    let bucket_raw: String = row_helpers::get(row, 1, "session_aggregates", "bucket_start")?;

    Ok(AggregateRow {
        granularity: row_helpers::parse_enum(&granularity_raw, "session_aggregates", "granularity")?,
        bucket_start: row_helpers::parse_ts(&bucket_raw, "session_aggregates", "bucket_start")?,
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "session_aggregates", "user_id")?),
        user_name: row_helpers::get(row, 3, "session_aggregates", "user_name")?,
        device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 4, "session_aggregates", "device_id")?),
        device_name: row_helpers::get(row, 5, "session_aggregates", "device_name")?,
        media_type: row_helpers::get(row, 6, "session_aggregates", "media_type")?,
        session_count: row_helpers::get(row, 7, "session_aggregates", "session_count")?,
        play_seconds: row_helpers::get(row, 8, "session_aggregates", "play_seconds")?,
        paused_seconds: row_helpers::get(row, 9, "session_aggregates", "paused_seconds")?,
        distinct_media: row_helpers::get(row, 10, "session_aggregates", "distinct_media")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::fixtures::{at, closed_session};
    use crate::sessions::{SessionFilters, SessionRepo};

    fn setup() -> (Database, SessionRepo, AggregateRepo) {
        let db = Database::in_memory().unwrap();
        (db.clone(), SessionRepo::new(db.clone()), AggregateRepo::new(db))
    }

    fn key_for(user: &str, bucket: DateTime<Utc>, granularity: Granularity) -> AggregateKey {
        AggregateKey {
            granularity,
            bucket_start: bucket,
            user_id: UserId::from_raw(user),
            device_id: DeviceId::from_raw("d1"),
            media_type: "Movie".into(),
        }
    }

    fn delta(sessions: i64, play: i64) -> AggregateDelta {
        AggregateDelta {
            user_name: "U1".into(),
            device_name: "Living Room TV".into(),
            session_count: sessions,
            play_seconds: play,
            paused_seconds: 0,
            distinct_media: 1,
        }
    }

    #[test]
    fn merge_creates_then_adds() {
        let (_, _, aggregates) = setup();
        let key = key_for("u1", at(2026, 1, 1, 20, 0, 0), Granularity::Hour);

        aggregates.merge(&key, &delta(1, 600)).unwrap();
        aggregates.merge(&key, &delta(2, 900)).unwrap();

        let rows = aggregates.list(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_count, 3);
        assert_eq!(rows[0].play_seconds, 1500);
        assert_eq!(rows[0].distinct_media, 2);
    }

    #[test]
    fn merge_distinct_keys_stay_separate() {
        let (_, _, aggregates) = setup();
        let bucket = at(2026, 1, 1, 20, 0, 0);

        aggregates.merge(&key_for("u1", bucket, Granularity::Hour), &delta(1, 600)).unwrap();
        aggregates.merge(&key_for("u2", bucket, Granularity::Hour), &delta(1, 300)).unwrap();
        aggregates.merge(&key_for("u1", bucket, Granularity::Day), &delta(1, 100)).unwrap();

        assert_eq!(aggregates.list(None).unwrap().len(), 3);
        assert_eq!(aggregates.list(Some(Granularity::Day)).unwrap().len(), 1);
    }

    #[test]
    fn compact_group_merges_and_deletes_atomically() {
        let (_, sessions, aggregates) = setup();
        let ended = at(2026, 1, 1, 20, 15, 0);
        sessions.upsert(&closed_session("s1", "u1", ended, 600)).unwrap();
        sessions.upsert(&closed_session("s2", "u1", ended, 300)).unwrap();

        let key = key_for("u1", at(2026, 1, 1, 20, 0, 0), Granularity::Hour);
        let deleted = aggregates
            .compact_group(
                &key,
                &delta(2, 900),
                &[SessionKey::from_raw("s1"), SessionKey::from_raw("s2")],
            )
            .unwrap();
        assert_eq!(deleted, 2);

        // Raw rows are gone, the bucket reflects them — never both.
        let remaining = sessions
            .query_closed(at(2026, 2, 1, 0, 0, 0), None, &SessionFilters::default())
            .unwrap();
        assert!(remaining.is_empty());
        let rows = aggregates.list(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].play_seconds, 900);
        assert_eq!(rows[0].session_count, 2);
    }

    #[test]
    fn compact_group_empty_is_noop() {
        let (_, _, aggregates) = setup();
        let key = key_for("u1", at(2026, 1, 1, 20, 0, 0), Granularity::Hour);
        assert_eq!(aggregates.compact_group(&key, &delta(0, 0), &[]).unwrap(), 0);
        assert!(aggregates.list(None).unwrap().is_empty());
    }

    #[test]
    fn prune_removes_old_buckets_only() {
        let (_, _, aggregates) = setup();
        aggregates.merge(&key_for("u1", at(2025, 6, 1, 0, 0, 0), Granularity::Day), &delta(1, 100)).unwrap();
        aggregates.merge(&key_for("u1", at(2026, 1, 1, 0, 0, 0), Granularity::Day), &delta(1, 200)).unwrap();

        let pruned = aggregates.prune_older_than(at(2025, 12, 1, 0, 0, 0)).unwrap();
        assert_eq!(pruned, 1);

        let rows = aggregates.list(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].play_seconds, 200);
    }
}
