use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use playtrack_core::ids::{DeviceId, MediaItemId, SessionKey, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A persisted playback session. Open rows are still being mutated by the
/// tracker; closed rows (`is_open == false`) are immutable and eligible for
/// compaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_key: SessionKey,
    pub user_id: UserId,
    pub user_name: String,
    pub device_id: DeviceId,
    pub device_name: String,
    pub client_name: String,
    pub media_id: MediaItemId,
    pub media_title: String,
    pub media_type: String,
    pub series_name: Option<String>,
    pub season_number: Option<i64>,
    pub episode_number: Option<i64>,
    pub runtime_seconds: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub position_seconds: i64,
    pub play_seconds: i64,
    pub paused_seconds: i64,
    pub last_paused: bool,
    pub completed: bool,
    pub is_open: bool,
}

/// Optional dimensional filters shared by raw queries and the facade.
#[derive(Clone, Debug, Default)]
pub struct SessionFilters {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub media_type: Option<String>,
}

impl SessionFilters {
    /// Render as ` AND col = ?` fragments with matching positional params.
    pub(crate) fn clause(&self) -> (String, Vec<String>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        if let Some(user_id) = &self.user_id {
            sql.push_str(" AND user_id = ?");
            params.push(user_id.clone());
        }
        if let Some(device_id) = &self.device_id {
            sql.push_str(" AND device_id = ?");
            params.push(device_id.clone());
        }
        if let Some(media_type) = &self.media_type {
            sql.push_str(" AND media_type = ?");
            params.push(media_type.clone());
        }
        (sql, params)
    }
}

pub(crate) const SESSION_COLUMNS: &str = "session_key, user_id, user_name, device_id, device_name, client_name, \
     media_id, media_title, media_type, series_name, season_number, episode_number, \
     runtime_seconds, started_at, last_seen_at, ended_at, position_seconds, \
     play_seconds, paused_seconds, last_paused, completed, is_open";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or fully replace the row for this session key. The whole row
    /// is written from the caller's state, so re-applying the same state is
    /// a no-op — the idempotence the tracker relies on.
    #[instrument(skip(self, session), fields(session_key = %session.session_key))]
    pub fn upsert(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_key, user_id, user_name, device_id, device_name,
                                       client_name, media_id, media_title, media_type, series_name,
                                       season_number, episode_number, runtime_seconds, started_at,
                                       last_seen_at, ended_at, position_seconds, play_seconds,
                                       paused_seconds, last_paused, completed, is_open)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21, ?22)
                 ON CONFLICT(session_key) DO UPDATE SET
                     user_id = excluded.user_id,
                     user_name = excluded.user_name,
                     device_id = excluded.device_id,
                     device_name = excluded.device_name,
                     client_name = excluded.client_name,
                     media_id = excluded.media_id,
                     media_title = excluded.media_title,
                     media_type = excluded.media_type,
                     series_name = excluded.series_name,
                     season_number = excluded.season_number,
                     episode_number = excluded.episode_number,
                     runtime_seconds = excluded.runtime_seconds,
                     started_at = excluded.started_at,
                     last_seen_at = excluded.last_seen_at,
                     ended_at = excluded.ended_at,
                     position_seconds = excluded.position_seconds,
                     play_seconds = excluded.play_seconds,
                     paused_seconds = excluded.paused_seconds,
                     last_paused = excluded.last_paused,
                     completed = excluded.completed,
                     is_open = excluded.is_open",
                rusqlite::params![
                    session.session_key.as_str(),
                    session.user_id.as_str(),
                    session.user_name,
                    session.device_id.as_str(),
                    session.device_name,
                    session.client_name,
                    session.media_id.as_str(),
                    session.media_title,
                    session.media_type,
                    session.series_name,
                    session.season_number,
                    session.episode_number,
                    session.runtime_seconds,
                    session.started_at.to_rfc3339(),
                    session.last_seen_at.to_rfc3339(),
                    session.ended_at.map(|dt| dt.to_rfc3339()),
                    session.position_seconds,
                    session.play_seconds,
                    session.paused_seconds,
                    session.last_paused,
                    session.completed,
                    session.is_open,
                ],
            )?;
            Ok(())
        })
    }

    /// Get a session by key.
    #[instrument(skip(self), fields(session_key = %key))]
    pub fn get(&self, key: &SessionKey) -> Result<SessionRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_key = ?1"
            ))?;
            let mut rows = stmt.query([key.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {key}"))),
            }
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

    /// All open sessions, newest first.
    pub fn list_open(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE is_open = 1 ORDER BY started_at DESC"
            ))?;
            collect_sessions(&mut stmt, [])
        })
    }

    /// Closed sessions with an end time inside `[after, before)`, oldest
    /// first. This is the compaction read path.
    #[instrument(skip(self, filters))]
    pub fn query_closed(
        &self,
        before: DateTime<Utc>,
        after: Option<DateTime<Utc>>,
        filters: &SessionFilters,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let (filter_sql, filter_params) = filters.clause();
        let mut sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE is_open = 0 AND ended_at IS NOT NULL AND ended_at < ?"
        );
        let mut params: Vec<String> = vec![before.to_rfc3339()];
        if let Some(after) = after {
            sql.push_str(" AND ended_at >= ?");
            params.push(after.to_rfc3339());
        }
        sql.push_str(&filter_sql);
        params.extend(filter_params);
        sql.push_str(" ORDER BY ended_at ASC");

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            collect_sessions(&mut stmt, rusqlite::params_from_iter(params.iter()))
        })
    }

    /// Delete raw session rows by key. Returns the number deleted.
    #[instrument(skip(self, keys), fields(count = keys.len()))]
    pub fn delete_keys(&self, keys: &[SessionKey]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                &format!("DELETE FROM sessions WHERE session_key IN ({placeholders})"),
                rusqlite::params_from_iter(keys.iter().map(|k| k.as_str())),
            )?;
            Ok(deleted)
        })
    }

    /// Close open rows whose last activity is older than `cutoff`, using the
    /// last activity time as the end time. Run at startup to resolve rows
    /// left open by a previous process, and usable as a store-level sweep.
    #[instrument(skip(self))]
    pub fn close_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let closed = conn.execute(
                "UPDATE sessions
                 SET ended_at = last_seen_at, is_open = 0
                 WHERE is_open = 1 AND last_seen_at < ?1",
                [cutoff.to_rfc3339()],
            )?;
            Ok(closed)
        })
    }
}

/// Collect rows, skipping (and logging) corrupt ones: one damaged row must
/// not take down a whole listing, and damaged rows are unrecoverable anyway.
pub(crate) fn collect_sessions<P: rusqlite::Params>(
    stmt: &mut rusqlite::Statement<'_>,
    params: P,
) -> Result<Vec<SessionRecord>, StoreError> {
    let mut rows = stmt.query(params)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        match row_to_session(row) {
            Ok(session) => results.push(session),
            Err(StoreError::CorruptRow { table, column, detail }) => {
                tracing::warn!(table, column, detail, "skipping corrupt session row");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(results)
}

pub(crate) fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    let started_raw: String = row_helpers::get(row, 13, "sessions", "started_at")?;
    let last_seen_raw: String = row_helpers::get(row, 14, "sessions", "last_seen_at")?;
    let ended_raw: Option<String> = row_helpers::get_opt(row, 15, "sessions", "ended_at")?;

    Ok(SessionRecord {
        session_key: SessionKey::from_raw(row_helpers::get::<String>(row, 0, "sessions", "session_key")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "user_id")?),
        user_name: row_helpers::get(row, 2, "sessions", "user_name")?,
        device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 3, "sessions", "device_id")?),
        device_name: row_helpers::get(row, 4, "sessions", "device_name")?,
        client_name: row_helpers::get(row, 5, "sessions", "client_name")?,
        media_id: MediaItemId::from_raw(row_helpers::get::<String>(row, 6, "sessions", "media_id")?),
        media_title: row_helpers::get(row, 7, "sessions", "media_title")?,
        media_type: row_helpers::get(row, 8, "sessions", "media_type")?,
        series_name: row_helpers::get_opt(row, 9, "sessions", "series_name")?,
        season_number: row_helpers::get_opt(row, 10, "sessions", "season_number")?,
        episode_number: row_helpers::get_opt(row, 11, "sessions", "episode_number")?,
        runtime_seconds: row_helpers::get_opt(row, 12, "sessions", "runtime_seconds")?,
        started_at: row_helpers::parse_ts(&started_raw, "sessions", "started_at")?,
        last_seen_at: row_helpers::parse_ts(&last_seen_raw, "sessions", "last_seen_at")?,
        ended_at: ended_raw
            .map(|raw| row_helpers::parse_ts(&raw, "sessions", "ended_at"))
            .transpose()?,
        position_seconds: row_helpers::get(row, 16, "sessions", "position_seconds")?,
        play_seconds: row_helpers::get(row, 17, "sessions", "play_seconds")?,
        paused_seconds: row_helpers::get(row, 18, "sessions", "paused_seconds")?,
        last_paused: row_helpers::get(row, 19, "sessions", "last_paused")?,
        completed: row_helpers::get(row, 20, "sessions", "completed")?,
        is_open: row_helpers::get(row, 21, "sessions", "is_open")?,
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::{at, closed_session, open_session};
    use super::*;

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn upsert_and_get_roundtrip() {
        let repo = setup();
        let session = closed_session("s1", "u1", at(2026, 3, 1, 20, 0, 0), 620);
        repo.upsert(&session).unwrap();

        let fetched = repo.get(&SessionKey::from_raw("s1")).unwrap();
        assert_eq!(fetched.play_seconds, 620);
        assert_eq!(fetched.ended_at, session.ended_at);
        assert!(!fetched.is_open);
    }

    #[test]
    fn upsert_replaces_whole_row() {
        let repo = setup();
        let mut session = open_session("s1", "u1", at(2026, 3, 1, 20, 0, 0));
        repo.upsert(&session).unwrap();

        session.play_seconds = 300;
        session.is_open = false;
        session.ended_at = Some(at(2026, 3, 1, 20, 10, 0));
        repo.upsert(&session).unwrap();

        let fetched = repo.get(&session.session_key).unwrap();
        assert_eq!(fetched.play_seconds, 300);
        assert!(!fetched.is_open);
    }

    #[test]
    fn reupsert_identical_state_changes_nothing() {
        let repo = setup();
        let session = closed_session("s1", "u1", at(2026, 3, 1, 20, 0, 0), 620);
        repo.upsert(&session).unwrap();
        repo.upsert(&session).unwrap();

        let fetched = repo.get(&session.session_key).unwrap();
        assert_eq!(fetched.play_seconds, 620);
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = setup();
        let result = repo.get(&SessionKey::from_raw("missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn open_count_tracks_open_rows() {
        let repo = setup();
        repo.upsert(&open_session("s1", "u1", at(2026, 3, 1, 20, 0, 0))).unwrap();
        repo.upsert(&open_session("s2", "u2", at(2026, 3, 1, 20, 0, 0))).unwrap();
        repo.upsert(&closed_session("s3", "u1", at(2026, 3, 1, 19, 0, 0), 100)).unwrap();

        assert_eq!(repo.open_count().unwrap(), 2);
        assert_eq!(repo.list_open().unwrap().len(), 2);
    }

    #[test]
    fn query_closed_respects_window_and_filters() {
        let repo = setup();
        repo.upsert(&closed_session("old", "u1", at(2026, 1, 1, 10, 0, 0), 100)).unwrap();
        repo.upsert(&closed_session("recent", "u1", at(2026, 3, 1, 10, 0, 0), 100)).unwrap();
        repo.upsert(&closed_session("other-user", "u2", at(2026, 1, 1, 11, 0, 0), 100)).unwrap();
        repo.upsert(&open_session("open", "u1", at(2026, 1, 1, 12, 0, 0))).unwrap();

        let before = at(2026, 2, 1, 0, 0, 0);
        let all_old = repo.query_closed(before, None, &SessionFilters::default()).unwrap();
        assert_eq!(all_old.len(), 2);

        let filters = SessionFilters { user_id: Some("u1".into()), ..Default::default() };
        let u1_old = repo.query_closed(before, None, &filters).unwrap();
        assert_eq!(u1_old.len(), 1);
        assert_eq!(u1_old[0].session_key.as_str(), "old");

        let windowed = repo
            .query_closed(before, Some(at(2026, 1, 1, 10, 30, 0)), &SessionFilters::default())
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].session_key.as_str(), "other-user");
    }

    #[test]
    fn delete_keys_removes_rows() {
        let repo = setup();
        repo.upsert(&closed_session("s1", "u1", at(2026, 1, 1, 10, 0, 0), 100)).unwrap();
        repo.upsert(&closed_session("s2", "u1", at(2026, 1, 1, 11, 0, 0), 100)).unwrap();

        let deleted = repo
            .delete_keys(&[SessionKey::from_raw("s1"), SessionKey::from_raw("missing")])
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.get(&SessionKey::from_raw("s1")).is_err());
        assert!(repo.get(&SessionKey::from_raw("s2")).is_ok());
    }

    #[test]
    fn delete_keys_empty_is_noop() {
        let repo = setup();
        assert_eq!(repo.delete_keys(&[]).unwrap(), 0);
    }

    #[test]
    fn corrupt_row_is_skipped_in_listings_but_reported_by_get() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.upsert(&open_session("good", "u1", at(2026, 3, 1, 12, 0, 0))).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_key, user_id, user_name, device_id, device_name,
                                       client_name, media_id, media_title, media_type,
                                       started_at, last_seen_at, is_open)
                 VALUES ('bad', 'u1', 'U1', 'd1', 'TV', 'App', 'm1', 'T', 'Movie',
                         'garbage', 'garbage', 1)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let open = repo.list_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].session_key.as_str(), "good");

        assert!(matches!(
            repo.get(&SessionKey::from_raw("bad")),
            Err(StoreError::CorruptRow { .. })
        ));
    }

    #[test]
    fn close_stale_ends_idle_open_rows() {
        let repo = setup();
        repo.upsert(&open_session("stale", "u1", at(2026, 3, 1, 10, 0, 0))).unwrap();
        repo.upsert(&open_session("fresh", "u1", at(2026, 3, 1, 12, 0, 0))).unwrap();

        let closed = repo.close_stale(at(2026, 3, 1, 11, 0, 0)).unwrap();
        assert_eq!(closed, 1);

        let stale = repo.get(&SessionKey::from_raw("stale")).unwrap();
        assert!(!stale.is_open);
        assert_eq!(stale.ended_at, Some(at(2026, 3, 1, 10, 0, 0)));

        let fresh = repo.get(&SessionKey::from_raw("fresh")).unwrap();
        assert!(fresh.is_open);
    }
}
