//! One-shot historical backfill from the media server's playback-reporting
//! endpoint. Imported rows get stable `imported_` keys so re-running the
//! import (or racing the live tracker) never duplicates a session.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use playtrack_core::ids::{DeviceId, MediaItemId, SessionKey, UserId};
use playtrack_core::{FeedError, Settings};
use playtrack_store::sessions::{SessionRecord, SessionRepo};
use playtrack_store::StoreError;

#[derive(Clone, Copy, Debug, Default)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ActivityTable {
    // The reporting endpoint has shipped both spellings.
    #[serde(default, alias = "colums")]
    columns: Vec<String>,
    #[serde(default)]
    results: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
}

pub struct HistoryImporter {
    settings: Settings,
    http: reqwest::Client,
    repo: SessionRepo,
}

impl HistoryImporter {
    pub fn new(settings: Settings, repo: SessionRepo) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
            repo,
        }
    }

    /// Import playback activity from the last `days` days.
    pub async fn run(&self, days: u32) -> Result<ImportOutcome, FeedError> {
        info!(days, "importing playback history");

        let table = self.fetch_activity(days).await?;
        if table.columns.is_empty() {
            return Err(FeedError::Protocol(
                "playback reporting response missing columns".into(),
            ));
        }
        if table.results.is_empty() {
            info!("no playback history to import");
            return Ok(ImportOutcome::default());
        }

        let user_names = match self.fetch_user_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "user name lookup failed, importing with ids only");
                HashMap::new()
            }
        };

        let outcome = self.apply_rows(&table, &user_names);
        info!(
            imported = outcome.imported,
            skipped = outcome.skipped,
            "import complete"
        );
        Ok(outcome)
    }

    fn apply_rows(&self, table: &ActivityTable, user_names: &HashMap<String, String>) -> ImportOutcome {
        let mut outcome = ImportOutcome::default();
        for row in &table.results {
            let Some(record) = record_from_row(&table.columns, row, user_names) else {
                outcome.skipped += 1;
                continue;
            };
            match self.repo.get(&record.session_key) {
                Ok(_) => outcome.skipped += 1,
                Err(StoreError::NotFound(_)) => match self.repo.upsert(&record) {
                    Ok(()) => outcome.imported += 1,
                    Err(e) => {
                        warn!(error = %e, key = %record.session_key, "failed to import session");
                        outcome.skipped += 1;
                    }
                },
                Err(e) => {
                    warn!(error = %e, key = %record.session_key, "lookup failed, skipping row");
                    outcome.skipped += 1;
                }
            }
        }
        outcome
    }

    async fn fetch_activity(&self, days: u32) -> Result<ActivityTable, FeedError> {
        let query = format!(
            "SELECT rowid, DateCreated, UserId, ItemId, ItemType, ItemName, \
                    PlaybackMethod, ClientName, DeviceName, PlayDuration \
             FROM PlaybackActivity \
             WHERE DateCreated >= datetime('now', '-{days} days') \
             ORDER BY DateCreated ASC"
        );
        let url = format!(
            "{}/user_usage_stats/submit_custom_query",
            self.settings.server_url
        );
        let response = self
            .http
            .post(&url)
            .query(&[("api_key", self.settings.api_token.expose_secret())])
            .json(&serde_json::json!({ "CustomQueryString": query }))
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| FeedError::Http { status: 0, body: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::from_status(status.as_u16(), body));
        }
        response
            .json()
            .await
            .map_err(|e| FeedError::Parse(e.to_string()))
    }

    async fn fetch_user_names(&self) -> Result<HashMap<String, String>, FeedError> {
        let url = format!("{}/Users", self.settings.server_url);
        let response = self
            .http
            .get(&url)
            .query(&[("api_key", self.settings.api_token.expose_secret())])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| FeedError::Http { status: 0, body: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::from_status(status.as_u16(), body));
        }
        let users: Vec<WireUser> = response
            .json()
            .await
            .map_err(|e| FeedError::Parse(e.to_string()))?;
        Ok(users.into_iter().map(|u| (u.id, u.name)).collect())
    }
}

fn record_from_row(
    columns: &[String],
    row: &[serde_json::Value],
    user_names: &HashMap<String, String>,
) -> Option<SessionRecord> {
    let map: HashMap<&str, &serde_json::Value> = columns
        .iter()
        .map(String::as_str)
        .zip(row.iter())
        .collect();

    let session_key = stable_key(columns, row, &map);
    let started_at = parse_activity_date(&text(&map, "DateCreated")?)?;

    let item_name = text(&map, "ItemName").unwrap_or_else(|| "Unknown".into());
    let (media_title, series_name, season_number, episode_number) = parse_item_name(&item_name);

    let user_id = text(&map, "UserId").unwrap_or_default();
    let device_name = text(&map, "DeviceName").unwrap_or_else(|| "Unknown".into());
    let play_seconds = integer(&map, "PlayDuration").max(0);

    Some(SessionRecord {
        session_key,
        user_name: user_names
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| "Unknown".into()),
        user_id: UserId::from_raw(user_id),
        device_id: DeviceId::from_raw(format!("imported_{device_name}")),
        device_name,
        client_name: text(&map, "ClientName").unwrap_or_else(|| "Unknown".into()),
        media_id: MediaItemId::from_raw(text(&map, "ItemId").unwrap_or_default()),
        media_title,
        media_type: text(&map, "ItemType").unwrap_or_else(|| "Unknown".into()),
        series_name,
        season_number,
        episode_number,
        runtime_seconds: None,
        started_at,
        last_seen_at: started_at,
        // The reporting source has no end times; the row lands in the bucket
        // of its start.
        ended_at: Some(started_at),
        position_seconds: 0,
        play_seconds,
        paused_seconds: 0,
        last_paused: false,
        completed: false,
        is_open: false,
    })
}

/// Prefer the source rowid for a stable key; fall back to a fingerprint of
/// the whole row.
fn stable_key(
    columns: &[String],
    row: &[serde_json::Value],
    map: &HashMap<&str, &serde_json::Value>,
) -> SessionKey {
    if let Some(rowid) = map.get("rowid") {
        if let Some(n) = rowid.as_i64() {
            return SessionKey::from_raw(format!("imported_{n}"));
        }
        if let Some(s) = rowid.as_str() {
            if !s.is_empty() {
                return SessionKey::from_raw(format!("imported_{s}"));
            }
        }
    }
    let fingerprint = columns
        .iter()
        .zip(row.iter())
        .map(|(_, v)| v.to_string())
        .collect::<Vec<_>>()
        .join("|");
    let digest = Sha256::digest(fingerprint.as_bytes());
    SessionKey::from_raw(format!("imported_{digest:x}"))
}

fn text(map: &HashMap<&str, &serde_json::Value>, key: &str) -> Option<String> {
    let value = map.get(key)?;
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn integer(map: &HashMap<&str, &serde_json::Value>, key: &str) -> i64 {
    match map.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// The reporting source ships dates in a few shapes depending on version.
fn parse_activity_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    let head = raw.get(..19)?;
    NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse `Series - s01e02 - Episode Title` item names into series metadata.
fn parse_item_name(name: &str) -> (String, Option<String>, Option<i64>, Option<i64>) {
    if !name.contains(" - s") || !name.contains('e') {
        return (name.to_string(), None, None, None);
    }
    let parts: Vec<&str> = name.splitn(3, " - ").collect();
    if parts.len() < 2 {
        return (name.to_string(), None, None, None);
    }

    let series = parts[0].to_string();
    let title = if parts.len() == 3 {
        parts[2].to_string()
    } else {
        name.to_string()
    };

    let marker = parts[1].to_ascii_lowercase();
    let (mut season, mut episode) = (None, None);
    if let Some(rest) = marker.strip_prefix('s') {
        if let Some((s, e)) = rest.split_once('e') {
            if let (Ok(s), Ok(e)) = (s.parse::<i64>(), e.parse::<i64>()) {
                season = Some(s);
                episode = Some(e);
            }
        }
    }

    (title, Some(series), season, episode)
}
