//! Completed-download history.
//!
//! One row per finished download, keyed by a monotonically increasing id.
//! In-flight operations are never persisted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::models::{DownloadRequest, HistoryMetadata};

/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

const DB_FILE_NAME: &str = "history.sqlite3";

/// Sink for completed downloads. Implementations must be cheap to share.
pub trait HistoryStore: Send + Sync {
    /// Persist one record and return its id.
    fn record(&self, entry: NewHistoryEntry) -> Result<i64>;
}

/// A record about to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHistoryEntry {
    pub title: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub file_path: PathBuf,
    pub format_id: Option<String>,
    pub resolution: Option<String>,
    pub is_audio_only: bool,
    /// Falls back to the file's on-disk size when `None`.
    pub file_size: Option<u64>,
    pub channel: Option<String>,
    pub duration_seconds: Option<f64>,
    /// Snapshot of the request options, for re-running a download.
    pub options: serde_json::Value,
}

impl NewHistoryEntry {
    pub fn from_download(req: &DownloadRequest, meta: &HistoryMetadata, file_path: PathBuf) -> Self {
        let title = if meta.title.trim().is_empty() {
            file_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| req.url.clone())
        } else {
            meta.title.clone()
        };

        Self {
            title,
            url: req.url.clone(),
            thumbnail_url: meta.thumbnail_url.clone(),
            file_path,
            format_id: req.format_id.clone(),
            resolution: meta.resolution.clone().or_else(|| req.resolution.clone()),
            is_audio_only: req.audio_only,
            file_size: None,
            channel: meta.channel.clone(),
            duration_seconds: meta.duration_seconds,
            options: serde_json::to_value(req).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub downloaded_at: DateTime<Utc>,
    pub title: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub file_path: PathBuf,
    pub format_id: Option<String>,
    pub resolution: Option<String>,
    pub is_audio_only: bool,
    pub file_size: Option<u64>,
    pub channel: Option<String>,
    pub duration_seconds: Option<f64>,
    pub options: serde_json::Value,
}

/// Per-user data directory for the history database.
///
/// macOS:  ~/Library/Application Support/ytdl-orchestrator
/// Windows: %APPDATA%\\ytdl-orchestrator
/// Linux:  ~/.local/share/ytdl-orchestrator (depending on XDG)
pub fn app_project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "ytdl-orchestrator", "ytdl-orchestrator")
        .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))
}

pub fn default_db_path() -> Result<PathBuf> {
    Ok(app_project_dirs()?.data_dir().join(DB_FILE_NAME))
}

/// SQLite-backed history. The connection is guarded by a mutex; callers on
/// an async runtime should invoke it from `spawn_blocking`.
pub struct SqliteHistory {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHistory").field("path", &self.path).finish()
    }
}

impl SqliteHistory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create history dir: {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("open sqlite db: {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        migrate(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open at the per-user location.
    pub fn open_default() -> Result<Self> {
        Self::open(default_db_path()?)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("history connection mutex poisoned"))
    }

    pub fn add(&self, entry: NewHistoryEntry) -> Result<i64> {
        let file_size = entry
            .file_size
            .or_else(|| fs::metadata(&entry.file_path).ok().map(|m| m.len()));
        let options = serde_json::to_string(&entry.options)?;
        let now = Utc::now().to_rfc3339();

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO history (
              downloaded_at, title, url, thumbnail_url, file_path,
              format_id, resolution, is_audio_only, file_size,
              channel, duration_seconds, options
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                now,
                entry.title,
                entry.url,
                entry.thumbnail_url,
                entry.file_path.to_string_lossy().into_owned(),
                entry.format_id,
                entry.resolution,
                entry.is_audio_only,
                file_size.map(|s| s as i64),
                entry.channel,
                entry.duration_seconds,
                options
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<HistoryEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM history WHERE id = ?1"),
                params![id],
                map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Newest first.
    pub fn list(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM history ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Case-insensitive substring match on title, channel and URL. Newest first.
    pub fn search(&self, query: &str) -> Result<Vec<HistoryEntry>> {
        let pattern = format!("%{}%", query.trim());
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {COLUMNS} FROM history
            WHERE title LIKE ?1 OR channel LIKE ?1 OR url LIKE ?1
            ORDER BY id DESC
            "#
        ))?;
        let rows = stmt
            .query_map(params![pattern], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Returns `false` if no such record existed.
    pub fn remove(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM history WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Returns the number of records removed.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM history", [])?)
    }
}

impl HistoryStore for SqliteHistory {
    fn record(&self, entry: NewHistoryEntry) -> Result<i64> {
        self.add(entry)
    }
}

const COLUMNS: &str = "id, downloaded_at, title, url, thumbnail_url, file_path, \
    format_id, resolution, is_audio_only, file_size, channel, duration_seconds, options";

fn map_row(r: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let downloaded_at: String = r.get(1)?;
    let downloaded_at = DateTime::parse_from_rfc3339(&downloaded_at)
        .map_err(|_| rusqlite::Error::InvalidQuery)?
        .with_timezone(&Utc);
    let file_path: String = r.get(5)?;
    let file_size: Option<i64> = r.get(9)?;
    let options: Option<String> = r.get(12)?;
    let options = options
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null);

    Ok(HistoryEntry {
        id: r.get(0)?,
        downloaded_at,
        title: r.get(2)?,
        url: r.get(3)?,
        thumbnail_url: r.get(4)?,
        file_path: PathBuf::from(file_path),
        format_id: r.get(6)?,
        resolution: r.get(7)?,
        is_audio_only: r.get(8)?,
        file_size: file_size.map(|s| s.max(0) as u64),
        channel: r.get(10)?,
        duration_seconds: r.get(11)?,
        options,
    })
}

fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(anyhow!(
            "history schema version {} is newer than supported {}",
            current_version,
            SCHEMA_VERSION
        ));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS history (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          downloaded_at TEXT NOT NULL,
          title TEXT NOT NULL,
          url TEXT NOT NULL,
          thumbnail_url TEXT NULL,
          file_path TEXT NOT NULL,
          format_id TEXT NULL,
          resolution TEXT NULL,
          is_audio_only INTEGER NOT NULL DEFAULT 0,
          file_size INTEGER NULL,
          channel TEXT NULL,
          duration_seconds REAL NULL,
          options TEXT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_history_downloaded_at ON history(downloaded_at);
        "#,
    )
    .context("create history table")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, channel: &str) -> NewHistoryEntry {
        NewHistoryEntry {
            title: title.to_string(),
            url: format!("https://www.youtube.com/watch?v={title}"),
            thumbnail_url: None,
            file_path: PathBuf::from(format!("/nonexistent/{title}.mp4")),
            format_id: Some("137".into()),
            resolution: Some("1080p".into()),
            is_audio_only: false,
            file_size: Some(1234),
            channel: Some(channel.to_string()),
            duration_seconds: Some(61.5),
            options: serde_json::json!({"merge_subtitles": true}),
        }
    }

    #[test]
    fn ids_increase_and_roundtrip() {
        let h = SqliteHistory::open_in_memory().unwrap();
        let a = h.add(entry("alpha", "Chan")).unwrap();
        let b = h.add(entry("beta", "Other")).unwrap();
        assert!(b > a);

        let got = h.get(a).unwrap().unwrap();
        assert_eq!(got.title, "alpha");
        assert_eq!(got.file_size, Some(1234));
        assert_eq!(got.duration_seconds, Some(61.5));
        assert_eq!(got.options["merge_subtitles"], true);
        assert!(h.get(9999).unwrap().is_none());
    }

    #[test]
    fn list_is_newest_first_and_search_matches_channel() {
        let h = SqliteHistory::open_in_memory().unwrap();
        h.add(entry("alpha", "Chan")).unwrap();
        h.add(entry("beta", "Other")).unwrap();

        let all = h.list(10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].title, "beta");

        let found = h.search("chan").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "alpha");
    }

    #[test]
    fn remove_and_clear() {
        let h = SqliteHistory::open_in_memory().unwrap();
        let a = h.add(entry("alpha", "Chan")).unwrap();
        h.add(entry("beta", "Other")).unwrap();
        assert!(h.remove(a).unwrap());
        assert!(!h.remove(a).unwrap());
        assert_eq!(h.clear().unwrap(), 1);
        assert!(h.list(10).unwrap().is_empty());
    }

    #[test]
    fn file_size_falls_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.mp4");
        fs::write(&file, vec![0u8; 42]).unwrap();

        let h = SqliteHistory::open(dir.path().join("db").join(DB_FILE_NAME)).unwrap();
        let mut e = entry("clip", "Chan");
        e.file_path = file;
        e.file_size = None;
        let id = h.add(e).unwrap();
        assert_eq!(h.get(id).unwrap().unwrap().file_size, Some(42));
    }

    #[test]
    fn reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DB_FILE_NAME);
        {
            let h = SqliteHistory::open(&path).unwrap();
            h.add(entry("alpha", "Chan")).unwrap();
        }
        let h = SqliteHistory::open(&path).unwrap();
        assert_eq!(h.list(10).unwrap().len(), 1);
    }

    #[test]
    fn entry_from_download_snapshots_options() {
        let req = DownloadRequest::new("https://x/v", "/dl").with_format("22", true);
        let meta = HistoryMetadata {
            title: "Clip".into(),
            channel: Some("Chan".into()),
            ..Default::default()
        };
        let e = NewHistoryEntry::from_download(&req, &meta, PathBuf::from("/dl/Clip.mp4"));
        assert_eq!(e.title, "Clip");
        assert_eq!(e.format_id.as_deref(), Some("22"));
        assert_eq!(e.options["format_has_audio"], true);
    }
}
