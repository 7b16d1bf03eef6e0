//! Persistence layer (§4.F): a single embedded SQLite store for downloads,
//! segments, queues, categories, and settings. Every state transition and
//! every segment batch write runs in one transaction; progress checkpoints
//! are plain single-row updates issued by the batching actor in
//! [`crate::segment_worker`].

use crate::error::DlmanError;
use chrono::{DateTime, Utc};
use dlman_types::{
    Category, Download, DownloadStatus, PostAction, Queue, Schedule, Segment, SegmentEnd,
    Settings,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

const SETTINGS_KEY: &str = "settings";

/// The single embedded relational store (§3, §4.F). Cheap to clone — it
/// wraps a connection pool.
#[derive(Clone, Debug)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, DlmanError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DlmanError::io(parent.display().to_string(), e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;

        run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    // ------------------------------------------------------------------
    // Downloads + segments
    // ------------------------------------------------------------------

    /// Persist a download and its full segment list in one transaction
    /// (§4.F: "state transitions and segment batch writes run in one
    /// transaction each").
    pub async fn upsert_download(&self, download: &Download) -> Result<(), DlmanError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, url, final_url, filename, destination, size, downloaded,
                status, queue_id, category_id, speed_limit, error, referrer,
                cookies, headers_json, created_at, completed_at, etag,
                last_modified, retry_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                final_url = excluded.final_url,
                filename = excluded.filename,
                destination = excluded.destination,
                size = excluded.size,
                downloaded = excluded.downloaded,
                status = excluded.status,
                queue_id = excluded.queue_id,
                category_id = excluded.category_id,
                speed_limit = excluded.speed_limit,
                error = excluded.error,
                referrer = excluded.referrer,
                cookies = excluded.cookies,
                headers_json = excluded.headers_json,
                completed_at = excluded.completed_at,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                retry_count = excluded.retry_count
            "#,
        )
        .bind(download.id.to_string())
        .bind(&download.url)
        .bind(&download.final_url)
        .bind(&download.filename)
        .bind(download.destination.to_string_lossy().into_owned())
        .bind(download.size.map(|s| s as i64))
        .bind(download.downloaded as i64)
        .bind(download.status.as_str())
        .bind(download.queue_id.to_string())
        .bind(download.category_id.map(|id| id.to_string()))
        .bind(download.speed_limit.map(|s| s as i64))
        .bind(&download.error)
        .bind(&download.referrer)
        .bind(&download.cookies)
        .bind(serde_json::to_string(&download.headers).unwrap_or_default())
        .bind(download.created_at.to_rfc3339())
        .bind(download.completed_at.map(|d| d.to_rfc3339()))
        .bind(&download.etag)
        .bind(&download.last_modified)
        .bind(download.retry_count as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM segments WHERE download_id = ?")
            .bind(download.id.to_string())
            .execute(&mut *tx)
            .await?;

        for segment in &download.segments {
            insert_segment(&mut tx, download.id, segment).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Checkpoint a single segment's progress (§4.D: coalesced to ≤1/sec,
    /// always on transition to complete/pause/error). Cheaper than
    /// `upsert_download` since it touches one row — but `downloads.downloaded`
    /// still has to reflect every segment, not just this one, so it's
    /// recomputed from the segments table inside the same transaction rather
    /// than trusting a caller-supplied total that can only see its own
    /// segment.
    pub async fn checkpoint_segment(
        &self,
        download_id: Uuid,
        segment: &Segment,
    ) -> Result<(), DlmanError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE segments SET downloaded = ?, complete = ?, end_byte = ?, end_open = ?
             WHERE download_id = ? AND idx = ?",
        )
        .bind(segment.downloaded as i64)
        .bind(segment.complete)
        .bind(segment.end.known().map(|e| e as i64).unwrap_or(0))
        .bind(segment.end.is_open())
        .bind(download_id.to_string())
        .bind(segment.index as i64)
        .execute(&mut *tx)
        .await?;

        let total_downloaded: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(downloaded), 0) FROM segments WHERE download_id = ?")
                .bind(download_id.to_string())
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query("UPDATE downloads SET downloaded = ? WHERE id = ?")
            .bind(total_downloaded)
            .bind(download_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn update_download_status(
        &self,
        id: Uuid,
        status: DownloadStatus,
        error: Option<&str>,
    ) -> Result<(), DlmanError> {
        let completed_at = (status == DownloadStatus::Completed).then(|| Utc::now().to_rfc3339());
        sqlx::query(
            "UPDATE downloads SET status = ?, error = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(completed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_download_fields(&self, download: &Download) -> Result<(), DlmanError> {
        self.upsert_download(download).await
    }

    pub async fn load_download(&self, id: Uuid) -> Result<Option<Download>, DlmanError> {
        let Some(row) = sqlx::query("SELECT * FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let segments = self.load_segments(id).await?;
        Ok(Some(row_to_download(row, segments)?))
    }

    pub async fn load_all_downloads(&self) -> Result<Vec<Download>, DlmanError> {
        let rows = sqlx::query("SELECT * FROM downloads ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        let segment_rows = sqlx::query("SELECT * FROM segments ORDER BY download_id, idx")
            .fetch_all(&self.pool)
            .await?;

        let mut by_download: HashMap<String, Vec<Segment>> = HashMap::new();
        for row in segment_rows {
            let download_id: String = row.get("download_id");
            by_download
                .entry(download_id)
                .or_default()
                .push(row_to_segment(&row)?);
        }

        rows.into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let segments = by_download.remove(&id).unwrap_or_default();
                row_to_download(row, segments)
            })
            .collect()
    }

    async fn load_segments(&self, download_id: Uuid) -> Result<Vec<Segment>, DlmanError> {
        let rows = sqlx::query("SELECT * FROM segments WHERE download_id = ? ORDER BY idx")
            .bind(download_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_segment).collect()
    }

    pub async fn delete_download(&self, id: Uuid) -> Result<(), DlmanError> {
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    pub async fn upsert_queue(&self, queue: &Queue) -> Result<(), DlmanError> {
        sqlx::query(
            r#"
            INSERT INTO queues (id, name, color, icon, max_concurrent, speed_limit, segment_count, schedule_json, post_action_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                color = excluded.color,
                icon = excluded.icon,
                max_concurrent = excluded.max_concurrent,
                speed_limit = excluded.speed_limit,
                segment_count = excluded.segment_count,
                schedule_json = excluded.schedule_json,
                post_action_json = excluded.post_action_json
            "#,
        )
        .bind(queue.id.to_string())
        .bind(&queue.name)
        .bind(&queue.color)
        .bind(&queue.icon)
        .bind(queue.max_concurrent as i64)
        .bind(queue.speed_limit.map(|s| s as i64))
        .bind(queue.segment_count.map(|s| s as i64))
        .bind(
            queue
                .schedule
                .as_ref()
                .map(|s| serde_json::to_string(s).unwrap_or_default()),
        )
        .bind(serde_json::to_string(&queue.post_action).unwrap_or_default())
        .bind(queue.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_queue(&self, id: Uuid) -> Result<(), DlmanError> {
        sqlx::query("DELETE FROM queues WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_all_queues(&self) -> Result<Vec<Queue>, DlmanError> {
        let rows = sqlx::query("SELECT * FROM queues ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_queue).collect()
    }

    // ------------------------------------------------------------------
    // Categories
    // ------------------------------------------------------------------

    pub async fn upsert_category(&self, category: &Category) -> Result<(), DlmanError> {
        sqlx::query(
            r#"
            INSERT INTO categories (id, name, color, icon, extensions_csv, custom_path)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                color = excluded.color,
                icon = excluded.icon,
                extensions_csv = excluded.extensions_csv,
                custom_path = excluded.custom_path
            "#,
        )
        .bind(category.id.to_string())
        .bind(&category.name)
        .bind(&category.color)
        .bind(&category.icon)
        .bind(category.extensions.join(","))
        .bind(
            category
                .custom_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_category(&self, id: Uuid) -> Result<(), DlmanError> {
        sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_all_categories(&self) -> Result<Vec<Category>, DlmanError> {
        let rows = sqlx::query("SELECT * FROM categories")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_category).collect()
    }

    // ------------------------------------------------------------------
    // Settings (single-row logical document, §3)
    // ------------------------------------------------------------------

    pub async fn load_settings(&self) -> Result<Settings, DlmanError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(SETTINGS_KEY)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: String = row.get("value");
                Ok(serde_json::from_str(&value).unwrap_or_default())
            }
            None => Ok(Settings::default()),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), DlmanError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(SETTINGS_KEY)
        .bind(serde_json::to_string(settings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Crash recovery (§4.F)
    // ------------------------------------------------------------------

    /// Run the startup recovery scan: transition in-flight downloads to
    /// `paused` (unless `auto_resume_on_startup` is set), clamp segments
    /// whose persisted `downloaded` overruns their range, and drop `file
    /// does not exist` from completed downloads into their `error` field
    /// without touching their bytes.
    pub async fn recover(&self, auto_resume: bool) -> Result<Vec<Download>, DlmanError> {
        let mut downloads = self.load_all_downloads().await?;

        for download in &mut downloads {
            if download.status == DownloadStatus::Downloading && !auto_resume {
                download.status = DownloadStatus::Paused;
                self.update_download_status(download.id, DownloadStatus::Paused, None)
                    .await?;
            }

            let mut changed = false;
            for segment in &mut download.segments {
                if let Some(end) = segment.end.known() {
                    let span = end.saturating_sub(segment.start) + 1;
                    if segment.downloaded > span {
                        segment.downloaded = span;
                        changed = true;
                    }
                }
            }
            if changed {
                self.upsert_download(download).await?;
            }

            if download.status == DownloadStatus::Completed {
                let path = download.destination.join(&download.filename);
                if !path.exists() {
                    download.error = Some("file_missing".to_string());
                }
            }
        }

        Ok(downloads)
    }
}

async fn insert_segment(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    download_id: Uuid,
    segment: &Segment,
) -> Result<(), DlmanError> {
    sqlx::query(
        "INSERT INTO segments (download_id, idx, start_byte, end_byte, end_open, downloaded, complete)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(download_id.to_string())
    .bind(segment.index as i64)
    .bind(segment.start as i64)
    .bind(segment.end.known().map(|e| e as i64).unwrap_or(0))
    .bind(segment.end.is_open())
    .bind(segment.downloaded as i64)
    .bind(segment.complete)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_segment(row: &SqliteRow) -> Result<Segment, DlmanError> {
    let end_open: bool = row.get("end_open");
    let end = if end_open {
        SegmentEnd::Open
    } else {
        SegmentEnd::Known(row.get::<i64, _>("end_byte") as u64)
    };
    Ok(Segment {
        index: row.get::<i64, _>("idx") as u32,
        start: row.get::<i64, _>("start_byte") as u64,
        end,
        downloaded: row.get::<i64, _>("downloaded") as u64,
        complete: row.get("complete"),
    })
}

fn row_to_download(row: SqliteRow, segments: Vec<Segment>) -> Result<Download, DlmanError> {
    let headers_json: String = row.get("headers_json");
    Ok(Download {
        id: parse_uuid(row.get("id"))?,
        url: row.get("url"),
        final_url: row.get("final_url"),
        filename: row.get("filename"),
        destination: row.get::<String, _>("destination").into(),
        size: row.get::<Option<i64>, _>("size").map(|s| s as u64),
        downloaded: row.get::<i64, _>("downloaded") as u64,
        status: DownloadStatus::parse(&row.get::<String, _>("status")),
        segments,
        queue_id: parse_uuid(row.get("queue_id"))?,
        category_id: row
            .get::<Option<String>, _>("category_id")
            .and_then(|s| Uuid::parse_str(&s).ok()),
        error: row.get("error"),
        speed_limit: row.get::<Option<i64>, _>("speed_limit").map(|s| s as u64),
        created_at: parse_rfc3339(row.get("created_at"))?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(|s| parse_rfc3339(s))
            .transpose()?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        referrer: row.get("referrer"),
        cookies: row.get("cookies"),
        headers: serde_json::from_str(&headers_json).unwrap_or_default(),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
    })
}

fn row_to_queue(row: &SqliteRow) -> Result<Queue, DlmanError> {
    let schedule_json: Option<String> = row.get("schedule_json");
    let post_action_json: String = row.get("post_action_json");
    Ok(Queue {
        id: parse_uuid(row.get("id"))?,
        name: row.get("name"),
        color: row.get("color"),
        icon: row.get("icon"),
        max_concurrent: row.get::<i64, _>("max_concurrent") as u32,
        speed_limit: row.get::<Option<i64>, _>("speed_limit").map(|s| s as u64),
        segment_count: row.get::<Option<i64>, _>("segment_count").map(|s| s as u32),
        schedule: schedule_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<Schedule>(s).ok()),
        post_action: serde_json::from_str::<PostAction>(&post_action_json).unwrap_or_default(),
        created_at: parse_rfc3339(row.get("created_at"))?,
    })
}

fn row_to_category(row: &SqliteRow) -> Result<Category, DlmanError> {
    let extensions_csv: String = row.get("extensions_csv");
    Ok(Category {
        id: parse_uuid(row.get("id"))?,
        name: row.get("name"),
        color: row.get("color"),
        icon: row.get("icon"),
        extensions: extensions_csv
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        custom_path: row
            .get::<Option<String>, _>("custom_path")
            .map(std::path::PathBuf::from),
    })
}

fn parse_uuid(s: String) -> Result<Uuid, DlmanError> {
    Uuid::parse_str(&s).map_err(|e| DlmanError::InvariantViolation(format!("bad uuid {s}: {e}")))
}

fn parse_rfc3339(s: String) -> Result<DateTime<Utc>, DlmanError> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DlmanError::InvariantViolation(format!("bad timestamp {s}: {e}")))
}

/// Ordered migration steps, applied once inside a single transaction.
/// `schema_version` tracks how many have run so new steps appended here
/// only execute on upgrade, never re-run.
const MIGRATIONS: &[&str] = &[MIGRATION_0001];

async fn run_migrations(pool: &SqlitePool) -> Result<(), DlmanError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;
    let applied: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await?;

    let mut tx = pool.begin().await?;
    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version <= applied {
            continue;
        }
        sqlx::query(migration).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

const MIGRATION_0001: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    final_url TEXT,
    filename TEXT NOT NULL,
    destination TEXT NOT NULL,
    size INTEGER,
    downloaded INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    queue_id TEXT NOT NULL,
    category_id TEXT,
    speed_limit INTEGER,
    error TEXT,
    referrer TEXT,
    cookies TEXT,
    headers_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    completed_at TEXT,
    etag TEXT,
    last_modified TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS segments (
    download_id TEXT NOT NULL,
    idx INTEGER NOT NULL,
    start_byte INTEGER NOT NULL,
    end_byte INTEGER NOT NULL,
    end_open INTEGER NOT NULL DEFAULT 0,
    downloaded INTEGER NOT NULL DEFAULT 0,
    complete INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (download_id, idx),
    FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS queues (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    color TEXT NOT NULL,
    icon TEXT,
    max_concurrent INTEGER NOT NULL,
    speed_limit INTEGER,
    segment_count INTEGER,
    schedule_json TEXT,
    post_action_json TEXT NOT NULL DEFAULT '{"kind":"none"}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    color TEXT NOT NULL,
    icon TEXT,
    extensions_csv TEXT NOT NULL DEFAULT '',
    custom_path TEXT
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
CREATE INDEX IF NOT EXISTS idx_downloads_queue ON downloads(queue_id);
CREATE INDEX IF NOT EXISTS idx_segments_download ON segments(download_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use dlman_types::Segment;

    async fn memory_storage() -> Storage {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        Storage { pool }
    }

    #[tokio::test]
    async fn round_trips_a_download_with_segments() {
        let storage = memory_storage().await;
        let mut download = Download::new("http://x/f.bin".into(), "/tmp".into(), Uuid::nil());
        download.segments = vec![
            Segment::new(0, 0, SegmentEnd::Known(99)),
            Segment::new(1, 100, SegmentEnd::Open),
        ];
        storage.upsert_download(&download).await.unwrap();

        let loaded = storage.load_download(download.id).await.unwrap().unwrap();
        assert_eq!(loaded.segments.len(), 2);
        assert_eq!(loaded.segments[0].end, SegmentEnd::Known(99));
        assert!(loaded.segments[1].end.is_open());
    }

    #[tokio::test]
    async fn recovery_clamps_overrun_segments() {
        let storage = memory_storage().await;
        let mut download = Download::new("http://x/f.bin".into(), "/tmp".into(), Uuid::nil());
        download.status = DownloadStatus::Downloading;
        let mut segment = Segment::new(0, 0, SegmentEnd::Known(9));
        segment.downloaded = 50; // overruns the 10-byte span
        download.segments = vec![segment];
        storage.upsert_download(&download).await.unwrap();

        let recovered = storage.recover(false).await.unwrap();
        let recovered = recovered.into_iter().find(|d| d.id == download.id).unwrap();
        assert_eq!(recovered.status, DownloadStatus::Paused);
        assert_eq!(recovered.segments[0].downloaded, 10);
    }

    #[tokio::test]
    async fn settings_default_when_absent() {
        let storage = memory_storage().await;
        let settings = storage.load_settings().await.unwrap();
        assert_eq!(settings.max_concurrent_downloads, 4);
    }
}
