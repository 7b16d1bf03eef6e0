//! Shared types for DLMan
//!
//! This crate contains all the shared data structures used across
//! the control server, the CLI, and the core engine crate.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Download Types
// ============================================================================

/// Represents a single download task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub id: Uuid,
    pub url: String,
    pub final_url: Option<String>,
    pub filename: String,
    pub destination: PathBuf,
    pub size: Option<u64>,
    pub downloaded: u64,
    pub status: DownloadStatus,
    pub segments: Vec<Segment>,
    pub queue_id: Uuid,
    pub category_id: Option<Uuid>,
    pub error: Option<String>,
    pub speed_limit: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    pub referrer: Option<String>,
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Download {
    pub fn new(url: String, destination: PathBuf, queue_id: Uuid) -> Self {
        let filename = url.rsplit('/').next().unwrap_or("download").to_string();

        Self {
            id: Uuid::new_v4(),
            url,
            final_url: None,
            filename,
            destination,
            size: None,
            downloaded: 0,
            status: DownloadStatus::Pending,
            segments: Vec::new(),
            queue_id,
            category_id: None,
            error: None,
            speed_limit: None,
            created_at: Utc::now(),
            completed_at: None,
            retry_count: 0,
            referrer: None,
            cookies: None,
            headers: HashMap::new(),
            etag: None,
            last_modified: None,
        }
    }

    pub fn progress(&self) -> f64 {
        match self.size {
            Some(size) if size > 0 => (self.downloaded as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// Status of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Queued,
    Cancelled,
    Deleted,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Queued => "queued",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "downloading" => DownloadStatus::Downloading,
            "paused" => DownloadStatus::Paused,
            "completed" => DownloadStatus::Completed,
            "failed" => DownloadStatus::Failed,
            "queued" => DownloadStatus::Queued,
            "cancelled" => DownloadStatus::Cancelled,
            "deleted" => DownloadStatus::Deleted,
            _ => DownloadStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

/// The end of a segment's byte range: either a known last byte (inclusive)
/// or an open end for streams whose length isn't known ahead of time.
///
/// Kept as an explicit variant rather than a `u64::MAX` sentinel so callers
/// can't accidentally treat "open" as a valid offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentEnd {
    Known(u64),
    Open,
}

impl SegmentEnd {
    pub fn is_open(&self) -> bool {
        matches!(self, SegmentEnd::Open)
    }

    pub fn known(&self) -> Option<u64> {
        match self {
            SegmentEnd::Known(n) => Some(*n),
            SegmentEnd::Open => None,
        }
    }
}

/// A segment of a multi-part download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub index: u32,
    pub start: u64,
    pub end: SegmentEnd,
    pub downloaded: u64,
    pub complete: bool,
}

impl Segment {
    pub fn new(index: u32, start: u64, end: SegmentEnd) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: 0,
            complete: false,
        }
    }

    /// Total size of this segment in bytes, if known.
    pub fn size(&self) -> Option<u64> {
        match self.end {
            SegmentEnd::Known(end) => Some(end - self.start + 1),
            SegmentEnd::Open => None,
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.end.is_open()
    }

    pub fn progress(&self) -> f64 {
        match self.size() {
            Some(size) if size > 0 => (self.downloaded as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

// ============================================================================
// Queue Types
// ============================================================================

/// A download queue with scheduling and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub icon: Option<String>,
    pub max_concurrent: u32,
    pub speed_limit: Option<u64>,
    #[serde(default)]
    pub segment_count: Option<u32>,
    pub schedule: Option<Schedule>,
    pub post_action: PostAction,
    pub created_at: DateTime<Utc>,
}

impl Queue {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            color: "#3b82f6".to_string(),
            icon: None,
            max_concurrent: 2,
            speed_limit: None,
            segment_count: None,
            schedule: None,
            post_action: PostAction::None,
            created_at: Utc::now(),
        }
    }

    /// The default queue that always exists and cannot be deleted.
    pub fn default_queue() -> Self {
        Self {
            id: Uuid::nil(),
            name: "Default".to_string(),
            color: "#3b82f6".to_string(),
            icon: None,
            max_concurrent: 4,
            speed_limit: None,
            segment_count: None,
            schedule: None,
            post_action: PostAction::None,
            created_at: Utc::now(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.id == Uuid::nil()
    }
}

/// Schedule for automatic queue start/stop.
///
/// A `stop_time` earlier than `start_time` is interpreted as an overnight
/// window that wraps through midnight, e.g. start=22:00, stop=06:00.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub enabled: bool,
    pub start_time: NaiveTime,
    pub stop_time: NaiveTime,
    pub days: Vec<Weekday>,
}

impl Schedule {
    /// Whether `now`/`today` fall inside this schedule's active window.
    pub fn is_active(&self, now: NaiveTime, today: Weekday) -> bool {
        if !self.enabled || !self.days.contains(&today) {
            return false;
        }
        if self.start_time <= self.stop_time {
            now >= self.start_time && now < self.stop_time
        } else {
            // Overnight window: active from start_time through midnight to stop_time.
            now >= self.start_time || now < self.stop_time
        }
    }
}

/// Action to perform after a queue drains (all downloads terminal).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PostAction {
    #[default]
    None,
    Notify,
    Sleep,
    Shutdown,
    Hibernate,
    RunCommand {
        command: String,
    },
}

/// Options for creating/updating a queue. Every field is an explicit
/// optional patch; `None` means "leave unchanged".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    pub name: Option<String>,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub max_concurrent: Option<u32>,
    pub speed_limit: Option<Option<u64>>,
    pub segment_count: Option<Option<u32>>,
    pub schedule: Option<Option<Schedule>>,
    pub post_action: Option<PostAction>,
}

// ============================================================================
// Category Types
// ============================================================================

/// File-type classifier. Advisory only — does not gate whether a download
/// is accepted, only how a frontend might group/route it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub icon: Option<String>,
    pub extensions: Vec<String>,
    pub custom_path: Option<PathBuf>,
}

impl Category {
    pub fn new(name: String, extensions: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            color: "#64748b".to_string(),
            icon: None,
            extensions: extensions
                .into_iter()
                .map(|e| e.to_lowercase())
                .collect(),
            custom_path: None,
        }
    }

    pub fn matches_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e == &ext.to_lowercase())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryOptions {
    pub name: Option<String>,
    pub color: Option<String>,
    pub icon: Option<Option<String>>,
    pub extensions: Option<Vec<String>>,
    pub custom_path: Option<Option<PathBuf>>,
}

// ============================================================================
// Settings Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    System,
    None,
    Manual,
}

impl Default for ProxyMode {
    fn default() -> Self {
        ProxyMode::System
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    pub mode: ProxyMode,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Application-wide, persisted configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub default_download_path: PathBuf,
    pub max_concurrent_downloads: u32,
    pub default_segments: u32,
    pub global_speed_limit: Option<u64>,
    pub max_retries: u32,
    pub retry_delay_seconds: u32,
    pub proxy: ProxySettings,
    pub notify_on_complete: bool,
    pub notify_on_error: bool,
    pub auto_check_updates: bool,
    pub dev_mode: bool,
    pub minimize_to_tray: bool,
    pub start_on_boot: bool,
    pub browser_integration_port: u16,
    pub remember_last_path: bool,
    /// Restores `downloading` entries on startup instead of forcing them to
    /// `paused`. Off by default; the user controls resumption.
    #[serde(default)]
    pub auto_resume_on_startup: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_download_path: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent_downloads: 4,
            default_segments: 4,
            global_speed_limit: None,
            max_retries: 5,
            retry_delay_seconds: 30,
            proxy: ProxySettings::default(),
            notify_on_complete: true,
            notify_on_error: true,
            auto_check_updates: false,
            dev_mode: false,
            minimize_to_tray: true,
            start_on_boot: false,
            browser_integration_port: 7899,
            remember_last_path: true,
            auto_resume_on_startup: false,
        }
    }
}

impl Settings {
    pub fn clamped_segments(&self) -> u32 {
        self.default_segments.clamp(1, 16)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events broadcast by the core to the control server and any in-process
/// frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CoreEvent {
    DownloadAdded {
        download: Download,
    },
    DownloadUpdated {
        download: Download,
    },
    DownloadRemoved {
        id: Uuid,
    },
    Progress {
        id: Uuid,
        downloaded: u64,
        total: Option<u64>,
        speed: u64,
        eta: Option<u64>,
    },
    StatusChanged {
        id: Uuid,
        status: DownloadStatus,
        error: Option<String>,
    },
    QueueUpdated {
        queue: Queue,
    },
    QueueStarted {
        id: Uuid,
    },
    QueueStopped {
        id: Uuid,
    },
    PostActionFired {
        queue_id: Uuid,
        action: PostAction,
    },
    SettingsUpdated,
}

impl CoreEvent {
    /// Status-affecting events must never be dropped by a slow subscriber;
    /// progress events may be coalesced/dropped under backpressure.
    pub fn is_high_priority(&self) -> bool {
        !matches!(self, CoreEvent::Progress { .. })
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Information about a link, from probing before it's added as a download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub url: String,
    pub final_url: Option<String>,
    pub filename: String,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub resumable: bool,
    pub error: Option<String>,
}

/// Result of a batch import of a previously exported snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub successful: Vec<Download>,
    pub failed: Vec<ImportError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportError {
    pub url: String,
    pub error: String,
}

/// Request payload for adding a single download over the control API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDownloadRequest {
    pub url: String,
    pub filename: Option<String>,
    pub destination: Option<PathBuf>,
    pub queue_id: Option<Uuid>,
    pub referrer: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub cookies: Option<String>,
}

/// Partial update for a download. Every field uses the double-`Option`
/// pattern: the outer `Option` distinguishes "omitted" from "present", the
/// inner `Option` carries an explicit null for fields that can be cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadPatch {
    pub destination: Option<PathBuf>,
    pub speed_limit: Option<Option<u64>>,
    pub queue_id: Option<Uuid>,
}
