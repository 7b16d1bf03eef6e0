//! The `DlmanCore` facade (§2's crate-to-component map): wires transport,
//! rate limiter, writer, segment worker, download task, persistence,
//! scheduler, and event bus behind the single handle both binaries hold.

use crate::download_task::{self, DownloadTaskDeps, Intent};
use crate::error::DlmanError;
use crate::events::{EventBus, EventSubscription};
use crate::persistence::Storage;
use crate::rate_limiter::{RateLimiterChain, TokenBucket};
use crate::scheduler::{Scheduler, SchedulerControl};
use crate::transport::{self, ProbeResult};
use dlman_types::{
    AddDownloadRequest, Category, CategoryOptions, CoreEvent, Download, DownloadPatch,
    DownloadStatus, LinkInfo, Queue, QueueOptions, Settings,
};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct ActiveHandle {
    intent: Intent,
    cancel: CancellationToken,
}

struct Inner {
    storage: Storage,
    events: EventBus,
    client: Mutex<Client>,
    active: Mutex<HashMap<Uuid, ActiveHandle>>,
    global_bucket: TokenBucket,
    queue_buckets: Mutex<HashMap<Uuid, TokenBucket>>,
    scheduler_waker: Mutex<Option<Arc<tokio::sync::Notify>>>,
    /// Set once, right after construction, so trait methods taking plain
    /// `&self` can still spawn a task that needs to outlive the call.
    self_weak: Mutex<Weak<Inner>>,
}

/// Handle shared by every frontend (CLI, control server, and previously the
/// desktop app). Cheap to clone; all state lives behind the inner `Arc`.
#[derive(Clone)]
pub struct DlmanCore {
    inner: Arc<Inner>,
}

impl SchedulerControl for Inner {
    fn grant(&self, download_id: Uuid) {
        self.spawn_download_task(download_id);
    }

    fn pause_for_schedule(&self, download_id: Uuid) {
        if let Some(handle) = self.active.lock().get(&download_id) {
            handle.intent.request_schedule_pause();
            handle.cancel.cancel();
        }
    }
}

impl Inner {
    fn spawn_download_task(&self, download_id: Uuid) {
        let Some(this) = self.self_weak.lock().upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let Ok(Some(download)) = this.storage.load_download(download_id).await else {
                return;
            };
            let mut settings = this.storage.load_settings().await.unwrap_or_default();
            if let Ok(queues) = this.storage.load_all_queues().await {
                if let Some(segment_count) = queues
                    .into_iter()
                    .find(|q| q.id == download.queue_id)
                    .and_then(|q| q.segment_count)
                {
                    settings.default_segments = segment_count;
                }
            }
            let intent = Intent::new();
            let cancel = CancellationToken::new();
            this.active.lock().insert(
                download_id,
                ActiveHandle {
                    intent: intent.clone(),
                    cancel: cancel.clone(),
                },
            );

            let queue_bucket = {
                let mut buckets = this.queue_buckets.lock();
                buckets
                    .entry(download.queue_id)
                    .or_insert_with(TokenBucket::unlimited)
                    .clone()
            };
            let download_bucket = TokenBucket::new(download.speed_limit);
            let rate_limiter = RateLimiterChain::new(this.global_bucket.clone(), queue_bucket, download_bucket);

            let deps = DownloadTaskDeps {
                client: this.client.lock().clone(),
                storage: this.storage.clone(),
                events: this.events.clone(),
                rate_limiter,
                cancel,
                intent,
                max_retries: settings.max_retries,
                retry_delay: Duration::from_secs(settings.retry_delay_seconds as u64),
                settings,
            };

            let final_download = download_task::run(deps, download).await;
            this.active.lock().remove(&download_id);
            this.events.publish(CoreEvent::DownloadUpdated {
                download: final_download,
            });
            if let Some(waker) = this.scheduler_waker.lock().as_ref() {
                waker.notify_one();
            }
        });
    }
}

impl DlmanCore {
    pub async fn new(data_dir: PathBuf) -> Result<Self, DlmanError> {
        let storage = Storage::open(data_dir.join("dlman.db")).await?;
        let settings = storage.load_settings().await?;
        if storage.load_all_queues().await?.is_empty() {
            storage.upsert_queue(&Queue::default_queue()).await?;
        }

        let client = transport::build_http_client(&settings)?;
        let events = EventBus::new();

        storage.recover(settings.auto_resume_on_startup).await?;

        let inner = Arc::new(Inner {
            storage: storage.clone(),
            events: events.clone(),
            client: Mutex::new(client),
            active: Mutex::new(HashMap::new()),
            global_bucket: TokenBucket::new(settings.global_speed_limit),
            queue_buckets: Mutex::new(HashMap::new()),
            scheduler_waker: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
        });
        *inner.self_weak.lock() = Arc::downgrade(&inner);

        let scheduler = Scheduler::new(storage.clone(), events.clone(), inner.clone() as Arc<dyn SchedulerControl>);
        *inner.scheduler_waker.lock() = Some(scheduler.waker());
        tokio::spawn(scheduler.run());

        if settings.auto_resume_on_startup {
            for download in storage.load_all_downloads().await? {
                if download.status == DownloadStatus::Downloading {
                    inner.spawn_download_task(download.id);
                }
            }
        }

        Ok(Self { inner })
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    fn wake_scheduler(&self) {
        if let Some(waker) = self.inner.scheduler_waker.lock().as_ref() {
            waker.notify_one();
        }
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    pub async fn add_download(&self, request: AddDownloadRequest) -> Result<Download, DlmanError> {
        let settings = self.inner.storage.load_settings().await?;
        let destination = request
            .destination
            .unwrap_or_else(|| settings.default_download_path.clone());
        let queue_id = request.queue_id.unwrap_or_else(Uuid::nil);

        let mut download = Download::new(request.url, destination, queue_id);
        if let Some(filename) = request.filename {
            download.filename = filename;
        }
        download.referrer = request.referrer;
        download.cookies = request.cookies;
        download.headers = request.headers.unwrap_or_default();
        download.status = DownloadStatus::Queued;

        self.inner.storage.upsert_download(&download).await?;
        self.inner.events.publish(CoreEvent::DownloadAdded {
            download: download.clone(),
        });
        self.wake_scheduler();
        Ok(download)
    }

    pub async fn list_downloads(&self, status: Option<DownloadStatus>) -> Result<Vec<Download>, DlmanError> {
        let all = self.inner.storage.load_all_downloads().await?;
        Ok(match status {
            Some(status) => all.into_iter().filter(|d| d.status == status).collect(),
            None => all,
        })
    }

    pub async fn get_download(&self, id: Uuid) -> Result<Download, DlmanError> {
        self.inner
            .storage
            .load_download(id)
            .await?
            .ok_or(DlmanError::NotFound(id))
    }

    pub async fn pause_download(&self, id: Uuid) -> Result<Download, DlmanError> {
        let mut download = self.get_download(id).await?;
        if download.status.is_terminal() || download.status == DownloadStatus::Paused {
            return Ok(download);
        }
        if let Some(handle) = self.inner.active.lock().get(&id) {
            handle.intent.request_pause();
            handle.cancel.cancel();
        } else {
            download.status = DownloadStatus::Paused;
            self.inner
                .storage
                .update_download_status(id, DownloadStatus::Paused, None)
                .await?;
            self.inner.events.publish(CoreEvent::StatusChanged {
                id,
                status: DownloadStatus::Paused,
                error: None,
            });
        }
        self.get_download(id).await
    }

    pub async fn resume_download(&self, id: Uuid) -> Result<Download, DlmanError> {
        let mut download = self.get_download(id).await?;
        if !matches!(download.status, DownloadStatus::Paused | DownloadStatus::Failed) {
            return Ok(download);
        }
        download.status = DownloadStatus::Queued;
        download.error = None;
        self.inner.storage.upsert_download(&download).await?;
        self.inner.events.publish(CoreEvent::StatusChanged {
            id,
            status: DownloadStatus::Queued,
            error: None,
        });
        self.wake_scheduler();
        Ok(download)
    }

    pub async fn retry_download(&self, id: Uuid) -> Result<Download, DlmanError> {
        let mut download = self.get_download(id).await?;
        if !matches!(
            download.status,
            DownloadStatus::Paused | DownloadStatus::Failed | DownloadStatus::Cancelled
        ) {
            return Ok(download);
        }
        // Clearing `final_url` forces `download_task::run`'s probe gate to
        // fire again: a retry reprobes the URL so a stale etag/last-modified/
        // size surfaces as `ContentChanged` instead of resuming blind.
        download.final_url = None;
        download.status = DownloadStatus::Queued;
        download.error = None;
        self.inner.storage.upsert_download(&download).await?;
        self.inner.events.publish(CoreEvent::StatusChanged {
            id,
            status: DownloadStatus::Queued,
            error: None,
        });
        self.wake_scheduler();
        Ok(download)
    }

    pub async fn cancel_download(&self, id: Uuid) -> Result<Download, DlmanError> {
        let mut download = self.get_download(id).await?;
        if download.status.is_terminal() {
            return Ok(download);
        }
        if let Some(handle) = self.inner.active.lock().get(&id) {
            handle.intent.request_cancel();
            handle.cancel.cancel();
        } else {
            download.status = DownloadStatus::Cancelled;
            self.inner
                .storage
                .update_download_status(id, DownloadStatus::Cancelled, None)
                .await?;
            self.inner.events.publish(CoreEvent::StatusChanged {
                id,
                status: DownloadStatus::Cancelled,
                error: None,
            });
        }
        self.get_download(id).await
    }

    pub async fn remove_download(&self, id: Uuid, delete_file: bool) -> Result<(), DlmanError> {
        let download = self.get_download(id).await?;
        if let Some(handle) = self.inner.active.lock().get(&id) {
            handle.intent.request_cancel();
            handle.cancel.cancel();
        }
        // Give a running task a moment to unwind before tearing down rows.
        for _ in 0..20 {
            if !self.inner.active.lock().contains_key(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        if delete_file {
            let path = download.destination.join(&download.filename);
            let _ = tokio::fs::remove_file(&path).await;
            let part = download.destination.join(format!("{}.part", download.filename));
            let _ = tokio::fs::remove_file(&part).await;
        }

        self.inner.storage.delete_download(id).await?;
        self.inner.events.publish(CoreEvent::DownloadRemoved { id });
        Ok(())
    }

    pub async fn patch_download(&self, id: Uuid, patch: DownloadPatch) -> Result<Download, DlmanError> {
        let mut download = self.get_download(id).await?;
        if let Some(destination) = patch.destination {
            download.destination = destination;
        }
        if let Some(speed_limit) = patch.speed_limit {
            download.speed_limit = speed_limit;
        }
        if let Some(queue_id) = patch.queue_id {
            download.queue_id = queue_id;
        }
        self.inner.storage.upsert_download(&download).await?;
        self.inner.events.publish(CoreEvent::DownloadUpdated {
            download: download.clone(),
        });
        Ok(download)
    }

    pub async fn probe_links(&self, urls: Vec<String>) -> Vec<LinkInfo> {
        let client = self.inner.client.lock().clone();
        let mut results = Vec::with_capacity(urls.len());
        for url in urls {
            let info = match transport::probe(&client, &url, &[]).await {
                Ok(ProbeResult {
                    final_url,
                    size,
                    accepts_ranges,
                    content_type,
                    filename_hint,
                    ..
                }) => LinkInfo {
                    url: url.clone(),
                    final_url: Some(final_url),
                    filename: filename_hint.unwrap_or_else(|| "download".to_string()),
                    size,
                    content_type,
                    resumable: accepts_ranges,
                    error: None,
                },
                Err(err) => LinkInfo {
                    url: url.clone(),
                    final_url: None,
                    filename: "download".to_string(),
                    size: None,
                    content_type: None,
                    resumable: false,
                    error: Some(err.to_string()),
                },
            };
            results.push(info);
        }
        results
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    pub async fn list_queues(&self) -> Result<Vec<Queue>, DlmanError> {
        self.inner.storage.load_all_queues().await
    }

    pub async fn create_queue(&self, name: String) -> Result<Queue, DlmanError> {
        let queue = Queue::new(name);
        self.inner.storage.upsert_queue(&queue).await?;
        self.inner.events.publish(CoreEvent::QueueUpdated { queue: queue.clone() });
        Ok(queue)
    }

    pub async fn update_queue(&self, id: Uuid, options: QueueOptions) -> Result<Queue, DlmanError> {
        let mut queue = self
            .list_queues()
            .await?
            .into_iter()
            .find(|q| q.id == id)
            .ok_or(DlmanError::QueueNotFound(id))?;

        if let Some(name) = options.name {
            queue.name = name;
        }
        if let Some(color) = options.color {
            queue.color = color;
        }
        if let Some(icon) = options.icon {
            queue.icon = Some(icon);
        }
        if let Some(max_concurrent) = options.max_concurrent {
            queue.max_concurrent = max_concurrent.max(1);
        }
        if let Some(speed_limit) = options.speed_limit {
            queue.speed_limit = speed_limit;
            let bucket = self.inner.queue_buckets.lock().get(&id).cloned();
            if let Some(bucket) = bucket {
                bucket.set_rate(speed_limit).await;
            }
        }
        if let Some(segment_count) = options.segment_count {
            queue.segment_count = segment_count;
        }
        if let Some(schedule) = options.schedule {
            queue.schedule = schedule;
        }
        if let Some(post_action) = options.post_action {
            queue.post_action = post_action;
        }

        self.inner.storage.upsert_queue(&queue).await?;
        self.inner.events.publish(CoreEvent::QueueUpdated { queue: queue.clone() });
        Ok(queue)
    }

    pub async fn delete_queue(&self, id: Uuid) -> Result<(), DlmanError> {
        if id == Uuid::nil() {
            return Err(DlmanError::InvalidOperation("cannot delete the default queue".into()));
        }
        for mut download in self.list_downloads(None).await? {
            if download.queue_id == id {
                download.queue_id = Uuid::nil();
                self.inner.storage.upsert_download(&download).await?;
            }
        }
        self.inner.storage.delete_queue(id).await?;
        self.inner.queue_buckets.lock().remove(&id);
        Ok(())
    }

    pub async fn start_queue(&self, id: Uuid) -> Result<(), DlmanError> {
        for download in self.list_downloads(None).await? {
            if download.queue_id == id && download.status == DownloadStatus::Paused {
                self.resume_download(download.id).await?;
            }
        }
        self.inner.events.publish(CoreEvent::QueueStarted { id });
        Ok(())
    }

    pub async fn stop_queue(&self, id: Uuid) -> Result<(), DlmanError> {
        for download in self.list_downloads(None).await? {
            if download.queue_id == id && download.status == DownloadStatus::Downloading {
                self.pause_download(download.id).await?;
            }
        }
        self.inner.events.publish(CoreEvent::QueueStopped { id });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Categories
    // ------------------------------------------------------------------

    pub async fn list_categories(&self) -> Result<Vec<Category>, DlmanError> {
        self.inner.storage.load_all_categories().await
    }

    pub async fn create_category(&self, name: String, extensions: Vec<String>) -> Result<Category, DlmanError> {
        let category = Category::new(name, extensions);
        self.inner.storage.upsert_category(&category).await?;
        Ok(category)
    }

    pub async fn update_category(&self, id: Uuid, options: CategoryOptions) -> Result<Category, DlmanError> {
        let mut category = self
            .list_categories()
            .await?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or(DlmanError::CategoryNotFound(id))?;

        if let Some(name) = options.name {
            category.name = name;
        }
        if let Some(color) = options.color {
            category.color = color;
        }
        if let Some(icon) = options.icon {
            category.icon = icon;
        }
        if let Some(extensions) = options.extensions {
            category.extensions = extensions;
        }
        if let Some(custom_path) = options.custom_path {
            category.custom_path = custom_path;
        }

        self.inner.storage.upsert_category(&category).await?;
        Ok(category)
    }

    pub async fn delete_category(&self, id: Uuid) -> Result<(), DlmanError> {
        self.inner.storage.delete_category(id).await
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_settings(&self) -> Result<Settings, DlmanError> {
        self.inner.storage.load_settings().await
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<Settings, DlmanError> {
        self.inner.storage.save_settings(&settings).await?;
        self.inner.global_bucket.set_rate(settings.global_speed_limit).await;
        *self.inner.client.lock() = transport::build_http_client(&settings)?;
        self.inner.events.publish(CoreEvent::SettingsUpdated);
        Ok(settings)
    }

    // ------------------------------------------------------------------
    // Import / export
    // ------------------------------------------------------------------

    pub async fn export_snapshot(&self) -> Result<serde_json::Value, DlmanError> {
        let downloads = self.list_downloads(None).await?;
        let queues = self.list_queues().await?;
        let settings = self.get_settings().await?;
        Ok(serde_json::json!({
            "downloads": downloads,
            "queues": queues,
            "settings": settings,
        }))
    }

    pub async fn import_snapshot(&self, snapshot: serde_json::Value) -> Result<usize, DlmanError> {
        let downloads: Vec<Download> = snapshot
            .get("downloads")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let count = downloads.len();
        for download in downloads {
            self.inner.storage.upsert_download(&download).await?;
        }
        if let Some(queues) = snapshot.get("queues").cloned() {
            let queues: Vec<Queue> = serde_json::from_value(queues)?;
            for queue in queues {
                self.inner.storage.upsert_queue(&queue).await?;
            }
        }
        Ok(count)
    }
}
