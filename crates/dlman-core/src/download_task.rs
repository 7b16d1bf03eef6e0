//! Download supervisor (§4.E): owns one download's lifecycle end to end —
//! probe, plan, run segment workers, merge and finalize, and the
//! retry/fatal/cancel decision tree between them. Named `download_task` to
//! match its role as the one task spawned per `downloading` transition.

use crate::error::DlmanError;
use crate::events::EventBus;
use crate::persistence::Storage;
use crate::rate_limiter::RateLimiterChain;
use crate::segment_worker::{SegmentOutcome, SegmentWorker};
use crate::transport::{self, ProbeResult};
use crate::writer::SharedWriter;
use dlman_types::{CoreEvent, Download, DownloadStatus, Segment, SegmentEnd, Settings};
use reqwest::Client;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ONE_MIB: u64 = 1024 * 1024;

/// What the caller asked for before cancelling the task's token. Read by
/// the task once its workers have unwound so it persists the status the
/// user actually requested rather than guessing from the error shape.
#[derive(Clone)]
pub struct Intent(Arc<AtomicU8>);

const INTENT_NONE: u8 = 0;
const INTENT_PAUSE: u8 = 1;
const INTENT_CANCEL: u8 = 2;
const INTENT_SCHEDULE_PAUSE: u8 = 3;

impl Intent {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(INTENT_NONE)))
    }

    pub fn request_pause(&self) {
        self.0.store(INTENT_PAUSE, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.0.store(INTENT_CANCEL, Ordering::SeqCst);
    }

    /// A schedule window closed on a running download. Unlike a user pause,
    /// this must land back in `queued` (§4.G: "they return to queued") so
    /// the scheduler itself promotes it again once the window reopens,
    /// rather than waiting on a user resume.
    pub fn request_schedule_pause(&self) {
        self.0.store(INTENT_SCHEDULE_PAUSE, Ordering::SeqCst);
    }

    fn status(&self) -> DownloadStatus {
        match self.0.load(Ordering::SeqCst) {
            INTENT_CANCEL => DownloadStatus::Cancelled,
            INTENT_SCHEDULE_PAUSE => DownloadStatus::Queued,
            _ => DownloadStatus::Paused,
        }
    }
}

impl Default for Intent {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a download task needs that isn't specific to the download
/// itself — shared across every task the manager spawns.
pub struct DownloadTaskDeps {
    pub client: Client,
    pub storage: Storage,
    pub events: EventBus,
    pub rate_limiter: RateLimiterChain,
    pub cancel: CancellationToken,
    pub intent: Intent,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub settings: Settings,
}

/// Run one download from its current persisted state through to a
/// terminal (or paused/cancelled) status. Returns the final `Download`
/// record; the caller (the manager) is responsible for handing control
/// back to the scheduler.
pub async fn run(deps: DownloadTaskDeps, mut download: Download) -> Download {
    let mut accepts_ranges = false;
    if download.final_url.is_none() {
        match probe_and_apply(&deps, &mut download).await {
            Ok(ranges) => accepts_ranges = ranges,
            Err(err) => return fail(&deps, download, err).await,
        }
    }

    if download.segments.is_empty() && download.size != Some(0) {
        plan(&mut download, accepts_ranges, &deps.settings);
        if let Err(err) = deps.storage.upsert_download(&download).await {
            return fail(&deps, download, err).await;
        }
    }

    if download.size == Some(0) {
        return finalize(&deps, download).await;
    }

    let final_path = download.destination.join(&download.filename);
    let writer = match SharedWriter::open(&final_path, download.size).await {
        Ok(w) => Arc::new(w),
        Err(err) => return fail(&deps, download, err).await,
    };

    loop {
        if deps.cancel.is_cancelled() {
            return unwind(&deps, download, writer).await;
        }

        let pending: Vec<Segment> = download
            .segments
            .iter()
            .filter(|s| !s.complete)
            .cloned()
            .collect();
        if pending.is_empty() {
            break;
        }

        let headers = request_headers(&download);
        let outcomes = run_segments(&deps, &download, &writer, pending, &headers).await;

        let mut fatal: Option<DlmanError> = None;
        let mut retryable = false;
        let mut cancelled = false;

        for outcome in outcomes {
            match outcome {
                SegmentOutcome::Completed(segment) => replace_segment(&mut download, segment),
                SegmentOutcome::Retryable(segment, err) => {
                    replace_segment(&mut download, segment);
                    retryable = true;
                    fatal.get_or_insert(err);
                }
                SegmentOutcome::Fatal(segment, err) => {
                    replace_segment(&mut download, segment);
                    fatal = Some(err);
                }
                SegmentOutcome::Cancelled(segment) => {
                    replace_segment(&mut download, segment);
                    cancelled = true;
                }
            }
        }
        download.downloaded = download.segments.iter().map(|s| s.downloaded).sum();
        let _ = deps.storage.upsert_download(&download).await;

        if cancelled {
            return unwind(&deps, download, writer).await;
        }

        if let Some(err) = fatal {
            if retryable && !err.is_retryable() {
                // A genuinely fatal segment alongside retryable ones: the
                // whole download fails, siblings have already stopped.
                return fail(&deps, download, err).await;
            }
            if !retryable {
                return fail(&deps, download, err).await;
            }

            download.retry_count += 1;
            if download.retry_count > deps.max_retries {
                return fail(&deps, download, err).await;
            }

            // Reprobe before resuming: a segment that failed because the
            // server's content moved out from under it should surface as a
            // content-changed failure here rather than retrying against a
            // URL that no longer serves the bytes already written.
            if let Err(reprobe_err) = probe_and_apply(&deps, &mut download).await {
                return fail(&deps, download, reprobe_err).await;
            }

            deps.events.publish(CoreEvent::DownloadUpdated {
                download: download.clone(),
            });
            tokio::select! {
                _ = tokio::time::sleep(deps.retry_delay) => {}
                _ = deps.cancel.cancelled() => return unwind(&deps, download, writer).await,
            }
            continue;
        }
    }

    match Arc::try_unwrap(writer) {
        Ok(writer) => finalize_with_writer(&deps, download, writer).await,
        Err(_) => fail(
            &deps,
            download,
            DlmanError::InvariantViolation("writer still shared at finalize".into()),
        )
        .await,
    }
}

async fn probe_and_apply(deps: &DownloadTaskDeps, download: &mut Download) -> Result<bool, DlmanError> {
    let headers = request_headers(download);
    let probe: ProbeResult = transport::probe(&deps.client, &download.url, &headers).await?;

    // Fields are only compared once a prior probe has actually populated
    // them, so the first probe of a fresh download never trips this — only
    // a reprobe (automatic retry, or a user-initiated retry) does.
    if let (Some(existing_etag), Some(new_etag)) = (&download.etag, &probe.etag) {
        if existing_etag != new_etag {
            return Err(DlmanError::ContentChanged(format!(
                "etag changed from {existing_etag} to {new_etag}"
            )));
        }
    }
    if let (Some(existing_lm), Some(new_lm)) = (&download.last_modified, &probe.last_modified) {
        if existing_lm != new_lm {
            return Err(DlmanError::ContentChanged(format!(
                "last-modified changed from {existing_lm} to {new_lm}"
            )));
        }
    }
    if let (Some(existing_size), Some(new_size)) = (download.size, probe.size) {
        if existing_size != new_size {
            return Err(DlmanError::ContentChanged(format!(
                "size changed from {existing_size} to {new_size}"
            )));
        }
    }

    download.final_url = Some(probe.final_url);
    download.size = probe.size;
    download.etag = probe.etag;
    download.last_modified = probe.last_modified;
    if let Some(hint) = probe.filename_hint {
        if download.filename.is_empty() || download.filename == "download" {
            download.filename = hint;
        }
    }
    deps.storage.upsert_download(download).await?;
    Ok(probe.accepts_ranges)
}

/// Planner, parameterized on probe results and configured segment count
/// (split at §4.E's thresholds).
fn plan(download: &mut Download, accepts_ranges: bool, settings: &Settings) {
    match download.size {
        Some(size) if accepts_ranges && size > ONE_MIB => {
            let n = settings.clamped_segments() as u64;
            let chunk = size / n;
            let mut segments = Vec::with_capacity(n as usize);
            for i in 0..n {
                let start = i * chunk;
                let end = if i == n - 1 { size - 1 } else { start + chunk - 1 };
                segments.push(Segment::new(i as u32, start, SegmentEnd::Known(end)));
            }
            download.segments = segments;
        }
        Some(size) => {
            download.segments = vec![Segment::new(0, 0, SegmentEnd::Known(size.saturating_sub(1)))];
        }
        None => {
            download.segments = vec![Segment::new(0, 0, SegmentEnd::Open)];
        }
    }
}

fn replace_segment(download: &mut Download, segment: Segment) {
    if let Some(slot) = download
        .segments
        .iter_mut()
        .find(|s| s.index == segment.index)
    {
        *slot = segment;
    }
}

fn request_headers(download: &Download) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = download
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(referrer) = &download.referrer {
        headers.push(("Referer".to_string(), referrer.clone()));
    }
    if let Some(cookies) = &download.cookies {
        headers.push(("Cookie".to_string(), cookies.clone()));
    }
    headers
}

async fn run_segments(
    deps: &DownloadTaskDeps,
    download: &Download,
    writer: &Arc<SharedWriter>,
    pending: Vec<Segment>,
    headers: &[(String, String)],
) -> Vec<SegmentOutcome> {
    let mut handles = Vec::with_capacity(pending.len());
    for segment in pending {
        let worker = SegmentWorker {
            download_id: download.id,
            client: deps.client.clone(),
            url: download
                .final_url
                .clone()
                .unwrap_or_else(|| download.url.clone()),
            headers: headers.to_vec(),
            writer: writer.clone(),
            rate_limiter: deps.rate_limiter.clone(),
            events: deps.events.clone(),
            storage: deps.storage.clone(),
            cancel: deps.cancel.clone(),
        };
        handles.push(tokio::spawn(worker.run(segment)));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(_join_err) => {
                // The worker task panicked; treat as fatal for this segment
                // so the download fails loudly instead of hanging forever.
            }
        }
    }
    outcomes
}

async fn unwind(deps: &DownloadTaskDeps, mut download: Download, writer: Arc<SharedWriter>) -> Download {
    if let Ok(writer) = Arc::try_unwrap(writer) {
        let _ = writer.fsync().await;
    }
    download.status = deps.intent.status();
    let _ = deps
        .storage
        .update_download_status(download.id, download.status, None)
        .await;
    deps.events.publish(CoreEvent::StatusChanged {
        id: download.id,
        status: download.status,
        error: None,
    });
    download
}

async fn fail(deps: &DownloadTaskDeps, mut download: Download, err: DlmanError) -> Download {
    download.status = DownloadStatus::Failed;
    download.error = Some(err.to_string());
    let _ = deps
        .storage
        .update_download_status(download.id, download.status, download.error.as_deref())
        .await;
    deps.events.publish(CoreEvent::StatusChanged {
        id: download.id,
        status: download.status,
        error: download.error.clone(),
    });
    download
}

async fn finalize(deps: &DownloadTaskDeps, mut download: Download) -> Download {
    if let Err(err) = tokio::fs::create_dir_all(&download.destination).await {
        return fail(deps, download, DlmanError::io(download.destination.display().to_string(), err)).await;
    }
    let final_path = download.destination.join(&download.filename);
    if let Err(err) = tokio::fs::write(&final_path, b"").await {
        return fail(deps, download, DlmanError::io(final_path.display().to_string(), err)).await;
    }
    download.status = DownloadStatus::Completed;
    download.completed_at = Some(chrono::Utc::now());
    let _ = deps.storage.upsert_download(&download).await;
    deps.events.publish(CoreEvent::StatusChanged {
        id: download.id,
        status: download.status,
        error: None,
    });
    download
}

async fn finalize_with_writer(
    deps: &DownloadTaskDeps,
    mut download: Download,
    writer: SharedWriter,
) -> Download {
    if let Some(size) = download.size {
        if download.downloaded != size {
            let err = DlmanError::InvariantViolation(format!(
                "downloaded {} != size {size} at finalize",
                download.downloaded
            ));
            return fail(deps, download, err).await;
        }
    }

    match writer.finalize(&download.destination, &download.filename).await {
        Ok(final_path) => {
            download.filename = final_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(download.filename);
            download.status = DownloadStatus::Completed;
            download.completed_at = Some(chrono::Utc::now());
            let _ = deps.storage.upsert_download(&download).await;
            deps.events.publish(CoreEvent::StatusChanged {
                id: download.id,
                status: download.status,
                error: None,
            });
            download
        }
        Err(err) => fail(deps, download, err).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_four_equal_segments_for_known_ranged_size() {
        let mut download = Download::new("http://x/f".into(), "/tmp".into(), uuid::Uuid::nil());
        download.size = Some(10_485_760);
        let settings = Settings {
            default_segments: 4,
            ..Settings::default()
        };
        plan(&mut download, true, &settings);
        assert_eq!(download.segments.len(), 4);
        assert_eq!(download.segments[0].start, 0);
        assert_eq!(download.segments[0].end, SegmentEnd::Known(2_621_439));
        assert_eq!(download.segments[3].end, SegmentEnd::Known(10_485_759));
    }

    #[test]
    fn plans_single_segment_when_ranges_unsupported() {
        let mut download = Download::new("http://x/f".into(), "/tmp".into(), uuid::Uuid::nil());
        download.size = Some(1_048_576);
        plan(&mut download, false, &Settings::default());
        assert_eq!(download.segments.len(), 1);
        assert_eq!(download.segments[0].end, SegmentEnd::Known(1_048_575));
    }

    #[test]
    fn plans_open_segment_for_unknown_size() {
        let mut download = Download::new("http://x/f".into(), "/tmp".into(), uuid::Uuid::nil());
        plan(&mut download, false, &Settings::default());
        assert_eq!(download.segments.len(), 1);
        assert!(download.segments[0].end.is_open());
    }
}
