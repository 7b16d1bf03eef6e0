//! HTTP handlers for the local control server (§4.I).
//!
//! REST is the primary transport — every mutation persists before the
//! handler returns; the WebSocket in `ws.rs` only streams confirmation of
//! what already happened.

use crate::error::ApiResult;
use axum::extract::{Path, Query, State};
use axum::Json;
use dlman_core::DlmanCore;
use dlman_types::{
    AddDownloadRequest, Category, CategoryOptions, Download, DownloadPatch, DownloadStatus,
    ImportError, ImportResult, LinkInfo, Queue, QueueOptions, Settings,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Serialize)]
pub struct PingResponse {
    ok: bool,
    version: &'static str,
}

pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    downloading: usize,
    queued: usize,
    total: usize,
    aggregate_speed: u64,
}

pub async fn status(State(core): State<DlmanCore>) -> ApiResult<Json<StatusResponse>> {
    let downloads = core.list_downloads(None).await?;
    let downloading = downloads.iter().filter(|d| d.status == DownloadStatus::Downloading).count();
    let queued = downloads.iter().filter(|d| d.status == DownloadStatus::Queued).count();
    Ok(Json(StatusResponse {
        downloading,
        queued,
        total: downloads.len(),
        // Per-download instantaneous speed isn't persisted; the control
        // server's aggregate is derived from the progress stream on `/ws`,
        // not reconstructable from a point-in-time status poll.
        aggregate_speed: 0,
    }))
}

#[derive(Deserialize)]
pub struct ListQuery {
    status: Option<String>,
}

pub async fn list_downloads(
    State(core): State<DlmanCore>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Download>>> {
    let status = query.status.map(|s| DownloadStatus::parse(&s));
    Ok(Json(core.list_downloads(status).await?))
}

pub async fn get_download(State(core): State<DlmanCore>, Path(id): Path<Uuid>) -> ApiResult<Json<Download>> {
    Ok(Json(core.get_download(id).await?))
}

pub async fn add_download(
    State(core): State<DlmanCore>,
    Json(request): Json<AddDownloadRequest>,
) -> ApiResult<Json<Download>> {
    Ok(Json(core.add_download(request).await?))
}

/// One URL in a batch failing to add doesn't sink the rest: each request is
/// attempted independently and the response carries both the successes and
/// the per-URL failures.
pub async fn add_downloads_batch(
    State(core): State<DlmanCore>,
    Json(requests): Json<Vec<AddDownloadRequest>>,
) -> Json<ImportResult> {
    let mut result = ImportResult {
        successful: Vec::with_capacity(requests.len()),
        failed: Vec::new(),
    };
    for request in requests {
        let url = request.url.clone();
        match core.add_download(request).await {
            Ok(download) => result.successful.push(download),
            Err(err) => result.failed.push(ImportError {
                url,
                error: err.to_string(),
            }),
        }
    }
    Json(result)
}

pub async fn pause_download(State(core): State<DlmanCore>, Path(id): Path<Uuid>) -> ApiResult<Json<Download>> {
    Ok(Json(core.pause_download(id).await?))
}

pub async fn resume_download(State(core): State<DlmanCore>, Path(id): Path<Uuid>) -> ApiResult<Json<Download>> {
    Ok(Json(core.resume_download(id).await?))
}

pub async fn cancel_download(State(core): State<DlmanCore>, Path(id): Path<Uuid>) -> ApiResult<Json<Download>> {
    Ok(Json(core.cancel_download(id).await?))
}

pub async fn retry_download(State(core): State<DlmanCore>, Path(id): Path<Uuid>) -> ApiResult<Json<Download>> {
    Ok(Json(core.retry_download(id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteQuery {
    #[serde(default)]
    delete_file: bool,
}

#[derive(Serialize)]
pub struct OkResponse {
    ok: bool,
}

pub async fn delete_download(
    State(core): State<DlmanCore>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Json<OkResponse>> {
    core.remove_download(id, query.delete_file).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn patch_download(
    State(core): State<DlmanCore>,
    Path(id): Path<Uuid>,
    Json(patch): Json<DownloadPatch>,
) -> ApiResult<Json<Download>> {
    Ok(Json(core.patch_download(id, patch).await?))
}

#[derive(Deserialize)]
pub struct ProbeRequest {
    urls: Vec<String>,
}

pub async fn probe(
    State(core): State<DlmanCore>,
    Json(request): Json<ProbeRequest>,
) -> Json<Vec<LinkInfo>> {
    Json(core.probe_links(request.urls).await)
}

// ----------------------------------------------------------------------
// Queues
// ----------------------------------------------------------------------

pub async fn list_queues(State(core): State<DlmanCore>) -> ApiResult<Json<Vec<Queue>>> {
    Ok(Json(core.list_queues().await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQueueRequest {
    name: String,
    color: Option<String>,
    max_concurrent: Option<u32>,
    speed_limit: Option<u64>,
}

pub async fn create_queue(
    State(core): State<DlmanCore>,
    Json(request): Json<CreateQueueRequest>,
) -> ApiResult<Json<Queue>> {
    let queue = core.create_queue(request.name).await?;
    let options = QueueOptions {
        color: request.color,
        max_concurrent: request.max_concurrent,
        speed_limit: request.speed_limit.map(Some),
        ..Default::default()
    };
    let queue = core.update_queue(queue.id, options).await?;
    Ok(Json(queue))
}

pub async fn update_queue(
    State(core): State<DlmanCore>,
    Path(id): Path<Uuid>,
    Json(options): Json<QueueOptions>,
) -> ApiResult<Json<Queue>> {
    Ok(Json(core.update_queue(id, options).await?))
}

pub async fn delete_queue(State(core): State<DlmanCore>, Path(id): Path<Uuid>) -> ApiResult<Json<OkResponse>> {
    core.delete_queue(id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn start_queue(State(core): State<DlmanCore>, Path(id): Path<Uuid>) -> ApiResult<Json<OkResponse>> {
    core.start_queue(id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn stop_queue(State(core): State<DlmanCore>, Path(id): Path<Uuid>) -> ApiResult<Json<OkResponse>> {
    core.stop_queue(id).await?;
    Ok(Json(OkResponse { ok: true }))
}

// ----------------------------------------------------------------------
// Categories
// ----------------------------------------------------------------------

pub async fn list_categories(State(core): State<DlmanCore>) -> ApiResult<Json<Vec<Category>>> {
    Ok(Json(core.list_categories().await?))
}

#[derive(Deserialize)]
pub struct CreateCategoryRequest {
    name: String,
    #[serde(default)]
    extensions: Vec<String>,
}

pub async fn create_category(
    State(core): State<DlmanCore>,
    Json(request): Json<CreateCategoryRequest>,
) -> ApiResult<Json<Category>> {
    Ok(Json(core.create_category(request.name, request.extensions).await?))
}

pub async fn update_category(
    State(core): State<DlmanCore>,
    Path(id): Path<Uuid>,
    Json(options): Json<CategoryOptions>,
) -> ApiResult<Json<Category>> {
    Ok(Json(core.update_category(id, options).await?))
}

pub async fn delete_category(State(core): State<DlmanCore>, Path(id): Path<Uuid>) -> ApiResult<Json<OkResponse>> {
    core.delete_category(id).await?;
    Ok(Json(OkResponse { ok: true }))
}

// ----------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------

pub async fn get_settings(State(core): State<DlmanCore>) -> ApiResult<Json<Settings>> {
    Ok(Json(core.get_settings().await?))
}

pub async fn update_settings(
    State(core): State<DlmanCore>,
    Json(settings): Json<Settings>,
) -> ApiResult<Json<Settings>> {
    Ok(Json(core.update_settings(settings).await?))
}

// ----------------------------------------------------------------------
// Export / import (not in §4.I's endpoint list but exposed by the CLI's
// `export`/`import`; kept here so the server and CLI share one surface).
// ----------------------------------------------------------------------

pub async fn export_snapshot(State(core): State<DlmanCore>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(core.export_snapshot().await?))
}

pub async fn import_snapshot(
    State(core): State<DlmanCore>,
    Json(snapshot): Json<serde_json::Value>,
) -> ApiResult<Json<HashMap<&'static str, usize>>> {
    let count = core.import_snapshot(snapshot).await?;
    let mut body = HashMap::new();
    body.insert("imported", count);
    Ok(Json(body))
}
