//! CLI command implementations

use crate::output::{format_bytes, format_speed};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat, QueueAction};
use anyhow::{anyhow, Result};
use console::style;
use dlman_core::DlmanCore;
use dlman_types::{AddDownloadRequest, CoreEvent, Download, DownloadStatus, QueueOptions};
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Download Commands
// ============================================================================

pub async fn add_download(
    core: &DlmanCore,
    url: &str,
    output: Option<PathBuf>,
    queue: Option<String>,
    segments: Option<u32>,
    watch: bool,
    format: OutputFormat,
) -> Result<()> {
    let queue_id = match queue {
        Some(id) => Some(Uuid::parse_str(&id)?),
        None => None,
    };

    let request = AddDownloadRequest {
        url: url.to_string(),
        filename: None,
        destination: output,
        queue_id,
        referrer: None,
        headers: None,
        cookies: None,
    };

    let download = core.add_download(request).await?;

    // `--segments` overrides the destination queue's split count rather than
    // this one download's: the engine plans segments from the queue/settings,
    // there is no per-download override in the request shape.
    if let Some(segments) = segments {
        core.update_queue(
            download.queue_id,
            QueueOptions {
                segment_count: Some(Some(segments)),
                ..Default::default()
            },
        )
        .await?;
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&download)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Added download: {}",
                style("✓").green().bold(),
                style(&download.filename).cyan()
            );
            println!("  ID: {}", download.id);
            if let Some(size) = download.size {
                println!("  Size: {}", format_bytes(size));
            }
        }
    }

    if watch {
        watch_download(core, download.id, download).await?;
    }

    Ok(())
}

/// Render a live progress bar for one download until it reaches a terminal
/// state (`add --now`'s "start immediately and show me" behavior).
async fn watch_download(core: &DlmanCore, id: Uuid, initial: Download) -> Result<()> {
    let progress = DownloadProgress::new();
    progress.add_download(&initial).await;
    let mut subscription = core.subscribe();

    loop {
        let event = tokio::select! {
            result = subscription.status.recv() => result,
            result = subscription.progress.recv() => result,
        };
        let Ok(event) = event else {
            break;
        };

        let belongs_to_this_download = match &event {
            CoreEvent::Progress { id: ev_id, .. } | CoreEvent::StatusChanged { id: ev_id, .. } => {
                *ev_id == id
            }
            _ => false,
        };
        if !belongs_to_this_download {
            continue;
        }

        progress.handle_event(&event).await;
        if let CoreEvent::StatusChanged { status, .. } = &event {
            if status.is_terminal() {
                break;
            }
        }
    }

    progress.clear().await;
    Ok(())
}

pub async fn list_downloads(
    core: &DlmanCore,
    status_filter: Option<String>,
    queue_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let status = status_filter.as_deref().map(DownloadStatus::parse);
    let downloads = core.list_downloads(status).await?;

    let filtered: Vec<_> = downloads
        .into_iter()
        .filter(|d| {
            if let Some(ref queue) = queue_filter {
                if let Ok(qid) = Uuid::parse_str(queue) {
                    if d.queue_id != qid {
                        return false;
                    }
                }
            }
            true
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&filtered)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct DownloadRow {
                id: String,
                filename: String,
                size: String,
                progress: String,
                status: String,
            }

            let rows: Vec<DownloadRow> = filtered
                .iter()
                .map(|d| DownloadRow {
                    id: d.id.to_string()[..8].to_string(),
                    filename: if d.filename.len() > 30 {
                        format!("{}...", &d.filename[..27])
                    } else {
                        d.filename.clone()
                    },
                    size: d.size.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                    progress: format!("{:.1}%", d.progress()),
                    status: d.status.as_str().to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for download in &filtered {
                print_download_summary(download, show_all);
            }
            println!();
            println!("{} download(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

fn print_download_summary(download: &Download, detailed: bool) {
    let status_icon = match download.status {
        DownloadStatus::Completed => style("✓").green(),
        DownloadStatus::Downloading => style("↓").cyan(),
        DownloadStatus::Paused => style("⏸").yellow(),
        DownloadStatus::Failed => style("✗").red(),
        DownloadStatus::Cancelled => style("○").dim(),
        _ => style("·").dim(),
    };

    let progress = format!("{:.1}%", download.progress());

    println!(
        "{} {} {} [{}]",
        status_icon,
        style(&download.filename).bold(),
        style(&progress).dim(),
        style(download.status.as_str()).dim()
    );

    if detailed {
        println!("    ID: {}", download.id);
        println!("    URL: {}", download.url);
        if let Some(size) = download.size {
            println!(
                "    Size: {} / {}",
                format_bytes(download.downloaded),
                format_bytes(size)
            );
        }
        if let Some(ref error) = download.error {
            println!("    Error: {}", style(error).red());
        }
        println!();
    }
}

pub async fn show_info(core: &DlmanCore, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    let download = core.get_download(uuid).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&download)?);
        }
        _ => {
            print_download_summary(&download, true);
        }
    }

    Ok(())
}

pub async fn pause_download(core: &DlmanCore, id: &str, _format: OutputFormat) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    core.pause_download(uuid).await?;
    println!("{} Download paused", style("✓").green().bold());
    Ok(())
}

pub async fn resume_download(core: &DlmanCore, id: &str, _format: OutputFormat) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    core.resume_download(uuid).await?;
    println!("{} Download resumed", style("✓").green().bold());
    Ok(())
}

pub async fn cancel_download(core: &DlmanCore, id: &str, _format: OutputFormat) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    core.cancel_download(uuid).await?;
    println!("{} Download cancelled", style("✓").green().bold());
    Ok(())
}

pub async fn retry_download(core: &DlmanCore, id: &str, _format: OutputFormat) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    core.retry_download(uuid).await?;
    println!("{} Download requeued", style("✓").green().bold());
    Ok(())
}

pub async fn delete_download(
    core: &DlmanCore,
    id: &str,
    with_file: bool,
    _format: OutputFormat,
) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    core.remove_download(uuid, with_file).await?;
    println!("{} Download deleted", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Queue Commands
// ============================================================================

pub async fn queue_action(core: &DlmanCore, action: QueueAction, format: OutputFormat) -> Result<()> {
    match action {
        QueueAction::List => {
            let queues = core.list_queues().await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&queues)?);
                }
                OutputFormat::Table => {
                    use tabled::{Table, Tabled};

                    #[derive(Tabled)]
                    struct QueueRow {
                        id: String,
                        name: String,
                        color: String,
                        max_concurrent: u32,
                    }

                    let rows: Vec<QueueRow> = queues
                        .iter()
                        .map(|q| QueueRow {
                            id: q.id.to_string()[..8].to_string(),
                            name: q.name.clone(),
                            color: q.color.clone(),
                            max_concurrent: q.max_concurrent,
                        })
                        .collect();

                    println!("{}", Table::new(rows));
                }
                OutputFormat::Human => {
                    for queue in &queues {
                        println!(
                            "{} {} ({})",
                            style("•").color256(u8::from_str_radix(&queue.color[1..3], 16).unwrap_or(255)),
                            style(&queue.name).bold(),
                            queue.id
                        );
                    }
                }
            }
        }

        QueueAction::Create {
            name,
            color,
            max_concurrent,
            speed_limit,
        } => {
            let queue = core.create_queue(name).await?;
            let options = QueueOptions {
                color,
                max_concurrent,
                speed_limit: speed_limit.map(Some),
                ..Default::default()
            };
            let queue = core.update_queue(queue.id, options).await?;
            println!(
                "{} Created queue: {} ({})",
                style("✓").green().bold(),
                style(&queue.name).cyan(),
                queue.id
            );
        }

        QueueAction::Delete { id } => {
            let uuid = Uuid::parse_str(&id)?;
            core.delete_queue(uuid).await?;
            println!("{} Queue deleted", style("✓").green().bold());
        }

        QueueAction::Start { id } => {
            let uuid = Uuid::parse_str(&id)?;
            core.start_queue(uuid).await?;
            println!("{} Queue started", style("✓").green().bold());
        }

        QueueAction::Stop { id } => {
            let uuid = Uuid::parse_str(&id)?;
            core.stop_queue(uuid).await?;
            println!("{} Queue stopped", style("✓").green().bold());
        }
    }

    Ok(())
}

// ============================================================================
// Probe Commands
// ============================================================================

pub async fn probe_urls(core: &DlmanCore, urls: Vec<String>, format: OutputFormat) -> Result<()> {
    let results = core.probe_links(urls).await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct LinkRow {
                filename: String,
                size: String,
                resumable: String,
            }

            let rows: Vec<LinkRow> = results
                .iter()
                .map(|info| LinkRow {
                    filename: if info.filename.len() > 40 {
                        format!("{}...", &info.filename[..37])
                    } else {
                        info.filename.clone()
                    },
                    size: info.size.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                    resumable: if info.resumable { "Yes" } else { "No" }.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for info in &results {
                if let Some(ref error) = info.error {
                    println!("{} {}: {}", style("✗").red(), info.url, style(error).red());
                } else {
                    println!("{} {}", style("✓").green(), info.filename);
                    if let Some(size) = info.size {
                        println!("    Size: {}", format_bytes(size));
                    }
                    if let Some(ref ct) = info.content_type {
                        println!("    Type: {}", ct);
                    }
                    println!(
                        "    Resumable: {}",
                        if info.resumable {
                            style("Yes").green()
                        } else {
                            style("No").yellow()
                        }
                    );
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Data Commands
// ============================================================================

pub async fn import_data(core: &DlmanCore, file: PathBuf, _format: OutputFormat) -> Result<()> {
    let content = tokio::fs::read_to_string(&file).await?;
    let snapshot: serde_json::Value = serde_json::from_str(&content)?;
    let count = core.import_snapshot(snapshot).await?;
    println!(
        "{} Imported {} download(s) from {}",
        style("✓").green().bold(),
        count,
        file.display()
    );
    Ok(())
}

pub async fn export_data(core: &DlmanCore, output: Option<PathBuf>, _format: OutputFormat) -> Result<()> {
    let snapshot = core.export_snapshot().await?;
    let data = serde_json::to_string_pretty(&snapshot)?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, &data).await?;
            println!(
                "{} Data exported to {}",
                style("✓").green().bold(),
                path.display()
            );
        }
        None => {
            println!("{}", data);
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(core: &DlmanCore, action: Option<ConfigAction>, format: OutputFormat) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.get_settings().await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("DLMan Configuration:");
                    println!();
                    println!(
                        "  Default download path: {}",
                        settings.default_download_path.display()
                    );
                    println!("  Max concurrent downloads: {}", settings.max_concurrent_downloads);
                    println!("  Default segments: {}", settings.default_segments);
                    println!(
                        "  Global speed limit: {}",
                        settings
                            .global_speed_limit
                            .map(format_speed)
                            .unwrap_or_else(|| "Unlimited".to_string())
                    );
                    println!("  Browser integration port: {}", settings.browser_integration_port);
                    println!("  Auto-resume on startup: {}", settings.auto_resume_on_startup);
                    println!("  Dev mode: {}", settings.dev_mode);
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = core.get_settings().await?;
            let value = match key.as_str() {
                "default_download_path" => settings.default_download_path.display().to_string(),
                "max_concurrent_downloads" => settings.max_concurrent_downloads.to_string(),
                "default_segments" => settings.default_segments.to_string(),
                "global_speed_limit" => settings
                    .global_speed_limit
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unlimited".to_string()),
                "browser_integration_port" => settings.browser_integration_port.to_string(),
                "auto_resume_on_startup" => settings.auto_resume_on_startup.to_string(),
                "dev_mode" => settings.dev_mode.to_string(),
                _ => return Err(anyhow!("Unknown config key: {}", key)),
            };
            println!("{}", value);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = core.get_settings().await?;

            match key.as_str() {
                "default_download_path" => settings.default_download_path = PathBuf::from(value),
                "max_concurrent_downloads" => settings.max_concurrent_downloads = value.parse()?,
                "default_segments" => settings.default_segments = value.parse()?,
                "global_speed_limit" => {
                    settings.global_speed_limit = if value.eq_ignore_ascii_case("unlimited") {
                        None
                    } else {
                        Some(value.parse()?)
                    }
                }
                "browser_integration_port" => settings.browser_integration_port = value.parse()?,
                "auto_resume_on_startup" => settings.auto_resume_on_startup = value.parse()?,
                "dev_mode" => settings.dev_mode = value.parse()?,
                _ => return Err(anyhow!("Unknown or read-only config key: {}", key)),
            }

            core.update_settings(settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                core.update_settings(dlman_types::Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
