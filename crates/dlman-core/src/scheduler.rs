//! Queue scheduler (§4.G): the single coordinator that decides which
//! `queued` downloads get promoted to `downloading`, applies schedule
//! windows, and fires post-completion actions.
//!
//! Grounded in the donor's `scheduler.rs` interval-plus-wake-channel shape,
//! but at the spec's 4 Hz tick instead of the donor's 30 s poll, and with
//! the schedule-window / post-action logic the donor's version never had.

use crate::persistence::Storage;
use chrono::Datelike;
use dlman_types::{CoreEvent, Download, DownloadStatus, PostAction, Queue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const TICK: Duration = Duration::from_millis(250);

/// Callback surface the scheduler needs from whatever owns the running
/// download tasks (the manager). Kept as a trait so the scheduler doesn't
/// need to know about HTTP clients, rate limiter chains, or join handles.
pub trait SchedulerControl: Send + Sync {
    /// Start supervising `download_id`; the scheduler has already persisted
    /// its status as `downloading`.
    fn grant(&self, download_id: Uuid);

    /// A schedule window just closed on a download that was running;
    /// request a pause (same as a user pause) without marking it failed.
    fn pause_for_schedule(&self, download_id: Uuid);
}

pub struct Scheduler {
    storage: Storage,
    events: crate::events::EventBus,
    control: Arc<dyn SchedulerControl>,
    wake: Arc<Notify>,
    /// Queues whose schedule window was active last tick, to detect edges.
    was_active: HashMap<Uuid, bool>,
    /// Queues that have already fired their post-action for the current
    /// completed batch, so draining doesn't refire every tick.
    fired_post_action: HashSet<Uuid>,
}

impl Scheduler {
    pub fn new(storage: Storage, events: crate::events::EventBus, control: Arc<dyn SchedulerControl>) -> Self {
        Self {
            storage,
            events,
            control,
            wake: Arc::new(Notify::new()),
            was_active: HashMap::new(),
            fired_post_action: HashSet::new(),
        }
    }

    /// A handle callers can use to nudge the scheduler to re-evaluate
    /// immediately (e.g. right after a download finishes) instead of
    /// waiting for the next tick.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(err) = self.tick().await {
                tracing::warn!(error = %err, "scheduler tick failed");
            }
        }
    }

    async fn tick(&mut self) -> Result<(), crate::error::DlmanError> {
        let settings = self.storage.load_settings().await?;
        let queues = self.storage.load_all_queues().await?;
        let downloads = self.storage.load_all_downloads().await?;

        let mut by_queue: HashMap<Uuid, Vec<&Download>> = HashMap::new();
        for download in &downloads {
            by_queue.entry(download.queue_id).or_default().push(download);
        }

        let global_running = downloads
            .iter()
            .filter(|d| d.status == DownloadStatus::Downloading)
            .count() as u32;
        let mut global_slots = settings.max_concurrent_downloads.saturating_sub(global_running);

        let now = chrono::Local::now();
        let today = now.weekday();
        let time_of_day = now.time();

        for queue in &queues {
            let members = by_queue.get(&queue.id).cloned().unwrap_or_default();
            self.apply_schedule_edge(queue, &members, time_of_day, today);
            self.apply_post_action(queue, &members);

            let active = queue
                .schedule
                .as_ref()
                .map(|s| s.is_active(time_of_day, today))
                .unwrap_or(true);
            if !active {
                continue;
            }

            let running = members
                .iter()
                .filter(|d| d.status == DownloadStatus::Downloading)
                .count() as u32;
            let mut queue_slots = queue.max_concurrent.saturating_sub(running);

            let mut queued: Vec<&&Download> = members
                .iter()
                .filter(|d| d.status == DownloadStatus::Queued)
                .collect();
            queued.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

            for download in queued {
                if queue_slots == 0 || global_slots == 0 {
                    break;
                }
                self.storage
                    .update_download_status(download.id, DownloadStatus::Downloading, None)
                    .await?;
                self.events.publish(CoreEvent::StatusChanged {
                    id: download.id,
                    status: DownloadStatus::Downloading,
                    error: None,
                });
                self.control.grant(download.id);
                queue_slots -= 1;
                global_slots -= 1;
            }
        }

        Ok(())
    }

    fn apply_schedule_edge(
        &mut self,
        queue: &Queue,
        members: &[&Download],
        time_of_day: chrono::NaiveTime,
        today: chrono::Weekday,
    ) {
        let Some(schedule) = &queue.schedule else {
            return;
        };
        let active = schedule.is_active(time_of_day, today);
        let was = self.was_active.insert(queue.id, active).unwrap_or(active);

        if was && !active {
            // Leaving-active edge: pause everything currently downloading
            // in this queue; the scheduler itself resumes them once the
            // window reopens, so they return to `queued` not `paused`.
            for download in members {
                if download.status == DownloadStatus::Downloading {
                    self.control.pause_for_schedule(download.id);
                }
            }
        }
    }

    fn apply_post_action(&mut self, queue: &Queue, members: &[&Download]) {
        if members.is_empty() {
            return;
        }
        let all_terminal = members.iter().all(|d| d.status.is_terminal());
        let any_completed = members
            .iter()
            .any(|d| d.status == DownloadStatus::Completed);

        if !all_terminal || !any_completed {
            self.fired_post_action.remove(&queue.id);
            return;
        }
        if self.fired_post_action.contains(&queue.id) {
            return;
        }
        self.fired_post_action.insert(queue.id);

        self.events.publish(CoreEvent::PostActionFired {
            queue_id: queue.id,
            action: queue.post_action.clone(),
        });

        if let PostAction::RunCommand { command } = &queue.post_action {
            let command = command.clone();
            tokio::spawn(async move {
                let status = if cfg!(target_os = "windows") {
                    tokio::process::Command::new("cmd").arg("/C").arg(&command).status().await
                } else {
                    tokio::process::Command::new("sh").arg("-c").arg(&command).status().await
                };
                match status {
                    Ok(status) if !status.success() => {
                        tracing::warn!(%command, code = ?status.code(), "post-action command exited non-zero");
                    }
                    Err(err) => tracing::warn!(%command, error = %err, "post-action command failed to spawn"),
                    Ok(_) => {}
                }
            });
        }
        // sleep/shutdown/hibernate: logged and emitted, no OS hook (§9).
        if matches!(
            queue.post_action,
            PostAction::Sleep | PostAction::Shutdown | PostAction::Hibernate
        ) {
            tracing::info!(queue = %queue.id, action = ?queue.post_action, "post-action fired (no OS hook wired in this core)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use dlman_types::Schedule;

    #[test]
    fn overnight_window_wraps_through_midnight() {
        let schedule = Schedule {
            enabled: true,
            start_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            stop_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            days: vec![chrono::Weekday::Mon],
        };
        assert!(schedule.is_active(NaiveTime::from_hms_opt(23, 30, 0).unwrap(), chrono::Weekday::Mon));
        assert!(schedule.is_active(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), chrono::Weekday::Mon));
        assert!(!schedule.is_active(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), chrono::Weekday::Mon));
    }

    #[test]
    fn schedule_window_closes_at_stop_time() {
        let schedule = Schedule {
            enabled: true,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            stop_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            days: vec![chrono::Weekday::Mon],
        };
        assert!(schedule.is_active(NaiveTime::from_hms_opt(16, 59, 59).unwrap(), chrono::Weekday::Mon));
        assert!(!schedule.is_active(NaiveTime::from_hms_opt(17, 0, 0).unwrap(), chrono::Weekday::Mon));
    }
}
