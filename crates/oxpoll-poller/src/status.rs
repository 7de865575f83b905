//! Periodic status line summarizing collector health, written on the
//! poller_log_schedule cadence.

use oxpoll_collector::base::HealthBoard;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::sync::watch;

pub async fn run_status_logger(
    health: HealthBoard,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    // the first tick fires immediately; skip it so the line has content
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => log_status(&health),
            _ = shutdown.changed() => break,
        }
    }
}

fn log_status(health: &HealthBoard) {
    let snapshot = health.snapshot();
    if snapshot.is_empty() {
        return;
    }
    let mut up = 0usize;
    let mut standby = 0usize;
    let mut summary = String::new();
    for (key, entry) in &snapshot {
        if entry.status == "standby" {
            standby += 1;
        } else {
            up += 1;
        }
        if !summary.is_empty() {
            summary.push_str(", ");
        }
        let _ = write!(
            summary,
            "{key}={} errors={} instances={} last={}ms",
            entry.status, entry.errors, entry.instances, entry.last_poll_ms
        );
    }
    tracing::info!(up, standby, collectors = %summary, "Poller status");
}
