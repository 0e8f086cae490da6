//! Periodic session maintenance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use super::server::ServerState;
use crate::bus::Bus;

pub(crate) struct SweepSettings {
    pub interval: Duration,
    pub idle_after: Duration,
    pub archive_after: Duration,
}

/// Idle quiet sessions and archive stale ones until shutdown.
pub(crate) async fn run_sweeper(
    bus: Arc<Bus>,
    state: Arc<ServerState>,
    settings: SweepSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let busy = state.bound_sessions();
                match bus.sweep(Utc::now(), settings.idle_after, settings.archive_after, &busy) {
                    Ok(report) if !report.idled.is_empty() || !report.archived.is_empty() => {
                        tracing::info!(idled = ?report.idled, archived = ?report.archived, "Sweep");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Sweep failed"),
                }
                // Subscriptions whose handles vanished without unsubscribing.
                bus.subscriptions().prune();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
