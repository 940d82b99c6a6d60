//! Lifecycle scheduler driving time-based race transitions
//!
//! A single periodic task promotes WAITING races past their scheduled start
//! to ACTIVE (or cancels them when the roster is empty) and prunes races
//! that reached a terminal state: FINISHED races after the retention window,
//! CANCELLED races immediately. One timer drives every race, so there is no
//! per-race skew.

use log::debug;
use shared::RaceStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broadcast::Dispatcher;
use crate::registry::RaceRegistry;
use crate::utils::now_ms;

/// Spawns the scheduler task. It runs until the shutdown flag flips.
pub fn spawn(
    registry: Arc<RaceRegistry>,
    dispatcher: Dispatcher,
    tick_interval: Duration,
    retention_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tick(&registry, &dispatcher, retention_ms, now_ms()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Lifecycle scheduler stopped");
    })
}

/// One scheduler pass over every registered race at time `now`.
pub async fn tick(registry: &RaceRegistry, dispatcher: &Dispatcher, retention_ms: u64, now: u64) {
    for race_id in registry.race_ids().await {
        let handle = match registry.get(&race_id).await {
            Some(handle) => handle,
            None => continue,
        };

        let (events, recipients, remove) = {
            let mut race = handle.lock().await;
            match race.status {
                RaceStatus::Waiting if race.scheduled_start <= now => {
                    if race.participants.is_empty() {
                        // nobody showed up before the scheduled start
                        (race.cancel(), Vec::new(), true)
                    } else {
                        let events = race.start(now);
                        let recipients = race.participant_ids();
                        (events, recipients, false)
                    }
                }
                RaceStatus::Finished => {
                    let expired = race
                        .end_time
                        .map(|end| end + retention_ms <= now)
                        .unwrap_or(true);
                    (Vec::new(), Vec::new(), expired)
                }
                RaceStatus::Cancelled => (Vec::new(), Vec::new(), true),
                _ => (Vec::new(), Vec::new(), false),
            }
        };

        dispatcher.dispatch(&recipients, events).await;
        if remove {
            registry.remove(&race_id).await;
        }
    }
}
