//! Connectivity-driven sync scheduling.
//!
//! The monitor owns the background loop: it watches the online flag,
//! waits out a settle delay after reconnection so flapping links do not
//! trigger storms of half-finished passes, reacts to foreground kicks,
//! and runs a periodic drain while the link is up.

use crate::dispatcher::Dispatcher;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

/// Snapshot of the engine's synchronization state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: usize,
    pub failed_count: usize,
}

/// Background loop reacting to connectivity changes and timers.
pub struct ConnectivityMonitor {
    dispatcher: Dispatcher,
    online: watch::Receiver<bool>,
    kick: Arc<Notify>,
    settle_delay_ms: u64,
    drain_interval_ms: u64,
}

impl ConnectivityMonitor {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        online: watch::Receiver<bool>,
        kick: Arc<Notify>,
        settle_delay_ms: u64,
        drain_interval_ms: u64,
    ) -> Self {
        Self {
            dispatcher,
            online,
            kick,
            settle_delay_ms,
            drain_interval_ms,
        }
    }

    /// Run until every status sender is dropped.
    pub async fn run(mut self) {
        let mut ticker = time::interval(Duration::from_millis(self.drain_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; swallow it so startup
        // does not race the settle delay.
        ticker.tick().await;

        info!("connectivity monitor started");
        loop {
            tokio::select! {
                changed = self.online.changed() => {
                    if changed.is_err() {
                        debug!("online channel closed, monitor stopping");
                        break;
                    }
                    let online = *self.online.borrow_and_update();
                    debug!(online, "connectivity changed");
                    if online {
                        time::sleep(Duration::from_millis(self.settle_delay_ms)).await;
                        // The link may have dropped again while settling.
                        if *self.online.borrow() {
                            self.dispatcher.drain().await;
                        }
                    }
                }
                _ = self.kick.notified() => {
                    if *self.online.borrow() {
                        debug!("foreground kick, draining");
                        self.dispatcher.drain().await;
                    }
                }
                _ = ticker.tick() => {
                    if *self.online.borrow() {
                        self.dispatcher.drain().await;
                    }
                }
            }
        }
    }
}
