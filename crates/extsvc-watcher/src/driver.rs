//! LeadershipDriver: keeps a watcher trying to lead its node.
//!
//! ```text
//!   SeekingLeadership ──run() ok + is_leader──▶ Leading
//!          ▲                                      │
//!          └────────── is_leader() == false ──────┘
//! ```
//!
//! The driver re-evaluates its state every `poll_interval`, immediately
//! when the watcher reports a state change while leading, and exits on the
//! shutdown signal after destroying the watcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::watcher::ExternalServiceWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    SeekingLeadership,
    Leading,
}

pub struct LeadershipDriver {
    watcher: Arc<ExternalServiceWatcher>,
    poll_interval: Duration,
    state: DriverState,
}

impl LeadershipDriver {
    pub fn new(watcher: Arc<ExternalServiceWatcher>, poll_interval: Duration) -> Self {
        Self {
            watcher,
            poll_interval,
            state: DriverState::SeekingLeadership,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn watcher(&self) -> &Arc<ExternalServiceWatcher> {
        &self.watcher
    }

    /// Evaluate one transition and return the new state.
    pub async fn step(&mut self) -> DriverState {
        let node = self.watcher.node().to_string();
        self.state = match self.state {
            DriverState::SeekingLeadership => match self.watcher.run().await {
                Ok(()) if self.watcher.is_leader().await => {
                    info!(%node, "leader");
                    DriverState::Leading
                }
                Ok(()) => {
                    debug!(%node, "watcher started but lock not held");
                    DriverState::SeekingLeadership
                }
                Err(e) if e.is_contention() => {
                    debug!(%node, "another watcher is leading");
                    DriverState::SeekingLeadership
                }
                Err(e) => {
                    warn!(%node, error = %e, "failed to start watcher");
                    DriverState::SeekingLeadership
                }
            },
            DriverState::Leading => {
                if self.watcher.is_leader().await {
                    debug!(%node, "still leader");
                    DriverState::Leading
                } else {
                    warn!(%node, "no longer leader");
                    DriverState::SeekingLeadership
                }
            }
        };
        self.state
    }

    /// Drive the watcher until `shutdown` flips (or its sender is dropped),
    /// then destroy the watcher.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut watcher_state = self.watcher.subscribe();
        info!(node = %self.watcher.node(), poll_interval = ?self.poll_interval, "leadership driver started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.step().await;
            // Only changes after this step should wake us.
            let _ = watcher_state.borrow_and_update();

            let leading = self.state == DriverState::Leading;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = watcher_state.changed(), if leading => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(node = %self.watcher.node(), "leadership driver shutting down");
        self.watcher.destroy().await
    }
}
