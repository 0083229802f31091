//! Per-process limit enforcement.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use super::census::{group_members, signal_group};
use super::KillReason;

pub(super) struct Watchdog {
    pub pgid: i32,
    pub deadline: Instant,
    pub max_processes: usize,
    pub census_interval: Duration,
    pub killed_by: Arc<OnceLock<KillReason>>,
    /// Cancelled once the process has been reaped.
    pub stop: CancellationToken,
}

pub(super) fn spawn(watchdog: Watchdog) {
    tokio::spawn(watchdog.run());
}

impl Watchdog {
    async fn run(self) {
        let mut census = interval(self.census_interval);
        census.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                () = sleep_until(self.deadline) => {
                    info!(pgid = self.pgid, "Wall-clock limit reached, killing process group");
                    self.kill(KillReason::TimeLimit);
                    break;
                }
                _ = census.tick() => {
                    let pgid = self.pgid;
                    let count = tokio::task::spawn_blocking(move || group_members(pgid).len())
                        .await
                        .unwrap_or(0);
                    trace!(pgid, count, "Process census");
                    if count > self.max_processes {
                        info!(
                            pgid,
                            count,
                            max = self.max_processes,
                            "Process limit exceeded, killing process group"
                        );
                        self.kill(KillReason::ProcessLimit);
                        break;
                    }
                }
            }
        }
    }

    fn kill(&self, reason: KillReason) {
        let _ = self.killed_by.set(reason);
        signal_group(self.pgid, libc::SIGKILL);
    }
}
