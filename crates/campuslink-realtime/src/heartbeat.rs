//! Liveness monitoring for an open connection.
//!
//! The inbound pump marks the connection alive on every frame it sees,
//! heartbeats included. [`run_heartbeat`] checks that flag on a fixed
//! interval and reports a timeout once enough consecutive checks found the
//! connection silent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

/// Number of checks per timeout window.
const CHECKS_PER_TIMEOUT: u32 = 4;

/// Shared "seen traffic since last check" flag.
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            alive: AtomicBool::new(true),
        }
    }
}

impl Liveness {
    /// Record inbound traffic.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Read and reset the flag.
    ///
    /// Returns `true` if traffic was seen since the last check.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No traffic for the whole timeout window.
    TimedOut,
    /// The connection was torn down first.
    Cancelled,
}

/// Interval between liveness checks for a given timeout.
pub fn check_interval(timeout: Duration) -> Duration {
    (timeout / CHECKS_PER_TIMEOUT).max(Duration::from_millis(1))
}

/// Watch `liveness` until it stays silent for `timeout` or `cancel` fires.
pub async fn run_heartbeat(
    liveness: &Liveness,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let interval = check_interval(timeout);
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if liveness.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= CHECKS_PER_TIMEOUT {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
