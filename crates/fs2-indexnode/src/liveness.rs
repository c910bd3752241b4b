//! Per-client liveness monitoring.
//!
//! Each registered client gets one recurring timer task. On every tick the
//! task submits a reachability probe unless one is already in flight for that
//! client. Consecutive failures are counted; once they exceed the configured
//! maximum the client is destroyed.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::registry::ClientRegistry;

/// Configuration for liveness probing.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Interval between probes.
    pub interval: Duration,
    /// Upper bound on a single probe.
    pub probe_timeout: Duration,
    /// Consecutive failures tolerated; one more destroys the client.
    pub max_failures: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_failures: 3,
        }
    }
}

/// Snapshot of a client's probe history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessStats {
    /// Current consecutive failures.
    pub consecutive_failures: u32,
    /// Total probes sent.
    pub total_sent: u64,
    /// Total successful probes.
    pub total_succeeded: u64,
    /// Total failed probes.
    pub total_failed: u64,
    /// Ticks skipped because a probe was still running.
    pub total_skipped: u64,
}

/// Probe bookkeeping for a single client.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    consecutive_failures: AtomicU32,
    in_flight: AtomicBool,
    total_sent: AtomicU64,
    total_succeeded: AtomicU64,
    total_failed: AtomicU64,
    total_skipped: AtomicU64,
}

impl LivenessTracker {
    /// Creates a tracker with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the in-flight slot. Returns false if a probe is already running.
    pub fn begin_probe(&self) -> bool {
        let claimed = self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.total_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_skipped.fetch_add(1, Ordering::Relaxed);
        }
        claimed
    }

    /// Records a successful probe and releases the in-flight slot.
    pub fn record_success(&self) {
        self.total_succeeded.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);
        self.in_flight.store(false, Ordering::Release);
    }

    /// Records a failed probe, releases the slot, and returns the new
    /// consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.in_flight.store(false, Ordering::Release);
        failures
    }

    /// Clears the failure count, e.g. when the client says hello again.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> LivenessStats {
        LivenessStats {
            consecutive_failures: self.consecutive_failures(),
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_succeeded: self.total_succeeded.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_skipped: self.total_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Spawns the recurring liveness task for `client`.
///
/// The task holds only weak references and exits on its own once the client
/// or registry is gone; [`Client::cancel_liveness`] aborts it eagerly.
pub(crate) fn spawn_monitor(
    registry: Weak<ClientRegistry>,
    client: Weak<Client>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the client was just probed.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (Some(registry), Some(client)) = (registry.upgrade(), client.upgrade()) else {
                break;
            };
            if client.is_destroyed() {
                break;
            }
            probe_once(&registry, &client);
        }
    })
}

/// Runs one liveness tick: submits a probe unless one is already in flight.
pub(crate) fn probe_once(registry: &Arc<ClientRegistry>, client: &Arc<Client>) {
    if !client.liveness().begin_probe() {
        warn!(client = %client.alias(), "previous liveness probe still running, skipping tick");
        return;
    }

    let registry = registry.clone();
    let client = client.clone();
    tokio::spawn(async move {
        let config = registry.liveness_config();
        let cltoken = client.cltoken();
        let probe = registry.transport().ping(client.address(), &cltoken);
        let result = match tokio::time::timeout(config.probe_timeout, probe).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("no answer within {:?}", config.probe_timeout)),
        };

        match result {
            Ok(()) => {
                client.liveness().record_success();
                debug!(client = %client.alias(), "liveness probe succeeded");
            }
            Err(e) => {
                let failures = client.liveness().record_failure();
                debug!(client = %client.alias(), failures, error = %e, "liveness probe failed");
                if failures > config.max_failures {
                    info!(
                        client = %client.alias(),
                        failures,
                        "client missed too many liveness probes, destroying"
                    );
                    registry.destroy(&client);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_guard() {
        let tracker = LivenessTracker::new();
        assert!(tracker.begin_probe());
        assert!(!tracker.begin_probe());
        tracker.record_success();
        assert!(tracker.begin_probe());

        let stats = tracker.stats();
        assert_eq!(stats.total_sent, 2);
        assert_eq!(stats.total_skipped, 1);
    }

    #[test]
    fn test_failures_accumulate_and_reset() {
        let tracker = LivenessTracker::new();
        for expected in 1..=3 {
            assert!(tracker.begin_probe());
            assert_eq!(tracker.record_failure(), expected);
        }
        assert!(tracker.begin_probe());
        tracker.record_success();
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.stats().total_failed, 3);
        assert_eq!(tracker.stats().total_succeeded, 1);
    }

    #[test]
    fn test_reset() {
        let tracker = LivenessTracker::new();
        tracker.begin_probe();
        tracker.record_failure();
        tracker.reset();
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn test_default_config() {
        let config = LivenessConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.max_failures, 3);
    }
}
