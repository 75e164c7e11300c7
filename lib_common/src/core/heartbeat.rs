//! # Heartbeat Monitor
//!
//! Detects dead peers that never produce a send error because nothing is sent
//! to them. Every period the monitor probes a snapshot of the registry, all
//! probes concurrently, each bounded by the probe timeout. Members that answer
//! get their `last_seen_at` refreshed; the rest are evicted.
//!
//! The probe timeout is validated to be shorter than the period, so one pass
//! always finishes before the next tick. With `MissedTickBehavior::Delay` a
//! pass never overlaps the next one anyway.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::configs::RoomConfig;
use crate::core::error::ProbeFailure;
use crate::core::registry::Registry;

/// Outcome of one probe pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub alive: BTreeSet<String>,
    pub evicted: BTreeMap<String, ProbeFailure>,
}

pub struct HeartbeatMonitor {
    registry: Arc<Registry>,
    period: Duration,
    probe_timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<Registry>, config: &RoomConfig) -> Self {
        Self {
            registry,
            period: config.heartbeat_period(),
            probe_timeout: config.probe_timeout(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Runs probe passes until `shutdown` is cancelled. The first pass starts
    /// immediately. Cancellation also interrupts a pass in flight; its
    /// outstanding probes are aborted and nothing is evicted on their behalf.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "Heartbeat monitor started (period {:?}, probe timeout {:?}).",
            self.period,
            self.probe_timeout
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                report = self.probe_all() => {
                    if !report.evicted.is_empty() {
                        log::warn!(
                            "Heartbeat: {} alive, {} evicted.",
                            report.alive.len(),
                            report.evicted.len()
                        );
                    } else {
                        log::debug!("Heartbeat: {} alive.", report.alive.len());
                    }
                }
            }
        }

        log::info!("Heartbeat monitor stopped.");
    }

    /// # Probe All
    ///
    /// One pass over a registry snapshot.
    ///
    /// A probe task that panics is an internal fault, not evidence about the
    /// peer: it is logged and the member is left in place for the next pass.
    pub async fn probe_all(&self) -> ProbeReport {
        let mut report = ProbeReport::default();
        let peers = self.registry.snapshot();
        if peers.is_empty() {
            return report;
        }

        let mut tasks = JoinSet::new();
        let mut owners = HashMap::with_capacity(peers.len());
        for (identity, handle) in peers {
            let timeout = self.probe_timeout;
            let task = tasks.spawn(async move {
                match time::timeout(timeout, handle.probe()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ProbeFailure::Connection(e)),
                    Err(_) => Err(ProbeFailure::Timeout(timeout)),
                }
            });
            owners.insert(task.id(), identity);
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    let Some(identity) = owners.remove(&id) else { continue };
                    match outcome {
                        Ok(()) => {
                            self.registry.touch(&identity, Utc::now());
                            report.alive.insert(identity);
                        }
                        Err(failure) => failed.push((identity, failure)),
                    }
                }
                Err(e) => {
                    let identity = owners.remove(&e.id()).unwrap_or_default();
                    log::error!("Probe task for '{}' failed internally: {}", identity, e);
                }
            }
        }

        for (identity, failure) in failed {
            if self.registry.evict(&identity, &failure).await {
                report.evicted.insert(identity, failure);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::{Connection, Inbound, MemoryConnection};
    use crate::core::error::ConnectionError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts probes, then panics inside each one.
    #[derive(Default)]
    struct PanickingProbe {
        probes: AtomicUsize,
    }

    #[async_trait]
    impl Connection for PanickingProbe {
        async fn send(&self, _frame: Bytes) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn receive(&self) -> Result<Inbound, ConnectionError> {
            Err(ConnectionError::Closed)
        }
        async fn probe(&self) -> Result<(), ConnectionError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            panic!("probe bug");
        }
        async fn close(&self) {}
    }

    fn config(period_ms: u64, probe_timeout_ms: u64) -> RoomConfig {
        RoomConfig {
            heartbeat_period_ms: period_ms,
            probe_timeout_ms,
            ..RoomConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_evicted_and_live_peer_refreshed() {
        let registry = Arc::new(Registry::new());
        let (live, live_peer) = MemoryConnection::handle_pair();
        let (silent, silent_peer) = MemoryConnection::handle_pair();
        registry.register("live", live).unwrap();
        registry.register("silent", silent).unwrap();
        silent_peer.ignore_probes(true);
        let before = registry.last_seen("live").unwrap();

        let monitor = HeartbeatMonitor::new(Arc::clone(&registry), &config(1000, 100));
        let report = monitor.probe_all().await;

        assert!(report.alive.contains("live"));
        assert_eq!(
            report.evicted.get("silent"),
            Some(&ProbeFailure::Timeout(Duration::from_millis(100)))
        );
        assert!(!registry.contains("silent"));
        assert_eq!(silent_peer.close_count(), 1);
        assert_eq!(live_peer.close_count(), 0);
        assert!(registry.last_seen("live").unwrap() >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_probes_every_period_until_cancelled() {
        let registry = Arc::new(Registry::new());
        let (handle, peer) = MemoryConnection::handle_pair();
        registry.register("u1", handle).unwrap();

        let monitor = Arc::new(HeartbeatMonitor::new(Arc::clone(&registry), &config(1000, 100)));
        let shutdown = CancellationToken::new();
        let task = {
            let monitor = Arc::clone(&monitor);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { monitor.run(shutdown).await })
        };

        // Ticks at 0, 1000 and 2000 ms.
        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(peer.probe_count(), 3);

        shutdown.cancel();
        task.await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(peer.probe_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_pass_in_flight() {
        let registry = Arc::new(Registry::new());
        let (handle, peer) = MemoryConnection::handle_pair();
        registry.register("slow", handle).unwrap();
        peer.ignore_probes(true);

        let monitor = HeartbeatMonitor::new(Arc::clone(&registry), &config(60_000, 30_000));
        let shutdown = CancellationToken::new();
        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_millis(10)).await;
                shutdown.cancel();
            })
        };

        let started = time::Instant::now();
        monitor.run(shutdown).await;
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(registry.contains("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_probe_keeps_the_member_and_the_loop() {
        let registry = Arc::new(Registry::new());
        let broken = Arc::new(PanickingProbe::default());
        let (healthy, healthy_peer) = MemoryConnection::handle_pair();
        registry.register("broken", broken.clone()).unwrap();
        registry.register("healthy", healthy).unwrap();

        let monitor = Arc::new(HeartbeatMonitor::new(Arc::clone(&registry), &config(1000, 100)));
        let report = monitor.probe_all().await;
        assert!(report.alive.contains("healthy"));
        assert!(report.evicted.is_empty());
        assert!(registry.contains("broken"));

        let shutdown = CancellationToken::new();
        let task = {
            let monitor = Arc::clone(&monitor);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { monitor.run(shutdown).await })
        };
        // Ticks at 0, 1000 and 2000 ms, on top of the pass above.
        time::sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(broken.probes.load(Ordering::SeqCst), 4);
        assert_eq!(healthy_peer.probe_count(), 4);
        assert!(registry.contains("broken"));
    }

    #[tokio::test]
    async fn empty_registry_yields_empty_report() {
        let monitor = HeartbeatMonitor::new(Arc::new(Registry::new()), &RoomConfig::default());
        assert_eq!(monitor.probe_all().await, ProbeReport::default());
    }
}
