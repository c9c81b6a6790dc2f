//! Balancer Health Manager
//!
//! Periodically probes every discovered real server of one balancer and
//! delivers the whole round to the balancer as a single report.

use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checker::HealthChecker;
use crate::discovery::DiscoveryResolver;
use crate::types::*;

/// Health manager for one balancer
pub struct HealthManager {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    targets: Arc<DashMap<Target, TargetHealth>>,
}

impl HealthManager {
    /// Start probing; stops when `cancel` fires or the report receiver is dropped
    pub fn spawn(
        name: String,
        settings: HealthSettings,
        discovery: Arc<dyn DiscoveryResolver>,
        checker: Arc<dyn HealthChecker>,
        reports: mpsc::Sender<HealthReport>,
        cancel: CancellationToken,
    ) -> Self {
        let targets = Arc::new(DashMap::new());
        let worker = Worker {
            name,
            settings,
            discovery,
            checker,
            targets: targets.clone(),
        };
        let handle = tokio::spawn(worker.run(reports, cancel.clone()));

        Self {
            cancel,
            handle: Some(handle),
            targets,
        }
    }

    /// Latest known health of every target
    pub fn snapshot(&self) -> Vec<TargetHealth> {
        let mut all: Vec<TargetHealth> = self.targets.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop probing and wait for the loop to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for HealthManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    name: String,
    settings: HealthSettings,
    discovery: Arc<dyn DiscoveryResolver>,
    checker: Arc<dyn HealthChecker>,
    targets: Arc<DashMap<Target, TargetHealth>>,
}

impl Worker {
    async fn run(self, reports: mpsc::Sender<HealthReport>, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.round() => report,
            };
            let Some(report) = report else { continue };

            debug!(
                balancer = %self.name,
                healthy = report.healthy_count(),
                total = report.total(),
                "Health check cycle complete"
            );

            if reports.send(report).await.is_err() {
                debug!(balancer = %self.name, "Report receiver gone, stopping health checks");
                break;
            }
        }
    }

    /// One probe round over the currently discovered targets
    async fn round(&self) -> Option<HealthReport> {
        let discovered = match self.discovery.targets().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(
                    balancer = %self.name,
                    discovery = %self.discovery.describe(),
                    error = %e,
                    "Discovery failed, skipping health round"
                );
                return None;
            }
        };

        let deadline = self.settings.interval();
        let probes = discovered.iter().map(|target| async move {
            let start = Instant::now();
            let result = match tokio::time::timeout(
                deadline,
                self.checker.check(&target.host, target.port),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(HealthError::Timeout(deadline)),
            };
            (start.elapsed(), result)
        });
        let results = join_all(probes).await;

        let mut report = Vec::with_capacity(discovered.len());
        for (target, (latency, result)) in discovered.iter().zip(results) {
            let health = self.apply(target, latency.as_secs_f64() * 1000.0, result);
            report.push(health);
        }

        self.targets.retain(|t, _| discovered.contains(t));

        Some(HealthReport {
            targets: report,
            generated_at: Utc::now(),
        })
    }

    /// Fold one probe result into the rise/fall state of a target
    fn apply(&self, target: &Target, latency_ms: f64, result: Result<(), HealthError>) -> TargetHealth {
        let prev = self.targets.get(target).map(|e| e.value().clone());
        let was_healthy = prev.as_ref().map(|p| p.healthy);
        let (prev_ok, prev_fail) = prev
            .as_ref()
            .map(|p| (p.consecutive_successes, p.consecutive_failures))
            .unwrap_or((0, 0));

        let health = match result {
            Ok(()) => {
                let successes = prev_ok.saturating_add(1);
                TargetHealth {
                    target: target.clone(),
                    healthy: was_healthy.unwrap_or(false) || successes >= self.settings.rise,
                    last_check: Utc::now(),
                    latency_ms,
                    consecutive_successes: successes,
                    consecutive_failures: 0,
                    last_error: None,
                }
            }
            Err(e) => {
                let failures = prev_fail.saturating_add(1);
                TargetHealth {
                    target: target.clone(),
                    healthy: was_healthy.unwrap_or(false) && failures < self.settings.fall,
                    last_check: Utc::now(),
                    latency_ms,
                    consecutive_successes: 0,
                    consecutive_failures: failures,
                    last_error: Some(e.to_string()),
                }
            }
        };

        if was_healthy.is_some_and(|h| h != health.healthy) {
            warn!(
                balancer = %self.name,
                target = %target,
                healthy = health.healthy,
                error = ?health.last_error,
                "Target health changed"
            );
        }

        self.targets.insert(target.clone(), health.clone());
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FlakyChecker {
        down: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl HealthChecker for FlakyChecker {
        async fn check(&self, host: &str, _port: u16) -> Result<(), HealthError> {
            if self.down.lock().unwrap().contains(host) {
                Err(HealthError::Unhealthy(format!("{} is down", host)))
            } else {
                Ok(())
            }
        }

        fn configuration(&self) -> HealthCheckConfig {
            HealthCheckConfig::Dummy
        }
    }

    fn settings(rise: u32, fall: u32) -> HealthSettings {
        HealthSettings {
            interval_ms: 10,
            rise,
            fall,
            check: HealthCheckConfig::Dummy,
        }
    }

    #[tokio::test]
    async fn test_reports_every_target() {
        let checker = Arc::new(FlakyChecker::default());
        checker.down.lock().unwrap().insert("h2".to_string());
        let discovery = Arc::new(StaticDiscovery::new(vec![
            Target::new("h1", 443),
            Target::new("h2", 443),
        ]));

        let (tx, mut rx) = mpsc::channel(4);
        let manager = HealthManager::spawn(
            "svc-a".into(),
            settings(1, 1),
            discovery,
            checker,
            tx,
            CancellationToken::new(),
        );

        let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.total(), 2);
        assert_eq!(report.healthy_count(), 1);
        let healthy: HashSet<_> = report
            .targets
            .iter()
            .filter(|t| t.healthy)
            .map(|t| t.target.host.clone())
            .collect();
        assert!(healthy.contains("h1"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_fall_threshold_delays_down() {
        let checker = Arc::new(FlakyChecker::default());
        let discovery = Arc::new(StaticDiscovery::new(vec![Target::new("h1", 80)]));
        let (tx, mut rx) = mpsc::channel(4);
        let manager = HealthManager::spawn(
            "svc-b".into(),
            settings(1, 2),
            discovery,
            checker.clone(),
            tx,
            CancellationToken::new(),
        );

        let first = rx.recv().await.unwrap();
        assert!(first.targets[0].healthy);

        checker.down.lock().unwrap().insert("h1".to_string());
        // Reports already queued may predate the outage; wait for the first failure
        let mut report = rx.recv().await.unwrap();
        while report.targets[0].consecutive_failures == 0 {
            report = rx.recv().await.unwrap();
        }
        assert_eq!(report.targets[0].consecutive_failures, 1);
        assert!(report.targets[0].healthy);

        let next = rx.recv().await.unwrap();
        assert_eq!(next.targets[0].consecutive_failures, 2);
        assert!(!next.targets[0].healthy);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_loop() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let manager = HealthManager::spawn(
            "svc-c".into(),
            settings(1, 1),
            Arc::new(StaticDiscovery::new(vec![])),
            Arc::new(FlakyChecker::default()),
            tx,
            cancel.clone(),
        );
        cancel.cancel();
        manager.stop().await;
        // Sender dropped with the worker
        while rx.recv().await.is_some() {}
    }
}
