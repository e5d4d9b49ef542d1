use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use http::Uri;
use log::{debug, info, warn};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use pingora_error::{Error, Result};
use pingora_http::ResponseHeader;
use pingora_load_balancing::{
    health_check::{HealthCheck as HealthCheckTrait, HttpHealthCheck},
    Backend,
};
use serde::Serialize;

use crate::config;

use super::{discovery, HealthStatus, ServiceEntry, ServiceRegistry};

/// Consecutive probe results for one service.
#[derive(Default)]
struct ProbeCounters {
    successes: u32,
    failures: u32,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub services: BTreeMap<String, HealthStatus>,
}

/// Probes every registered service on an interval and on demand.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    config: config::HealthCheck,
    counters: Arc<DashMap<String, ProbeCounters>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ServiceRegistry>, config: config::HealthCheck) -> Self {
        Self {
            registry,
            config,
            counters: Arc::new(DashMap::new()),
        }
    }

    fn build_check(&self, entry: &ServiceEntry) -> HttpHealthCheck {
        let mut health_check = HttpHealthCheck::new(&entry.host, entry.tls);
        if let Err(e) = health_check
            .req
            .insert_header(http::header::HOST, entry.authority.as_str())
        {
            warn!("Invalid health check host for '{}': {e}", entry.service_id);
        }
        health_check.peer_template.options.total_connection_timeout =
            Some(Duration::from_secs(self.config.timeout));
        health_check.peer_template.options.read_timeout =
            Some(Duration::from_secs(self.config.timeout));

        let path = entry.health_uri();
        match Uri::builder().path_and_query(path.as_str()).build() {
            Ok(uri) => health_check.req.set_uri(uri),
            Err(_) => warn!("Invalid health check path for '{}': {path}", entry.service_id),
        }

        // any 2xx counts as healthy
        health_check.validator = Some(Box::new(|header: &ResponseHeader| {
            if header.status.is_success() {
                Ok(())
            } else {
                Err(Error::new_str("Unhealthy status"))
            }
        }));
        health_check
    }

    async fn probe(&self, entry: &ServiceEntry) -> Result<()> {
        let addr = discovery::resolve(&entry.host, entry.port).await?;
        let backend = Backend::new(&addr.to_string())?;
        self.build_check(entry).check(&backend).await
    }

    /// Applies one probe result and returns the resulting status.
    fn observe(&self, entry: &ServiceEntry, success: bool) -> HealthStatus {
        let mut counters = self.counters.entry(entry.service_id.clone()).or_default();
        if success {
            counters.successes += 1;
            counters.failures = 0;
        } else {
            counters.failures += 1;
            counters.successes = 0;
        }

        let current = entry.health();
        let next = if success && counters.successes >= self.config.healthy_successes {
            HealthStatus::Healthy
        } else if !success && counters.failures >= self.config.unhealthy_failures {
            HealthStatus::Unhealthy
        } else {
            current
        };

        if next != current {
            info!(
                "Service '{}' health changed from {current:?} to {next:?}",
                entry.service_id
            );
            entry.set_health(next);
        }
        next
    }

    /// Runs one probe round over the whole registry.
    pub async fn probe_all(&self) {
        let entries = self.registry.list();
        let probes = entries.iter().map(|entry| async move {
            let result = self.probe(entry).await;
            if let Err(e) = &result {
                debug!("Health probe for '{}' failed: {e}", entry.service_id);
            }
            self.observe(entry, result.is_ok());
        });
        join_all(probes).await;
    }

    /// Current health of every service plus the aggregate status.
    pub fn snapshot(&self) -> HealthSnapshot {
        let services: BTreeMap<_, _> = self
            .registry
            .list()
            .iter()
            .map(|entry| (entry.service_id.clone(), entry.health()))
            .collect();
        HealthSnapshot {
            status: aggregate_status(services.values().copied()),
            services,
        }
    }
}

/// `healthy` when every service is healthy, `unhealthy` when every service
/// is unhealthy, `degraded` otherwise. An empty registry is healthy.
fn aggregate_status(statuses: impl Iterator<Item = HealthStatus>) -> &'static str {
    let (mut total, mut healthy, mut unhealthy) = (0, 0, 0);
    for status in statuses {
        total += 1;
        match status {
            HealthStatus::Healthy => healthy += 1,
            HealthStatus::Unhealthy => unhealthy += 1,
            HealthStatus::Unknown => {}
        }
    }

    if healthy == total {
        "healthy"
    } else if unhealthy == total {
        "unhealthy"
    } else {
        "degraded"
    }
}

#[async_trait]
impl BackgroundService for HealthMonitor {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        info!("Starting health monitor");
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, stopping health monitor");
                        break;
                    }
                },
                _ = interval.tick() => self.probe_all().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;

    fn monitor(healthy_successes: u32, unhealthy_failures: u32) -> HealthMonitor {
        let registry = Arc::new(ServiceRegistry::new(Timeouts::default()));
        for (id, url) in [("users", "http://10.0.0.1:80"), ("orders", "http://10.0.0.2:80")] {
            registry
                .register(&config::Service {
                    id: id.to_string(),
                    base_url: url.to_string(),
                    endpoints: vec![],
                    health_path: "/health".to_string(),
                    rate_limit_policy: None,
                    auth_policy: None,
                    timeouts: None,
                })
                .unwrap();
        }
        HealthMonitor::new(
            registry,
            config::HealthCheck {
                interval: 10,
                timeout: 1,
                healthy_successes,
                unhealthy_failures,
            },
        )
    }

    #[test]
    fn test_consecutive_thresholds() {
        let monitor = monitor(2, 3);
        let users = monitor.registry.resolve("users").unwrap();

        assert_eq!(HealthStatus::Unknown, monitor.observe(&users, true));
        assert_eq!(HealthStatus::Healthy, monitor.observe(&users, true));

        assert_eq!(HealthStatus::Healthy, monitor.observe(&users, false));
        assert_eq!(HealthStatus::Healthy, monitor.observe(&users, false));
        // a success in between restarts the failure run
        assert_eq!(HealthStatus::Healthy, monitor.observe(&users, true));
        assert_eq!(HealthStatus::Healthy, monitor.observe(&users, false));
        assert_eq!(HealthStatus::Healthy, monitor.observe(&users, false));
        assert_eq!(HealthStatus::Unhealthy, monitor.observe(&users, false));
        assert_eq!(HealthStatus::Unhealthy, users.health());
    }

    #[test]
    fn test_snapshot_aggregate() {
        let monitor = monitor(1, 1);
        let users = monitor.registry.resolve("users").unwrap();
        let orders = monitor.registry.resolve("orders").unwrap();

        assert_eq!("degraded", monitor.snapshot().status);

        monitor.observe(&users, true);
        monitor.observe(&orders, true);
        assert_eq!("healthy", monitor.snapshot().status);

        monitor.observe(&orders, false);
        let snapshot = monitor.snapshot();
        assert_eq!("degraded", snapshot.status);
        assert_eq!(Some(&HealthStatus::Unhealthy), snapshot.services.get("orders"));

        monitor.observe(&users, false);
        assert_eq!("unhealthy", monitor.snapshot().status);
    }

    #[test]
    fn test_aggregate_empty_registry() {
        assert_eq!("healthy", aggregate_status(std::iter::empty()));
    }

    #[test]
    fn test_check_request_targets_service() {
        let monitor = monitor(1, 1);
        let users = monitor.registry.resolve("users").unwrap();
        let check = monitor.build_check(&users);

        assert_eq!(
            Some("10.0.0.1:80"),
            check
                .req
                .headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
        );
        assert_eq!("/health", check.req.uri.path());
        assert_eq!(
            Some(Duration::from_secs(1)),
            check.peer_template.options.read_timeout
        );
    }
}
