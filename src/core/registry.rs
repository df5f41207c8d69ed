//! Service registry and background health monitor.
//!
//! The registry is the single source of truth for endpoint health. Probes
//! and finished calls both feed it; the RPC client consults it before
//! dialing out. Endpoint records are replaced under a write lock, so readers
//! always see a whole record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::Transport;
use crate::domain::{ErrorKind, OrchestratorError, ServiceEndpoint, ServiceStatus};

/// Health monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Seconds between background probe rounds (default: 60)
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Upper bound for a single probe in seconds (default: 10)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

fn default_interval() -> u64 {
    60
}
fn default_probe_timeout() -> u64 {
    10
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            probe_timeout_seconds: default_probe_timeout(),
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds.max(1))
    }
}

struct MonitorHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Registered endpoints plus their live health
pub struct ServiceRegistry {
    endpoints: RwLock<BTreeMap<String, ServiceEndpoint>>,
    transport: Arc<dyn Transport>,
    settings: HealthSettings,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl ServiceRegistry {
    pub fn new(transport: Arc<dyn Transport>, settings: HealthSettings) -> Self {
        Self {
            endpoints: RwLock::new(BTreeMap::new()),
            transport,
            settings,
            monitor: Mutex::new(None),
        }
    }

    /// Build a registry pre-populated with `endpoints`
    pub fn with_endpoints(
        transport: Arc<dyn Transport>,
        settings: HealthSettings,
        endpoints: impl IntoIterator<Item = ServiceEndpoint>,
    ) -> Result<Self, OrchestratorError> {
        let registry = Self::new(transport, settings);
        for endpoint in endpoints {
            registry.register(endpoint)?;
        }
        Ok(registry)
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Transport shared with the RPC client
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Add or overwrite an endpoint
    pub fn register(&self, endpoint: ServiceEndpoint) -> Result<(), OrchestratorError> {
        if endpoint.name.trim().is_empty() {
            return Err(OrchestratorError::validation("service name cannot be empty"));
        }
        if endpoint.base_url.trim().is_empty() {
            return Err(OrchestratorError::validation(format!(
                "service '{}' has an empty address",
                endpoint.name
            )));
        }

        debug!(service = %endpoint.name, url = %endpoint.base_url, "Registered service");
        self.endpoints.write().insert(endpoint.name.clone(), endpoint);
        Ok(())
    }

    /// Remove an endpoint; returns whether it existed
    pub fn deregister(&self, name: &str) -> bool {
        self.endpoints.write().remove(name).is_some()
    }

    /// Copy of one endpoint record
    pub fn endpoint(&self, name: &str) -> Option<ServiceEndpoint> {
        self.endpoints.read().get(name).cloned()
    }

    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.endpoints.read().get(name).map(|e| e.status)
    }

    /// Copies of all endpoint records, ordered by name
    pub fn list(&self) -> Vec<ServiceEndpoint> {
        self.endpoints.read().values().cloned().collect()
    }

    /// Status of every service, ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, ServiceStatus> {
        self.endpoints
            .read()
            .iter()
            .map(|(name, e)| (name.clone(), e.status))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.endpoints.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    /// Probe one service's health address.
    ///
    /// Returns the resulting status, or `None` for an unknown service.
    /// Probe failures only update the record.
    #[instrument(skip(self))]
    pub async fn probe(&self, name: &str) -> Option<ServiceStatus> {
        let endpoint = self.endpoint(name)?;
        let timeout = endpoint.timeout().min(self.settings.probe_timeout());

        let started = Instant::now();
        let outcome = self.transport.health_check(&endpoint, timeout).await;
        let latency = started.elapsed();

        let mut endpoints = self.endpoints.write();
        // Deregistered while the probe was in flight
        let entry = endpoints.get_mut(name)?;

        match outcome {
            Ok(()) => {
                if entry.status != ServiceStatus::Healthy {
                    info!(service = %name, latency_ms = latency.as_millis() as u64, "Service healthy");
                }
                entry.mark_success(latency);
            }
            Err(e) => {
                let status = entry.mark_failure(latency);
                warn!(
                    service = %name,
                    error_count = entry.error_count,
                    %status,
                    error = %e,
                    "Health probe failed"
                );
            }
        }

        Some(entry.status)
    }

    /// Probe every registered service concurrently
    pub async fn probe_all(&self) -> BTreeMap<String, ServiceStatus> {
        let names = self.names();
        let results = join_all(names.iter().map(|name| self.probe(name))).await;

        names
            .into_iter()
            .zip(results)
            .filter_map(|(name, status)| status.map(|s| (name, s)))
            .collect()
    }

    /// Feed the outcome of a finished call back into the service's health.
    ///
    /// `error` is `None` for a successful call. A remote execution failure
    /// still proves the service is reachable; transport failures and
    /// timeouts count against it; anything else leaves the record alone.
    pub fn record_call(
        &self,
        name: &str,
        latency: Duration,
        error: Option<ErrorKind>,
    ) -> Option<ServiceStatus> {
        let mut endpoints = self.endpoints.write();
        let entry = endpoints.get_mut(name)?;

        match error {
            None | Some(ErrorKind::RemoteExecution) => entry.mark_success(latency),
            Some(kind) if kind.is_connectivity_fault() => {
                let status = entry.mark_failure(latency);
                if status == ServiceStatus::Unhealthy {
                    warn!(service = %name, error_count = entry.error_count, "Circuit opened after failed calls");
                }
            }
            Some(_) => {}
        }

        Some(entry.status)
    }

    /// Start the background probe loop. Returns false if already running.
    pub fn start_health_monitor(self: &Arc<Self>) -> bool {
        let mut guard = self.monitor.lock();
        if guard.as_ref().is_some_and(|m| !m.task.is_finished()) {
            return false;
        }

        let shutdown = CancellationToken::new();
        let registry = Arc::clone(self);
        let token = shutdown.clone();
        let period = self.settings.interval();

        let task = tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Health monitor started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let statuses = tokio::select! {
                    _ = token.cancelled() => break,
                    statuses = registry.probe_all() => statuses,
                };
                let unhealthy = statuses
                    .values()
                    .filter(|s| **s == ServiceStatus::Unhealthy)
                    .count();
                debug!(probed = statuses.len(), unhealthy, "Health round finished");
            }

            info!("Health monitor stopped");
        });

        *guard = Some(MonitorHandle { shutdown, task });
        true
    }

    /// Stop the background probe loop and wait for it to exit.
    /// Returns false if it was not running.
    pub async fn stop_health_monitor(&self) -> bool {
        let handle = self.monitor.lock().take();
        match handle {
            Some(MonitorHandle { shutdown, task }) => {
                shutdown.cancel();
                if let Err(e) = task.await {
                    warn!(error = %e, "Health monitor task ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .is_some_and(|m| !m.task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::HttpTransport;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(HttpTransport::new()), HealthSettings::default())
    }

    #[test]
    fn test_register_rejects_empty_fields() {
        let registry = registry();

        let err = registry
            .register(ServiceEndpoint::new("", "http://localhost:1"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = registry.register(ServiceEndpoint::new("a", "")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_overwrites() {
        let registry = registry();
        registry
            .register(ServiceEndpoint::new("a", "http://one"))
            .unwrap();
        registry
            .register(ServiceEndpoint::new("a", "http://two"))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.endpoint("a").unwrap().base_url, "http://two");
        assert_eq!(registry.status("a"), Some(ServiceStatus::Unknown));
    }

    #[test]
    fn test_record_call_classification() {
        let registry = registry();
        registry
            .register(ServiceEndpoint::new("a", "http://a").with_error_threshold(2))
            .unwrap();

        let latency = Duration::from_millis(5);
        assert_eq!(
            registry.record_call("a", latency, Some(ErrorKind::Transport)),
            Some(ServiceStatus::Degraded)
        );
        // Cancellation says nothing about the service
        assert_eq!(
            registry.record_call("a", latency, Some(ErrorKind::Cancelled)),
            Some(ServiceStatus::Degraded)
        );
        assert_eq!(
            registry.record_call("a", latency, Some(ErrorKind::Timeout)),
            Some(ServiceStatus::Unhealthy)
        );
        assert_eq!(
            registry.record_call("a", latency, Some(ErrorKind::RemoteExecution)),
            Some(ServiceStatus::Healthy)
        );
        assert_eq!(registry.record_call("missing", latency, None), None);
    }

    #[tokio::test]
    async fn test_probe_unknown_service() {
        let registry = registry();
        assert_eq!(registry.probe("nope").await, None);
    }
}
