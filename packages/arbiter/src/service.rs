//! FairShare-Arbiter: Service Arbitrator Shim
//!
//! Abstract "service slots" (text generation, embedding, ...) are just
//! resource demands in disguise: each service carries a static per-slot
//! resource footprint, and a slot request multiplies it out. The resulting
//! contention is fed into the single-resource or joint arbitrators
//! unchanged; this shim adds no mechanism of its own.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use fairshare_core::{ResourceBundle, ResourceType};

/// Per-slot resource footprints by service id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceCatalog {
    footprints: BTreeMap<String, ResourceBundle>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service's per-slot footprint.
    pub fn register(mut self, service_id: impl Into<String>, footprint: ResourceBundle) -> Self {
        self.footprints.insert(service_id.into(), footprint);
        self
    }

    pub fn footprint(&self, service_id: &str) -> Option<&ResourceBundle> {
        self.footprints.get(service_id)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.footprints.keys().map(String::as_str)
    }
}

/// A request for some number of slots of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSlotRequest {
    pub agent_id: String,
    pub service_id: String,
    pub slots: u64,
}

/// Service shim errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown service: {service_id}")]
    UnknownService { service_id: String },

    #[error("service {service_id} invocation failed: {reason}")]
    InvocationFailed { service_id: String, reason: String },
}

/// Translates slot requests to resource demands.
#[derive(Debug, Clone, Default)]
pub struct ServiceArbitrator {
    catalog: ServiceCatalog,
}

impl ServiceArbitrator {
    pub fn new(catalog: ServiceCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    /// `slots x footprint`, the injective translation the arbitrators
    /// consume.
    pub fn resource_demand(
        &self,
        request: &ServiceSlotRequest,
    ) -> Result<ResourceBundle, ServiceError> {
        let footprint = self
            .catalog
            .footprint(&request.service_id)
            .ok_or_else(|| ServiceError::UnknownService {
                service_id: request.service_id.clone(),
            })?;
        Ok(footprint.scaled(request.slots))
    }

    /// Probe a backend once to estimate a service's latency. Estimation
    /// only; the result never enters the allocator.
    pub async fn probe_qos(
        &self,
        backend: &dyn ServiceBackend,
        service_id: &str,
    ) -> Result<Duration, ServiceError> {
        if self.catalog.footprint(service_id).is_none() {
            return Err(ServiceError::UnknownService {
                service_id: service_id.to_string(),
            });
        }
        let response = backend.invoke(service_id, &BTreeMap::new()).await?;
        Ok(response.duration)
    }
}

/// Output of one backend invocation.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub outputs: BTreeMap<String, String>,
    pub duration: Duration,
}

/// The runtime's service capability. Retry-on-error stays with the
/// implementer; the shim surfaces failures as-is.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    async fn invoke(
        &self,
        service_id: &str,
        input: &BTreeMap<String, String>,
    ) -> Result<ServiceResponse, ServiceError>;
}

/// Deterministic mock backend with a configurable simulated failure rate.
pub struct MockServiceBackend {
    failure_rate: f64,
    latency: Duration,
    rng: Mutex<StdRng>,
}

impl MockServiceBackend {
    pub fn new(seed: u64) -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::from_millis(5),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl ServiceBackend for MockServiceBackend {
    async fn invoke(
        &self,
        service_id: &str,
        input: &BTreeMap<String, String>,
    ) -> Result<ServiceResponse, ServiceError> {
        let roll: f64 = self.rng.lock().gen();
        if roll < self.failure_rate {
            return Err(ServiceError::InvocationFailed {
                service_id: service_id.to_string(),
                reason: "simulated failure".to_string(),
            });
        }

        let mut outputs = BTreeMap::new();
        outputs.insert("echo".to_string(), format!("{service_id}:{}", input.len()));
        Ok(ServiceResponse {
            outputs,
            duration: self.latency,
        })
    }
}

/// A reasonable default catalog for demos and tests.
pub fn default_catalog() -> ServiceCatalog {
    ServiceCatalog::new()
        .register(
            "text_generation",
            ResourceBundle::new()
                .with(ResourceType::Compute, 4)
                .with(ResourceType::Memory, 2)
                .with(ResourceType::ApiCredits, 1),
        )
        .register(
            "embedding",
            ResourceBundle::new()
                .with(ResourceType::Compute, 1)
                .with(ResourceType::Memory, 1),
        )
        .register(
            "batch_inference",
            ResourceBundle::new()
                .with(ResourceType::Compute, 8)
                .with(ResourceType::Memory, 4)
                .with(ResourceType::Dataset, 1),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_translation_multiplies_footprint() {
        let shim = ServiceArbitrator::new(default_catalog());
        let demand = shim
            .resource_demand(&ServiceSlotRequest {
                agent_id: "a".to_string(),
                service_id: "text_generation".to_string(),
                slots: 3,
            })
            .unwrap();

        assert_eq!(demand.get(ResourceType::Compute), 12);
        assert_eq!(demand.get(ResourceType::Memory), 6);
        assert_eq!(demand.get(ResourceType::ApiCredits), 3);
    }

    #[test]
    fn test_translation_is_injective_per_service() {
        // Distinct slot counts produce distinct bundles.
        let shim = ServiceArbitrator::new(default_catalog());
        let request = |slots| ServiceSlotRequest {
            agent_id: "a".to_string(),
            service_id: "embedding".to_string(),
            slots,
        };
        let one = shim.resource_demand(&request(1)).unwrap();
        let two = shim.resource_demand(&request(2)).unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn test_unknown_service_rejected() {
        let shim = ServiceArbitrator::new(default_catalog());
        let err = shim
            .resource_demand(&ServiceSlotRequest {
                agent_id: "a".to_string(),
                service_id: "quantum_oracle".to_string(),
                slots: 1,
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownService { .. }));
    }

    #[tokio::test]
    async fn test_mock_backend_succeeds_without_failures() {
        let backend = MockServiceBackend::new(7);
        let response = backend.invoke("embedding", &BTreeMap::new()).await.unwrap();
        assert!(response.outputs.contains_key("echo"));
    }

    #[tokio::test]
    async fn test_mock_backend_simulated_failures_are_surfaced() {
        // Failure rate 1.0: every call fails, and the shim does not retry.
        let backend = MockServiceBackend::new(7).with_failure_rate(1.0);
        let err = backend.invoke("embedding", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvocationFailed { .. }));
    }

    #[tokio::test]
    async fn test_probe_qos_reports_latency() {
        let shim = ServiceArbitrator::new(default_catalog());
        let backend = MockServiceBackend::new(1).with_latency(Duration::from_millis(12));
        let latency = shim.probe_qos(&backend, "embedding").await.unwrap();
        assert_eq!(latency, Duration::from_millis(12));
    }
}
