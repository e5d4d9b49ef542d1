//! Dependency container
//!
//! Builds every gateway component from configuration once at startup and
//! hands them out behind `Arc`s, so request handling never touches globals.

use std::sync::Arc;

use crate::{
    auth::AuthEngine,
    breaker::CircuitBreakers,
    config::{self, Config},
    policy::PolicyStore,
    proxy::{health_check::HealthMonitor, ServiceRegistry},
    ratelimit::RateLimiter,
};

use super::{
    error::GatewayResult,
    store::{build_store, StateStore},
};

pub struct ServiceContainer {
    pub gateway: config::Gateway,
    pub policies: Arc<PolicyStore>,
    pub store: Arc<dyn StateStore>,
    pub limiter: RateLimiter,
    pub auth: AuthEngine,
    pub breakers: CircuitBreakers,
    pub registry: Arc<ServiceRegistry>,
    pub health: HealthMonitor,
}

impl ServiceContainer {
    /// Fails on any configuration problem that would otherwise surface on
    /// the first request: unsupported store, unusable JWT policy, bad
    /// service URL.
    pub fn from_config(config: &Config) -> GatewayResult<Self> {
        let gateway = config.gateway.clone();

        let store = build_store(gateway.store_url.as_deref())?;
        let policies = Arc::new(PolicyStore::from_config(config)?);

        let auth = AuthEngine::new(policies.clone(), store.clone(), gateway.jwt.clone());
        auth.compile_all()?;

        let registry = Arc::new(ServiceRegistry::from_config(config)?);
        let health = HealthMonitor::new(registry.clone(), gateway.health_check);

        Ok(Self {
            limiter: RateLimiter::new(policies.clone(), store.clone()),
            breakers: CircuitBreakers::new(store.clone(), gateway.circuit_breaker),
            gateway,
            policies,
            store,
            auth,
            registry,
            health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let conf = Config::from_yaml(
            r#"
gateway:
  listeners:
    - address: 0.0.0.0:8080
  jwt:
    secret_key: secret
auth_policies:
  - policy_id: jwt
    auth_type: jwt
services:
  - id: users
    base_url: http://127.0.0.1:9001
"#,
        )
        .unwrap();

        let container = ServiceContainer::from_config(&conf).unwrap();
        assert!(container.registry.contains("users"));
        assert!(container.policies.rate_limit_policy("default").is_some());
    }

    #[test]
    fn test_jwt_policy_without_secret_is_fatal() {
        let conf = Config::from_yaml(
            r#"
gateway:
  listeners:
    - address: 0.0.0.0:8080
auth_policies:
  - policy_id: jwt
    auth_type: jwt
"#,
        )
        .unwrap();

        assert!(ServiceContainer::from_config(&conf).is_err());
    }
}
