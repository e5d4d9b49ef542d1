//! Rate limiter
//!
//! Evaluates a [`RateLimitPolicy`] for one identifier. Counter state is a JSON
//! record in the shared [`StateStore`] under `ratelimit:{policy}:{identifier}`
//! and is only ever changed through a compare-and-swap, so concurrent checks
//! against one key never admit more than the policy allows.

mod algorithm;

use std::sync::Arc;

use serde::Serialize;

use crate::{
    config::{RateLimitPolicy, RateLimitScope},
    core::{
        store::{read_json, update_json},
        unix_now, GatewayError, GatewayResult, StateStore,
    },
    policy::PolicyStore,
};

pub use algorithm::CounterState;

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the caller regains capacity
    pub reset_at: Option<f64>,
}

impl RateLimitDecision {
    /// Whole seconds until `reset_at`, never less than one.
    pub fn retry_after(&self, now: f64) -> u64 {
        self.reset_at
            .map(|reset_at| (reset_at - now).ceil().max(1.0) as u64)
            .unwrap_or(1)
    }
}

/// Counter key for a policy and scope-derived identifier.
pub fn counter_key(policy_id: &str, identifier: &str) -> String {
    format!("ratelimit:{policy_id}:{identifier}")
}

/// Derives the counter identifier for a scope.
///
/// `per_user` falls back to the client address for anonymous callers.
pub fn scope_identifier(
    scope: RateLimitScope,
    client_ip: &str,
    user_id: Option<&str>,
    api: &str,
) -> String {
    match scope {
        RateLimitScope::PerIp => format!("ip:{client_ip}"),
        RateLimitScope::PerUser => match user_id {
            Some(user) if !user.is_empty() => format!("user:{user}"),
            _ => format!("ip:{client_ip}"),
        },
        RateLimitScope::PerApi => format!("api:{api}"),
    }
}

pub struct RateLimiter {
    policies: Arc<PolicyStore>,
    store: Arc<dyn StateStore>,
}

impl RateLimiter {
    pub fn new(policies: Arc<PolicyStore>, store: Arc<dyn StateStore>) -> Self {
        Self { policies, store }
    }

    fn policy(&self, policy_id: &str) -> GatewayResult<Arc<RateLimitPolicy>> {
        self.policies.rate_limit_policy(policy_id).ok_or_else(|| {
            GatewayError::Configuration(format!("Unknown rate limit policy '{policy_id}'"))
        })
    }

    /// Consumes one unit of capacity, failing with `RateLimited` when none is left.
    pub async fn check(&self, policy_id: &str, identifier: &str) -> GatewayResult<RateLimitDecision> {
        self.check_at(policy_id, identifier, unix_now()).await
    }

    pub async fn check_at(
        &self,
        policy_id: &str,
        identifier: &str,
        now: f64,
    ) -> GatewayResult<RateLimitDecision> {
        let policy = self.policy(policy_id)?;
        let key = counter_key(policy_id, identifier);

        let decision = update_json(self.store.as_ref(), &key, |state: Option<CounterState>| {
            algorithm::consume(&policy, state, now)
        })
        .await?;

        if decision.allowed {
            Ok(decision)
        } else {
            log::debug!("Rate limit exceeded for '{key}'");
            Err(GatewayError::RateLimited {
                message: "Rate limit exceeded".to_string(),
                limit: decision.limit,
                remaining: decision.remaining,
                retry_after: decision.retry_after(now),
            })
        }
    }

    /// Current counter snapshot without consuming capacity.
    pub async fn status(&self, policy_id: &str, identifier: &str) -> GatewayResult<RateLimitDecision> {
        self.status_at(policy_id, identifier, unix_now()).await
    }

    pub async fn status_at(
        &self,
        policy_id: &str,
        identifier: &str,
        now: f64,
    ) -> GatewayResult<RateLimitDecision> {
        let policy = self.policy(policy_id)?;
        let key = counter_key(policy_id, identifier);
        let state: Option<CounterState> = read_json(self.store.as_ref(), &key).await?;
        Ok(algorithm::peek(&policy, state, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RateLimitAlgorithm,
        core::MemoryStore,
    };

    fn limiter(policy: RateLimitPolicy) -> RateLimiter {
        let policies = Arc::new(PolicyStore::new());
        policies.put_rate_limit_policy(policy).unwrap();
        RateLimiter::new(policies, Arc::new(MemoryStore::default()))
    }

    fn policy(algorithm: RateLimitAlgorithm, rpm: u32, burst: Option<u32>, window: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            policy_id: "p".to_string(),
            algorithm,
            requests_per_minute: rpm,
            burst_size: burst,
            window_size_seconds: window,
            refill_rate: None,
            scope: RateLimitScope::PerIp,
        }
    }

    #[tokio::test]
    async fn test_token_bucket_burst_then_refill() {
        let limiter = limiter(policy(RateLimitAlgorithm::TokenBucket, 60, Some(5), 60));

        for expected_remaining in (0..5).rev() {
            let decision = limiter.check_at("p", "ip:1.1.1.1", 1000.0).await.unwrap();
            assert_eq!(expected_remaining, decision.remaining);
            assert_eq!(5, decision.limit);
        }

        let err = limiter.check_at("p", "ip:1.1.1.1", 1000.0).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { limit: 5, remaining: 0, retry_after: 1, .. }));

        assert!(limiter.check_at("p", "ip:1.1.1.1", 1001.0).await.is_ok());
        assert!(limiter.check_at("p", "ip:1.1.1.1", 1001.0).await.is_err());
    }

    #[tokio::test]
    async fn test_token_bucket_keys_are_independent() {
        let limiter = limiter(policy(RateLimitAlgorithm::TokenBucket, 60, Some(1), 60));
        assert!(limiter.check_at("p", "ip:a", 0.0).await.is_ok());
        assert!(limiter.check_at("p", "ip:a", 0.0).await.is_err());
        assert!(limiter.check_at("p", "ip:b", 0.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_sliding_window() {
        let limiter = limiter(policy(RateLimitAlgorithm::SlidingWindow, 3, None, 60));

        for t in [0.0, 1.0, 2.0] {
            assert!(limiter.check_at("p", "user:u", t).await.is_ok());
        }
        let err = limiter.check_at("p", "user:u", 3.0).await.unwrap_err();
        // oldest entry (t=0) leaves the window at t=60
        assert!(matches!(err, GatewayError::RateLimited { retry_after: 57, .. }));

        let decision = limiter.check_at("p", "user:u", 63.0).await.unwrap();
        assert_eq!(2, decision.remaining);
    }

    #[tokio::test]
    async fn test_sliding_window_boundary_is_inclusive_to_new_window() {
        let limiter = limiter(policy(RateLimitAlgorithm::SlidingWindow, 1, None, 60));
        assert!(limiter.check_at("p", "k", 0.0).await.is_ok());
        assert!(limiter.check_at("p", "k", 59.9).await.is_err());
        assert!(limiter.check_at("p", "k", 60.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_fixed_window() {
        let limiter = limiter(policy(RateLimitAlgorithm::FixedWindow, 2, None, 10));

        assert!(limiter.check_at("p", "k", 0.0).await.is_ok());
        assert!(limiter.check_at("p", "k", 9.0).await.is_ok());
        let status = limiter.status_at("p", "k", 9.5).await.unwrap();
        assert_eq!(Some(10.0), status.reset_at);
        assert_eq!(0, status.remaining);
        assert!(limiter.check_at("p", "k", 9.5).await.is_err());

        let decision = limiter.check_at("p", "k", 11.0).await.unwrap();
        assert_eq!(1, decision.remaining);
        assert_eq!(Some(20.0), decision.reset_at);
    }

    #[tokio::test]
    async fn test_fixed_window_boundary_starts_new_window() {
        let limiter = limiter(policy(RateLimitAlgorithm::FixedWindow, 1, None, 10));
        assert!(limiter.check_at("p", "k", 5.0).await.is_ok());
        assert!(limiter.check_at("p", "k", 10.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_does_not_consume() {
        let limiter = limiter(policy(RateLimitAlgorithm::TokenBucket, 60, Some(2), 60));
        let status = limiter.status_at("p", "k", 0.0).await.unwrap();
        assert_eq!(2, status.remaining);
        limiter.status_at("p", "k", 0.0).await.unwrap();
        assert_eq!(1, limiter.check_at("p", "k", 0.0).await.unwrap().remaining);
    }

    #[tokio::test]
    async fn test_unknown_policy_is_configuration_error() {
        let limiter = limiter(policy(RateLimitAlgorithm::TokenBucket, 60, None, 60));
        let err = limiter.check_at("missing", "k", 0.0).await.unwrap_err();
        assert_eq!(500, err.status().as_u16());
    }

    async fn concurrent_admissions(algorithm: RateLimitAlgorithm, capacity: u32, requests: usize) -> usize {
        let limiter = Arc::new(limiter(policy(algorithm, capacity, Some(capacity), 60)));
        let tasks: Vec<_> = (0..requests)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_at("p", "shared", 30.0).await.is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        admitted
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_admit_exactly_capacity() {
        for algorithm in [
            RateLimitAlgorithm::TokenBucket,
            RateLimitAlgorithm::SlidingWindow,
            RateLimitAlgorithm::FixedWindow,
        ] {
            for (capacity, requests) in [(1, 20), (10, 100), (25, 25)] {
                let admitted = concurrent_admissions(algorithm, capacity, requests).await;
                assert_eq!(capacity as usize, admitted, "{algorithm:?} {capacity}/{requests}");
            }
        }
    }

    #[test]
    fn test_scope_identifier() {
        assert_eq!("ip:10.0.0.1", scope_identifier(RateLimitScope::PerIp, "10.0.0.1", Some("bob"), "users"));
        assert_eq!("user:bob", scope_identifier(RateLimitScope::PerUser, "10.0.0.1", Some("bob"), "users"));
        assert_eq!("ip:10.0.0.1", scope_identifier(RateLimitScope::PerUser, "10.0.0.1", None, "users"));
        assert_eq!("api:users", scope_identifier(RateLimitScope::PerApi, "10.0.0.1", None, "users"));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_at: Some(10.2),
        };
        assert_eq!(1, decision.retry_after(10.0));
        assert_eq!(3, decision.retry_after(7.5));
    }
}
