//! Request context management
//!
//! [`RequestContext`] is created once per inbound request, carried through
//! every pipeline stage and dropped with the response.

use std::{sync::Arc, time::Instant};

use crate::{
    auth::AuthResult, breaker::Admission, proxy::ServiceEntry, ratelimit::RateLimitDecision,
};

/// What the request path addresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Target {
    /// Nothing recognised yet
    #[default]
    Unmatched,
    /// A gateway-local endpoint (health, introspection, administration)
    Local,
    /// `/api/v1/{service_id}/{path}`
    Service { service_id: String, path: String },
}

impl Target {
    pub fn service_id(&self) -> Option<&str> {
        match self {
            Target::Service { service_id, .. } => Some(service_id),
            _ => None,
        }
    }
}

/// Per-request state
pub struct RequestContext {
    pub request_id: String,
    pub tenant_id: Option<String>,
    pub auth_result: Option<AuthResult>,
    pub rate_limit: Option<RateLimitDecision>,

    pub request_start: Instant,
    pub target: Target,
    /// Exempt paths skip rate limiting, authentication and the breaker
    pub exempt: bool,
    /// Value of the caller's `Origin` header, if any
    pub origin: Option<String>,

    /// Registry entry resolved by the router stage
    pub upstream: Option<Arc<ServiceEntry>>,
    /// How the breaker admitted this request
    pub admission: Option<Admission>,
    /// Set once the upstream outcome has been reported to the breaker
    pub outcome_reported: bool,
    /// When the upstream peer was selected
    pub upstream_started: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: None,
            auth_result: None,
            rate_limit: None,
            request_start: Instant::now(),
            target: Target::default(),
            exempt: false,
            origin: None,
            upstream: None,
            admission: None,
            outcome_reported: false,
            upstream_started: None,
        }
    }
}

impl RequestContext {
    pub fn rate_limit_remaining(&self) -> Option<u32> {
        self.rate_limit.as_ref().map(|d| d.remaining)
    }

    pub fn service_id(&self) -> Option<&str> {
        self.target.service_id()
    }
}
