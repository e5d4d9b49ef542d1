//! Request pipeline
//!
//! An explicit, ordered list of named stages. On the way in each stage runs
//! in order and the first error short-circuits the rest; on the way out every
//! stage may annotate the response header, in reverse order.

use std::{net::IpAddr, sync::Arc, time::Instant};

use async_trait::async_trait;
use http::{header, HeaderMap, HeaderValue, Method, Uri};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;

use crate::{
    admin::AdminRouter,
    config::{self, RateLimitPolicy, RateLimitScope},
    core::{unix_now, GatewayError, GatewayResult, RequestContext, ServiceContainer, Target},
    observability,
    ratelimit::scope_identifier,
    utils::{
        request::{get_client_ip, get_header_value, get_peer_ip},
        response::{HEADER_RATE_LIMIT_LIMIT, HEADER_RATE_LIMIT_REMAINING},
    },
};

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_TENANT_ID: &str = "x-tenant-id";
pub const HEADER_GATEWAY_REQUEST_ID: &str = "x-gateway-request-id";
pub const HEADER_GATEWAY_VERSION: &str = "x-gateway-version";

const SERVICE_PREFIX: &str = "/api/v1/";

/// The parts of the downstream request the stages look at.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub client_ip: String,
}

impl GatewayRequest {
    pub fn from_session(session: &Session, gateway: &config::Gateway) -> Self {
        let req = session.req_header();
        Self::from_parts(
            req.method.clone(),
            &req.uri,
            req.headers.clone(),
            get_peer_ip(session),
            gateway,
        )
    }

    pub fn from_parts(
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        peer: Option<IpAddr>,
        gateway: &config::Gateway,
    ) -> Self {
        let client_ip = get_client_ip(&headers, peer, |addr| gateway.is_trusted_proxy(addr));
        Self {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
            client_ip,
        }
    }
}

#[async_trait]
pub trait GatewayStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Admission stages are skipped for exempt paths.
    fn admission(&self) -> bool {
        false
    }

    async fn on_request(
        &self,
        _request: &GatewayRequest,
        _ctx: &mut RequestContext,
    ) -> GatewayResult<()> {
        Ok(())
    }

    fn on_response(&self, _ctx: &RequestContext, _response: &mut ResponseHeader) -> Result<()> {
        Ok(())
    }
}

pub struct Pipeline {
    stages: Vec<Arc<dyn GatewayStage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn GatewayStage>>) -> Self {
        Self { stages }
    }

    /// The gateway's fixed stage order.
    pub fn standard(container: Arc<ServiceContainer>, admin: Arc<AdminRouter>) -> Self {
        Self::new(vec![
            Arc::new(RequestContextStage {
                container: container.clone(),
                admin,
            }),
            Arc::new(LatencyTimerStage),
            Arc::new(CorsStage {
                origins: container.gateway.cors_origins.clone(),
            }),
            Arc::new(RateLimitStage {
                container: container.clone(),
            }),
            Arc::new(AuthStage {
                container: container.clone(),
            }),
            Arc::new(CircuitBreakerStage {
                container: container.clone(),
            }),
            Arc::new(RouterStage { container }),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn run_request(
        &self,
        request: &GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<()> {
        for stage in self.stages.iter() {
            if ctx.exempt && stage.admission() {
                continue;
            }
            if let Err(err) = stage.on_request(request, ctx).await {
                log::debug!(
                    "Request {} rejected by stage '{}': {err}",
                    ctx.request_id,
                    stage.name()
                );
                observability::record_rejection(err.code());
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn run_response(&self, ctx: &RequestContext, response: &mut ResponseHeader) -> Result<()> {
        for stage in self.stages.iter().rev() {
            stage.on_response(ctx, response)?;
        }
        Ok(())
    }
}

/// Splits `/api/v1/{service_id}/{path}`; local endpoints win over services.
fn classify(path: &str, admin: &AdminRouter) -> Target {
    if admin.has_path(path) {
        return Target::Local;
    }

    match path.strip_prefix(SERVICE_PREFIX) {
        Some(rest) => {
            let (service_id, path) = rest.split_once('/').unwrap_or((rest, ""));
            if service_id.is_empty() {
                Target::Unmatched
            } else {
                Target::Service {
                    service_id: service_id.to_string(),
                    path: path.to_string(),
                }
            }
        }
        None => Target::Unmatched,
    }
}

/// Rate-limit policy and counter identifier that apply to a request, or
/// `None` when no policy is in effect.
pub fn rate_limit_subject(
    container: &ServiceContainer,
    request: &GatewayRequest,
    service_id: Option<&str>,
) -> GatewayResult<Option<(Arc<RateLimitPolicy>, String)>> {
    let policy_id = service_id
        .and_then(|id| container.registry.get(id))
        .and_then(|entry| entry.rate_limit_policy.clone())
        .or_else(|| container.gateway.fallback_rate_limit_policy().map(String::from));
    let Some(policy_id) = policy_id else {
        return Ok(None);
    };

    let policy = container.policies.rate_limit_policy(&policy_id).ok_or_else(|| {
        GatewayError::Configuration(format!("Unknown rate limit policy '{policy_id}'"))
    })?;

    // rate limiting runs before authentication, so the user is identified
    // from the credential itself; unverifiable callers count by address
    let user_id = match policy.scope {
        RateLimitScope::PerUser => auth_policy_for(container, service_id).and_then(|auth| {
            container.auth.identify_at(
                &request.headers,
                request.query.as_deref(),
                &auth,
                unix_now(),
            )
        }),
        _ => None,
    };
    let identifier = scope_identifier(
        policy.scope,
        &request.client_ip,
        user_id.as_deref(),
        service_id.unwrap_or(&request.path),
    );
    Ok(Some((policy, identifier)))
}

/// Auth policy guarding a request: the target service's own, else the
/// gateway default.
fn auth_policy_for(container: &ServiceContainer, service_id: Option<&str>) -> Option<String> {
    service_id
        .and_then(|id| container.registry.get(id))
        .and_then(|entry| entry.auth_policy.clone())
        .or_else(|| container.gateway.default_auth_policy.clone())
}

struct RequestContextStage {
    container: Arc<ServiceContainer>,
    admin: Arc<AdminRouter>,
}

#[async_trait]
impl GatewayStage for RequestContextStage {
    fn name(&self) -> &'static str {
        "request-context"
    }

    async fn on_request(
        &self,
        request: &GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<()> {
        let non_empty = |name: &str| {
            get_header_value(&request.headers, name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        if let Some(request_id) = non_empty(HEADER_REQUEST_ID) {
            ctx.request_id = request_id;
        }
        ctx.tenant_id = non_empty(HEADER_TENANT_ID);
        ctx.origin = non_empty(header::ORIGIN.as_str());
        ctx.target = classify(&request.path, &self.admin);
        ctx.exempt = self.container.gateway.is_exempt(&request.path);
        Ok(())
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut ResponseHeader) -> Result<()> {
        response.insert_header(HEADER_GATEWAY_REQUEST_ID, ctx.request_id.as_str())?;
        response.insert_header(
            HEADER_GATEWAY_VERSION,
            self.container.gateway.version.as_str(),
        )?;
        Ok(())
    }
}

struct LatencyTimerStage;

#[async_trait]
impl GatewayStage for LatencyTimerStage {
    fn name(&self) -> &'static str {
        "latency-timer"
    }

    async fn on_request(
        &self,
        _request: &GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<()> {
        ctx.request_start = Instant::now();
        Ok(())
    }
}

struct CorsStage {
    origins: Vec<String>,
}

#[async_trait]
impl GatewayStage for CorsStage {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut ResponseHeader) -> Result<()> {
        if self.origins.iter().any(|o| o == "*") {
            response.insert_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")?;
            return Ok(());
        }

        if let Some(origin) = ctx.origin.as_deref() {
            if self.origins.iter().any(|o| o == origin) {
                response.insert_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin)?;
                response.append_header(header::VARY, HeaderValue::from_static("Origin"))?;
            }
        }
        Ok(())
    }
}

struct RateLimitStage {
    container: Arc<ServiceContainer>,
}

#[async_trait]
impl GatewayStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn admission(&self) -> bool {
        true
    }

    async fn on_request(
        &self,
        request: &GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<()> {
        let subject = rate_limit_subject(&self.container, request, ctx.service_id())?;
        if let Some((policy, identifier)) = subject {
            let decision = self
                .container
                .limiter
                .check(&policy.policy_id, &identifier)
                .await?;
            ctx.rate_limit = Some(decision);
        }
        Ok(())
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut ResponseHeader) -> Result<()> {
        if let Some(decision) = &ctx.rate_limit {
            response.insert_header(HEADER_RATE_LIMIT_LIMIT, decision.limit.to_string())?;
            response.insert_header(HEADER_RATE_LIMIT_REMAINING, decision.remaining.to_string())?;
        }
        Ok(())
    }
}

struct AuthStage {
    container: Arc<ServiceContainer>,
}

#[async_trait]
impl GatewayStage for AuthStage {
    fn name(&self) -> &'static str {
        "authentication"
    }

    fn admission(&self) -> bool {
        true
    }

    async fn on_request(
        &self,
        request: &GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<()> {
        let Some(policy_id) = auth_policy_for(&self.container, ctx.service_id()) else {
            return Ok(());
        };

        let result = self
            .container
            .auth
            .authenticate(&request.headers, request.query.as_deref(), &policy_id)
            .await?;
        if ctx.tenant_id.is_none() {
            ctx.tenant_id = result.tenant_id.clone();
        }
        ctx.auth_result = Some(result);
        Ok(())
    }
}

struct CircuitBreakerStage {
    container: Arc<ServiceContainer>,
}

#[async_trait]
impl GatewayStage for CircuitBreakerStage {
    fn name(&self) -> &'static str {
        "circuit-breaker"
    }

    fn admission(&self) -> bool {
        true
    }

    async fn on_request(
        &self,
        _request: &GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<()> {
        // unknown services are left to the router
        let Some(service_id) = ctx
            .service_id()
            .filter(|id| self.container.registry.contains(id))
            .map(String::from)
        else {
            return Ok(());
        };

        let admission = self.container.breakers.acquire(&service_id).await?;
        ctx.admission = Some(admission);
        Ok(())
    }
}

struct RouterStage {
    container: Arc<ServiceContainer>,
}

#[async_trait]
impl GatewayStage for RouterStage {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn on_request(
        &self,
        request: &GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<()> {
        match &ctx.target {
            Target::Local => Ok(()),
            Target::Service { service_id, .. } => {
                ctx.upstream = Some(self.container.registry.resolve(service_id)?);
                Ok(())
            }
            Target::Unmatched => Err(GatewayError::Routing(format!(
                "No route for path '{}'",
                request.path
            ))),
        }
    }
}
