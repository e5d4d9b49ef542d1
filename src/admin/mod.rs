//! Gateway-local endpoints
//!
//! Health, introspection and policy administration. These paths are served
//! by the gateway itself from `request_filter`; they go through the same
//! pipeline as proxied traffic, minus the router. Everything except the
//! read-only introspection endpoints also needs `gateway.admin.api_key` in
//! `X-Admin-Key`; without an admin section those endpoints are disabled.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use http::{header, Method, Response, StatusCode};
use matchit::{Match, Router};
use serde::{de::DeserializeOwned, Serialize};
use validator::Validate;

use crate::{
    config::{self, ApiKeyStatus, AuthType, RateLimitPolicy},
    core::{GatewayError, GatewayResult, ServiceContainer},
    pipeline::{rate_limit_subject, GatewayRequest},
    policy::IssueApiKey,
    utils::{
        request::{get_header_value, get_query_value},
        response::{content_type, ResponseBuilder},
    },
};

/// Header carrying `gateway.admin.api_key`.
pub const HEADER_ADMIN_KEY: &str = "x-admin-key";

type Params = BTreeMap<String, String>;

#[async_trait]
trait Handler {
    /// Read-only introspection anyone admitted by the pipeline may call.
    /// Everything else needs the admin key.
    fn public(&self) -> bool {
        false
    }

    async fn handle(
        &self,
        container: &ServiceContainer,
        request: &GatewayRequest,
        params: Params,
        body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>>;
}

pub struct AdminRouter {
    router: Router<HashMap<Method, Box<dyn Handler + Send + Sync>>>,
}

impl Default for AdminRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminRouter {
    pub fn new() -> Self {
        let mut this = Self {
            router: Router::new(),
        };

        this.route("/health", Method::GET, Box::new(HealthHandler))
            .route("/api/v1/services", Method::GET, Box::new(ServiceListHandler))
            .route(
                "/api/v1/rate-limit/status",
                Method::GET,
                Box::new(RateLimitStatusHandler),
            )
            .route(
                "/api/v1/circuit-breaker/{service}",
                Method::GET,
                Box::new(CircuitBreakerStatusHandler),
            )
            .route("/gateway/routes", Method::POST, Box::new(RouteCreateHandler))
            .route(
                "/rate-limit/policies",
                Method::POST,
                Box::new(RateLimitPolicyCreateHandler),
            )
            .route(
                "/auth/policies",
                Method::POST,
                Box::new(AuthPolicyCreateHandler),
            )
            .route("/auth/api-keys", Method::POST, Box::new(ApiKeyIssueHandler))
            .route(
                "/auth/api-keys/{key_id}",
                Method::GET,
                Box::new(ApiKeyGetHandler),
            )
            .route(
                "/auth/api-keys/{key_id}/revoke",
                Method::POST,
                Box::new(ApiKeyRevokeHandler),
            );

        this
    }

    fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> &mut Self {
        match self.router.at_mut(path) {
            Ok(routes) => {
                routes.value.insert(method, handler);
            }
            Err(_) => {
                let mut handlers = HashMap::new();
                handlers.insert(method, handler);
                if let Err(e) = self.router.insert(path, handlers) {
                    log::error!("Failed to register local route {path}: {e}");
                }
            }
        }
        self
    }

    /// Whether `path` is served by the gateway itself.
    pub fn has_path(&self, path: &str) -> bool {
        self.router.at(path).is_ok()
    }

    pub async fn dispatch(
        &self,
        container: &ServiceContainer,
        request: &GatewayRequest,
        body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let Match { value, params } = self.router.at(&request.path).map_err(|_| {
            GatewayError::Routing(format!("No route for path '{}'", request.path))
        })?;

        let handler = value.get(&request.method).ok_or_else(|| {
            GatewayError::MethodNotAllowed(format!(
                "Method {} is not allowed on {}",
                request.method, request.path
            ))
        })?;

        if !handler.public() {
            validate_admin_key(container.gateway.admin.as_ref(), request)?;
        }

        let params: Params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        handler.handle(container, request, params, body).await
    }
}

fn validate_admin_key(admin: Option<&config::Admin>, request: &GatewayRequest) -> GatewayResult<()> {
    let Some(admin) = admin else {
        return Err(GatewayError::Authorization(
            "Administrative endpoints are disabled".to_string(),
        ));
    };

    match get_header_value(&request.headers, HEADER_ADMIN_KEY) {
        Some(key) if constant_time_eq(key.as_bytes(), admin.api_key.as_bytes()) => Ok(()),
        Some(_) => Err(GatewayError::Authorization("Invalid admin key".to_string())),
        None => Err(GatewayError::Authentication(
            "Must provide admin key".to_string(),
        )),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn param<'a>(params: &'a Params, name: &str) -> GatewayResult<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| GatewayError::Validation(format!("Missing path parameter '{name}'")))
}

fn parse_json_body<T: DeserializeOwned>(request: &GatewayRequest, body: &[u8]) -> GatewayResult<T> {
    match get_header_value(&request.headers, header::CONTENT_TYPE.as_str()) {
        Some(value) if value.starts_with(content_type::APPLICATION_JSON) => {}
        _ => {
            return Err(GatewayError::Validation(
                "Content-Type must be application/json".to_string(),
            ))
        }
    }
    Ok(serde_json::from_slice(body)?)
}

fn validate<T: Validate>(resource: &T) -> GatewayResult<()> {
    resource
        .validate()
        .map_err(|e| GatewayError::Validation(e.to_string()))
}

fn created<T: Serialize>(data: &T) -> Response<Vec<u8>> {
    ResponseBuilder::json(StatusCode::CREATED, data)
}

struct HealthHandler;

#[async_trait]
impl Handler for HealthHandler {
    fn public(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        container: &ServiceContainer,
        request: &GatewayRequest,
        _params: Params,
        _body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        if get_query_value(request.query.as_deref(), "refresh") == Some("true") {
            container.health.probe_all().await;
        }
        Ok(ResponseBuilder::success_json(&container.health.snapshot()))
    }
}

struct ServiceListHandler;

#[async_trait]
impl Handler for ServiceListHandler {
    fn public(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        container: &ServiceContainer,
        _request: &GatewayRequest,
        _params: Params,
        _body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let entries = container.registry.list();
        let services: Vec<_> = entries.iter().map(|entry| entry.as_ref()).collect();
        Ok(ResponseBuilder::success_json(
            &serde_json::json!({ "services": services }),
        ))
    }
}

#[derive(Serialize)]
struct RateLimitStatus {
    client_id: String,
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<f64>,
}

struct RateLimitStatusHandler;

#[async_trait]
impl Handler for RateLimitStatusHandler {
    fn public(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        container: &ServiceContainer,
        request: &GatewayRequest,
        _params: Params,
        _body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let status = match rate_limit_subject(container, request, None)? {
            Some((policy, identifier)) => {
                let decision = container
                    .limiter
                    .status(&policy.policy_id, &identifier)
                    .await?;
                RateLimitStatus {
                    client_id: identifier,
                    limit: Some(decision.limit),
                    remaining: Some(decision.remaining),
                    reset_at: decision.reset_at,
                }
            }
            None => RateLimitStatus {
                client_id: request.client_ip.clone(),
                limit: None,
                remaining: None,
                reset_at: None,
            },
        };
        Ok(ResponseBuilder::success_json(&status))
    }
}

struct CircuitBreakerStatusHandler;

#[async_trait]
impl Handler for CircuitBreakerStatusHandler {
    fn public(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        container: &ServiceContainer,
        _request: &GatewayRequest,
        params: Params,
        _body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let service = param(&params, "service")?;
        container.registry.resolve(service)?;
        let status = container.breakers.status(service).await?;
        Ok(ResponseBuilder::success_json(&status))
    }
}

struct RouteCreateHandler;

#[async_trait]
impl Handler for RouteCreateHandler {
    async fn handle(
        &self,
        container: &ServiceContainer,
        request: &GatewayRequest,
        _params: Params,
        body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let service: config::Service = parse_json_body(request, body)?;
        validate(&service)?;

        if let Some(policy) = &service.rate_limit_policy {
            if container.policies.rate_limit_policy(policy).is_none() {
                return Err(GatewayError::Validation(format!(
                    "Unknown rate limit policy '{policy}'"
                )));
            }
        }
        if let Some(policy) = &service.auth_policy {
            if container.policies.auth_policy(policy).is_none() {
                return Err(GatewayError::Validation(format!(
                    "Unknown auth policy '{policy}'"
                )));
            }
        }

        let entry = container.registry.register(&service)?;
        log::info!("Service '{}' registered at {}", entry.service_id, entry.base_url);
        Ok(created(entry.as_ref()))
    }
}

struct RateLimitPolicyCreateHandler;

#[async_trait]
impl Handler for RateLimitPolicyCreateHandler {
    async fn handle(
        &self,
        container: &ServiceContainer,
        request: &GatewayRequest,
        _params: Params,
        body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let policy: RateLimitPolicy = parse_json_body(request, body)?;
        let policy = container.policies.put_rate_limit_policy(policy)?;
        Ok(created(policy.as_ref()))
    }
}

/// Auth policy as echoed back, without key material.
#[derive(Serialize)]
struct AuthPolicySummary<'a> {
    policy_id: &'a str,
    auth_type: AuthType,
    required_scopes: &'a [String],
    required_roles: &'a [String],
}

struct AuthPolicyCreateHandler;

#[async_trait]
impl Handler for AuthPolicyCreateHandler {
    async fn handle(
        &self,
        container: &ServiceContainer,
        request: &GatewayRequest,
        _params: Params,
        body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let policy: config::AuthPolicy = parse_json_body(request, body)?;
        let policy = container.auth.register_policy(policy)?;
        Ok(created(&AuthPolicySummary {
            policy_id: &policy.policy_id,
            auth_type: policy.auth_type,
            required_scopes: &policy.required_scopes,
            required_roles: &policy.required_roles,
        }))
    }
}

struct ApiKeyIssueHandler;

#[async_trait]
impl Handler for ApiKeyIssueHandler {
    async fn handle(
        &self,
        container: &ServiceContainer,
        request: &GatewayRequest,
        _params: Params,
        body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let issue: IssueApiKey = parse_json_body(request, body)?;
        let key = container.policies.issue_api_key(issue)?;
        log::info!("API key '{}' issued", key.key_id);
        // the only response that ever carries the secret
        Ok(created(key.as_ref()))
    }
}

#[derive(Serialize)]
struct ApiKeyView<'a> {
    key_id: &'a str,
    scopes: &'a [String],
    roles: &'a [String],
    status: ApiKeyStatus,
    expires_at: Option<f64>,
    usage_count: u64,
    last_used_at: Option<f64>,
}

struct ApiKeyGetHandler;

#[async_trait]
impl Handler for ApiKeyGetHandler {
    async fn handle(
        &self,
        container: &ServiceContainer,
        _request: &GatewayRequest,
        params: Params,
        _body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let key_id = param(&params, "key_id")?;
        let key = container
            .policies
            .api_key_by_id(key_id)
            .ok_or_else(|| GatewayError::Routing(format!("Unknown API key '{key_id}'")))?;
        let usage = container.auth.api_key_usage(key_id).await?;

        Ok(ResponseBuilder::success_json(&ApiKeyView {
            key_id: &key.key_id,
            scopes: &key.scopes,
            roles: &key.roles,
            status: key.status,
            expires_at: key.expires_at,
            usage_count: usage.usage_count,
            last_used_at: usage.last_used_at,
        }))
    }
}

struct ApiKeyRevokeHandler;

#[async_trait]
impl Handler for ApiKeyRevokeHandler {
    async fn handle(
        &self,
        container: &ServiceContainer,
        _request: &GatewayRequest,
        params: Params,
        _body: &[u8],
    ) -> GatewayResult<Response<Vec<u8>>> {
        let key = container.policies.revoke_api_key(param(&params, "key_id")?)?;
        Ok(ResponseBuilder::success_json(&serde_json::json!({
            "key_id": key.key_id,
            "status": key.status,
        })))
    }
}
