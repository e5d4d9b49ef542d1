use std::fs;
use std::net::{IpAddr, SocketAddr};

use http::Uri;
use ipnetwork::IpNetwork;
use jsonwebtoken::Algorithm;
use log::{debug, info, trace};
use once_cell::sync::Lazy;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Prefix of every environment variable the gateway reads.
pub const ENV_PREFIX: &str = "GATEWAY_";

/// Id of the policy synthesized from `gateway.rate_limit`.
pub const DEFAULT_RATE_LIMIT_POLICY: &str = "default";

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_references"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    pub gateway: Gateway,

    #[validate(nested)]
    #[serde(default)]
    pub services: Vec<Service>,
    #[validate(nested)]
    #[serde(default)]
    pub rate_limit_policies: Vec<RateLimitPolicy>,
    #[validate(nested)]
    #[serde(default)]
    pub auth_policies: Vec<AuthPolicy>,
    #[validate(nested)]
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
}

// Config file load and validation
impl Config {
    fn read_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::parse_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::read_yaml(path)?;
            conf.merge_with_opt(opt);
            conf.apply_env_overrides(std::env::vars())?;
            conf.validate()
                .or_err_with(FileReadError, || "Conf file valid failed")?;
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        let conf = Self::parse_yaml(conf_str)?;

        // use validator to validate conf file
        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    fn parse_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");
        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    /// Applies `GATEWAY_*` overrides on top of the file contents.
    ///
    /// Variables without the prefix are ignored, so the full process
    /// environment can be passed in.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match key {
                "JWT_SECRET_KEY" => self.gateway.jwt.secret_key = Some(value),
                "JWT_ALGORITHM" => {
                    self.gateway.jwt.algorithm = value
                        .parse::<Algorithm>()
                        .or_err_with(ReadError, || format!("Invalid {name}: {value}"))?
                }
                "RATE_LIMIT_REQUESTS_PER_MINUTE" => {
                    self.gateway.rate_limit.requests_per_minute = parse_env(&name, &value)?
                }
                "RATE_LIMIT_BURST_SIZE" => {
                    self.gateway.rate_limit.burst_size = Some(parse_env(&name, &value)?)
                }
                "CONNECTION_TIMEOUT" => {
                    self.gateway.timeouts.connection_timeout = parse_env(&name, &value)?
                }
                "READ_TIMEOUT" => self.gateway.timeouts.read_timeout = parse_env(&name, &value)?,
                "MAX_RETRIES" => self.gateway.max_retries = parse_env(&name, &value)?,
                "STORE_URL" => self.gateway.store_url = Some(value),
                "ADMIN_API_KEY" => self.gateway.admin = Some(Admin { api_key: value }),
                "CORS_ORIGINS" => {
                    self.gateway.cors_origins = value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(String::from)
                        .collect()
                }
                _ => {
                    if let Some(service) = key.strip_suffix("_SERVICE_URL") {
                        self.override_service_url(service, value);
                    }
                }
            }
        }

        Ok(())
    }

    fn override_service_url(&mut self, env_name: &str, base_url: String) {
        let wanted = env_name.to_ascii_lowercase();
        let existing = self
            .services
            .iter_mut()
            .find(|s| s.id.to_ascii_lowercase().replace('-', "_") == wanted);

        match existing {
            Some(service) => {
                info!("Service '{}' base_url overridden from environment", service.id);
                service.base_url = base_url;
            }
            None => {
                info!("Service '{wanted}' registered from environment");
                self.services.push(Service {
                    id: wanted,
                    base_url,
                    endpoints: Vec::new(),
                    health_path: Service::default_health_path(),
                    rate_limit_policy: None,
                    auth_policy: None,
                    timeouts: None,
                });
            }
        }
    }

    /// Every rate-limit policy in effect, including the synthesized default.
    pub fn effective_rate_limit_policies(&self) -> Vec<RateLimitPolicy> {
        let mut policies = self.rate_limit_policies.clone();
        if self.gateway.rate_limit.enabled
            && !policies
                .iter()
                .any(|p| p.policy_id == DEFAULT_RATE_LIMIT_POLICY)
        {
            policies.push(self.gateway.rate_limit.to_policy());
        }
        policies
    }

    fn validate_references(&self) -> Result<(), ValidationError> {
        let rate_ids: Vec<&str> = self
            .rate_limit_policies
            .iter()
            .map(|p| p.policy_id.as_str())
            .chain(
                self.gateway
                    .rate_limit
                    .enabled
                    .then_some(DEFAULT_RATE_LIMIT_POLICY),
            )
            .collect();
        let auth_ids: Vec<&str> = self
            .auth_policies
            .iter()
            .map(|p| p.policy_id.as_str())
            .collect();

        let mut service_ids = Vec::with_capacity(self.services.len());
        for service in &self.services {
            if service_ids.contains(&service.id.as_str()) {
                return Err(ValidationError::new("duplicate_service_id"));
            }
            service_ids.push(service.id.as_str());

            if let Some(policy) = &service.rate_limit_policy {
                if !rate_ids.contains(&policy.as_str()) {
                    return Err(unknown_policy("unknown_rate_limit_policy", policy));
                }
            }
            if let Some(policy) = &service.auth_policy {
                if !auth_ids.contains(&policy.as_str()) {
                    return Err(unknown_policy("unknown_auth_policy", policy));
                }
            }
        }

        if let Some(policy) = &self.gateway.default_rate_limit_policy {
            if !rate_ids.contains(&policy.as_str()) {
                return Err(unknown_policy("unknown_rate_limit_policy", policy));
            }
        }
        if let Some(policy) = &self.gateway.default_auth_policy {
            if !auth_ids.contains(&policy.as_str()) {
                return Err(unknown_policy("unknown_auth_policy", policy));
            }
        }

        if let Some(url) = &self.gateway.store_url {
            if !url.starts_with("memory://") {
                let mut err = ValidationError::new("unsupported_store_url");
                err.add_param("url".into(), url);
                return Err(err);
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| Error::explain(ReadError, format!("Invalid {name}: {value}")))
}

fn unknown_policy(code: &'static str, policy: &str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.add_param("policy".into(), &policy);
    err
}

fn validate_id(id: &str) -> Result<(), ValidationError> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        let mut err = ValidationError::new("invalid_id");
        err.add_param("id".into(), &id);
        Err(err)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Gateway {
    #[serde(default = "Gateway::default_version")]
    pub version: String,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[serde(default)]
    #[validate(nested)]
    pub timeouts: Timeouts,
    /// Reserved, no retry layer consumes it.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    pub store_url: Option<String>,

    #[serde(default)]
    pub jwt: JwtDefaults,
    #[serde(default)]
    #[validate(nested)]
    pub rate_limit: RateLimitDefaults,
    pub default_rate_limit_policy: Option<String>,
    pub default_auth_policy: Option<String>,

    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreaker,
    #[serde(default)]
    #[validate(nested)]
    pub health_check: HealthCheck,
    #[serde(default = "Gateway::default_exempt_paths")]
    pub exempt_paths: Vec<String>,
    /// Peers whose `X-Forwarded-For`/`X-Real-IP` headers are believed.
    #[serde(default)]
    pub trusted_proxies: Vec<IpNetwork>,

    #[validate(nested)]
    pub admin: Option<Admin>,
    pub log: Option<Log>,
    pub prometheus: Option<Prometheus>,
    pub sentry: Option<Sentry>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            version: Self::default_version(),
            listeners: Vec::new(),
            timeouts: Timeouts::default(),
            max_retries: 0,
            cors_origins: Vec::new(),
            store_url: None,
            jwt: JwtDefaults::default(),
            rate_limit: RateLimitDefaults::default(),
            default_rate_limit_policy: None,
            default_auth_policy: None,
            circuit_breaker: CircuitBreaker::default(),
            health_check: HealthCheck::default(),
            exempt_paths: Self::default_exempt_paths(),
            trusted_proxies: Vec::new(),
            admin: None,
            log: None,
            prometheus: None,
            sentry: None,
        }
    }
}

impl Gateway {
    fn default_version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn default_exempt_paths() -> Vec<String> {
        vec![
            "/health".to_string(),
            "/docs".to_string(),
            "/openapi.json".to_string(),
        ]
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| p == path)
    }

    pub fn is_trusted_proxy(&self, addr: IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(addr))
    }

    /// Rate-limit policy applied when the target service names none.
    pub fn fallback_rate_limit_policy(&self) -> Option<&str> {
        self.default_rate_limit_policy
            .as_deref()
            .or(self.rate_limit.enabled.then_some(DEFAULT_RATE_LIMIT_POLICY))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
    #[serde(default)]
    pub offer_h2c: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

/// Upstream call deadlines, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct Timeouts {
    #[serde(default = "Timeouts::default_connection_timeout")]
    #[validate(range(min = 1))]
    pub connection_timeout: u64,
    #[serde(default = "Timeouts::default_read_timeout")]
    #[validate(range(min = 1))]
    pub read_timeout: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Self::default_connection_timeout(),
            read_timeout: Self::default_read_timeout(),
        }
    }
}

impl Timeouts {
    fn default_connection_timeout() -> u64 {
        5
    }

    fn default_read_timeout() -> u64 {
        30
    }
}

/// Fallbacks for JWT policies that carry no key material of their own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JwtDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default = "JwtDefaults::default_algorithm")]
    pub algorithm: Algorithm,
}

impl Default for JwtDefaults {
    fn default() -> Self {
        Self {
            secret_key: None,
            algorithm: Self::default_algorithm(),
        }
    }
}

impl JwtDefaults {
    fn default_algorithm() -> Algorithm {
        Algorithm::HS256
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct RateLimitDefaults {
    #[serde(default = "RateLimitDefaults::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    #[serde(default = "RateLimitDefaults::default_requests_per_minute")]
    #[validate(range(min = 1))]
    pub requests_per_minute: u32,
    #[validate(range(min = 1))]
    pub burst_size: Option<u32>,
    #[serde(default = "RateLimitPolicy::default_window_size_seconds")]
    #[validate(range(min = 1))]
    pub window_size_seconds: u64,
    #[serde(default)]
    pub scope: RateLimitScope,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            algorithm: RateLimitAlgorithm::default(),
            requests_per_minute: Self::default_requests_per_minute(),
            burst_size: None,
            window_size_seconds: RateLimitPolicy::default_window_size_seconds(),
            scope: RateLimitScope::default(),
        }
    }
}

impl RateLimitDefaults {
    fn default_enabled() -> bool {
        true
    }

    fn default_requests_per_minute() -> u32 {
        100
    }

    pub fn to_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            policy_id: DEFAULT_RATE_LIMIT_POLICY.to_string(),
            algorithm: self.algorithm,
            requests_per_minute: self.requests_per_minute,
            burst_size: self.burst_size,
            window_size_seconds: self.window_size_seconds,
            refill_rate: None,
            scope: self.scope,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Validate)]
pub struct CircuitBreaker {
    #[serde(default = "CircuitBreaker::default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    #[serde(default = "CircuitBreaker::default_failure_window_seconds")]
    #[validate(range(min = 1))]
    pub failure_window_seconds: u64,
    #[serde(default = "CircuitBreaker::default_cooldown_seconds")]
    #[validate(range(min = 1))]
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            failure_threshold: Self::default_failure_threshold(),
            failure_window_seconds: Self::default_failure_window_seconds(),
            cooldown_seconds: Self::default_cooldown_seconds(),
        }
    }
}

impl CircuitBreaker {
    fn default_failure_threshold() -> u32 {
        5
    }

    fn default_failure_window_seconds() -> u64 {
        60
    }

    fn default_cooldown_seconds() -> u64 {
        30
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Validate)]
pub struct HealthCheck {
    #[serde(default = "HealthCheck::default_interval")]
    #[validate(range(min = 1))]
    pub interval: u64,
    #[serde(default = "HealthCheck::default_timeout")]
    #[validate(range(min = 1))]
    pub timeout: u64,
    #[serde(default = "HealthCheck::default_threshold")]
    #[validate(range(min = 1))]
    pub healthy_successes: u32,
    #[serde(default = "HealthCheck::default_threshold")]
    #[validate(range(min = 1))]
    pub unhealthy_failures: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
            timeout: Self::default_timeout(),
            healthy_successes: Self::default_threshold(),
            unhealthy_failures: Self::default_threshold(),
        }
    }
}

impl HealthCheck {
    fn default_interval() -> u64 {
        10
    }

    fn default_timeout() -> u64 {
        1
    }

    fn default_threshold() -> u32 {
        1
    }
}

/// Credential guarding the administrative endpoints.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Admin {
    #[validate(length(min = 16))]
    #[serde(skip_serializing)]
    pub api_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sentry {
    pub dsn: String,
}

/// A logical upstream service addressed as `/api/v1/{id}/...`.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Service {
    #[validate(custom(function = "validate_id"))]
    pub id: String,
    #[validate(custom(function = "Service::validate_base_url"))]
    pub base_url: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "Service::default_health_path")]
    pub health_path: String,
    pub rate_limit_policy: Option<String>,
    pub auth_policy: Option<String>,
    #[validate(nested)]
    pub timeouts: Option<Timeouts>,
}

impl Service {
    fn default_health_path() -> String {
        "/health".to_string()
    }

    fn validate_base_url(base_url: &str) -> Result<(), ValidationError> {
        let uri = base_url
            .parse::<Uri>()
            .map_err(|_| ValidationError::new("invalid_base_url"))?;

        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Err(ValidationError::new("unsupported_base_url_scheme")),
        }

        if uri.host().map_or(true, str::is_empty) {
            return Err(ValidationError::new("base_url_host_required"));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    PerUser,
    PerApi,
    #[default]
    PerIp,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "RateLimitPolicy::validate_refill_rate"))]
pub struct RateLimitPolicy {
    #[validate(custom(function = "validate_id"))]
    pub policy_id: String,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    #[validate(range(min = 1))]
    pub requests_per_minute: u32,
    /// Bucket capacity, defaults to `requests_per_minute`.
    #[validate(range(min = 1))]
    pub burst_size: Option<u32>,
    #[serde(default = "RateLimitPolicy::default_window_size_seconds")]
    #[validate(range(min = 1))]
    pub window_size_seconds: u64,
    /// Tokens per second, defaults to `requests_per_minute / 60`.
    pub refill_rate: Option<f64>,
    #[serde(default)]
    pub scope: RateLimitScope,
}

impl RateLimitPolicy {
    fn default_window_size_seconds() -> u64 {
        60
    }

    fn validate_refill_rate(&self) -> Result<(), ValidationError> {
        match self.refill_rate {
            Some(rate) if !(rate.is_finite() && rate > 0.0) => {
                Err(ValidationError::new("refill_rate_must_be_positive"))
            }
            _ => Ok(()),
        }
    }

    pub fn burst(&self) -> u32 {
        self.burst_size.unwrap_or(self.requests_per_minute)
    }

    pub fn tokens_per_second(&self) -> f64 {
        self.refill_rate
            .unwrap_or(self.requests_per_minute as f64 / 60.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Jwt,
    ApiKey,
    Oauth2,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Jwt => "jwt",
            AuthType::ApiKey => "api_key",
            AuthType::Oauth2 => "oauth2",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct AuthPolicy {
    #[validate(custom(function = "validate_id"))]
    pub policy_id: String,
    pub auth_type: AuthType,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub required_roles: Vec<String>,

    /// HMAC secret; falls back to `gateway.jwt.secret_key`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret_key: Option<String>,
    #[serde(default)]
    pub base64_secret: bool,
    /// PEM public key for RSA/ECDSA algorithms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_public_key: Option<String>,
    pub jwt_algorithm: Option<Algorithm>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    #[serde(default)]
    pub jwt_leeway_seconds: u64,

    #[serde(default = "AuthPolicy::default_api_key_header")]
    #[validate(length(min = 1))]
    pub api_key_header: String,
    pub api_key_query_param: Option<String>,

    pub oauth2_client_id: Option<String>,
    pub oauth2_authorization_url: Option<String>,
    pub oauth2_token_url: Option<String>,
}

impl AuthPolicy {
    fn default_api_key_header() -> String {
        "X-API-Key".to_string()
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    #[default]
    Active,
    Revoked,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ApiKey {
    #[validate(custom(function = "validate_id"))]
    pub key_id: String,
    #[validate(length(min = 16))]
    pub api_key: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub status: ApiKeyStatus,
    /// Unix timestamp in seconds.
    pub expires_at: Option<f64>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    const BASE_CONF: &str = r#"
---
pingora:
  version: 1
  client_bind_to_ipv4:
      - 1.2.3.4
      - 5.6.7.8
  client_bind_to_ipv6: []

gateway:
  version: "2.1.0"
  listeners:
    - address: 0.0.0.0:8080
    - address: "[::1]:8443"
      tls:
        cert_path: /etc/ssl/server.crt
        key_path: /etc/ssl/server.key
      offer_h2: true
  timeouts:
    connection_timeout: 2
    read_timeout: 10
  default_auth_policy: jwt-default
  circuit_breaker:
    failure_threshold: 3

services:
  - id: users
    base_url: http://127.0.0.1:8001
    endpoints: [/users]
    rate_limit_policy: strict
  - id: order-items
    base_url: https://orders.internal
    auth_policy: keys

rate_limit_policies:
  - policy_id: strict
    algorithm: sliding_window
    requests_per_minute: 3
    scope: per_user

auth_policies:
  - policy_id: jwt-default
    auth_type: jwt
    jwt_secret_key: secret
    required_scopes: [read]
  - policy_id: keys
    auth_type: api_key

api_keys:
  - key_id: ci
    api_key: pgk_0123456789abcdef
    scopes: [read]
"#;

    #[test]
    fn test_load_file() {
        init_log();
        let conf = Config::from_yaml(BASE_CONF).unwrap();
        assert_eq!(2, conf.pingora.client_bind_to_ipv4.len());
        assert_eq!(1, conf.pingora.version);
        assert_eq!("2.1.0", conf.gateway.version);
        assert_eq!(2, conf.gateway.listeners.len());
        assert_eq!(2, conf.services.len());
        assert_eq!("/health", conf.services[0].health_path);
        assert_eq!(3, conf.gateway.circuit_breaker.failure_threshold);
        assert_eq!(30, conf.gateway.circuit_breaker.cooldown_seconds);
        assert_eq!(10, conf.gateway.timeouts.read_timeout);
        assert!(conf.gateway.is_exempt("/health"));
        assert!(!conf.gateway.is_exempt("/api/v1/services"));

        let policy = &conf.rate_limit_policies[0];
        assert_eq!(RateLimitAlgorithm::SlidingWindow, policy.algorithm);
        assert_eq!(RateLimitScope::PerUser, policy.scope);
        assert_eq!(60, policy.window_size_seconds);
        assert_eq!(3, policy.burst());
        assert_eq!("X-API-Key", conf.auth_policies[1].api_key_header);
    }

    #[test]
    fn test_default_rate_limit_policy_synthesized() {
        init_log();
        let conf = Config::from_yaml(BASE_CONF).unwrap();
        let policies = conf.effective_rate_limit_policies();
        assert_eq!(2, policies.len());
        let default = policies
            .iter()
            .find(|p| p.policy_id == DEFAULT_RATE_LIMIT_POLICY)
            .unwrap();
        assert_eq!(100, default.requests_per_minute);
        assert_eq!(Some(DEFAULT_RATE_LIMIT_POLICY), conf.gateway.fallback_rate_limit_policy());
    }

    #[test]
    fn test_env_overrides() {
        init_log();
        let mut conf = Config::from_yaml(BASE_CONF).unwrap();
        conf.apply_env_overrides(vec![
            ("GATEWAY_JWT_SECRET_KEY".to_string(), "from-env".to_string()),
            ("GATEWAY_JWT_ALGORITHM".to_string(), "HS512".to_string()),
            ("GATEWAY_READ_TIMEOUT".to_string(), "7".to_string()),
            ("GATEWAY_RATE_LIMIT_BURST_SIZE".to_string(), "9".to_string()),
            (
                "GATEWAY_CORS_ORIGINS".to_string(),
                "https://a.example, https://b.example".to_string(),
            ),
            (
                "GATEWAY_ORDER_ITEMS_SERVICE_URL".to_string(),
                "http://10.0.0.9:9000".to_string(),
            ),
            (
                "GATEWAY_BILLING_SERVICE_URL".to_string(),
                "http://10.0.0.10:9000".to_string(),
            ),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ])
        .unwrap();

        assert_eq!(Some("from-env"), conf.gateway.jwt.secret_key.as_deref());
        assert_eq!(Algorithm::HS512, conf.gateway.jwt.algorithm);
        assert_eq!(7, conf.gateway.timeouts.read_timeout);
        assert_eq!(Some(9), conf.gateway.rate_limit.burst_size);
        assert_eq!(2, conf.gateway.cors_origins.len());
        assert_eq!("http://10.0.0.9:9000", conf.services[1].base_url);
        assert_eq!(3, conf.services.len());
        assert_eq!("billing", conf.services[2].id);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        init_log();
        let mut conf = Config::from_yaml(BASE_CONF).unwrap();
        let result = conf.apply_env_overrides(vec![(
            "GATEWAY_CONNECTION_TIMEOUT".to_string(),
            "soon".to_string(),
        )]);
        assert!(result.is_err());
    }

    #[test]
    fn test_valid_listeners_length() {
        init_log();
        let conf_str = r#"
---
gateway:
  listeners: []
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_listeners_tls_for_offer_h2() {
        init_log();
        let conf_str = r#"
---
gateway:
  listeners:
    - address: "[::1]:8080"
      offer_h2: true
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_unknown_policy_reference() {
        init_log();
        let conf_str = r#"
---
gateway:
  listeners:
    - address: "[::1]:8080"

services:
  - id: users
    base_url: http://127.0.0.1:8001
    auth_policy: missing
        "#;
        let conf = Config::from_yaml(conf_str);
        match conf {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => eprintln!("Error: {:?}", e),
        }
    }

    #[test]
    fn test_valid_base_url_scheme() {
        init_log();
        let conf_str = r#"
---
gateway:
  listeners:
    - address: "[::1]:8080"

services:
  - id: users
    base_url: ftp://127.0.0.1:8001
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_store_url() {
        init_log();
        let conf_str = r#"
---
gateway:
  listeners:
    - address: "[::1]:8080"
  store_url: redis://127.0.0.1:6379
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        let conf_str = r#"
---
gateway:
  listeners:
    - address: "[::1]:8080"
  store_url: memory://
        "#;
        assert!(Config::from_yaml(conf_str).is_ok());
    }

    #[test]
    fn test_valid_refill_rate() {
        init_log();
        let conf_str = r#"
---
gateway:
  listeners:
    - address: "[::1]:8080"

rate_limit_policies:
  - policy_id: broken
    requests_per_minute: 10
    refill_rate: -1.0
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_duplicate_service() {
        init_log();
        let conf_str = r#"
---
gateway:
  listeners:
    - address: "[::1]:8080"

services:
  - id: users
    base_url: http://127.0.0.1:8001
  - id: users
    base_url: http://127.0.0.1:8002
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_admin_and_trusted_proxies() {
        init_log();
        let conf_str = r#"
---
gateway:
  listeners:
    - address: "[::1]:8080"
  trusted_proxies: [10.0.0.0/8, "::1/128"]
  admin:
    api_key: 0123456789abcdef0123
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert!(conf.gateway.is_trusted_proxy("10.1.2.3".parse().unwrap()));
        assert!(conf.gateway.is_trusted_proxy("::1".parse().unwrap()));
        assert!(!conf.gateway.is_trusted_proxy("192.168.0.1".parse().unwrap()));
        assert_eq!(
            "0123456789abcdef0123",
            conf.gateway.admin.as_ref().unwrap().api_key
        );
    }

    #[test]
    fn test_valid_admin_key_length() {
        init_log();
        let conf_str = r#"
---
gateway:
  listeners:
    - address: "[::1]:8080"
  admin:
    api_key: short
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_env_admin_key() {
        init_log();
        let mut conf = Config::from_yaml(BASE_CONF).unwrap();
        assert!(conf.gateway.admin.is_none());
        conf.apply_env_overrides(vec![(
            "GATEWAY_ADMIN_API_KEY".to_string(),
            "admin-key-from-environment".to_string(),
        )])
        .unwrap();
        assert_eq!(
            "admin-key-from-environment",
            conf.gateway.admin.as_ref().unwrap().api_key
        );
    }
}
