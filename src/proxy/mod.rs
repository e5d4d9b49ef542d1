//! Service registry and upstream forwarding
//!
//! Requests addressed as `/api/v1/{service_id}/{path}` are forwarded to
//! `base_url + "/api/v1/" + path`. Pingora performs the actual transfer; this
//! module resolves the registry entry, builds the peer and rewrites the
//! upstream request header.

pub mod discovery;
pub mod health_check;

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use http::{header, Uri};
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use pingora_http::RequestHeader;
use serde::Serialize;

use crate::{
    config::{self, Timeouts},
    core::{GatewayError, GatewayResult},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HealthStatus::Healthy,
            2 => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

/// A registered upstream service.
///
/// Everything but the health status is fixed once registered; replacing a
/// service swaps in a new entry.
#[derive(Debug, Serialize)]
pub struct ServiceEntry {
    pub service_id: String,
    pub base_url: String,
    pub endpoints: Vec<String>,
    pub rate_limit_policy: Option<String>,
    pub auth_policy: Option<String>,
    #[serde(skip)]
    pub tls: bool,
    #[serde(skip)]
    pub host: String,
    #[serde(skip)]
    pub port: u16,
    /// Value written to the upstream `Host` header
    #[serde(skip)]
    pub authority: String,
    /// Path of `base_url` without the trailing slash
    #[serde(skip)]
    pub base_path: String,
    #[serde(skip)]
    pub health_path: String,
    #[serde(skip)]
    pub timeouts: Timeouts,
    #[serde(rename = "health_status", serialize_with = "serialize_health")]
    health: AtomicU8,
}

fn serialize_health<S: serde::Serializer>(
    health: &AtomicU8,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    HealthStatus::from_u8(health.load(Ordering::Relaxed)).serialize(serializer)
}

impl ServiceEntry {
    pub fn new(service: &config::Service, default_timeouts: Timeouts) -> GatewayResult<Self> {
        let invalid = |reason: &str| {
            GatewayError::Validation(format!(
                "Service '{}' has an invalid base_url '{}': {reason}",
                service.id, service.base_url
            ))
        };

        let uri = service
            .base_url
            .parse::<Uri>()
            .map_err(|e| invalid(&e.to_string()))?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let authority = match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };

        Ok(Self {
            service_id: service.id.clone(),
            base_url: service.base_url.clone(),
            endpoints: service.endpoints.clone(),
            rate_limit_policy: service.rate_limit_policy.clone(),
            auth_policy: service.auth_policy.clone(),
            tls,
            host,
            port,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            health_path: service.health_path.clone(),
            timeouts: service.timeouts.unwrap_or(default_timeouts),
            health: AtomicU8::new(HealthStatus::Unknown.as_u8()),
        })
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_u8(self.health.load(Ordering::Relaxed))
    }

    pub fn set_health(&self, status: HealthStatus) {
        self.health.store(status.as_u8(), Ordering::Relaxed);
    }

    /// Upstream path and query for a proxied request.
    pub fn upstream_uri(&self, path: &str, query: Option<&str>) -> String {
        let mut uri = format!("{}/api/v1/{}", self.base_path, path);
        if let Some(query) = query {
            uri.push('?');
            uri.push_str(query);
        }
        uri
    }

    pub fn health_uri(&self) -> String {
        format!("{}{}", self.base_path, self.health_path)
    }

    /// Builds the peer for a resolved address, with this service's deadlines.
    pub fn peer(&self, addr: SocketAddr) -> HttpPeer {
        let sni = self.host.trim_start_matches('[').trim_end_matches(']');
        let mut peer = HttpPeer::new(addr, self.tls, sni.to_string());
        peer.options.connection_timeout = Some(Duration::from_secs(self.timeouts.connection_timeout));
        peer.options.read_timeout = Some(Duration::from_secs(self.timeouts.read_timeout));
        peer.options.write_timeout = Some(Duration::from_secs(self.timeouts.read_timeout));
        peer
    }
}

/// Read-mostly map of service id to entry, replaced copy-on-write.
pub struct ServiceRegistry {
    entries: ArcSwap<BTreeMap<String, Arc<ServiceEntry>>>,
    default_timeouts: Timeouts,
}

impl ServiceRegistry {
    pub fn new(default_timeouts: Timeouts) -> Self {
        Self {
            entries: ArcSwap::from_pointee(BTreeMap::new()),
            default_timeouts,
        }
    }

    pub fn from_config(config: &config::Config) -> GatewayResult<Self> {
        let registry = Self::new(config.gateway.timeouts);
        for service in &config.services {
            log::info!("Configuring Service: {}", service.id);
            registry.register(service)?;
        }
        Ok(registry)
    }

    /// Adds a service or replaces the entry with the same id.
    pub fn register(&self, service: &config::Service) -> GatewayResult<Arc<ServiceEntry>> {
        let entry = Arc::new(ServiceEntry::new(service, self.default_timeouts)?);
        self.entries.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(entry.service_id.clone(), entry.clone());
            next
        });
        Ok(entry)
    }

    pub fn resolve(&self, service_id: &str) -> GatewayResult<Arc<ServiceEntry>> {
        self.get(service_id)
            .ok_or_else(|| GatewayError::Routing(format!("Unknown service '{service_id}'")))
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<ServiceEntry>> {
        self.entries.load().get(service_id).cloned()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.entries.load().contains_key(service_id)
    }

    /// Entries ordered by service id.
    pub fn list(&self) -> Vec<Arc<ServiceEntry>> {
        self.entries.load().values().cloned().collect()
    }
}

/// Rewrites the downstream request header for the upstream.
///
/// `Host` and `Connection` are dropped and `Host` is set to the upstream
/// authority; every other header passes through.
pub fn prepare_upstream_request(
    upstream_request: &mut RequestHeader,
    entry: &ServiceEntry,
    path: &str,
    query: Option<&str>,
) -> Result<()> {
    let uri = entry.upstream_uri(path, query);
    let uri = uri
        .parse::<Uri>()
        .or_err_with(InternalError, || format!("Invalid upstream uri {uri}"))?;
    upstream_request.set_uri(uri);

    upstream_request.remove_header(&header::HOST);
    upstream_request.remove_header(&header::CONNECTION);
    upstream_request.insert_header(header::HOST, entry.authority.as_str())?;
    Ok(())
}

/// Maps a transport failure to the caller-facing error.
pub fn map_upstream_error(service_id: &str, e: &Error) -> GatewayError {
    match e.etype() {
        ConnectTimedout | ReadTimedout | WriteTimedout | TLSHandshakeTimedout
        | HTTPStatus(504) => {
            GatewayError::Timeout(format!("Upstream service '{service_id}' timed out"))
        }
        _ => GatewayError::Upstream(format!("Upstream service '{service_id}' is unavailable")),
    }
}
