use std::net::{IpAddr, SocketAddr};

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use once_cell::sync::OnceCell;

use crate::core::{GatewayError, GatewayResult};

static GLOBAL_RESOLVER: OnceCell<TokioAsyncResolver> = OnceCell::new();

fn get_global_resolver() -> &'static TokioAsyncResolver {
    GLOBAL_RESOLVER.get_or_init(|| {
        TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            log::warn!("Unable to read system resolver conf, using defaults: {e}");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        })
    })
}

/// Parses a literal IPv4 or IPv6 host, with or without brackets.
fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}

/// Resolves an upstream host to a socket address.
///
/// Literal IPs are returned as-is; names go through the async resolver and
/// the first address wins.
pub async fn resolve(host: &str, port: u16) -> GatewayResult<SocketAddr> {
    if let Some(ip) = parse_ip_literal(host) {
        return Ok(SocketAddr::new(ip, port));
    }

    log::debug!("Resolving DNS for domain: {host}");
    let lookup = get_global_resolver().lookup_ip(host).await.map_err(|e| {
        log::warn!("DNS resolution for '{host}' failed: {e}");
        GatewayError::Upstream(format!("Unable to resolve upstream host '{host}'"))
    })?;

    lookup
        .iter()
        .next()
        .map(|ip| SocketAddr::new(ip, port))
        .ok_or_else(|| GatewayError::Upstream(format!("No address found for '{host}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_literal() {
        let test_cases = [
            ("127.0.0.1", Some("127.0.0.1")),
            ("[::1]", Some("::1")),
            ("::1", Some("::1")),
            ("[2001:db8:85a3::8a2e:370:7334]", Some("2001:db8:85a3::8a2e:370:7334")),
            ("example.com", None),
            ("", None),
        ];

        for (input, expected) in test_cases {
            let expected = expected.map(|ip| ip.parse::<IpAddr>().unwrap());
            assert_eq!(expected, parse_ip_literal(input), "{input}");
        }
    }

    #[tokio::test]
    async fn test_resolve_literal_skips_dns() {
        assert_eq!(
            "10.0.0.7:8080".parse::<SocketAddr>().unwrap(),
            resolve("10.0.0.7", 8080).await.unwrap()
        );
        assert_eq!(
            "[::1]:443".parse::<SocketAddr>().unwrap(),
            resolve("[::1]", 443).await.unwrap()
        );
    }
}
