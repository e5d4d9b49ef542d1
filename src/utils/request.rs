use std::net::IpAddr;

use http::{header, HeaderMap, HeaderName};
use once_cell::sync::Lazy;
use pingora_proxy::Session;

/// Extracts the value of a specific query parameter from a raw query string.
///
/// Returns the first occurrence of the parameter's value.
pub fn get_query_value<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query.and_then(|query| {
        query.split('&').find_map(|pair| match pair.split_once('=') {
            Some((k, v)) if k == name => Some(v.trim()),
            None if pair == name => Some(""),
            _ => None,
        })
    })
}

/// Retrieves the value of a specific header.
///
/// Returns `None` if the header is not present or its value is not valid UTF-8.
pub fn get_header_value<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|value| value.to_str().ok())
}

/// Token of an `Authorization: Bearer <token>` header.
pub fn get_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = get_header_value(headers, header::AUTHORIZATION.as_str())?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}

static HTTP_HEADER_X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

static HTTP_HEADER_X_REAL_IP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-real-ip"));

/// Gets the client's apparent IP address.
///
/// Forwarding headers are only believed when the connection itself comes
/// from a trusted proxy; otherwise anyone could pick their own address.
/// For a trusted peer the order of precedence is:
/// 1. `X-Forwarded-For`, walked right to left, first hop that is not itself
///    a trusted proxy
/// 2. `X-Real-IP`
/// 3. The peer address of the connection
///
/// Returns an empty string if no IP address can be determined.
pub fn get_client_ip<F>(headers: &HeaderMap, peer: Option<IpAddr>, is_trusted: F) -> String
where
    F: Fn(IpAddr) -> bool,
{
    let Some(peer) = peer else {
        log::debug!("Could not determine client IP address");
        return String::new();
    };
    if !is_trusted(peer) {
        return peer.to_string();
    }

    if let Some(forwarded) = headers
        .get(&*HTTP_HEADER_X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        let mut client = peer;
        for hop in forwarded.rsplit(',') {
            match hop.trim().parse::<IpAddr>() {
                Ok(ip) if is_trusted(ip) => client = ip,
                Ok(ip) => return ip.to_string(),
                // a malformed hop ends the chain we can vouch for
                Err(_) => break,
            }
        }
        return client.to_string();
    }

    if let Some(real_ip) = headers
        .get(&*HTTP_HEADER_X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return real_ip.to_string();
    }

    peer.to_string()
}

/// IP part of the downstream connection address.
pub fn get_peer_ip(session: &Session) -> Option<IpAddr> {
    session
        .client_addr()
        .and_then(|addr| addr.as_inet())
        .map(|addr| addr.ip())
}
