use http::{header, HeaderMap, Uri};

use super::http1::ProxyRequest;

// RFC 7230 Section 6.1: hop-by-hop headers must not be forwarded by proxies.
// Proxy-Connection is non-standard but widely sent by clients.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Drop connection-management headers from a header map, by name. Applied to
/// inbound requests before forwarding and to outbound responses before they
/// are written back.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Normalize a request for proxying: an explicit `Host` header wins over the
/// host parsed out of the target, and a redundant default port is dropped so
/// downstream comparisons see a canonical authority.
pub fn normalize_request(request: &mut ProxyRequest) {
    if let Some(host) = request
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
    {
        if !host.is_empty() {
            request.host = host.to_string();
        }
    }

    strip_default_port(request);
}

fn strip_default_port(request: &mut ProxyRequest) {
    let (Some(scheme), Some(port)) = (request.target.scheme_str(), request.target.port_u16())
    else {
        return;
    };
    let default = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return,
    };
    if port != default {
        return;
    }

    let scheme = scheme.to_string();
    if let Some(host) = request.target.host() {
        // Uri::host strips IPv6 brackets; put them back for the authority.
        let authority = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let path_and_query = request
            .target
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        if let Ok(target) = Uri::builder()
            .scheme(scheme.as_str())
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
        {
            request.target = target;
        }
    }

    if let Some(stripped) = request.host.strip_suffix(&format!(":{default}")) {
        request.host = stripped.to_string();
    }
}
