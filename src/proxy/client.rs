use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderValue, Version};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::debug;

use super::http1::{ProxyRequest, ProxyResponse};
use super::sanitize;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("failed to read the upstream response body: {0}")]
    Body(#[from] hyper::Error),
    #[error("host value cannot be sent as a header")]
    Host,
}

/// HTTP client owned by one accepted connection. The peer address is kept
/// for log correlation only; it plays no part in routing.
pub struct OutboundClient {
    peer: SocketAddr,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl OutboundClient {
    pub fn new(peer: SocketAddr) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build_http();
        Self { peer, client }
    }

    /// Issue the sanitized request to its destination and buffer the reply.
    /// Pooled connections are released when this client is dropped.
    pub async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, ForwardError> {
        let ProxyRequest {
            method,
            target,
            headers,
            body,
            host,
            ..
        } = request;

        let mut outbound = http::Request::new(Full::new(body));
        *outbound.method_mut() = method;
        *outbound.uri_mut() = target;
        *outbound.version_mut() = Version::HTTP_11;
        *outbound.headers_mut() = headers;
        let host = HeaderValue::from_str(&host).map_err(|_| ForwardError::Host)?;
        outbound.headers_mut().insert(header::HOST, host);

        let response = self.client.request(outbound).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        debug!(peer = %self.peer, status = %parts.status, "forwarded request upstream");

        let mut headers = parts.headers;
        headers.remove(header::CONTENT_LENGTH);
        // Upstream connection-management headers end at this hop.
        sanitize::remove_hop_by_hop_headers(&mut headers);

        Ok(ProxyResponse {
            status: parts.status,
            reason: None,
            version: Version::HTTP_11,
            headers,
            body: Some(body),
            close: false,
        })
    }
}
