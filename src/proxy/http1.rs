use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::stream::BufferedConn;

const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed during I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before a full request was read")]
    UnexpectedEof,
    #[error("request head too large")]
    HeadTooLarge,
    #[error("malformed request: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("incomplete request head")]
    Incomplete,
    #[error("invalid request line")]
    RequestLine,
    #[error("invalid header")]
    Header,
    #[error("invalid request target: {0}")]
    Target(#[from] http::uri::InvalidUri),
    #[error("invalid Content-Length header")]
    ContentLength,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("request bodies with Transfer-Encoding are not supported")]
    TransferEncoding,
}

/// One request cycle's parsed message. Mutated in place by the sanitizer
/// before being forwarded; never reused across cycles.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub target: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Effective host the request is for, `host[:port]`. Seeded from the
    /// target authority; an explicit `Host` header overrides it.
    pub host: String,
    pub remote_addr: Option<SocketAddr>,
}

/// Response written back to the client, either synthesized locally or
/// obtained from the outbound client.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    /// Status text override; the canonical reason phrase otherwise.
    pub reason: Option<&'static str>,
    pub version: Version,
    pub headers: HeaderMap,
    /// `None` means no body and no framing headers at all (a CONNECT
    /// confirmation); an empty buffer still writes `Content-Length: 0`.
    pub body: Option<Bytes>,
    pub close: bool,
}

impl ProxyResponse {
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Some(Bytes::new()),
            close: false,
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse one HTTP/1.x request off the connection. Bytes beyond the head and
/// declared body stay buffered for the next cycle (or the tunnel relay).
pub async fn read_request<S>(conn: &mut BufferedConn<S>) -> Result<ProxyRequest, ParseError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if find_head_end(conn.buffered()).is_some() {
            break;
        }
        if conn.buffered().len() >= MAX_HEAD_BYTES {
            return Err(ParseError::HeadTooLarge);
        }
        if conn.fill().await? == 0 {
            return Err(ParseError::UnexpectedEof);
        }
    }

    let (method, target, version, headers, head_len) = {
        let buf = conn.buffered();
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut storage);
        let head_len = match parsed.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Err(ParseError::Incomplete),
        };

        let method = Method::from_bytes(parsed.method.ok_or(ParseError::RequestLine)?.as_bytes())
            .map_err(|_| ParseError::RequestLine)?;
        let target: Uri = parsed.path.ok_or(ParseError::RequestLine)?.parse()?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| ParseError::Header)?;
            let value = HeaderValue::from_bytes(h.value).map_err(|_| ParseError::Header)?;
            headers.append(name, value);
        }

        (method, target, version, headers, head_len)
    };
    conn.consume(head_len);

    if headers.contains_key(header::TRANSFER_ENCODING) {
        return Err(ParseError::TransferEncoding);
    }
    let content_length = match headers.get(header::CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or(ParseError::ContentLength)?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(ParseError::BodyTooLarge);
    }
    let body = if content_length > 0 {
        conn.read_exact_bytes(content_length).await?
    } else {
        Bytes::new()
    };

    let host = target
        .authority()
        .map(|authority| authority.as_str().to_string())
        .unwrap_or_default();

    Ok(ProxyRequest {
        method,
        target,
        version,
        headers,
        body,
        host,
        remote_addr: None,
    })
}

/// Serialize a response onto the connection. The wire line is regenerated
/// from structured fields; framing comes from the buffered body and the
/// close flag.
pub async fn write_response<W>(conn: &mut W, response: &ProxyResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let version = match response.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let reason = response
        .reason
        .or_else(|| response.status.canonical_reason())
        .unwrap_or("");

    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(format!("{} {} {}\r\n", version, response.status.as_u16(), reason).as_bytes());
    for (name, value) in &response.headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if let Some(body) = &response.body {
        head.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    if response.close {
        head.extend_from_slice(b"Connection: close\r\n");
    }
    head.extend_from_slice(b"\r\n");

    conn.write_all(&head).await?;
    if let Some(body) = &response.body {
        if !body.is_empty() {
            conn.write_all(body).await?;
        }
    }
    conn.flush().await
}
