use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{header, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::auth::{AuthGate, Authenticator, VerdictCache};

use super::client::OutboundClient;
use super::context::InboundContext;
use super::http1::{self, ProxyRequest, ProxyResponse};
use super::sanitize;
use super::stream::BufferedConn;

/// Idle time allowed between keep-alive requests; advertised to clients in
/// the `Keep-Alive` response header.
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(4);

/// Outcome of dispatching one trusted request. The loop pattern-matches on
/// this instead of returning out of the middle of itself, so the hijack
/// boundary is an explicit value.
pub enum Dispatch {
    /// Write this response and consult keep-alive intent.
    Continue(ProxyResponse),
    /// Tear the connection down without writing anything further.
    Close,
    /// The CONNECT confirmation is already on the wire; hand the connection
    /// to the tunnel relay and never touch it again.
    Hijack(ProxyRequest),
}

/// Per-connection protocol driver.
///
/// The verifier is injected here once; whether authentication applies to a
/// given connection is decided by the cache argument to [`handle`].
///
/// [`handle`]: ConnectionHandler::handle
pub struct ConnectionHandler {
    gate: Option<AuthGate>,
}

impl ConnectionHandler {
    pub fn new(verifier: Option<Arc<dyn Authenticator>>) -> Self {
        Self {
            gate: verifier.map(AuthGate::new),
        }
    }

    /// Drive one accepted connection until it closes, fails, or is hijacked
    /// by a CONNECT tunnel.
    ///
    /// Passing no cache disables authentication for this connection. Once a
    /// cycle passes the gate the whole connection is trusted: later requests
    /// on it are not re-authenticated.
    pub async fn handle<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        inbound: mpsc::Sender<InboundContext>,
        cache: Option<Arc<VerdictCache>>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Dropped on every exit path, hijack included, releasing the
        // client's pooled idle connections.
        let client = OutboundClient::new(peer);
        let mut conn = BufferedConn::new(stream);

        let mut keep_alive = true;
        let mut trusted = cache.is_none();
        let mut first = true;

        while keep_alive {
            let read = if first {
                http1::read_request(&mut conn).await
            } else {
                match timeout(KEEP_ALIVE_TIMEOUT, http1::read_request(&mut conn)).await {
                    Ok(read) => read,
                    Err(_) => {
                        debug!(%peer, "keep-alive connection idle, closing");
                        break;
                    }
                }
            };
            first = false;

            let mut request = match read {
                Ok(request) => request,
                Err(err) => {
                    debug!(%peer, error = %err, "failed to read request");
                    break;
                }
            };
            request.remote_addr = Some(peer);

            keep_alive = request
                .headers
                .get("proxy-connection")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("keep-alive"));

            let mut denial = None;
            if !trusted {
                if let (Some(gate), Some(cache)) = (self.gate.as_ref(), cache.as_deref()) {
                    denial = gate.authenticate(&request, cache);
                }
                trusted = denial.is_none();
            }

            let outcome = match denial {
                Some(response) => Dispatch::Continue(response),
                None => self.dispatch(request, &mut conn, &client).await,
            };

            match outcome {
                Dispatch::Continue(mut response) => {
                    if keep_alive {
                        response
                            .headers
                            .insert("proxy-connection", HeaderValue::from_static("keep-alive"));
                        response
                            .headers
                            .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
                        response
                            .headers
                            .insert("keep-alive", HeaderValue::from_static("timeout=4"));
                    }
                    response.close = !keep_alive;
                    if let Err(err) = http1::write_response(&mut conn, &response).await {
                        debug!(%peer, error = %err, "failed to write response");
                        break;
                    }
                }
                Dispatch::Close => break,
                Dispatch::Hijack(request) => {
                    let context = InboundContext {
                        request,
                        stream: conn.into_boxed(),
                    };
                    if inbound.send(context).await.is_err() {
                        debug!(%peer, "tunnel relay is gone, dropping hijacked connection");
                    }
                    return;
                }
            }
        }
    }

    async fn dispatch<S>(
        &self,
        mut request: ProxyRequest,
        conn: &mut BufferedConn<S>,
        client: &OutboundClient,
    ) -> Dispatch
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if request.method == Method::CONNECT {
            let mut established = ProxyResponse::with_status(StatusCode::OK);
            established.reason = Some("Connection established");
            established.body = None;
            if let Err(err) = http1::write_response(conn, &established).await {
                debug!(error = %err, "failed to confirm CONNECT tunnel");
                return Dispatch::Close;
            }
            return Dispatch::Hijack(request);
        }

        sanitize::normalize_request(&mut request);
        sanitize::remove_hop_by_hop_headers(&mut request.headers);

        if request.target.scheme().is_none() || request.target.host().is_none() {
            return Dispatch::Continue(ProxyResponse::with_status(StatusCode::BAD_REQUEST));
        }

        match client.forward(request).await {
            Ok(response) => Dispatch::Continue(response),
            Err(err) => {
                debug!(error = %err, "upstream request failed");
                Dispatch::Continue(ProxyResponse::with_status(StatusCode::BAD_GATEWAY))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingVerifier {
        username: &'static str,
        password: &'static str,
        calls: AtomicUsize,
    }

    impl CountingVerifier {
        fn new(username: &'static str, password: &'static str) -> Arc<Self> {
            Arc::new(Self {
                username,
                password,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Authenticator for CountingVerifier {
        fn verify(&self, username: &str, password: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            username == self.username && password == self.password
        }
    }

    fn spawn_handler(
        verifier: Option<Arc<dyn Authenticator>>,
        cache: Option<Arc<VerdictCache>>,
    ) -> (DuplexStream, mpsc::Receiver<InboundContext>) {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(1);
        let handler = ConnectionHandler::new(verifier);
        tokio::spawn(async move {
            handler
                .handle(server_side, "127.0.0.1:51123".parse().unwrap(), tx, cache)
                .await;
        });
        (client_side, rx)
    }

    struct WireResponse {
        status: u16,
        reason: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl WireResponse {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        }
    }

    async fn read_response(stream: &mut (impl AsyncRead + Unpin)) -> WireResponse {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        let head_len = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed before a full response");
            buf.extend_from_slice(&tmp[..n]);
        };

        let mut storage = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Response::new(&mut storage);
        parsed.parse(&buf[..head_len]).unwrap();
        let status = parsed.code.unwrap();
        let reason = parsed.reason.unwrap_or("").to_string();
        let headers: Vec<(String, String)> = parsed
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        let content_length = headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .map(|(_, v)| v.trim().parse::<usize>().unwrap())
            .unwrap_or(0);
        let mut body = buf[head_len..].to_vec();
        while body.len() < content_length {
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed mid-body");
            body.extend_from_slice(&tmp[..n]);
        }

        WireResponse {
            status,
            reason,
            headers,
            body,
        }
    }

    fn basic(credential: &str) -> String {
        STANDARD.encode(credential)
    }

    #[tokio::test]
    async fn connect_establishes_tunnel_and_hijacks_the_connection() {
        let (mut client, mut rx) = spawn_handler(None, None);

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nearly-data")
            .await
            .unwrap();

        let response = read_response(&mut client).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "Connection established");
        assert!(response.header("content-length").is_none());
        assert!(response.body.is_empty());

        let mut context = rx.recv().await.expect("hijacked connection handed over");
        assert_eq!(context.request.method, Method::CONNECT);
        assert_eq!(context.request.target.host(), Some("example.com"));

        // Bytes pipelined behind the CONNECT head belong to the tunnel.
        let mut early = [0u8; 10];
        context.stream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early-data");
    }

    #[tokio::test]
    async fn missing_credentials_are_challenged_and_denials_are_cached() {
        let verifier = CountingVerifier::new("bob", "secret");
        let cache = Arc::new(VerdictCache::new());
        let (mut client, _rx) = spawn_handler(Some(verifier.clone()), Some(cache));

        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nProxy-Connection: keep-alive\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert_eq!(response.status, 407);
        assert_eq!(response.header("proxy-authenticate"), Some("Basic"));
        assert_eq!(response.header("proxy-connection"), Some("keep-alive"));
        assert_eq!(response.header("connection"), Some("keep-alive"));
        assert_eq!(response.header("keep-alive"), Some("timeout=4"));

        // The denial did not end the connection: a bad credential now gets a
        // 403, and repeating it is answered from the cache.
        for _ in 0..2 {
            client
                .write_all(
                    format!(
                        "GET http://example.com/ HTTP/1.1\r\n\
                         Proxy-Authorization: Basic {}\r\n\
                         Proxy-Connection: keep-alive\r\n\r\n",
                        basic("bob:wrong")
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            let response = read_response(&mut client).await;
            assert_eq!(response.status, 403);
        }
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn verdicts_are_shared_across_connections() {
        let verifier = CountingVerifier::new("bob", "secret");
        let cache = Arc::new(VerdictCache::new());

        for _ in 0..2 {
            let (mut client, _rx) =
                spawn_handler(Some(verifier.clone()), Some(cache.clone()));
            client
                .write_all(
                    format!(
                        "GET http://example.com/ HTTP/1.1\r\nProxy-Authorization: Basic {}\r\n\r\n",
                        basic("bob:wrong")
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            let response = read_response(&mut client).await;
            assert_eq!(response.status, 403);
        }

        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_trusted_connection_skips_reauthentication() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&upstream)
            .await;

        let verifier = CountingVerifier::new("bob", "secret");
        let cache = Arc::new(VerdictCache::new());
        let (mut client, _rx) = spawn_handler(Some(verifier.clone()), Some(cache));

        client
            .write_all(
                format!(
                    "GET {}/ HTTP/1.1\r\n\
                     Proxy-Authorization: Basic {}\r\n\
                     Proxy-Connection: keep-alive\r\n\r\n",
                    upstream.uri(),
                    basic("bob:secret")
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");

        // No credentials on the second request; a 400 (not 407) proves the
        // gate was skipped for the rest of the connection.
        client
            .write_all(b"GET / HTTP/1.1\r\nProxy-Connection: keep-alive\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert_eq!(response.status, 400);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forwards_requests_and_strips_hop_by_hop_headers() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("ok")
                    .insert_header("upgrade", "h2c")
                    .insert_header("x-upstream", "yes"),
            )
            .mount(&upstream)
            .await;

        let (mut client, _rx) = spawn_handler(None, None);
        client
            .write_all(
                format!(
                    "GET {}/ HTTP/1.1\r\n\
                     Proxy-Connection: keep-alive\r\n\
                     Te: trailers\r\n\r\n",
                    upstream.uri()
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let response = read_response(&mut client).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");
        assert_eq!(response.header("x-upstream"), Some("yes"));
        assert!(response.header("upgrade").is_none());
        assert_eq!(response.header("connection"), Some("keep-alive"));

        // Hop-by-hop request headers never reached the upstream.
        let received = upstream.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(!received[0].headers.contains_key("proxy-connection"));
        assert!(!received[0].headers.contains_key("te"));

        // Keep-alive held: the same connection serves a second request.
        client
            .write_all(format!("GET {}/ HTTP/1.1\r\n\r\n", upstream.uri()).as_bytes())
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.header("connection"), Some("close"));
    }

    #[rstest::rstest]
    #[case("GET")]
    #[case("DELETE")]
    #[tokio::test]
    async fn a_target_without_scheme_or_host_yields_400(#[case] verb: &str) {
        let (mut client, _rx) = spawn_handler(None, None);
        client
            .write_all(format!("{verb} /no-scheme HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let response = read_response(&mut client).await;
        assert_eq!(response.status, 400);

        // No keep-alive requested, so the connection closes after one cycle.
        let mut tmp = [0u8; 1];
        assert_eq!(client.read(&mut tmp).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn an_unreachable_upstream_yields_502() {
        let (mut client, _rx) = spawn_handler(None, None);
        client
            .write_all(b"GET http://127.0.0.1:9/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let response = read_response(&mut client).await;
        assert_eq!(response.status, 502);
    }

    #[tokio::test]
    async fn a_malformed_request_closes_without_a_response() {
        let (mut client, _rx) = spawn_handler(None, None);
        client.write_all(b"\x00\x01\x02\r\n\r\n").await.unwrap();

        let mut tmp = [0u8; 1];
        assert_eq!(client.read(&mut tmp).await.unwrap(), 0);
    }
}
