use super::http1::ProxyRequest;
use super::stream::{BufferedConn, ClientStream};

/// A hijacked CONNECT tunnel: the request that established it and the raw
/// client connection, buffered bytes included.
///
/// Pushed onto the relay channel at most once per connection, and only after
/// the confirmation response was fully written. From then on the relay owns
/// the connection exclusively; the proxy loop never reads, writes, or closes
/// it again.
pub struct InboundContext {
    pub request: ProxyRequest,
    pub stream: BufferedConn<ClientStream>,
}
