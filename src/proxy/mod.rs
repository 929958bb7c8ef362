use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::VerdictCache;
use crate::config::Settings;

mod client;
mod connection;
mod context;
mod http1;
mod sanitize;
mod stream;

pub use client::{ForwardError, OutboundClient};
pub use connection::{ConnectionHandler, Dispatch};
pub use context::InboundContext;
pub use http1::{ParseError, ProxyRequest, ProxyResponse};
pub use sanitize::{normalize_request, remove_hop_by_hop_headers};
pub use stream::{BufferedConn, ClientStream};

/// Accept connections and hand each one to the connection handler on its own
/// task. Hijacked CONNECT tunnels come out of the `inbound` channel.
pub async fn start(
    settings: Arc<Settings>,
    handler: Arc<ConnectionHandler>,
    cache: Option<Arc<VerdictCache>>,
    inbound: mpsc::Sender<InboundContext>,
    listener: TcpListener,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;

        if settings.tcp_nodelay {
            if let Err(err) = socket.set_nodelay(true) {
                debug!(%peer, error = %err, "failed to set TCP_NODELAY");
            }
        }

        let handler = handler.clone();
        let cache = cache.clone();
        let inbound = inbound.clone();
        tokio::spawn(async move {
            handler.handle(socket, peer, inbound, cache).await;
        });
    }
}
