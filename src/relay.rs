//! Downstream relay for hijacked CONNECT tunnels.
//!
//! Deliberately policy-free: the authority named by the CONNECT request is
//! dialled directly and bytes are shuttled until either side closes.

use anyhow::{anyhow, Result};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::proxy::InboundContext;

/// Consume hijacked connections off the channel, one relay task per tunnel.
pub async fn run(mut inbound: mpsc::Receiver<InboundContext>) -> Result<()> {
    while let Some(context) = inbound.recv().await {
        tokio::spawn(async move {
            if let Err(err) = tunnel(context).await {
                debug!(error = %err, "tunnel closed with error");
            }
        });
    }

    Ok(())
}

async fn tunnel(mut context: InboundContext) -> Result<()> {
    let authority = context
        .request
        .target
        .authority()
        .ok_or_else(|| anyhow!("CONNECT target has no authority"))?;
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);

    let mut upstream = TcpStream::connect((host.as_str(), port)).await?;
    debug!(target = %context.request.target, "tunnel established");

    copy_bidirectional(&mut context.stream, &mut upstream).await?;

    Ok(())
}
