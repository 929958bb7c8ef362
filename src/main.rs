use std::sync::Arc;

use anyhow::Result;
use tokio::{net::TcpListener, sync::mpsc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use guichet::{auth, config, proxy, relay};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings: Arc<config::Settings> = Arc::new(config::init());

    let verifier = settings.users.as_ref().map(|users| {
        Arc::new(auth::StaticUserTable::new(
            users
                .iter()
                .map(|user| (user.username.clone(), user.password.clone())),
        )) as Arc<dyn auth::Authenticator>
    });
    let cache = verifier.as_ref().map(|_| Arc::new(auth::VerdictCache::new()));
    let handler = Arc::new(proxy::ConnectionHandler::new(verifier));

    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let listener = TcpListener::bind(settings.listen).await?;
    info!(listen = %settings.listen, "starting services");

    tokio::try_join!(
        proxy::start(settings.clone(), handler, cache, inbound_tx, listener),
        relay::run(inbound_rx),
    )?;

    info!("exiting");

    Ok(())
}
