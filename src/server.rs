use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::future;
use futures_util::StreamExt;
use kv_schema::config::ServerConfig;
use kv_schema::limits::ConnectionTracker;
use kv_schema::rpc::WireServer;
use kv_schema::shared_types::{self, WireService};
use kv_schema::store::KvStore;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::parse();

    // Schema is loaded once, before any traffic, and read-only afterwards.
    let registry = shared_types::registry().context("loading kv schema")?;
    let store = Arc::new(KvStore::new());
    let dispatch = store.dispatch(&registry)?;
    dispatch.ensure_complete()?;
    let server = WireServer::new(Arc::new(dispatch));

    let tracker = Arc::new(ConnectionTracker::new(
        config.max_per_ip,
        config.max_connections,
    ));

    let mut listener = tarpc::serde_transport::tcp::listen(&config.listen, Json::default)
        .await
        .with_context(|| format!("listening on {}", config.listen))?;
    listener
        .config_mut()
        .max_frame_length(config.max_frame_length);

    info!(
        addr = %listener.local_addr(),
        max_connections = config.max_connections,
        max_per_ip = config.max_per_ip,
        max_frame_length = config.max_frame_length,
        "server listening"
    );

    listener
        // Ignore accept errors.
        .filter_map(|r| future::ready(r.ok()))
        .map(server::BaseChannel::with_defaults)
        .for_each(|channel| {
            let server = server.clone();
            let tracker = tracker.clone();
            async move {
                let peer_addr = match channel.transport().peer_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!(error = %e, "dropping connection without peer address");
                        return;
                    }
                };

                let Some(guard) = tracker.try_acquire(peer_addr.ip()) else {
                    return;
                };
                info!(
                    peer = %peer_addr,
                    active = tracker.active(),
                    max = tracker.max_total(),
                    "new connection"
                );

                let fut = channel.execute(server.serve());

                tokio::spawn(async move {
                    fut.await;
                    // Slot is released when the guard drops.
                    drop(guard);
                    info!(peer = %peer_addr, "client disconnected");
                });
            }
        })
        .await;

    Ok(())
}
