use anyhow::Context;
use clap::Parser;
use kv_schema::config::{ClientCommand, ClientConfig};
use kv_schema::rpc::TarpcTransport;
use kv_schema::shared_types::{self, GET, GET_REQUEST, KV_SERVICE, SET, SET_REQUEST};
use kv_schema::{build_client_stub, DynamicMessage};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Stub calls block their worker, which needs the multi-threaded runtime.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let config = ClientConfig::parse();
    let registry = shared_types::registry().context("loading kv schema")?;
    let service = registry
        .service(KV_SERVICE)
        .context("kv service missing from schema")?;

    debug!(server = %config.server, "connecting");
    let transport = TarpcTransport::connect(config.server, config.timeout())
        .await
        .with_context(|| format!("connecting to {}", config.server))?;
    let client = build_client_stub(service, transport);

    match config.command {
        ClientCommand::Get { key } => {
            let request = DynamicMessage::new(registry.message(GET_REQUEST).context("GetRequest")?)
                .with("key", key.as_str())?;
            let response = client.call(GET, &request)?;
            let value = response.get("value")?;
            info!(%key, "get");
            println!("{}", value.as_str().unwrap_or_default());
        }
        ClientCommand::Set { key, value } => {
            let request = DynamicMessage::new(registry.message(SET_REQUEST).context("SetRequest")?)
                .with("key", key.as_str())?
                .with("value", value)?;
            let response = client.call(SET, &request)?;
            let ok = response.get("ok")?.as_bool().unwrap_or_default();
            info!(%key, ok, "set");
            println!("{}", if ok { "OK" } else { "FAILED" });
        }
    }

    Ok(())
}
