//! Demo RPC server: registers the `demo` namespace and serves it over
//! Redis pub/sub until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use pubsub_rpc_demos::{CountingExecutor, RedisArgs, DEMO_NAMESPACE};
use rpc_proto::Codec;
use rpc_server::Server;
use rpc_transport_redis::{RedisTransport, RedisTransportConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = RedisArgs::parse();
    let codec = Arc::new(Codec::new());
    let config = RedisTransportConfig::new(args.redis_url, args.subchannel);
    let transport = Arc::new(RedisTransport::connect(config, codec).await?);

    let server = Server::new(transport);
    server.register(DEMO_NAMESPACE, Arc::new(CountingExecutor))?;

    tracing::info!(namespace = DEMO_NAMESPACE, "demo server listening");

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.stop().await?;
    serving.await??;
    Ok(())
}
