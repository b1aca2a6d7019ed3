//! Demo RPC client: exercises a one-shot call, a
//! served chained call, an unknown-namespace failure, and a cancelled
//! streaming subscription against the `demo` namespace — the scenarios
//! the protocol's test suite covers, run against a real Redis broker instead of
//! the in-process transport doubles the crate unit tests use.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pubsub_rpc_demos::{RedisArgs, DEMO_NAMESPACE};
use rpc_client::{Client, ClientConfig};
use rpc_proto::{MethodCall, Value};
use rpc_transport_redis::{RedisTransport, RedisTransportConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = RedisArgs::parse();
    let codec = Arc::new(rpc_proto::Codec::new());
    // Inverse of the server's channels: this process listens where the
    // server publishes, and publishes where the server listens.
    let config = RedisTransportConfig::new(args.redis_url, args.pubchannel.clone());
    let transport = Arc::new(RedisTransport::connect(config, codec).await?);

    let client = Client::new(transport, ClientConfig::new(args.subchannel.clone()));
    let serve_client = client.clone();
    let serve_task = tokio::spawn(async move { serve_client.serve().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let product = client
        .call(
            DEMO_NAMESPACE,
            vec![MethodCall::new("multiply").with_args(vec![Value::Int(100), Value::Int(100)])],
            None,
        )
        .await?;
    tracing::info!(?product, "multiply(100, 100)");

    let chained = client
        .call(
            DEMO_NAMESPACE,
            vec![
                MethodCall::new("integer"),
                MethodCall::new("multiply").with_args(vec![Value::Int(6), Value::Int(7)]),
            ],
            None,
        )
        .await?;
    tracing::info!(?chained, "integer.multiply(6, 7)");

    match client.call("no-such-namespace", vec![], None).await {
        Err(err) => tracing::info!(%err, "unknown namespace rejected as expected"),
        Ok(v) => tracing::warn!(?v, "unexpected success calling unknown namespace"),
    }

    let subscription = client
        .subscribe_call(
            DEMO_NAMESPACE,
            vec![MethodCall::new("count_to").with_args(vec![Value::Int(20)])],
            None,
        )
        .await?;
    while let Some(item) = subscription.next().await {
        match item {
            Ok(Value::Int(n)) => {
                tracing::info!(n, "data point");
                if n >= 5 {
                    break;
                }
            }
            Ok(other) => tracing::warn!(?other, "unexpected data point shape"),
            Err(err) => {
                tracing::error!(%err, "subscription failed");
                break;
            }
        }
    }
    subscription.close().await?;

    client.close().await?;
    let _ = tokio::time::timeout(Duration::from_secs(1), serve_task).await;
    Ok(())
}
