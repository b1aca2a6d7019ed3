//! Shared `Resource` tree for the demo server, and the CLI arg shapes both
//! demo binaries parse: a `multiply` method at the root plus an `integer`
//! sub-resource exposing its own `multiply`, so the same namespace
//! demonstrates both a flat call and a chained one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use rpc_proto::Value;
use rpc_server::{ExecutorFailure, Publisher, Resource, ValueResource};

pub const DEMO_NAMESPACE: &str = "demo";

#[derive(Parser, Debug, Clone)]
pub struct RedisArgs {
    /// Redis connection string.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Topic this process subscribes to for inbound envelopes.
    #[arg(long, env = "RPC_SUBCHANNEL")]
    pub subchannel: String,

    /// Topic this process publishes Requests/SubscribeRequests to.
    #[arg(long, env = "RPC_PUBCHANNEL")]
    pub pubchannel: String,
}

/// Root of the demo namespace's resource tree.
pub struct Service;

impl Resource for Service {
    fn invoke(
        &self,
        method: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> Result<Box<dyn Resource>, ExecutorFailure> {
        match method {
            "multiply" => multiply(args, kwargs),
            "integer" => Ok(Box::new(IntegerResource)),
            other => Err(ExecutorFailure::attribute_error(other)),
        }
    }

    fn to_value(&self) -> Value {
        Value::Nil
    }
}

/// The `.integer` property from `examples/stacked/server.py`: a sub-resource
/// whose own `multiply` is reached by chaining through the root.
struct IntegerResource;

impl Resource for IntegerResource {
    fn invoke(
        &self,
        method: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> Result<Box<dyn Resource>, ExecutorFailure> {
        match method {
            "multiply" => multiply(args, kwargs),
            other => Err(ExecutorFailure::attribute_error(other)),
        }
    }

    fn to_value(&self) -> Value {
        Value::Nil
    }
}

fn multiply(
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<Box<dyn Resource>, ExecutorFailure> {
    if !kwargs.is_empty() {
        return Err(ExecutorFailure::new("TypeError", vec![Value::Str("multiply takes no kwargs".into())]));
    }
    let [Value::Int(a), Value::Int(b)] = args else {
        return Err(ExecutorFailure::new(
            "TypeError",
            vec![Value::Str("multiply expects two integers".into())],
        ));
    };
    Ok(Box::new(ValueResource(Value::Int(a * b))))
}

/// Streaming executor for the demo namespace: `count_to(n)` publishes
/// `0..n` as DataPoints, one every 50ms, checking `publisher.active`
/// between emissions per the publisher's cooperative-cancellation contract.
pub struct CountingExecutor;

#[async_trait]
impl rpc_server::Executor for CountingExecutor {
    async fn call(&self, stack: &[rpc_proto::MethodCall]) -> Result<Value, ExecutorFailure> {
        let mut resource: Box<dyn Resource> = Box::new(Service);
        for step in stack {
            resource = resource.invoke(&step.name, &step.args, &step.kwargs)?;
        }
        Ok(resource.to_value())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream(
        &self,
        stack: &[rpc_proto::MethodCall],
        publisher: Arc<Publisher>,
    ) -> Result<(), ExecutorFailure> {
        let limit = match stack.first() {
            Some(call) if call.name == "count_to" => match call.args.first() {
                Some(Value::Int(n)) => *n,
                _ => 20,
            },
            _ => 20,
        };

        let emitted = AtomicU64::new(0);
        for i in 0..limit {
            if !publisher.is_active() {
                break;
            }
            if publisher.publish(Value::Int(i)).await == 0 {
                break;
            }
            emitted.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}
