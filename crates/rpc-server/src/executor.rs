use std::sync::Arc;

use async_trait::async_trait;
use rpc_proto::{MethodCall, Value};

use crate::publisher::Publisher;

/// The cause carried by a server-side [`Envelope::Failure`](rpc_proto::Envelope::Failure):
/// a bare class-name tag plus the argument tuple the original error raised with.
///
/// Mirrors the reflection layer's reliance on bare exception class names — see
/// `BuiltinErrorKind` in `rpc-proto` for the client-side reconstruction half.
#[derive(Debug, Clone)]
pub struct ExecutorFailure {
    pub class_name: String,
    pub args: Vec<Value>,
}

impl ExecutorFailure {
    pub fn new(class_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class_name: class_name.into(),
            args,
        }
    }

    pub fn not_implemented() -> Self {
        Self::new("NotImplemented", vec![])
    }

    pub fn attribute_error(name: &str) -> Self {
        Self::new("AttributeError", vec![Value::Str(name.to_string())])
    }
}

/// One registered namespace's handler. A namespace is one `Executor`;
/// [`crate::server::Server::register`] refuses a second registration under
/// the same name.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs one Request's call stack to completion and returns its result.
    async fn call(&self, stack: &[MethodCall]) -> Result<Value, ExecutorFailure>;

    /// Whether this executor exposes a streaming method. The server reports
    /// `NotImplemented` for a SubscribeRequest when this is `false` rather
    /// than invoking [`Executor::stream`] at all.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Runs a SubscribeRequest's call stack, emitting results to `publisher`
    /// until it completes, is cancelled, or `publisher` goes inactive.
    /// Only invoked when [`Executor::supports_streaming`] is `true`.
    async fn stream(&self, stack: &[MethodCall], publisher: Arc<Publisher>) -> Result<(), ExecutorFailure> {
        let _ = (stack, publisher);
        Err(ExecutorFailure::not_implemented())
    }
}

/// Either a terminal value, or another attribute/method resource to keep
/// walking the call stack against.
///
/// This is the static-typing stand-in for reflection-based attribute lookup:
/// instead of inspecting a live object's members by name, a `Resource` owns
/// its own `invoke` dispatch and decides for itself whether `method` names an
/// invocable member, a plain value binding, or nothing at all.
pub trait Resource: Send + Sync {
    /// Resolves `method` against this resource. Implementations that expose
    /// a plain value attribute rather than a callable should ignore `args`/
    /// `kwargs` when they're empty and fail with `TypeError` when they
    /// aren't — mirroring a reflected attribute invoked with arguments it
    /// doesn't accept.
    fn invoke(
        &self,
        method: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> Result<Box<dyn Resource>, ExecutorFailure>;

    /// Collapses this resource to the encoded value a Result envelope
    /// carries. Called once, on the last resource left after the stack is
    /// exhausted.
    fn to_value(&self) -> Value;
}

/// Wraps a plain [`Value`] as a terminal resource: any further `invoke`
/// against it fails, since a bare value has no further attributes.
pub struct ValueResource(pub Value);

impl Resource for ValueResource {
    fn invoke(
        &self,
        method: &str,
        _args: &[Value],
        _kwargs: &[(String, Value)],
    ) -> Result<Box<dyn Resource>, ExecutorFailure> {
        Err(ExecutorFailure::attribute_error(method))
    }

    fn to_value(&self) -> Value {
        self.0.clone()
    }
}

/// Walks a Request's `stack` against a fresh root [`Resource`] built per
/// call: `resource = root`, then for each [`MethodCall`] in order,
/// `resource = resource.invoke(call.method, call.positional, call.named)`.
/// The final resource's value is the call's result.
pub struct DefaultExecutor<F> {
    root: F,
}

impl<F> DefaultExecutor<F>
where
    F: Fn() -> Box<dyn Resource> + Send + Sync,
{
    pub fn new(root: F) -> Self {
        Self { root }
    }
}

#[async_trait]
impl<F> Executor for DefaultExecutor<F>
where
    F: Fn() -> Box<dyn Resource> + Send + Sync,
{
    async fn call(&self, stack: &[MethodCall]) -> Result<Value, ExecutorFailure> {
        let mut resource = (self.root)();
        for step in stack {
            resource = resource.invoke(&step.name, &step.args, &step.kwargs)?;
        }
        Ok(resource.to_value())
    }
}
