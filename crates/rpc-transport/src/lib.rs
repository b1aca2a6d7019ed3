//! The narrow seam between the RPC core crates and whatever pub/sub broker
//! actually moves bytes. Both [`Server`](../rpc_server) and
//! [`Client`](../rpc_client) are generic over [`Transport`]; `rpc-proto`
//! never depends on this crate, and this crate never depends on a concrete
//! broker — that lives one crate further out, in `rpc-transport-redis`.

use std::sync::Arc;

use async_trait::async_trait;
use rpc_proto::Envelope;

pub mod supervisor;
pub use supervisor::supervise;

/// Invoked once per inbound envelope a subscription receives.
pub type EnvelopeCallback = Arc<dyn Fn(Envelope) + Send + Sync>;

/// A broker-backed pub/sub channel carrying [`Envelope`]s, with an
/// optional sideband for payloads too large to publish inline.
///
/// Implementors own connection lifecycle and retry policy; callers only
/// see the four operations below plus [`Transport::close`]. A single
/// `Transport` instance is shared by many in-flight calls and
/// subscriptions, so every method must tolerate concurrent use.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the broker connection and subscribes to this transport's
    /// inbound topic, without yet delivering anything. Idempotent — safe to
    /// call again on a transport that is already connected. Must run
    /// before [`Transport::subscribe`] is called.
    async fn do_subscribe(&self) -> anyhow::Result<()>;

    /// Publishes `envelope` to `topic`, stamping `reply_to` on calls that
    /// expect one and moving oversized payloads to the sideband store.
    /// Returns the number of subscribers the broker reports as reached.
    async fn publish(&self, envelope: Envelope, topic: &str) -> anyhow::Result<usize>;

    /// Registers `on_event` and then blocks, decoding and dispatching every
    /// envelope the broker delivers, until [`Transport::unsubscribe`] or
    /// [`Transport::close`] ends the stream. Safe to call from more than
    /// one task concurrently: the first caller drives the read loop, later
    /// callers just attach another listener and return once the drive loop
    /// ends. Callers that need this to behave as a supervised task (as
    /// `Server`/`Client` do, per their `serve()` loops) should treat its
    /// `Ok(())` return as "stream ended, respawn if still wanted".
    async fn subscribe(&self, on_event: EnvelopeCallback) -> anyhow::Result<()>;

    /// Detaches all listeners without tearing down the connection.
    async fn unsubscribe(&self) -> anyhow::Result<()>;

    /// Tears down the connection. A transport is not usable afterward.
    async fn close(&self) -> anyhow::Result<()>;
}
