use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rpc_proto::{Envelope, Payload, Value};
use rpc_transport::Transport;

/// Server-side stream head for one accepted SubscribeRequest.
///
/// Owned by the dispatch loop and handed to the streaming executor that
/// emits its DataPoints. `active` starts `true` and only ever transitions to
/// `false`; once inactive a `Publisher` is inert and stays out of the
/// server's table.
pub struct Publisher {
    uid: String,
    namespace: String,
    reply_to: String,
    transport: Arc<dyn Transport>,
    active: AtomicBool,
    table: Arc<DashMap<String, Arc<Publisher>>>,
}

impl Publisher {
    pub(crate) fn new(
        uid: String,
        namespace: String,
        reply_to: String,
        transport: Arc<dyn Transport>,
        table: Arc<DashMap<String, Arc<Publisher>>>,
    ) -> Self {
        Self {
            uid,
            namespace,
            reply_to,
            transport,
            active: AtomicBool::new(true),
            table,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Idempotently marks this publisher dead. Streaming executors should
    /// poll [`Publisher::is_active`] between emissions and stop on `false`.
    pub fn set_inactive(&self) {
        self.active.store(false, Ordering::Release);
        self.table.remove(&self.uid);
    }

    /// Wraps `value` in a DataPoint and publishes it on the subscriber's
    /// reply topic. Returns the subscriber count the transport reports; `0`
    /// both when already inactive and when the publish itself reaches no
    /// one, in which case this publisher also retires itself — the
    /// cooperative cancellation signal streaming executors are expected to
    /// honor.
    pub async fn publish(&self, value: Value) -> usize {
        if !self.is_active() {
            return 0;
        }
        let envelope = Envelope::DataPoint {
            uid: self.uid.clone(),
            namespace: self.namespace.clone(),
            data: Payload::Inline(value),
        };
        match self.transport.publish(envelope, &self.reply_to).await {
            Ok(count) if count > 0 => count,
            Ok(_) => {
                self.set_inactive();
                0
            }
            Err(err) => {
                tracing::warn!(uid = %self.uid, %err, "publish to subscriber failed, retiring publisher");
                self.set_inactive();
                0
            }
        }
    }
}
