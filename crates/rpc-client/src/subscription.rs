use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rpc_proto::{Envelope, RpcError, Value};
use rpc_transport::Transport;
use tokio::sync::{mpsc, Mutex};

/// One buffered item: a decoded DataPoint value, the terminal Failure that
/// ends the subscription, or the internal `STOP` sentinel.
enum Item {
    Data(Value),
    Failure(RpcError),
    Stop,
}

/// Client-side handle for one outstanding SubscribeRequest.
///
/// Consumed as a lazy stream via [`Subscription::next`]: `Ok(value)` per
/// DataPoint, `Err` once if the server ends the stream with a Failure, then
/// `None` forever after. [`Subscription::close`] tears it down from the
/// client side instead.
pub struct Subscription {
    uid: String,
    namespace: String,
    outbound_topic: String,
    tx: mpsc::UnboundedSender<Item>,
    rx: Mutex<mpsc::UnboundedReceiver<Item>>,
    transport: Arc<dyn Transport>,
    table: Arc<DashMap<String, Arc<Subscription>>>,
    closed: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        uid: String,
        namespace: String,
        outbound_topic: String,
        transport: Arc<dyn Transport>,
        table: Arc<DashMap<String, Arc<Subscription>>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            uid,
            namespace,
            outbound_topic,
            tx,
            rx: Mutex::new(rx),
            transport,
            table,
            closed: AtomicBool::new(false),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Called by the client's process loop for every DataPoint matching
    /// this subscription's `uid`.
    pub(crate) fn enqueue_data(&self, value: Value) {
        let _ = self.tx.send(Item::Data(value));
    }

    /// Called by the client's process loop when a Failure for this `uid`
    /// arrives: a Failure terminates the
    /// subscription, so `STOP` follows right behind it.
    pub(crate) fn enqueue_failure(&self, err: RpcError) {
        let _ = self.tx.send(Item::Failure(err));
        let _ = self.tx.send(Item::Stop);
    }

    /// Yields the next DataPoint's decoded value, re-raising a terminal
    /// Failure exactly once, then `None` once the stream is exhausted or
    /// `close()` has run. Buffered items queued before `close()` are
    /// flushed to the caller first rather than discarded.
    pub async fn next(&self) -> Option<Result<Value, RpcError>> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Item::Data(v)) => Some(Ok(v)),
            Some(Item::Failure(e)) => Some(Err(e)),
            Some(Item::Stop) | None => None,
        }
    }

    /// Publishes an UnsubscribeRequest, removes this subscription from the
    /// client's table, and pushes `STOP` behind whatever is already
    /// buffered. Idempotent.
    pub async fn close(&self) -> Result<(), RpcError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.table.remove(&self.uid);
        let envelope = Envelope::UnsubscribeRequest {
            uid: self.uid.clone(),
            namespace: self.namespace.clone(),
        };
        self.transport
            .publish(envelope, &self.outbound_topic)
            .await
            .map_err(RpcError::Transport)?;
        let _ = self.tx.send(Item::Stop);
        Ok(())
    }
}
