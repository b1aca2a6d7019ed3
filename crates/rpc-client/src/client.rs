use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rpc_proto::{BuiltinErrorKind, Call, CodecError, Envelope, MethodCall, Payload, RpcError, Value};
use rpc_transport::{supervise, supervisor::DEFAULT_MAX_RETRIES, Transport};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::subscription::Subscription;

/// Notice handler: invoked with the free-form `message` carried by an
/// unsolicited [`Envelope::Notice`].
pub type NoticeHandler = Arc<dyn Fn(String) + Send + Sync>;

enum Inbound {
    Envelope(Envelope),
    End,
}

/// Where Requests publish and how long they wait by default, per client
/// instance.
#[derive(Clone)]
pub struct ClientConfig {
    /// Topic the server's namespace listens on.
    pub outbound_topic: String,
    pub default_timeout: Duration,
}

impl ClientConfig {
    pub fn new(outbound_topic: impl Into<String>) -> Self {
        Self {
            outbound_topic: outbound_topic.into(),
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Client-side RPC core: fan-in queue, pending-call table,
/// subscription table, served/one-shot call modes.
pub struct Client<T: Transport + 'static> {
    transport: Arc<T>,
    config: ClientConfig,
    pending: DashMap<String, oneshot::Sender<Envelope>>,
    subscriptions: Arc<DashMap<String, Arc<Subscription>>>,
    notice_handler: parking_lot::RwLock<Option<NoticeHandler>>,
    /// Distinguishes served mode (`serve()` has been called and is still
    /// running) from one-shot mode.
    processing: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

impl<T: Transport + 'static> Client<T> {
    pub fn new(transport: Arc<T>, config: ClientConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            transport,
            config,
            pending: DashMap::new(),
            subscriptions: Arc::new(DashMap::new()),
            notice_handler: parking_lot::RwLock::new(None),
            processing: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn on_notice(&self, handler: NoticeHandler) {
        *self.notice_handler.write() = Some(handler);
    }

    pub fn is_serving(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Enters served mode: starts the subscribe loop and the process loop
    /// under the shared supervision rule, and blocks until [`Client::close`]
    /// unwinds both. While this runs, calls made through [`Client::call`]
    /// use the pending-table path and may be in flight concurrently.
    pub async fn serve(self: &Arc<Self>) -> anyhow::Result<()> {
        self.transport.do_subscribe().await?;
        self.processing.store(true, Ordering::SeqCst);

        let subscribe_handle = {
            let transport = self.transport.clone();
            let tx = self.inbound_tx.clone();
            supervise("rpc-client-subscribe", DEFAULT_MAX_RETRIES, move || {
                let transport = transport.clone();
                let tx = tx.clone();
                async move {
                    transport.do_subscribe().await?;
                    transport
                        .subscribe(Arc::new(move |envelope| {
                            let _ = tx.send(Inbound::Envelope(envelope));
                        }))
                        .await
                }
            })
        };

        let process_handle = {
            let this = self.clone();
            supervise("rpc-client-process", DEFAULT_MAX_RETRIES, move || {
                let this = this.clone();
                async move { this.process_loop().await }
            })
        };

        let _ = tokio::join!(subscribe_handle, process_handle);
        self.processing.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Unwinds `serve()`, cancelling in-flight waiters with
    /// `ConnectionClosed` rather than leaving them to time out.
    pub async fn close(&self) -> anyhow::Result<()> {
        let _ = self.inbound_tx.send(Inbound::End);
        self.transport.unsubscribe().await?;
        for entry in self.pending.iter() {
            let uid = entry.key().clone();
            if let Some((_, tx)) = self.pending.remove(&uid) {
                let _ = tx.send(Envelope::Failure {
                    uid,
                    namespace: String::new(),
                    class_name: "ConnectionClosed".into(),
                    args: vec![],
                });
            }
        }
        Ok(())
    }

    async fn process_loop(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("process loop already running"))?;

        loop {
            match rx.recv().await {
                Some(Inbound::Envelope(envelope)) => self.route(envelope),
                Some(Inbound::End) | None => break,
            }
        }

        *self.inbound_rx.lock().await = Some(rx);
        Ok(())
    }

    /// Routes one inbound envelope per the served-mode table.
    fn route(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Result { uid, .. } | Envelope::Failure { uid, .. } => {
                if let Some((_, tx)) = self.pending.remove(&uid) {
                    let _ = tx.send(envelope);
                    return;
                }
                if let Envelope::Failure { class_name, args, .. } = envelope {
                    if let Some((_, sub)) = self.subscriptions.remove(&uid) {
                        sub.enqueue_failure(reconstruct_failure(class_name, args));
                        return;
                    }
                }
                tracing::debug!(uid, "dropping reply with no matching pending call or subscription");
            }
            Envelope::DataPoint { uid, data, .. } => {
                let Some(sub) = self.subscriptions.get(&uid) else {
                    tracing::debug!(uid, "dropping data point with no matching subscription");
                    return;
                };
                match inline_value(data) {
                    Ok(v) => sub.enqueue_data(v),
                    Err(e) => sub.enqueue_failure(e),
                }
            }
            Envelope::Notice { message } => {
                if let Some(handler) = self.notice_handler.read().clone() {
                    handler(message);
                }
            }
            Envelope::Request(_) | Envelope::SubscribeRequest(_) | Envelope::UnsubscribeRequest { .. } => {
                // A client's inbound topic only ever carries replies and
                // notices addressed to it; requests arriving here are a
                // broker misconfiguration, not something to act on.
            }
        }
    }

    /// Issues one Request and awaits its correlated Result/Failure.
    pub async fn call(
        &self,
        namespace: impl Into<String>,
        stack: Vec<MethodCall>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let uid = Uuid::new_v4().to_string();
        let call = Call::new(uid.clone(), namespace, timeout.as_millis() as u64).with_stack(stack);

        self.transport.do_subscribe().await.map_err(RpcError::Transport)?;

        if self.processing.load(Ordering::Acquire) {
            self.call_served(call, timeout).await
        } else {
            self.call_one_shot(call, timeout).await
        }
    }

    async fn call_served(&self, call: Call, timeout: Duration) -> Result<Value, RpcError> {
        let uid = call.uid.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(uid.clone(), tx);

        let count = self
            .transport
            .publish(Envelope::Request(call), &self.config.outbound_topic)
            .await
            .map_err(RpcError::Transport)?;
        if count == 0 {
            self.pending.remove(&uid);
            return Err(RpcError::NotDelivered);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => envelope_to_result(envelope),
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&uid);
                Err(RpcError::Timeout)
            }
        }
    }

    async fn call_one_shot(&self, call: Call, timeout: Duration) -> Result<Value, RpcError> {
        let uid = call.uid.clone();
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let matcher = {
            let uid = uid.clone();
            let slot = slot.clone();
            Arc::new(move |envelope: Envelope| {
                if envelope.uid() != Some(uid.as_str()) {
                    return;
                }
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(envelope);
                }
            })
        };

        let subscribe_task = {
            let transport = self.transport.clone();
            tokio::spawn(async move { transport.subscribe(matcher).await })
        };

        let count = self
            .transport
            .publish(Envelope::Request(call), &self.config.outbound_topic)
            .await
            .map_err(RpcError::Transport)?;

        let outcome = if count == 0 {
            Err(RpcError::NotDelivered)
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(envelope)) => envelope_to_result(envelope),
                Ok(Err(_)) => Err(RpcError::ConnectionClosed),
                Err(_) => Err(RpcError::Timeout),
            }
        };

        let _ = self.transport.unsubscribe().await;
        subscribe_task.abort();
        outcome
    }

    /// Opens a streaming subscription. Requires served mode.
    pub async fn subscribe_call(
        &self,
        namespace: impl Into<String>,
        stack: Vec<MethodCall>,
        timeout: Option<Duration>,
    ) -> Result<Arc<Subscription>, RpcError> {
        if !self.processing.load(Ordering::Acquire) {
            return Err(RpcError::SubscriptionClosed);
        }
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let namespace = namespace.into();
        let uid = Uuid::new_v4().to_string();
        let call = Call::new(uid.clone(), namespace.clone(), timeout.as_millis() as u64).with_stack(stack);

        self.transport.do_subscribe().await.map_err(RpcError::Transport)?;
        let count = self
            .transport
            .publish(Envelope::SubscribeRequest(call), &self.config.outbound_topic)
            .await
            .map_err(RpcError::Transport)?;
        if count == 0 {
            return Err(RpcError::NotDelivered);
        }

        let subscription = Arc::new(Subscription::new(
            uid.clone(),
            namespace,
            self.config.outbound_topic.clone(),
            self.transport.clone() as Arc<dyn Transport>,
            self.subscriptions.clone(),
        ));
        self.subscriptions.insert(uid, subscription.clone());
        Ok(subscription)
    }
}

fn inline_value(data: Payload) -> Result<Value, RpcError> {
    match data {
        Payload::Inline(v) => Ok(v),
        Payload::SidebandKey(key) => Err(RpcError::Codec(CodecError::Malformed(format!(
            "transport delivered unresolved sideband key {key}"
        )))),
    }
}

fn envelope_to_result(envelope: Envelope) -> Result<Value, RpcError> {
    match envelope {
        Envelope::Result { data, .. } => inline_value(data),
        Envelope::Failure { class_name, args, .. } => Err(reconstruct_failure(class_name, args)),
        other => Err(RpcError::Codec(CodecError::Malformed(format!(
            "unexpected reply envelope variant for a call: {other:?}"
        )))),
    }
}

/// Reconstructs a client-raisable error from a Failure's bare class name
/// well-known names become their builtin kind, anything else
/// becomes a `WrappedFailure` carrying the original name and args.
fn reconstruct_failure(class_name: String, args: Vec<Value>) -> RpcError {
    match BuiltinErrorKind::from_class_name(&class_name) {
        Some(kind) => RpcError::Builtin { kind, args },
        None => RpcError::WrappedFailure { class_name, args },
    }
}
