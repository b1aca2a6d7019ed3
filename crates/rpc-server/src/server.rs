use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rpc_proto::{Envelope, Payload, RpcError};
use rpc_transport::{supervise, supervisor::DEFAULT_MAX_RETRIES, Transport};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::executor::{Executor, ExecutorFailure};
use crate::publisher::Publisher;

/// Either a decoded inbound envelope, or the `END` sentinel that cleanly
/// terminates the dispatch loop.
enum Inbound {
    Envelope(Envelope),
    End,
}

/// Server-side RPC core: fan-in queue, namespace registry, streaming
/// publisher table.
///
/// Generic over [`Transport`] so the same dispatch logic runs against Redis
/// pub/sub or any other broker implementing the trait.
pub struct Server<T: Transport + 'static> {
    transport: Arc<T>,
    executors: DashMap<String, Arc<dyn Executor>>,
    publishers: Arc<DashMap<String, Arc<Publisher>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    alive: AtomicBool,
}

impl<T: Transport + 'static> Server<T> {
    pub fn new(transport: Arc<T>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            transport,
            executors: DashMap::new(),
            publishers: Arc::new(DashMap::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(Some(inbound_rx)),
            alive: AtomicBool::new(true),
        })
    }

    /// Registers `executor` under `namespace`. One-shot per namespace: a
    /// second registration under the same name fails with
    /// `NamespaceCollision` rather than replacing the first.
    pub fn register(&self, namespace: impl Into<String>, executor: Arc<dyn Executor>) -> Result<(), RpcError> {
        let namespace = namespace.into();
        if self.executors.contains_key(&namespace) {
            return Err(RpcError::NamespaceCollision(namespace));
        }
        self.executors.insert(namespace, executor);
        Ok(())
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    /// Starts the subscribe loop and the dispatch loop under the shared
    /// supervision rule and blocks until both have finished — which only
    /// happens after [`Server::stop`] is called (or both give up retrying
    /// after repeated failures).
    pub async fn serve(self: &Arc<Self>) -> anyhow::Result<()> {
        self.transport.do_subscribe().await?;
        let subscribe_handle = {
            let transport = self.transport.clone();
            let tx = self.inbound_tx.clone();
            supervise("rpc-server-subscribe", DEFAULT_MAX_RETRIES, move || {
                let transport = transport.clone();
                let tx = tx.clone();
                async move {
                    transport.do_subscribe().await?;
                    let tx = tx.clone();
                    transport
                        .subscribe(Arc::new(move |envelope| {
                            let _ = tx.send(Inbound::Envelope(envelope));
                        }))
                        .await
                }
            })
        };

        let dispatch_handle = {
            let this = self.clone();
            supervise("rpc-server-dispatch", DEFAULT_MAX_RETRIES, move || {
                let this = this.clone();
                async move { this.dispatch_loop().await }
            })
        };

        let _ = tokio::join!(subscribe_handle, dispatch_handle);
        Ok(())
    }

    /// Cleanly unwinds `serve()`: pushes the `END` sentinel so the dispatch
    /// loop exits, and tells the transport to stop delivering envelopes so
    /// the subscribe loop exits too.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.inbound_tx.send(Inbound::End);
        self.transport.unsubscribe().await
    }

    async fn dispatch_loop(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("dispatch loop already running"))?;

        let result = loop {
            match rx.recv().await {
                Some(Inbound::Envelope(envelope)) => {
                    if let Err(err) = self.handle(envelope).await {
                        break Err(err);
                    }
                }
                Some(Inbound::End) | None => break Ok(()),
            }
        };

        *self.inbound_rx.lock().await = Some(rx);
        result
    }

    async fn handle(self: &Arc<Self>, envelope: Envelope) -> anyhow::Result<()> {
        match envelope {
            Envelope::Request(call) => {
                let Some(reply_to) = call.reply_to.clone() else {
                    tracing::warn!(uid = %call.uid, "request with no reply_to, dropping");
                    return Ok(());
                };
                let reply = match self.executors.get(&call.namespace) {
                    None => Envelope::Failure {
                        uid: call.uid.clone(),
                        namespace: call.namespace.clone(),
                        class_name: "UnknownNamespace".into(),
                        args: vec![call.namespace.clone().into()],
                    },
                    Some(executor) => {
                        let executor = executor.clone();
                        let bound = Duration::from_millis(call.timeout_ms.max(1));
                        match timeout(bound, executor.call(&call.stack)).await {
                            Ok(Ok(value)) => Envelope::Result {
                                uid: call.uid.clone(),
                                namespace: call.namespace.clone(),
                                data: Payload::Inline(value),
                            },
                            Ok(Err(ExecutorFailure { class_name, args })) => Envelope::Failure {
                                uid: call.uid.clone(),
                                namespace: call.namespace.clone(),
                                class_name,
                                args,
                            },
                            Err(_elapsed) => Envelope::Failure {
                                uid: call.uid.clone(),
                                namespace: call.namespace.clone(),
                                class_name: "Timeout".into(),
                                args: vec![],
                            },
                        }
                    }
                };
                self.transport.publish(reply, &reply_to).await?;
                Ok(())
            }
            Envelope::SubscribeRequest(call) => {
                let Some(reply_to) = call.reply_to.clone() else {
                    tracing::warn!(uid = %call.uid, "subscribe request with no reply_to, dropping");
                    return Ok(());
                };
                let executor = match self.executors.get(&call.namespace) {
                    Some(e) if e.supports_streaming() => e.clone(),
                    Some(_) => {
                        let failure = Envelope::Failure {
                            uid: call.uid.clone(),
                            namespace: call.namespace.clone(),
                            class_name: "NotImplemented".into(),
                            args: vec![],
                        };
                        self.transport.publish(failure, &reply_to).await?;
                        return Ok(());
                    }
                    None => {
                        let failure = Envelope::Failure {
                            uid: call.uid.clone(),
                            namespace: call.namespace.clone(),
                            class_name: "UnknownNamespace".into(),
                            args: vec![call.namespace.clone().into()],
                        };
                        self.transport.publish(failure, &reply_to).await?;
                        return Ok(());
                    }
                };

                let publisher = Arc::new(Publisher::new(
                    call.uid.clone(),
                    call.namespace.clone(),
                    reply_to,
                    self.transport.clone() as Arc<dyn Transport>,
                    self.publishers.clone(),
                ));
                self.publishers.insert(call.uid.clone(), publisher.clone());

                tokio::spawn(async move {
                    if let Err(ExecutorFailure { class_name, args }) =
                        executor.stream(&call.stack, publisher.clone()).await
                    {
                        if publisher.is_active() {
                            tracing::warn!(uid = %call.uid, %class_name, ?args, "streaming executor failed");
                        }
                    }
                    publisher.set_inactive();
                });
                Ok(())
            }
            Envelope::UnsubscribeRequest { uid, .. } => {
                if let Some((_, publisher)) = self.publishers.remove(&uid) {
                    publisher.set_inactive();
                }
                Ok(())
            }
            Envelope::Result { .. } | Envelope::DataPoint { .. } | Envelope::Notice { .. } => {
                // A server only ever consumes requests and teardown notices
                // on its inbound topic; anything else arriving here is a
                // stray reply from an unrelated conversation.
                Ok(())
            }
        }
    }
}
