//! Redis-backed [`Transport`]: plain pub/sub for envelope delivery, plus a
//! key/value sideband for `Result`/`DataPoint` payloads so large call
//! results never ride the pub/sub channel itself.
//!
//! A request's `reply_to` is always stamped with this transport's own
//! subchannel at publish time, and any non-nil result payload is written
//! under a random key with a short expiry rather than inlined.
//!
//! [`Transport::subscribe`] is the blocking read loop described below —
//! it returns only once [`Transport::unsubscribe`] fires — so `Server` and
//! `Client` can supervise it directly as one of their two cooperating
//! tasks instead of this crate running a hidden
//! background task neither of them can observe failing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use rpc_proto::{Codec, Envelope, Payload};
use rpc_transport::{EnvelopeCallback, Transport};
use tokio::sync::oneshot;

/// Seconds a sidebanded result survives in Redis before expiring unread.
pub const DEFAULT_RESULT_EXPIRE_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct RedisTransportConfig {
    /// `redis://host:port` connection string.
    pub url: String,
    /// This transport's own inbound topic. Stamped onto outgoing
    /// `Request`/`SubscribeRequest` envelopes as `reply_to`.
    pub subchannel: String,
    pub result_expire_secs: u64,
}

impl RedisTransportConfig {
    pub fn new(url: impl Into<String>, subchannel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subchannel: subchannel.into(),
            result_expire_secs: DEFAULT_RESULT_EXPIRE_SECS,
        }
    }
}

pub struct RedisTransport {
    config: RedisTransportConfig,
    client: redis::Client,
    manager: ConnectionManager,
    codec: Arc<Codec>,
    listeners: Arc<RwLock<Vec<EnvelopeCallback>>>,
    /// Set by `do_subscribe`, taken by the first `subscribe` call that
    /// actually drives the read loop.
    pubsub: Mutex<Option<PubSub>>,
    /// Fired by `unsubscribe` to break the loop inside `subscribe`.
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
    cancel_rx: Mutex<Option<oneshot::Receiver<()>>>,
    subscribed: Arc<AtomicBool>,
    driving: AtomicBool,
}

impl RedisTransport {
    pub async fn connect(config: RedisTransportConfig, codec: Arc<Codec>) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.url.clone())?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            config,
            client,
            manager,
            codec,
            listeners: Arc::new(RwLock::new(Vec::new())),
            pubsub: Mutex::new(None),
            cancel_tx: Mutex::new(None),
            cancel_rx: Mutex::new(None),
            subscribed: Arc::new(AtomicBool::new(false)),
            driving: AtomicBool::new(false),
        })
    }

    pub fn subchannel(&self) -> &str {
        &self.config.subchannel
    }

    async fn resolve_sideband(
        manager: &mut ConnectionManager,
        codec: &Codec,
        data: &mut Payload,
    ) -> anyhow::Result<()> {
        if let Payload::SidebandKey(key) = data {
            let bytes: Vec<u8> = manager.get(&*key).await?;
            let _: () = manager.del(&*key).await?;
            *data = Payload::Inline(codec.decode(&bytes)?);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn do_subscribe(&self) -> anyhow::Result<()> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.config.subchannel).await?;
        *self.pubsub.lock() = Some(pubsub);

        let (tx, rx) = oneshot::channel();
        *self.cancel_tx.lock() = Some(tx);
        *self.cancel_rx.lock() = Some(rx);
        Ok(())
    }

    async fn publish(&self, mut envelope: Envelope, topic: &str) -> anyhow::Result<usize> {
        match &mut envelope {
            Envelope::Request(call) | Envelope::SubscribeRequest(call) => {
                call.reply_to = Some(self.config.subchannel.clone());
            }
            Envelope::Result { data, .. } | Envelope::DataPoint { data, .. } => {
                if let Payload::Inline(value) = data {
                    if !value.is_nil() {
                        let key = uuid::Uuid::new_v4().simple().to_string();
                        let bytes = self.codec.encode(value)?;
                        let mut manager = self.manager.clone();
                        let _: () = manager
                            .set_ex(&key, bytes.to_vec(), self.config.result_expire_secs)
                            .await?;
                        *data = Payload::SidebandKey(key);
                    }
                }
            }
            Envelope::UnsubscribeRequest { .. }
            | Envelope::Failure { .. }
            | Envelope::Notice { .. } => {}
        }

        let bytes = self.codec.encode(&envelope.to_value())?;
        let mut manager = self.manager.clone();
        let receivers: usize = manager.publish(topic, bytes.to_vec()).await?;
        Ok(receivers)
    }

    /// Registers `on_event`. The first caller becomes the driving loop and
    /// blocks here, consuming the pub/sub stream opened by `do_subscribe`,
    /// until `unsubscribe()` fires; later callers (if any) just append
    /// their callback and return immediately, fed by the loop already
    /// running.
    async fn subscribe(&self, on_event: EnvelopeCallback) -> anyhow::Result<()> {
        self.listeners.write().push(on_event);

        if self.driving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut pubsub = self
            .pubsub
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("do_subscribe must complete before subscribe"))?;
        let mut cancel = self
            .cancel_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("do_subscribe must complete before subscribe"))?;

        let listeners = self.listeners.clone();
        let codec = self.codec.clone();
        let mut manager = self.manager.clone();

        let mut stream = pubsub.on_message();
        let disconnected = loop {
            tokio::select! {
                biased;
                _ = &mut cancel => break false,
                next = stream.next() => {
                    let Some(msg) = next else { break true };
                    let payload: Vec<u8> = match msg.get_payload() {
                        Ok(p) => p,
                        Err(err) => {
                            tracing::warn!(?err, "dropping unreadable redis pub/sub payload");
                            continue;
                        }
                    };
                    let envelope = match codec
                        .decode(&payload)
                        .map_err(anyhow::Error::from)
                        .and_then(|v| Envelope::from_value(&v).map_err(anyhow::Error::from))
                    {
                        Ok(e) => e,
                        Err(err) => {
                            tracing::warn!(?err, "dropping malformed envelope");
                            continue;
                        }
                    };
                    let envelope = match resolve_if_sidebanded(envelope, &mut manager, &codec).await {
                        Ok(e) => e,
                        Err(err) => {
                            tracing::warn!(?err, "failed to resolve sidebanded payload");
                            continue;
                        }
                    };
                    for cb in listeners.read().iter() {
                        cb(envelope.clone());
                    }
                    continue;
                }
            }
        };

        self.driving.store(false, Ordering::SeqCst);
        self.subscribed.store(false, Ordering::SeqCst);
        if disconnected {
            anyhow::bail!("redis pub/sub connection ended before unsubscribe() was called");
        }
        Ok(())
    }

    async fn unsubscribe(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.cancel_tx.lock().take() {
            let _ = tx.send(());
        }
        self.listeners.write().clear();
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.unsubscribe().await
    }
}

async fn resolve_if_sidebanded(
    mut envelope: Envelope,
    manager: &mut ConnectionManager,
    codec: &Codec,
) -> anyhow::Result<Envelope> {
    match &mut envelope {
        Envelope::Result { data, .. } | Envelope::DataPoint { data, .. } => {
            RedisTransport::resolve_sideband(manager, codec, data).await?;
        }
        _ => {}
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_default_expiry() {
        let cfg = RedisTransportConfig::new("redis://localhost:6379", "client.abc123");
        assert_eq!(cfg.result_expire_secs, DEFAULT_RESULT_EXPIRE_SECS);
        assert_eq!(cfg.subchannel, "client.abc123");
    }
}
