//! Server-side RPC core: dispatch loop, namespace registry and
//! the streaming publisher lifecycle, generic over any [`rpc_transport::Transport`].
//!
//! A [`Server`] owns zero broker connection logic itself — it only knows how
//! to turn inbound [`rpc_proto::Envelope`]s into executor calls and
//! [`rpc_proto::Envelope::Result`]/[`rpc_proto::Envelope::Failure`] replies.

pub mod executor;
pub mod publisher;
pub mod server;

pub use executor::{DefaultExecutor, Executor, ExecutorFailure, Resource, ValueResource};
pub use publisher::Publisher;
pub use server::Server;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use rpc_proto::{Envelope, MethodCall, Payload, Value};
    use rpc_transport::{EnvelopeCallback, Transport};
    use tokio::sync::Mutex;

    use super::*;

    /// An in-process [`Transport`] double: publishing to a topic invokes
    /// whichever callback last registered for that same topic string,
    /// counting "subscriber" as 1 if someone is listening on it, else 0.
    #[derive(Default)]
    struct LoopbackTransport {
        listeners: Mutex<Vec<(String, EnvelopeCallback)>>,
        inbound_topic: String,
    }

    impl LoopbackTransport {
        fn new(inbound_topic: impl Into<String>) -> Self {
            Self {
                listeners: Mutex::new(Vec::new()),
                inbound_topic: inbound_topic.into(),
            }
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn do_subscribe(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn publish(&self, envelope: Envelope, topic: &str) -> anyhow::Result<usize> {
            let listeners = self.listeners.lock().await;
            let mut count = 0;
            for (t, cb) in listeners.iter() {
                if t == topic {
                    cb(envelope.clone());
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn subscribe(&self, on_event: EnvelopeCallback) -> anyhow::Result<()> {
            self.listeners
                .lock()
                .await
                .push((self.inbound_topic.clone(), on_event));
            Ok(())
        }

        async fn unsubscribe(&self) -> anyhow::Result<()> {
            self.listeners.lock().await.clear();
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.unsubscribe().await
        }
    }

    struct Multiply;

    impl Resource for Multiply {
        fn invoke(
            &self,
            method: &str,
            args: &[Value],
            _kwargs: &[(String, Value)],
        ) -> Result<Box<dyn Resource>, ExecutorFailure> {
            match method {
                "multiply" => {
                    let [Value::Int(a), Value::Int(b)] = args else {
                        return Err(ExecutorFailure::new("TypeError", vec![]));
                    };
                    Ok(Box::new(ValueResource(Value::Int(a * b))))
                }
                other => Err(ExecutorFailure::attribute_error(other)),
            }
        }

        fn to_value(&self) -> Value {
            Value::Nil
        }
    }

    #[tokio::test]
    async fn dispatches_request_and_replies_on_reply_to() {
        let transport = Arc::new(LoopbackTransport::new("T-in"));
        let server = Server::new(transport.clone());
        server
            .register("T", Arc::new(DefaultExecutor::new(|| Box::new(Multiply) as Box<dyn Resource>)))
            .unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let got = received.clone();
        transport
            .listeners
            .lock()
            .await
            .push((
                "caller-reply".into(),
                Arc::new(move |envelope: Envelope| {
                    if let Envelope::Result { data: Payload::Inline(Value::Int(10_000)), .. } = envelope {
                        got.store(1, Ordering::SeqCst);
                    }
                }),
            ));

        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };

        // Give the subscribe task a moment to register before publishing.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut call = rpc_proto::Call::new("uid-1", "T", 5_000);
        call.reply_to = Some("caller-reply".into());
        call.stack = vec![MethodCall::new("multiply").with_args(vec![Value::Int(100), Value::Int(100)])];
        transport
            .publish(Envelope::Request(call), "T-in")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);

        server.stop().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
    }

    #[tokio::test]
    async fn unknown_namespace_becomes_failure() {
        let transport = Arc::new(LoopbackTransport::new("T-in"));
        let server = Server::new(transport.clone());

        let failure_class = Arc::new(Mutex::new(None));
        let slot = failure_class.clone();
        transport
            .listeners
            .lock()
            .await
            .push((
                "caller-reply".into(),
                Arc::new(move |envelope: Envelope| {
                    if let Envelope::Failure { class_name, .. } = envelope {
                        let slot = slot.clone();
                        tokio::spawn(async move {
                            *slot.lock().await = Some(class_name);
                        });
                    }
                }),
            ));

        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut call = rpc_proto::Call::new("uid-2", "missing", 5_000);
        call.reply_to = Some("caller-reply".into());
        transport
            .publish(Envelope::Request(call), "T-in")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(failure_class.lock().await.as_deref(), Some("UnknownNamespace"));

        server.stop().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
    }

    #[test]
    fn duplicate_namespace_registration_collides() {
        struct Noop;
        #[async_trait]
        impl Executor for Noop {
            async fn call(&self, _stack: &[MethodCall]) -> Result<Value, ExecutorFailure> {
                Ok(Value::Nil)
            }
        }
        let transport = Arc::new(LoopbackTransport::new("T-in"));
        let server = Server::new(transport);
        server.register("dup", Arc::new(Noop)).unwrap();
        assert!(matches!(
            server.register("dup", Arc::new(Noop)),
            Err(rpc_proto::RpcError::NamespaceCollision(_))
        ));
    }

    #[tokio::test]
    async fn dispatches_chained_call_across_resources() {
        struct Root;
        impl Resource for Root {
            fn invoke(
                &self,
                method: &str,
                _args: &[Value],
                _kwargs: &[(String, Value)],
            ) -> Result<Box<dyn Resource>, ExecutorFailure> {
                match method {
                    "integer" => Ok(Box::new(IntegerResource)),
                    other => Err(ExecutorFailure::attribute_error(other)),
                }
            }

            fn to_value(&self) -> Value {
                Value::Nil
            }
        }

        struct IntegerResource;
        impl Resource for IntegerResource {
            fn invoke(
                &self,
                method: &str,
                args: &[Value],
                _kwargs: &[(String, Value)],
            ) -> Result<Box<dyn Resource>, ExecutorFailure> {
                match method {
                    "multiply" => {
                        let [Value::Int(a), Value::Int(b)] = args else {
                            return Err(ExecutorFailure::new("TypeError", vec![]));
                        };
                        Ok(Box::new(ValueResource(Value::Int(a * b))))
                    }
                    other => Err(ExecutorFailure::attribute_error(other)),
                }
            }

            fn to_value(&self) -> Value {
                Value::Nil
            }
        }

        let transport = Arc::new(LoopbackTransport::new("T-in"));
        let server = Server::new(transport.clone());
        server
            .register("T", Arc::new(DefaultExecutor::new(|| Box::new(Root) as Box<dyn Resource>)))
            .unwrap();

        let received = Arc::new(Mutex::new(None));
        let got = received.clone();
        transport.listeners.lock().await.push((
            "caller-reply".into(),
            Arc::new(move |envelope: Envelope| {
                if let Envelope::Result {
                    data: Payload::Inline(v),
                    ..
                } = envelope
                {
                    let got = got.clone();
                    tokio::spawn(async move {
                        *got.lock().await = Some(v);
                    });
                }
            }),
        ));

        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut call = rpc_proto::Call::new("uid-chained", "T", 5_000);
        call.reply_to = Some("caller-reply".into());
        call.stack = vec![
            MethodCall::new("integer"),
            MethodCall::new("multiply").with_args(vec![Value::Int(100), Value::Int(100)]),
        ];
        transport
            .publish(Envelope::Request(call), "T-in")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.lock().await.clone(), Some(Value::Int(10_000)));

        server.stop().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
    }

    #[tokio::test]
    async fn streaming_publisher_retires_after_unsubscribe() {
        struct CountingExecutor;
        #[async_trait]
        impl Executor for CountingExecutor {
            async fn call(&self, _stack: &[MethodCall]) -> Result<Value, ExecutorFailure> {
                Ok(Value::Nil)
            }

            fn supports_streaming(&self) -> bool {
                true
            }

            async fn stream(
                &self,
                _stack: &[MethodCall],
                publisher: Arc<Publisher>,
            ) -> Result<(), ExecutorFailure> {
                for i in 0..50i64 {
                    if !publisher.is_active() {
                        break;
                    }
                    if publisher.publish(Value::Int(i)).await == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(())
            }
        }

        let transport = Arc::new(LoopbackTransport::new("T-in"));
        let server = Server::new(transport.clone());
        server.register("counter", Arc::new(CountingExecutor)).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let got = received.clone();
        transport.listeners.lock().await.push((
            "caller-reply".into(),
            Arc::new(move |envelope: Envelope| {
                if let Envelope::DataPoint {
                    data: Payload::Inline(Value::Int(n)),
                    ..
                } = envelope
                {
                    let got = got.clone();
                    tokio::spawn(async move {
                        got.lock().await.push(n);
                    });
                }
            }),
        ));

        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut call = rpc_proto::Call::new("sub-1", "counter", 5_000);
        call.reply_to = Some("caller-reply".into());
        transport
            .publish(Envelope::SubscribeRequest(call), "T-in")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(server.publisher_count(), 1, "publisher should still be registered mid-stream");

        transport
            .publish(
                Envelope::UnsubscribeRequest {
                    uid: "sub-1".into(),
                    namespace: "counter".into(),
                },
                "T-in",
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.publisher_count(), 0, "publisher should be gone once cancelled");

        let count_at_cancel = received.lock().await.len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let count_after_wait = received.lock().await.len();
        assert_eq!(
            count_at_cancel, count_after_wait,
            "no further data points should be emitted after the publisher is cancelled"
        );

        server.stop().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
    }
}
