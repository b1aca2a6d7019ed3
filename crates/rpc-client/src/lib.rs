//! Client-side RPC core: fan-in queue, pending-call table,
//! subscription table, served vs. one-shot call modes, and Failure →
//! `RpcError` reconstruction — generic over any [`rpc_transport::Transport`].

pub mod client;
pub mod subscription;

pub use client::{Client, ClientConfig, NoticeHandler};
pub use subscription::Subscription;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use rpc_proto::{Envelope, MethodCall, Payload, RpcError, Value};
    use rpc_transport::{EnvelopeCallback, Transport};
    use tokio::sync::Mutex;

    use super::*;

    /// An in-process broker double shared by both client and server test
    /// suites in spirit: publishing to a topic fans out to every callback
    /// currently registered for that topic.
    #[derive(Default)]
    struct LoopbackTransport {
        listeners: Mutex<Vec<(String, EnvelopeCallback)>>,
        inbound_topic: Mutex<Option<String>>,
    }

    impl LoopbackTransport {
        fn new() -> Self {
            Self {
                listeners: Mutex::new(Vec::new()),
                inbound_topic: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn do_subscribe(&self) -> anyhow::Result<()> {
            let mut topic = self.inbound_topic.lock().await;
            if topic.is_none() {
                *topic = Some("client-reply".to_string());
            }
            Ok(())
        }

        async fn publish(&self, mut envelope: Envelope, topic: &str) -> anyhow::Result<usize> {
            if let Envelope::Request(call) | Envelope::SubscribeRequest(call) = &mut envelope {
                call.reply_to = self.inbound_topic.lock().await.clone();
            }
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
            let topic = self
                .inbound_topic
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| "client-reply".into());
            self.listeners.lock().await.push((topic, on_event));
            // Mirrors the real transport's blocking contract loosely enough
            // for tests: parks until the test unsubscribes.
            futures::future::pending::<()>().await;
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

    /// A transport whose one registered listener answers every Request it
    /// sees immediately and synchronously — enough to exercise one-shot
    /// `call()` without a real broker or server.
    struct EchoServerTransport {
        inbound_topic: Mutex<Option<String>>,
        listeners: Mutex<Vec<(String, EnvelopeCallback)>>,
    }

    impl EchoServerTransport {
        fn new() -> Self {
            Self {
                inbound_topic: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for EchoServerTransport {
        async fn do_subscribe(&self) -> anyhow::Result<()> {
            let mut topic = self.inbound_topic.lock().await;
            if topic.is_none() {
                *topic = Some("client-reply".to_string());
            }
            Ok(())
        }

        async fn publish(&self, mut envelope: Envelope, topic: &str) -> anyhow::Result<usize> {
            if let Envelope::Request(call) = &mut envelope {
                call.reply_to = self.inbound_topic.lock().await.clone();
            }
            if let Envelope::Request(call) = &envelope {
                let reply_to = call.reply_to.clone().unwrap();
                let reply = match call.namespace.as_str() {
                    "T" if call.stack.len() == 1 && call.stack[0].name == "multiply" => {
                        let (Value::Int(a), Value::Int(b)) = (&call.stack[0].args[0], &call.stack[0].args[1]) else {
                            unreachable!()
                        };
                        Envelope::Result {
                            uid: call.uid.clone(),
                            namespace: call.namespace.clone(),
                            data: Payload::Inline(Value::Int(a * b)),
                        }
                    }
                    "T" if call.stack.len() == 1 && call.stack[0].name == "boom" => Envelope::Failure {
                        uid: call.uid.clone(),
                        namespace: call.namespace.clone(),
                        class_name: "CustomException".into(),
                        args: vec![Value::Str("boom".into())],
                    },
                    "T" if call.stack.len() == 1 && call.stack[0].name == "get_item" => Envelope::Failure {
                        uid: call.uid.clone(),
                        namespace: call.namespace.clone(),
                        class_name: "KeyError".into(),
                        args: call.stack[0].args.clone(),
                    },
                    "slow" => return Ok(0), // simulate no responder, caller hits Timeout/NotDelivered
                    _ => Envelope::Failure {
                        uid: call.uid.clone(),
                        namespace: call.namespace.clone(),
                        class_name: "UnknownNamespace".into(),
                        args: vec![],
                    },
                };
                let listeners = self.listeners.lock().await;
                for (t, cb) in listeners.iter() {
                    if *t == reply_to {
                        cb(reply.clone());
                    }
                }
                return Ok(1);
            }
            Ok(0)
        }

        async fn subscribe(&self, on_event: EnvelopeCallback) -> anyhow::Result<()> {
            let topic = self
                .inbound_topic
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| "client-reply".into());
            self.listeners.lock().await.push((topic, on_event));
            futures::future::pending::<()>().await;
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

    fn multiply_stack(a: i64, b: i64) -> Vec<MethodCall> {
        vec![MethodCall::new("multiply").with_args(vec![Value::Int(a), Value::Int(b)])]
    }

    #[tokio::test]
    async fn one_shot_call_returns_result() {
        let transport = Arc::new(EchoServerTransport::new());
        let client = Client::new(transport, ClientConfig::new("T-in"));
        let value = client.call("T", multiply_stack(100, 100), None).await.unwrap();
        assert_eq!(value, Value::Int(10_000));
    }

    #[tokio::test]
    async fn one_shot_call_wraps_unknown_failure() {
        let transport = Arc::new(EchoServerTransport::new());
        let client = Client::new(transport, ClientConfig::new("T-in"));
        let err = client
            .call("T", vec![MethodCall::new("boom")], None)
            .await
            .unwrap_err();
        match err {
            RpcError::WrappedFailure { class_name, args } => {
                assert_eq!(class_name, "CustomException");
                assert_eq!(args, vec![Value::Str("boom".into())]);
            }
            other => panic!("expected WrappedFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_shot_call_reconstructs_builtin_error() {
        let transport = Arc::new(EchoServerTransport::new());
        let client = Client::new(transport, ClientConfig::new("T-in"));
        let err = client
            .call(
                "T",
                vec![MethodCall::new("get_item").with_args(vec![Value::Str("absent".into())])],
                None,
            )
            .await
            .unwrap_err();
        match err {
            RpcError::Builtin { kind, args } => {
                assert_eq!(kind, rpc_proto::BuiltinErrorKind::KeyError);
                assert_eq!(args, vec![Value::Str("absent".into())]);
            }
            other => panic!("expected Builtin(KeyError), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_shot_call_with_no_subscriber_is_not_delivered() {
        let transport = Arc::new(EchoServerTransport::new());
        let client = Client::new(transport, ClientConfig::new("slow"));
        let err = client.call("slow", vec![], None).await.unwrap_err();
        assert!(matches!(err, RpcError::NotDelivered));
    }

    #[tokio::test]
    async fn served_mode_call_times_out_with_no_responder() {
        let transport = Arc::new(LoopbackTransport::new());
        let client = Client::new(transport, ClientConfig::new("T-in"));
        let serve_client = client.clone();
        let serve_task = tokio::spawn(async move { serve_client.serve().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = client
            .call("T", vec![], Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(RpcError::Timeout)));

        client.close().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), serve_task).await;
    }

    #[tokio::test]
    async fn subscription_delivers_data_points_until_closed() {
        let transport = Arc::new(LoopbackTransport::new());
        let client = Client::new(transport.clone(), ClientConfig::new("T-in"));
        let serve_client = client.clone();
        let serve_task = tokio::spawn(async move { serve_client.serve().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sub = client.subscribe_call("counter", vec![], None).await.unwrap();
        let uid = sub.uid().to_string();

        let produced = Arc::new(AtomicU64::new(0));
        {
            let produced = produced.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                for i in 0..20u64 {
                    let env = Envelope::DataPoint {
                        uid: uid.clone(),
                        namespace: "counter".into(),
                        data: Payload::Inline(Value::Int(i as i64)),
                    };
                    transport.publish(env, "client-reply").await.unwrap();
                    produced.store(i + 1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            });
        }

        let mut seen = Vec::new();
        while let Some(item) = sub.next().await {
            let v = item.unwrap();
            if let Value::Int(n) = v {
                seen.push(n);
                if n > 5 {
                    break;
                }
            }
        }
        sub.close().await.unwrap();

        assert!(seen.first() == Some(&0));
        assert!(*seen.last().unwrap() > 5);

        client.close().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), serve_task).await;
    }
}
