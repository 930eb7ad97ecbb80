use async_trait::async_trait;
use bytes::Bytes;
use courier_broker::{BrokerConfig, MemoryBroker};
use courier_core::{
    AckToken, Channel, ConsumeOptions, CorrelationId, Delivery, DeliveryHandler, Headers, QueueId,
    Subscription, TransportError,
};
use courier_rpc::{
    handler_fn, AsyncRpcClient, FibonacciService, HandlerError, HandlerFailurePolicy,
    RequestHandler, RpcClient, RpcError, RpcServer, RpcServerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REQUEST_QUEUE: &str = "rpc_queue";

struct TestServer {
    shutdown: CancellationToken,
    handle: JoinHandle<courier_rpc::Result<()>>,
}

impl TestServer {
    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn setup() -> (MemoryBroker, Arc<dyn Channel>) {
    let broker = MemoryBroker::new(BrokerConfig::default()).unwrap();
    broker.declare_queue(REQUEST_QUEUE).await.unwrap();
    let channel: Arc<dyn Channel> = Arc::new(broker.clone());
    (broker, channel)
}

fn start_server(
    channel: &Arc<dyn Channel>,
    config: RpcServerConfig,
    handler: Arc<dyn RequestHandler>,
) -> TestServer {
    let server = RpcServer::new(channel.clone(), config, handler);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { server.run(token).await });
    TestServer { shutdown, handle }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_fibonacci_round_trip() {
    let (_broker, channel) = setup().await;
    let server = start_server(&channel, RpcServerConfig::default(), Arc::new(FibonacciService));
    let client = AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE);

    let reply = client.call("5", Duration::from_secs(5)).await.unwrap();
    assert_eq!(reply, "5");
    assert_eq!(client.pending_calls(), 0);
    assert!(client.reply_queue().unwrap().as_str().starts_with("amq.gen-"));

    server.stop().await;
}

#[tokio::test]
async fn test_late_reply_does_not_leak_into_next_call() {
    let (_broker, channel) = setup().await;
    let handler = handler_fn(|request: Bytes| async move {
        if request == "slow" {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(request)
    });
    let server = start_server(&channel, RpcServerConfig::default(), Arc::new(handler));
    let client = AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE);

    match client.call("slow", Duration::from_millis(100)).await {
        Err(RpcError::Timeout(_)) => {}
        other => panic!("Expected timeout, got {:?}", other),
    }
    assert_eq!(client.pending_calls(), 0);

    // Served after the slow request, so the late reply lands first.
    let reply = client.call("fast", Duration::from_secs(5)).await.unwrap();
    assert_eq!(reply, "fast");
    assert_eq!(client.pending_calls(), 0);

    server.stop().await;
}

/// Replies to every request twice.
struct Stutter {
    channel: Arc<dyn Channel>,
}

#[async_trait]
impl DeliveryHandler for Stutter {
    async fn handle(&self, delivery: Delivery) {
        let id = delivery.headers.correlation_id.unwrap();
        let reply_to = delivery.headers.reply_to.unwrap();
        for _ in 0..2 {
            self.channel
                .publish(&reply_to, Headers::reply(id), delivery.payload.clone())
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn test_duplicate_replies_are_absorbed() {
    let (_broker, channel) = setup().await;
    let _subscription = channel
        .consume(
            &QueueId::from(REQUEST_QUEUE),
            ConsumeOptions::auto_ack(),
            Arc::new(Stutter {
                channel: channel.clone(),
            }),
        )
        .await
        .unwrap();
    let client = AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE);

    assert_eq!(client.call("one", Duration::from_secs(5)).await.unwrap(), "one");
    assert_eq!(client.call("two", Duration::from_secs(5)).await.unwrap(), "two");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_orphaned_reply_is_dropped() {
    let (_broker, channel) = setup().await;
    let server = start_server(&channel, RpcServerConfig::default(), Arc::new(FibonacciService));
    let client = AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE);
    client.call("1", Duration::from_secs(5)).await.unwrap();

    let reply_queue = client.reply_queue().unwrap().clone();
    channel
        .publish(&reply_queue, Headers::reply(CorrelationId::new()), Bytes::from("stray"))
        .await
        .unwrap();
    channel
        .publish(&reply_queue, Headers::default(), Bytes::from("no id"))
        .await
        .unwrap();

    assert_eq!(client.call("10", Duration::from_secs(5)).await.unwrap(), "55");
    assert_eq!(client.pending_calls(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_calls_share_one_reply_queue() {
    let (_broker, channel) = setup().await;
    let config = RpcServerConfig {
        concurrency: 3,
        ..Default::default()
    };
    let server = start_server(&channel, config, Arc::new(FibonacciService));
    let client = Arc::new(AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE));

    let calls: Vec<_> = (0..20u64)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                let reply = client.call(n.to_string(), Duration::from_secs(5)).await.unwrap();
                (n, reply)
            })
        })
        .collect();

    for call in calls {
        let (n, reply) = call.await.unwrap();
        assert_eq!(reply, FibonacciService::fib(n).unwrap().to_string());
    }
    assert_eq!(client.pending_calls(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_request_without_headers_is_acked_and_dropped() {
    let (broker, channel) = setup().await;
    let server = start_server(&channel, RpcServerConfig::default(), Arc::new(FibonacciService));
    let queue = QueueId::from(REQUEST_QUEUE);
    wait_until(|| broker.consumer_count(&queue) == 1).await;

    channel
        .publish(&queue, Headers::default(), Bytes::from("5"))
        .await
        .unwrap();
    wait_until(|| broker.metrics().messages("acked", REQUEST_QUEUE) == 1).await;
    assert_eq!(broker.queue_depth(&queue), Some(0));
    assert_eq!(broker.unacked_count(&queue), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_handler_failure_is_acked_and_dropped_by_default() {
    let (broker, channel) = setup().await;
    let server = start_server(&channel, RpcServerConfig::default(), Arc::new(FibonacciService));
    let client = AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE);

    match client.call("not a number", Duration::from_millis(200)).await {
        Err(RpcError::Timeout(_)) => {}
        other => panic!("Expected timeout, got {:?}", other),
    }
    assert_eq!(broker.metrics().messages("requeued", REQUEST_QUEUE), 0);
    assert_eq!(client.call("6", Duration::from_secs(5)).await.unwrap(), "8");

    server.stop().await;
}

#[tokio::test]
async fn test_requeue_policy_retries_failed_request() {
    let (broker, channel) = setup().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let handler = handler_fn(move |request: Bytes| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HandlerError::Failed("transient".into()))
            } else {
                Ok(request)
            }
        }
    });
    let config = RpcServerConfig {
        failure_policy: HandlerFailurePolicy::Requeue,
        ..Default::default()
    };
    let server = start_server(&channel, config, Arc::new(handler));
    let client = AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE);

    assert_eq!(client.call("retry", Duration::from_secs(5)).await.unwrap(), "retry");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(broker.metrics().messages("requeued", REQUEST_QUEUE), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_publish_failure_fails_call_immediately() {
    let (_broker, channel) = setup().await;
    let client = AsyncRpcClient::new(channel.clone(), "missing_queue");

    match client.call("5", Duration::from_secs(5)).await {
        Err(RpcError::Transport(TransportError::QueueNotFound(queue))) => {
            assert_eq!(queue.as_str(), "missing_queue");
        }
        other => panic!("Expected QueueNotFound, got {:?}", other),
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_call_json() {
    let (_broker, channel) = setup().await;
    let handler = handler_fn(|request: Bytes| async move {
        let values: Vec<u64> = serde_json::from_slice(&request)
            .map_err(|e| HandlerError::InvalidRequest(e.to_string()))?;
        let sum: u64 = values.iter().sum();
        Ok(Bytes::from(serde_json::to_vec(&sum).unwrap()))
    });
    let server = start_server(&channel, RpcServerConfig::default(), Arc::new(handler));
    let client = AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE);

    let sum: u64 = client
        .call_json(&vec![1u64, 2, 3], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(sum, 6);

    server.stop().await;
}

#[tokio::test]
async fn test_close_removes_reply_queue() {
    let (broker, channel) = setup().await;
    let server = start_server(&channel, RpcServerConfig::default(), Arc::new(FibonacciService));
    let client = AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE);
    client.call("3", Duration::from_secs(5)).await.unwrap();

    let reply_queue = client.reply_queue().unwrap().clone();
    assert!(broker.queue_exists(&reply_queue));

    client.close().await.unwrap();
    assert!(!broker.queue_exists(&reply_queue));
    assert!(client.call("3", Duration::from_secs(1)).await.is_err());

    server.stop().await;
}

#[tokio::test]
async fn test_broker_loss_fails_waiting_calls() {
    let (broker, channel) = setup().await;
    let client = Arc::new(AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE));

    let started = Instant::now();
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call("5", Duration::from_secs(2)).await })
    };
    wait_until(|| client.pending_calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.close();

    match call.await.unwrap() {
        Err(RpcError::Transport(TransportError::Closed)) => {}
        other => panic!("Expected Closed, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    assert_eq!(client.pending_calls(), 0);
    assert!(matches!(
        client.call("5", Duration::from_secs(2)).await,
        Err(RpcError::Transport(TransportError::Closed))
    ));
}

fn message_series(broker: &MemoryBroker) -> usize {
    broker
        .metrics()
        .registry
        .gather()
        .iter()
        .filter(|family| family.get_name() == "courier_messages_total")
        .map(|family| family.get_metric().len())
        .sum()
}

#[tokio::test]
async fn test_closed_clients_leave_no_metric_series() {
    let (broker, channel) = setup().await;
    let server = start_server(&channel, RpcServerConfig::default(), Arc::new(FibonacciService));

    let mut counts = Vec::new();
    for _ in 0..3 {
        for _ in 0..10 {
            let client = AsyncRpcClient::new(channel.clone(), REQUEST_QUEUE);
            client.call("7", Duration::from_secs(5)).await.unwrap();
            client.close().await.unwrap();
        }
        counts.push(message_series(&broker));
    }
    assert!(counts.windows(2).all(|w| w[0] == w[1]), "series grew: {:?}", counts);

    server.stop().await;
}

/// Delegates to a broker, failing selected operations.
struct FaultyChannel {
    broker: MemoryBroker,
    refuse_consume: bool,
    full_prefix: Option<&'static str>,
    declared: Mutex<Vec<QueueId>>,
}

impl FaultyChannel {
    fn new(broker: MemoryBroker) -> Self {
        FaultyChannel {
            broker,
            refuse_consume: false,
            full_prefix: None,
            declared: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Channel for FaultyChannel {
    async fn declare_queue(&self, name: &str) -> courier_core::Result<QueueId> {
        self.broker.declare_queue(name).await
    }

    async fn declare_temporary_queue(&self) -> courier_core::Result<QueueId> {
        let queue = self.broker.declare_temporary_queue().await?;
        self.declared.lock().unwrap().push(queue.clone());
        Ok(queue)
    }

    async fn delete_queue(&self, queue: &QueueId) -> courier_core::Result<()> {
        self.broker.delete_queue(queue).await
    }

    async fn publish(
        &self,
        destination: &QueueId,
        headers: Headers,
        payload: Bytes,
    ) -> courier_core::Result<()> {
        if let Some(prefix) = self.full_prefix {
            if destination.as_str().starts_with(prefix) {
                return Err(TransportError::QueueFull {
                    queue: destination.clone(),
                    depth: 0,
                });
            }
        }
        self.broker.publish(destination, headers, payload).await
    }

    async fn consume(
        &self,
        queue: &QueueId,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> courier_core::Result<Subscription> {
        if self.refuse_consume {
            return Err(TransportError::ConsumerTagInUse("reply".into()));
        }
        self.broker.consume(queue, options, handler).await
    }

    async fn ack(&self, token: AckToken) -> courier_core::Result<()> {
        self.broker.ack(token).await
    }

    async fn nack(&self, token: AckToken, requeue: bool) -> courier_core::Result<()> {
        self.broker.nack(token, requeue).await
    }
}

#[tokio::test]
async fn test_failed_reply_subscription_removes_queue() {
    let (broker, _channel) = setup().await;
    let faulty = Arc::new(FaultyChannel {
        refuse_consume: true,
        ..FaultyChannel::new(broker.clone())
    });
    let client = AsyncRpcClient::new(faulty.clone(), REQUEST_QUEUE);

    assert!(matches!(
        client.call("5", Duration::from_secs(1)).await,
        Err(RpcError::Transport(TransportError::ConsumerTagInUse(_)))
    ));
    assert!(client.reply_queue().is_none());

    let declared = faulty.declared.lock().unwrap().clone();
    assert_eq!(declared.len(), 1);
    assert!(!broker.queue_exists(&declared[0]));
}

#[tokio::test]
async fn test_full_reply_queue_drops_request() {
    let (broker, _channel) = setup().await;
    let faulty: Arc<dyn Channel> = Arc::new(FaultyChannel {
        full_prefix: Some("amq.gen-"),
        ..FaultyChannel::new(broker.clone())
    });
    let server = start_server(&faulty, RpcServerConfig::default(), Arc::new(FibonacciService));
    let client = AsyncRpcClient::new(faulty.clone(), REQUEST_QUEUE);

    match client.call("5", Duration::from_millis(200)).await {
        Err(RpcError::Timeout(_)) => {}
        other => panic!("Expected timeout, got {:?}", other),
    }
    let queue = QueueId::from(REQUEST_QUEUE);
    wait_until(|| broker.metrics().messages("acked", REQUEST_QUEUE) == 1).await;
    assert_eq!(broker.metrics().messages("requeued", REQUEST_QUEUE), 0);
    assert_eq!(broker.metrics().messages("delivered", REQUEST_QUEUE), 1);
    assert_eq!(broker.queue_depth(&queue), Some(0));
    assert_eq!(broker.unacked_count(&queue), 0);

    server.stop().await;
}

#[test]
fn test_blocking_client_across_threads() {
    let server_runtime = tokio::runtime::Runtime::new().unwrap();
    let broker = MemoryBroker::new(BrokerConfig::default()).unwrap();
    let channel: Arc<dyn Channel> = Arc::new(broker.clone());
    let shutdown = CancellationToken::new();

    server_runtime.block_on(async {
        broker.declare_queue(REQUEST_QUEUE).await.unwrap();
    });
    let server = RpcServer::new(
        channel.clone(),
        RpcServerConfig {
            concurrency: 2,
            ..Default::default()
        },
        Arc::new(FibonacciService),
    );
    let token = shutdown.clone();
    let handle = server_runtime.spawn(async move { server.run(token).await });

    let client = RpcClient::new(channel.clone(), REQUEST_QUEUE).unwrap();
    std::thread::scope(|scope| {
        for n in [5u64, 10, 20, 30] {
            let client = &client;
            scope.spawn(move || {
                let reply = client.call(n.to_string(), Duration::from_secs(5)).unwrap();
                assert_eq!(reply, FibonacciService::fib(n).unwrap().to_string());
            });
        }
    });
    assert_eq!(client.pending_calls(), 0);

    let reply_queue = client.reply_queue().unwrap().clone();
    drop(client);
    assert!(!broker.queue_exists(&reply_queue));

    shutdown.cancel();
    server_runtime.block_on(handle).unwrap().unwrap();
}
