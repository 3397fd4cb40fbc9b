//! Streaming calls: fan-out aggregation, batching, failure, cancellation.

use rookery::mailbox::Outbox;
use rookery::messaging::Headers;
use rookery::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

fn new_runtime() -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
    Runtime::new()
}

/// Stream producer: counts up on `range`, fails mid-stream on `break_after`,
/// and polls cancellation on `until_cancelled`.
struct RangeStub;

impl Stub for RangeStub {
    fn stream(
        &mut self,
        _outbox: &mut Outbox,
        method: &str,
        _headers: &Headers,
        sink: StreamResult,
        args: Vec<Value>,
    ) -> Result<(), ServiceError> {
        match method {
            "range" => {
                let n = args.first().and_then(Value::as_u64).unwrap_or(0);
                for i in 0..n {
                    sink.accept(json!(i));
                }
                sink.ok();
                Ok(())
            }
            "break_after" => {
                let n = args.first().and_then(Value::as_u64).unwrap_or(0);
                for i in 0..n {
                    sink.accept(json!(i));
                }
                sink.fail(ServiceError::Execution("stream broke".into()));
                Ok(())
            }
            "until_cancelled" => {
                for i in 0..10_000u64 {
                    if sink.is_cancelled() {
                        break;
                    }
                    sink.accept(json!(i));
                }
                sink.ok();
                Ok(())
            }
            _ => Err(ServiceError::Execution(format!("unknown stream {method}"))),
        }
    }
}

/// Kicks a stream off from inside its own mailbox on `start`, so batches
/// travel back through this service's queue.
struct ProxyStub {
    backend: ServiceRef,
    sink: Arc<CollectSink>,
}

impl Stub for ProxyStub {
    fn send(
        &mut self,
        outbox: &mut Outbox,
        method: &str,
        _headers: &Headers,
        args: Vec<Value>,
    ) -> Result<(), ServiceError> {
        match method {
            "start" => {
                self.backend
                    .stream_with(outbox, Headers::new(), "range", args, self.sink.clone());
                Ok(())
            }
            _ => Err(ServiceError::Execution(format!("unknown send {method}"))),
        }
    }
}

/// Collects values and resolves a oneshot with the terminal.
struct CollectSink {
    values: Mutex<Vec<Value>>,
    done: Mutex<Option<oneshot::Sender<Result<usize, ServiceError>>>>,
    cancel_after: Option<usize>,
    cancelled: AtomicBool,
}

impl CollectSink {
    fn collector() -> (Arc<Self>, oneshot::Receiver<Result<usize, ServiceError>>) {
        Self::with_cancel_after(None)
    }

    fn cancelling(limit: usize) -> (Arc<Self>, oneshot::Receiver<Result<usize, ServiceError>>) {
        Self::with_cancel_after(Some(limit))
    }

    fn with_cancel_after(
        cancel_after: Option<usize>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<usize, ServiceError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                values: Mutex::new(Vec::new()),
                done: Mutex::new(Some(tx)),
                cancel_after,
                cancelled: AtomicBool::new(false),
            }),
            rx,
        )
    }

    fn values(&self) -> Vec<Value> {
        self.values.lock().unwrap().clone()
    }

    fn finish(&self, result: Result<usize, ServiceError>) {
        if let Some(tx) = self.done.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }
}

impl StreamSink for CollectSink {
    fn accept(&self, value: Value) {
        let mut values = self.values.lock().unwrap();
        values.push(value);
        if let Some(limit) = self.cancel_after {
            if values.len() >= limit {
                self.cancelled.store(true, Ordering::SeqCst);
            }
        }
    }

    fn ok(&self) {
        let count = self.values.lock().unwrap().len();
        self.finish(Ok(count));
    }

    fn fail(&self, error: ServiceError) {
        self.finish(Err(error));
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_single_stream_round_trip() {
    let runtime = new_runtime();
    let range = runtime.service("local://range", Box::new(RangeStub));

    let (sink, rx) = CollectSink::collector();
    range.stream("range", vec![json!(3)], sink.clone());

    let count = rx.await.expect("terminal").expect("stream should succeed");
    assert_eq!(count, 3);
    assert_eq!(sink.values(), vec![json!(0), json!(1), json!(2)]);
    assert_eq!(runtime.query_table().pending_count(), 0);

    runtime.shutdown_and_wait(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_fanout_fires_downstream_ok_exactly_once() {
    let runtime = new_runtime();
    let targets: Vec<ServiceRef> = (0..3)
        .map(|i| runtime.service(format!("local://range-{i}"), Box::new(RangeStub)))
        .collect();

    let (sink, rx) = CollectSink::collector();
    runtime.stream_fanout(&targets, "range", vec![json!(2)], sink.clone());

    // ok fires once, only after every leg finished; all values arrived first.
    let count = rx.await.expect("terminal").expect("fan-out should succeed");
    assert_eq!(count, 6);
    assert_eq!(sink.values().len(), 6);

    runtime.shutdown_and_wait(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_empty_fanout_completes_immediately() {
    let runtime = new_runtime();

    let (sink, rx) = CollectSink::collector();
    runtime.stream_fanout(&[], "range", vec![json!(2)], sink);

    let count = rx.await.expect("terminal").expect("empty fan-out completes");
    assert_eq!(count, 0);

    runtime.shutdown_and_wait(ShutdownMode::Immediate).await;
}

#[tokio::test]
async fn test_stream_failure_forwards_immediately() {
    let runtime = new_runtime();
    let range = runtime.service("local://range", Box::new(RangeStub));

    let (sink, rx) = CollectSink::collector();
    range.stream("break_after", vec![json!(2)], sink.clone());

    let result = rx.await.expect("terminal");
    assert!(matches!(result, Err(ServiceError::Execution(_))));
    assert_eq!(sink.values().len(), 2);

    runtime.shutdown_and_wait(ShutdownMode::Immediate).await;
}

#[tokio::test]
async fn test_fanout_failure_does_not_cancel_siblings() {
    let runtime = new_runtime();
    let failing = runtime.service("local://failing", Box::new(RangeStub));
    let healthy = runtime.service("local://healthy", Box::new(RangeStub));

    let (sink, rx) = CollectSink::collector();

    // One leg breaks; the failure goes downstream without waiting for, or
    // cancelling, the healthy leg.
    Outbox::scoped(|outbox| {
        runtime.stream_fanout_with(
            outbox,
            Headers::new(),
            &[failing.clone(), healthy.clone()],
            "break_after",
            vec![json!(1)],
            sink,
        );
    });

    let result = rx.await.expect("terminal");
    assert!(matches!(result, Err(ServiceError::Execution(_))));

    runtime.shutdown_and_wait(ShutdownMode::Immediate).await;
}

#[tokio::test]
async fn test_cancellation_stops_the_producer() {
    let runtime = new_runtime();
    let range = runtime.service("local://range", Box::new(RangeStub));

    let (sink, rx) = CollectSink::cancelling(5);
    range.stream("until_cancelled", vec![], sink.clone());

    let count = rx.await.expect("terminal").expect("producer finishes after cancel");
    assert!(count >= 5, "producer stopped before the cancel point: {count}");
    assert!(
        count < 10_000,
        "producer ignored cancellation and ran to completion"
    );

    runtime.shutdown_and_wait(ShutdownMode::Immediate).await;
}

#[tokio::test]
async fn test_cancellation_through_caller_mailbox_drops_remaining_values() {
    let runtime = new_runtime();
    let backend = runtime.service("local://range", Box::new(RangeStub));

    let (sink, rx) = CollectSink::cancelling(5);
    let proxy = runtime.service(
        "local://proxy",
        Box::new(ProxyStub {
            backend: backend.clone(),
            sink: sink.clone(),
        }),
    );

    // The producer finishes its 200 values before the consumer cancels, but
    // the delivery leg stops forwarding at the cancellation point and sends
    // the best-effort cancel note back to the producer mailbox.
    proxy.send("start", vec![json!(200)]);

    let count = rx.await.expect("terminal").expect("stream still terminates");
    assert_eq!(count, 5);
    assert_eq!(sink.values().len(), 5);

    runtime.shutdown_and_wait(ShutdownMode::Immediate).await;
}

#[tokio::test]
async fn test_batches_preserve_order_through_caller_mailbox() {
    let runtime = new_runtime();
    let backend = runtime.service("local://range", Box::new(RangeStub));

    let (sink, rx) = CollectSink::collector();
    let proxy = runtime.service(
        "local://proxy",
        Box::new(ProxyStub {
            backend: backend.clone(),
            sink: sink.clone(),
        }),
    );

    // 200 values span several bounded batches routed through the proxy's own
    // mailbox.
    proxy.send("start", vec![json!(200)]);

    let count = rx.await.expect("terminal").expect("stream should succeed");
    assert_eq!(count, 200);

    let expected: Vec<Value> = (0..200u64).map(|i| json!(i)).collect();
    assert_eq!(sink.values(), expected);

    runtime.shutdown_and_wait(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_stream_to_closed_mailbox_fails_downstream() {
    let runtime = new_runtime();
    let range = runtime.service("local://range", Box::new(RangeStub));
    range.close(ShutdownMode::Immediate);

    let (sink, rx) = CollectSink::collector();
    range.stream("range", vec![json!(3)], sink);

    let result = rx.await.expect("terminal");
    assert!(matches!(result, Err(ServiceError::Closed(_))));

    runtime.shutdown_and_wait(ShutdownMode::Immediate).await;
}
