// SPDX-License-Identifier: MIT OR Apache-2.0
//! Consume-loop concurrency: prefetch bounds the envelopes in flight,
//! and shutdown drains what is already running.

use asya::core::Envelope;
use asya::gateway_client::ReporterHandle;
use asya::runtime::{HandlerOutcome, PayloadFn, RuntimeConfig, RuntimeServer};
use asya::sidecar::run::consume_loop;
use asya::sidecar::{Router, SidecarConfig, SidecarMetrics};
use asya::transport::{MemoryTransport, Transport};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct Rig {
    transport: Arc<MemoryTransport>,
    router: Arc<Router>,
    active: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// A slow handler that records its own concurrency.
async fn rig(prefetch: u16) -> Rig {
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("app.sock");

    let a = active.clone();
    let m = max_seen.clone();
    let handler = Arc::new(PayloadFn(move |p: Value| {
        let current = a.fetch_add(1, Ordering::SeqCst) + 1;
        m.fetch_max(current, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(40));
        a.fetch_sub(1, Ordering::SeqCst);
        Ok(HandlerOutcome::Value(p))
    }));
    let server = RuntimeServer::bind(
        RuntimeConfig {
            socket_path: socket.clone(),
            handler: "tests.slow".into(),
            ..RuntimeConfig::default()
        },
        handler,
    )
    .await
    .unwrap();
    let server = tokio::spawn(async move {
        let _ = server.serve().await;
    });

    let transport = Arc::new(MemoryTransport::new());
    let mut config = SidecarConfig::for_actor("slow");
    config.socket_path = socket;
    config.prefetch = prefetch;
    config.runtime_timeout = Duration::from_secs(5);
    config.graceful_shutdown = Duration::from_secs(5);
    let router = Arc::new(Router::new(
        config,
        transport.clone(),
        ReporterHandle::disabled(),
        Arc::new(SidecarMetrics::new()),
    ));

    Rig {
        transport,
        router,
        active,
        max_seen,
        _dir: dir,
        server,
    }
}

async fn wait_for_happy_end(transport: &MemoryTransport, count: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if transport.queue_depth("asya-happy-end").await.unwrap() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pipeline should drain");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prefetch_one_processes_strictly_serially() {
    let rig = rig(1).await;
    for i in 0..6 {
        let envelope = Envelope::new(vec!["slow".into()], json!({"i": i}));
        rig.transport
            .publish("asya-slow", &serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();
    }

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let join = tokio::spawn(consume_loop(
        rig.router.clone(),
        rig.transport.clone(),
        async {
            let _ = rx.await;
        },
    ));

    wait_for_happy_end(&rig.transport, 6).await;
    tx.send(()).unwrap();
    join.await.unwrap().unwrap();

    assert_eq!(rig.max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(rig.active.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn higher_prefetch_overlaps_but_stays_bounded() {
    let rig = rig(3).await;
    for i in 0..12 {
        let envelope = Envelope::new(vec!["slow".into()], json!({"i": i}));
        rig.transport
            .publish("asya-slow", &serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();
    }

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let join = tokio::spawn(consume_loop(
        rig.router.clone(),
        rig.transport.clone(),
        async {
            let _ = rx.await;
        },
    ));

    wait_for_happy_end(&rig.transport, 12).await;
    tx.send(()).unwrap();
    join.await.unwrap().unwrap();

    let max = rig.max_seen.load(Ordering::SeqCst);
    assert!(max <= 3, "in-flight {max} exceeded prefetch");
    assert!(max >= 2, "expected some overlap, saw {max}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_in_flight_work() {
    let rig = rig(2).await;
    for i in 0..4 {
        let envelope = Envelope::new(vec!["slow".into()], json!({"i": i}));
        rig.transport
            .publish("asya-slow", &serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();
    }

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let join = tokio::spawn(consume_loop(
        rig.router.clone(),
        rig.transport.clone(),
        async {
            let _ = rx.await;
        },
    ));

    // Let some work start, then signal shutdown mid-stream.
    tokio::time::sleep(Duration::from_millis(60)).await;
    tx.send(()).unwrap();
    join.await.unwrap().unwrap();

    // Everything that was picked up finished (acked and published); the
    // rest is still on the queue for redelivery, not lost.
    let done = rig.transport.queue_depth("asya-happy-end").await.unwrap();
    let pending = rig.transport.queue_depth("asya-slow").await.unwrap();
    assert_eq!(rig.active.load(Ordering::SeqCst), 0);
    assert_eq!(done + pending, 4, "no envelope may vanish");
}
