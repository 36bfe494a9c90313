//! Integration tests against a real `TcpListener` and an in-process
//! scripted upstream queue, covering the dispatcher's end-to-end scenarios.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use reqfan::{Dispatcher, Queue, QueueError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

enum Script {
    Reply { response: Bytes, delay: Duration },
    Fail { delay: Duration },
}

/// An upstream queue whose response to each distinct request is scripted in
/// advance, with a configurable per-request delay. Lets tests control
/// completion order and simulate upstream failure deterministically.
struct ScriptedQueue {
    scripts: Mutex<HashMap<Vec<u8>, Script>>,
}

impl ScriptedQueue {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
        }
    }

    fn reply(&self, request: &[u8], response: impl Into<Bytes>, delay: Duration) {
        self.scripts.lock().unwrap().insert(
            request.to_vec(),
            Script::Reply {
                response: response.into(),
                delay,
            },
        );
    }

    fn fail(&self, request: &[u8], delay: Duration) {
        self.scripts
            .lock()
            .unwrap()
            .insert(request.to_vec(), Script::Fail { delay });
    }
}

#[async_trait]
impl Queue for ScriptedQueue {
    async fn submit(&self, request: Bytes) -> Result<Bytes, QueueError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .remove(request.as_ref())
            .unwrap_or(Script::Reply {
                response: request.clone(),
                delay: Duration::ZERO,
            });

        match script {
            Script::Reply { response, delay } => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Script::Fail { delay } => {
                tokio::time::sleep(delay).await;
                Err(QueueError::Failed("scripted failure".into()))
            }
        }
    }
}

async fn bind() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

async fn connect(addr: std::net::SocketAddr) -> Framed<TcpStream, LengthDelimitedCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// S1: a single request on a single connection is answered, and the
/// dispatcher keeps soliciting new connections afterward.
#[tokio::test]
async fn s1_single_request_then_close_leaves_dispatcher_soliciting() {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let queue = Arc::new(ScriptedQueue::new());
    queue.reply(&[1, 2, 3], Bytes::from_static(&[0xAA, 0xBB]), Duration::ZERO);

    let mut dispatcher = Dispatcher::construct(vec![listener], Arc::clone(&queue), 1).unwrap();
    let run = tokio::spawn(async move {
        let _ = dispatcher.run().await;
    });

    let mut client = connect(addr).await;
    client.send(Bytes::from_static(&[1, 2, 3])).await.unwrap();
    let response = client.next().await.unwrap().unwrap();
    assert_eq!(&response[..], &[0xAA, 0xBB]);
    drop(client);

    // Give the dispatcher a moment to reap the dropped connection, then
    // prove it is still alive and soliciting by serving a fresh client.
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.reply(b"second", Bytes::from_static(b"ok"), Duration::ZERO);
    let mut client2 = connect(addr).await;
    client2.send(Bytes::from_static(b"second")).await.unwrap();
    let response2 = tokio::time::timeout(Duration::from_millis(300), client2.next())
        .await
        .expect("dispatcher should still be accepting after the first connection closed")
        .unwrap()
        .unwrap();
    assert_eq!(&response2[..], b"ok");

    run.abort();
}

/// S2: a third connection past the cap is not served until one of the
/// first two active connections drops.
#[tokio::test]
async fn s2_cap_enforcement_admits_third_client_only_after_one_drops() {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let queue = Arc::new(ScriptedQueue::new());
    let mut dispatcher = Dispatcher::construct(vec![listener], Arc::clone(&queue), 2).unwrap();
    let run = tokio::spawn(async move {
        let _ = dispatcher.run().await;
    });

    let mut c1 = connect(addr).await;
    let mut c2 = connect(addr).await;
    queue.reply(b"a", Bytes::from_static(b"ra"), Duration::ZERO);
    queue.reply(b"b", Bytes::from_static(b"rb"), Duration::ZERO);
    c1.send(Bytes::from_static(b"a")).await.unwrap();
    c2.send(Bytes::from_static(b"b")).await.unwrap();
    assert_eq!(&c1.next().await.unwrap().unwrap()[..], b"ra");
    assert_eq!(&c2.next().await.unwrap().unwrap()[..], b"rb");

    let mut c3 = connect(addr).await;
    queue.reply(b"c", Bytes::from_static(b"rc"), Duration::ZERO);
    c3.send(Bytes::from_static(b"c")).await.unwrap();

    let premature = tokio::time::timeout(Duration::from_millis(150), c3.next()).await;
    assert!(
        premature.is_err(),
        "third client should not be served while the connection cap is full"
    );

    drop(c1);

    let response3 = tokio::time::timeout(Duration::from_millis(500), c3.next())
        .await
        .expect("third client should be served once a slot frees up")
        .unwrap()
        .unwrap();
    assert_eq!(&response3[..], b"rc");

    run.abort();
}

/// S3: the client observes responses in upstream completion order, not
/// request order, when the dispatcher pipelines reads.
#[tokio::test]
async fn s3_pipelined_requests_return_in_upstream_completion_order() {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let queue = Arc::new(ScriptedQueue::new());
    queue.reply(b"p1", Bytes::from_static(b"r1"), Duration::from_millis(10));
    queue.reply(b"p2", Bytes::from_static(b"r2"), Duration::from_millis(120));
    queue.reply(b"p3", Bytes::from_static(b"r3"), Duration::from_millis(60));

    let mut dispatcher = Dispatcher::construct(vec![listener], Arc::clone(&queue), 1).unwrap();
    let run = tokio::spawn(async move {
        let _ = dispatcher.run().await;
    });

    let mut client = connect(addr).await;
    client.send(Bytes::from_static(b"p1")).await.unwrap();
    client.send(Bytes::from_static(b"p2")).await.unwrap();
    client.send(Bytes::from_static(b"p3")).await.unwrap();

    let first = client.next().await.unwrap().unwrap();
    let second = client.next().await.unwrap().unwrap();
    let third = client.next().await.unwrap().unwrap();

    assert_eq!(&first[..], b"r1");
    assert_eq!(&second[..], b"r3");
    assert_eq!(&third[..], b"r2");

    run.abort();
}

/// S4: a client that half-closes its write side after sending its requests
/// still receives every in-flight response before the dispatcher reaps the
/// connection.
#[tokio::test]
async fn s4_half_closed_client_still_receives_in_flight_responses() {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let queue = Arc::new(ScriptedQueue::new());
    queue.reply(b"p1", Bytes::from_static(b"r1"), Duration::from_millis(20));
    queue.reply(b"p2", Bytes::from_static(b"r2"), Duration::from_millis(40));

    let mut dispatcher = Dispatcher::construct(vec![listener], Arc::clone(&queue), 1).unwrap();
    let run = tokio::spawn(async move {
        let _ = dispatcher.run().await;
    });

    let mut client = connect(addr).await;
    client.send(Bytes::from_static(b"p1")).await.unwrap();
    client.send(Bytes::from_static(b"p2")).await.unwrap();
    client.get_mut().shutdown().await.unwrap();

    let first = client.next().await.unwrap().unwrap();
    let second = client.next().await.unwrap().unwrap();
    assert_eq!(&first[..], b"r1");
    assert_eq!(&second[..], b"r2");

    // Once both responses are delivered, the dispatcher reaps the drained
    // connection on its own -- observed indirectly, since max_connections
    // == 1, by a fresh connection being served promptly.
    queue.reply(b"next", Bytes::from_static(b"ok"), Duration::ZERO);
    let mut client2 = connect(addr).await;
    client2.send(Bytes::from_static(b"next")).await.unwrap();
    let resp = tokio::time::timeout(Duration::from_millis(500), client2.next())
        .await
        .expect("dispatcher should have reaped the drained connection")
        .unwrap()
        .unwrap();
    assert_eq!(&resp[..], b"ok");

    run.abort();
}

/// S5: an upstream failure tips the dispatcher into upstream-failed mode,
/// every connection drains (the idle one immediately, the one with the
/// failed request once accounted for), and `run` returns `Ok(())`.
#[tokio::test]
async fn s5_upstream_failure_drains_and_dispatcher_terminates() {
    let listener = bind().await;
    let addr = listener.local_addr().unwrap();
    let queue = Arc::new(ScriptedQueue::new());
    queue.fail(b"p1", Duration::from_millis(20));

    let dispatcher = Dispatcher::construct(vec![listener], Arc::clone(&queue), 4).unwrap();

    let mut client_a = connect(addr).await;
    let mut client_b = connect(addr).await;

    let run = tokio::spawn(async move {
        let mut dispatcher = dispatcher;
        dispatcher.run().await
    });

    // Give the dispatcher a moment to accept and start reading both
    // connections before client A's request tips it over.
    tokio::time::sleep(Duration::from_millis(20)).await;
    client_a.send(Bytes::from_static(b"p1")).await.unwrap();
    // client_b stays idle, with its read pending, for the whole test.

    let result = tokio::time::timeout(Duration::from_millis(1000), run)
        .await
        .expect("dispatcher should finish draining")
        .expect("run task should not panic");
    assert!(result.is_ok());

    assert!(
        client_a.next().await.is_none(),
        "client A's connection should close without a response for the failed request"
    );
    assert!(
        client_b.next().await.is_none(),
        "idle client B should be dropped once upstream fails"
    );
}

/// An externally requested shutdown with no active connections drains
/// immediately, exercising the ambient `shutdown()` entry point rather
/// than an upstream failure.
#[tokio::test]
async fn graceful_shutdown_drains_with_no_active_connections() {
    let listener = bind().await;
    let queue = Arc::new(ScriptedQueue::new());
    let mut dispatcher = Dispatcher::construct(vec![listener], queue, 4).unwrap();

    dispatcher.shutdown();
    let result = tokio::time::timeout(Duration::from_millis(200), dispatcher.run())
        .await
        .expect("shutdown with no active connections should drain quickly");
    assert!(result.is_ok());
}
