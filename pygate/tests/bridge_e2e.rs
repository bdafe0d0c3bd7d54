//! End-to-end bridge tests with an in-process fake script peer.
//!
//! The peer connects over a unix socket exactly as the Python client
//! would: hello handshake first, then framed invocations and results.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use pygate::bridge::codec::Decoded;
use pygate::{
    BridgeConfig, CallResult, ChannelState, Endpoint, ErrorKind, Frame, FrameReader, FrameWriter,
    Hello, Outcome, PROTOCOL_VERSION, RetryPolicy, Session, TrafficRecord, TrafficSink, connect,
    frame_stream,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn socket_endpoint(dir: &tempfile::TempDir) -> Endpoint {
    Endpoint::unix(dir.path().join("bridge.sock"))
}

fn fast_config(endpoint: Endpoint) -> BridgeConfig {
    BridgeConfig::new(endpoint)
        .with_connect_timeout(Duration::from_secs(5))
        .with_handshake_timeout(Duration::from_secs(5))
        .with_invoke_timeout(Duration::from_secs(5))
        .with_drain_timeout(Duration::from_millis(200))
        .with_retry(RetryPolicy::none())
}

fn test_record(id: &str) -> TrafficRecord {
    TrafficRecord {
        id: id.to_string(),
        direction: pygate::Direction::Request,
        headers: vec![("Host".to_string(), "example.com".to_string())],
        body: b"q=1".to_vec(),
        metadata: Default::default(),
    }
}

/// Script side of the bridge, driven explicitly by each test.
struct Peer {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Peer {
    /// Connect and complete the handshake. Retries until the host binds.
    async fn connect(endpoint: &Endpoint, auth_token: Option<String>) -> Self {
        let mut peer = Self::connect_raw(endpoint, auth_token).await;
        match peer.recv().await {
            Some(Frame::HelloAck(_)) => peer,
            other => panic!("expected hello_ack, got {other:?}"),
        }
    }

    /// Connect and send hello, without waiting for the ack.
    async fn connect_raw(endpoint: &Endpoint, auth_token: Option<String>) -> Self {
        let stream = loop {
            match connect(endpoint).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        let (reader, writer) = frame_stream(stream);
        let mut peer = Self { reader, writer };
        peer.send(Frame::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            session_id: Uuid::new_v4(),
            auth_token,
        }))
        .await;
        peer
    }

    async fn send(&mut self, frame: Frame) {
        self.writer.send(frame).await.expect("peer send");
    }

    async fn recv(&mut self) -> Option<Frame> {
        match self.reader.next().await {
            Some(Ok(Decoded::Frame(frame))) => Some(frame),
            Some(Ok(Decoded::Malformed { detail })) => panic!("malformed frame: {detail}"),
            Some(Err(e)) => panic!("peer read error: {e}"),
            None => None,
        }
    }

    /// Answer invocations like a small script would: `echo` returns its
    /// argument, `slow` never answers, everything else is unknown.
    async fn serve(mut self) {
        while let Some(frame) = self.recv().await {
            match frame {
                Frame::Invoke(invocation) => {
                    let outcome = match invocation.target_capability.as_str() {
                        "echo" => Outcome::success(
                            invocation.arguments.first().cloned().unwrap_or(Value::Null),
                        ),
                        "slow" => continue,
                        other => Outcome::failure(ErrorKind::UnknownCapability, other),
                    };
                    self.send(Frame::Result(CallResult {
                        correlation_id: invocation.correlation_id,
                        outcome,
                    }))
                    .await;
                }
                Frame::Goodbye => break,
                _ => {}
            }
        }
    }
}

#[tokio::test]
async fn echo_capability_roundtrips() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let endpoint = socket_endpoint(&dir);

    let session = Session::new(fast_config(endpoint.clone()));
    let peer = tokio::spawn(async move { Peer::connect(&endpoint, None).await.serve().await });

    session.start().await.unwrap();
    assert_eq!(session.state(), ChannelState::Ready);

    let outcome = session.invoke("echo", vec![json!("ping")]).await;
    assert_eq!(outcome, Outcome::success(json!("ping")));

    session.stop().await.unwrap();
    assert_eq!(session.state(), ChannelState::Disconnected);
    peer.await.unwrap();
}

#[tokio::test]
async fn unregistered_capability_fails_structurally() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let endpoint = socket_endpoint(&dir);

    let session = Session::new(fast_config(endpoint.clone()));
    tokio::spawn(async move { Peer::connect(&endpoint, None).await.serve().await });

    session.start().await.unwrap();

    let outcome = session.invoke("missing", vec![]).await;
    assert_eq!(
        outcome,
        Outcome::failure(ErrorKind::UnknownCapability, "missing")
    );

    session.stop().await.unwrap();
}

#[tokio::test]
async fn deadline_fires_once_and_late_result_is_discarded() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let endpoint = socket_endpoint(&dir);

    let session = Session::new(fast_config(endpoint.clone()));
    let connect_endpoint = endpoint.clone();
    let peer = tokio::spawn(async move { Peer::connect(&connect_endpoint, None).await });
    session.start().await.unwrap();
    let mut peer = peer.await.unwrap();

    let begun = Instant::now();
    let outcome = session
        .invoke_with_deadline("slow", vec![], Duration::from_millis(50))
        .await;
    assert_eq!(outcome.failure_kind(), Some(ErrorKind::Timeout));
    assert!(begun.elapsed() >= Duration::from_millis(50));

    // The peer answers far too late; the session must discard it and keep
    // serving new calls on the same connection.
    let invocation = match peer.recv().await {
        Some(Frame::Invoke(invocation)) => invocation,
        other => panic!("expected invoke, got {other:?}"),
    };
    peer.send(Frame::Result(CallResult {
        correlation_id: invocation.correlation_id,
        outcome: Outcome::success(json!("late")),
    }))
    .await;

    let follow_up = session.begin_invoke("echo", vec![json!("still alive")], Duration::from_secs(5))
        .await
        .unwrap();
    let invocation = match peer.recv().await {
        Some(Frame::Invoke(invocation)) => invocation,
        other => panic!("expected invoke, got {other:?}"),
    };
    assert_eq!(invocation.target_capability, "echo");
    peer.send(Frame::Result(CallResult {
        correlation_id: invocation.correlation_id,
        outcome: Outcome::success(json!("still alive")),
    }))
    .await;
    assert_eq!(follow_up.wait().await, Outcome::success(json!("still alive")));

    session.stop().await.unwrap();
}

#[tokio::test]
async fn disconnect_fails_pending_calls_and_restart_recovers() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let endpoint = socket_endpoint(&dir);

    let session = Session::new(fast_config(endpoint.clone()));
    let connect_endpoint = endpoint.clone();
    let first_peer =
        tokio::spawn(async move { Peer::connect(&connect_endpoint, None).await });

    session.start().await.unwrap();
    let mut peer = first_peer.await.unwrap();

    let first = session
        .begin_invoke("slow", vec![], Duration::from_secs(30))
        .await
        .unwrap();
    let second = session
        .begin_invoke("slow", vec![], Duration::from_secs(30))
        .await
        .unwrap();

    // Both invocations reach the peer, which then dies without answering.
    for _ in 0..2 {
        match peer.recv().await {
            Some(Frame::Invoke(_)) => {}
            other => panic!("expected invoke, got {other:?}"),
        }
    }
    drop(peer);

    assert_eq!(
        first.wait().await.failure_kind(),
        Some(ErrorKind::SessionLost)
    );
    assert_eq!(
        second.wait().await.failure_kind(),
        Some(ErrorKind::SessionLost)
    );

    let mut states = session.subscribe_state();
    states
        .wait_for(|state| *state == ChannelState::Failed)
        .await
        .unwrap();

    // Explicit restart from Failed reconnects.
    let reconnect_endpoint = endpoint.clone();
    tokio::spawn(async move { Peer::connect(&reconnect_endpoint, None).await.serve().await });
    session.start().await.unwrap();
    assert_eq!(session.state(), ChannelState::Ready);

    let outcome = session.invoke("echo", vec![json!("back")]).await;
    assert_eq!(outcome, Outcome::success(json!("back")));

    session.stop().await.unwrap();
}

#[tokio::test]
async fn script_invokes_host_capability() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let endpoint = socket_endpoint(&dir);

    let session = Session::new(fast_config(endpoint.clone()));
    session.registry().register("hostEcho", |mut args| async move {
        Ok(args.pop().unwrap_or(Value::Null))
    });

    let connect_endpoint = endpoint.clone();
    let peer = tokio::spawn(async move { Peer::connect(&connect_endpoint, None).await });
    session.start().await.unwrap();
    let mut peer = peer.await.unwrap();

    peer.send(Frame::Invoke(pygate::Invocation {
        correlation_id: pygate::CorrelationId::new(100),
        target_capability: "hostEcho".to_string(),
        arguments: vec![json!("hi")],
        deadline_ms: None,
    }))
    .await;

    match peer.recv().await {
        Some(Frame::Result(result)) => {
            assert_eq!(result.correlation_id, pygate::CorrelationId::new(100));
            assert_eq!(result.outcome, Outcome::success(json!("hi")));
        }
        other => panic!("expected result, got {other:?}"),
    }

    // Built-in discovery lists the host's capabilities.
    peer.send(Frame::Invoke(pygate::Invocation {
        correlation_id: pygate::CorrelationId::new(101),
        target_capability: pygate::LIST_CAPABILITIES.to_string(),
        arguments: vec![],
        deadline_ms: None,
    }))
    .await;

    match peer.recv().await {
        Some(Frame::Result(result)) => match result.outcome {
            Outcome::Success { value } => {
                let names: Vec<String> = serde_json::from_value(value).unwrap();
                assert!(names.contains(&"hostEcho".to_string()));
                assert!(names.contains(&pygate::LIST_CAPABILITIES.to_string()));
            }
            other => panic!("expected success, got {other:?}"),
        },
        other => panic!("expected result, got {other:?}"),
    }

    session.stop().await.unwrap();
}

struct CollectingSink {
    tx: mpsc::UnboundedSender<TrafficRecord>,
}

#[async_trait::async_trait]
impl TrafficSink for CollectingSink {
    async fn accept(&self, record: TrafficRecord) {
        let _ = self.tx.send(record);
    }
}

#[tokio::test]
async fn traffic_flows_both_ways() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let endpoint = socket_endpoint(&dir);

    let session = Session::new(fast_config(endpoint.clone()));
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    session.set_traffic_sink(Arc::new(CollectingSink { tx: sink_tx })).await;

    let connect_endpoint = endpoint.clone();
    let peer = tokio::spawn(async move { Peer::connect(&connect_endpoint, None).await });
    session.start().await.unwrap();
    let mut peer = peer.await.unwrap();

    let record = test_record("req-1");
    let (outcome, ()) = tokio::join!(session.deliver_traffic(record.clone()), async {
        let invocation = match peer.recv().await {
            Some(Frame::Invoke(invocation)) => invocation,
            other => panic!("expected invoke, got {other:?}"),
        };
        assert_eq!(invocation.target_capability, pygate::PROCESS_TRAFFIC);
        let delivered: TrafficRecord =
            serde_json::from_value(invocation.arguments[0].clone()).unwrap();
        assert_eq!(delivered, record);

        peer.send(Frame::Result(CallResult {
            correlation_id: invocation.correlation_id,
            outcome: Outcome::success(json!({"verdict": "forward"})),
        }))
        .await;

        // The script can also push records back asynchronously.
        peer.send(Frame::Traffic(test_record("resp-1"))).await;
    });
    assert_eq!(outcome, Outcome::success(json!({"verdict": "forward"})));

    let pushed = tokio::time::timeout(Duration::from_secs(5), sink_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.id, "resp-1");

    session.stop().await.unwrap();
}

#[tokio::test]
async fn wrong_auth_token_fails_the_handshake() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let endpoint = socket_endpoint(&dir);

    let session = Session::new(
        fast_config(endpoint.clone()).with_auth_token("expected-secret"),
    );

    let connect_endpoint = endpoint.clone();
    let peer = tokio::spawn(async move {
        let mut peer =
            Peer::connect_raw(&connect_endpoint, Some("wrong-secret".to_string())).await;
        // Host closes without an ack.
        assert!(peer.recv().await.is_none());
    });

    let result = session.start().await;
    assert!(matches!(result, Err(pygate::BridgeError::Handshake(_))));
    assert_eq!(session.state(), ChannelState::Failed);
    peer.await.unwrap();
}
