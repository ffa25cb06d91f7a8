//! Client frames in, backend calls out, replies back over the wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mqgate_core::{Argument, CallResult, Session};
use mqgate_gateway::wire::{Connect, MqttCodec, Packet, Publish, QoS};
use mqgate_gateway::{
    Agent, Gate, GateOptions, RouteHandler, RouteOutcome, SendHook, StaticResolver, StorageHandler,
};
use mqgate_rpc::{HandlerError, HandlerRegistry, MemoryTransport, RpcClient, TransportServer};
use serde_json::{Value, json};
use tokio::io::DuplexStream;
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;

type Client = Framed<DuplexStream, MqttCodec>;

struct Backend {
    server: Arc<TransportServer>,
    resolver: Arc<StaticResolver>,
    hits: Arc<AtomicUsize>,
    gate_open: Arc<Semaphore>,
}

/// `echo@1` with `HD_echo` (returns its body), `HD_whoami` (returns the
/// session it was called with), `HD_fail`, and `HD_slow` (waits for a permit
/// on `gate_open`).
async fn backend() -> Backend {
    let transport = Arc::new(MemoryTransport::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let gate_open = Arc::new(Semaphore::new(0));

    let mut registry = HandlerRegistry::new();
    let counter = hits.clone();
    registry.register_fn("HD_echo", move |args: Vec<Argument>| {
        let counter = counter.clone();
        async move {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            let session = args[0].as_session()?;
            let body = args[1].as_json()?;
            Ok::<_, HandlerError>(CallResult::Value(json!({"topic": session.topic, "body": body})))
        }
    });
    registry.register_fn("HD_whoami", |args: Vec<Argument>| async move {
        let session = args[0].as_session()?;
        let value = serde_json::to_value(&session).map_err(|e| HandlerError::Internal {
            message: e.to_string(),
        })?;
        Ok::<_, HandlerError>(CallResult::Value(value))
    });
    let counter = hits.clone();
    registry.register_fn("HD_fail", move |_args: Vec<Argument>| {
        let counter = counter.clone();
        async move {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            Err::<CallResult, _>(HandlerError::Internal {
                message: "boom".into(),
            })
        }
    });
    let counter = hits.clone();
    let open = gate_open.clone();
    registry.register_fn("HD_slow", move |_args: Vec<Argument>| {
        let counter = counter.clone();
        let open = open.clone();
        async move {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            let _permit = open.acquire().await.map_err(|e| HandlerError::Internal {
                message: e.to_string(),
            })?;
            Ok::<_, HandlerError>(CallResult::Value(json!("done")))
        }
    });

    let server = TransportServer::start(
        transport.clone(),
        Arc::new(registry),
        Duration::from_millis(50),
    )
    .await
    .unwrap();
    let resolver = Arc::new(StaticResolver::new());
    resolver.register(
        "echo@1",
        Arc::new(RpcClient::new(transport, server.addr(), Duration::from_secs(5))),
    );

    Backend {
        server,
        resolver,
        hits,
        gate_open,
    }
}

async fn connect(gate: &Gate, keep_alive: u16) -> Client {
    connect_agent(gate, keep_alive).await.1
}

async fn connect_agent(gate: &Gate, keep_alive: u16) -> (Arc<Agent>, Client) {
    let (server, client) = tokio::io::duplex(64 * 1024);
    let (agent, _handle) = gate.accept(server, "test", "10.0.0.1:5000".to_owned());
    let mut client = Framed::new(client, MqttCodec::new(65_535));
    client
        .send(Packet::Connect(Connect::new("client-1", keep_alive)))
        .await
        .unwrap();
    assert_matches!(client.next().await, Some(Ok(Packet::ConnAck(ack))) if ack == mqgate_gateway::wire::ConnAck::accepted());
    (agent, client)
}

async fn publish(client: &mut Client, topic: &str, body: &'static [u8]) {
    client
        .send(Packet::Publish(Publish::new(topic, body)))
        .await
        .unwrap();
}

async fn next_reply(client: &mut Client) -> (String, Value) {
    let packet = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("reply within deadline")
        .expect("connection open")
        .unwrap();
    let Packet::Publish(reply) = packet else {
        panic!("expected PUBLISH, got {packet:?}");
    };
    (reply.topic, serde_json::from_slice(&reply.payload).unwrap())
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn success_reply_comes_back_on_request_topic() {
    let backend = backend().await;
    let gate = Gate::builder().resolver(backend.resolver.clone()).build();
    let mut client = connect(&gate, 0).await;

    publish(&mut client, "echo@1/HD_echo/7", br#"{"room":"lobby"}"#).await;
    let (topic, body) = next_reply(&mut client).await;

    assert_eq!(topic, "echo@1/HD_echo/7");
    assert_eq!(body["Error"], "");
    assert_eq!(
        body["Result"],
        json!({"topic": "echo@1/HD_echo/7", "body": {"room": "lobby"}})
    );
    assert!(!body["Trace"].as_str().unwrap().is_empty());
    backend.server.shutdown();
}

#[tokio::test]
async fn handler_sees_connection_session_with_request_topic() {
    let backend = backend().await;
    let gate = Gate::builder()
        .server_id("gate-7")
        .resolver(backend.resolver.clone())
        .build();
    let (agent, mut client) = connect_agent(&gate, 0).await;

    publish(&mut client, "echo@1/HD_whoami/1", b"{}").await;
    let (_, first) = next_reply(&mut client).await;
    publish(&mut client, "echo@1/HD_whoami/2", b"{}").await;
    let (_, second) = next_reply(&mut client).await;

    let base = agent.session().unwrap();
    assert_eq!(base.topic, None);
    assert_eq!(base.server_id, "gate-7");
    assert_eq!(base.peer_addr, "10.0.0.1:5000");

    for (reply, topic) in [(first, "echo@1/HD_whoami/1"), (second, "echo@1/HD_whoami/2")] {
        let seen: Session = serde_json::from_value(reply["Result"].clone()).unwrap();
        let mut expected = base.clone();
        expected.topic = Some(topic.to_owned());
        assert_eq!(seen, expected);
        assert_eq!(reply["Trace"], base.trace_id.as_str());
    }
    assert_eq!(agent.session().unwrap().topic, None);
    backend.server.shutdown();
}

#[tokio::test]
async fn remote_error_is_replied_when_msgid_present() {
    let backend = backend().await;
    let gate = Gate::builder().resolver(backend.resolver.clone()).build();
    let mut client = connect(&gate, 0).await;

    publish(&mut client, "echo@1/HD_fail/1", b"{}").await;
    let (_, body) = next_reply(&mut client).await;
    assert_eq!(body["Error"], "boom");
    assert_eq!(body["Result"], Value::Null);
    backend.server.shutdown();
}

#[tokio::test]
async fn failure_without_msgid_sends_nothing() {
    let backend = backend().await;
    let gate = Gate::builder().resolver(backend.resolver.clone()).build();
    let mut client = connect(&gate, 0).await;

    publish(&mut client, "echo@1/HD_fail", b"{}").await;
    wait_for(|| backend.hits.load(Ordering::SeqCst) == 1).await;

    client.send(Packet::PingReq).await.unwrap();
    assert_matches!(client.next().await, Some(Ok(Packet::PingResp)));
    backend.server.shutdown();
}

#[tokio::test]
async fn handler_without_prefix_is_never_called() {
    let backend = backend().await;
    let gate = Gate::builder().resolver(backend.resolver.clone()).build();
    let mut client = connect(&gate, 0).await;

    publish(&mut client, "echo@1/ping", b"{}").await;
    client.send(Packet::PingReq).await.unwrap();
    assert_matches!(client.next().await, Some(Ok(Packet::PingResp)));

    publish(&mut client, "echo@1/ping/3", b"{}").await;
    let (_, body) = next_reply(&mut client).await;
    assert_eq!(body["Error"], "Method(ping) must begin with 'HD_'");
    assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
    backend.server.shutdown();
}

#[tokio::test]
async fn routing_errors_are_replied() {
    let backend = backend().await;
    let gate = Gate::builder().resolver(backend.resolver.clone()).build();
    let mut client = connect(&gate, 0).await;

    publish(&mut client, "nope@1/HD_echo/1", b"{}").await;
    let (_, body) = next_reply(&mut client).await;
    assert_eq!(body["Error"], "Service(type:nope@1) not found");

    publish(&mut client, "echo@1/HD_echo/2", b"{broken").await;
    let (_, body) = next_reply(&mut client).await;
    assert_eq!(body["Error"], "The JSON format is incorrect");

    publish(&mut client, "lonely", b"").await;
    let (topic, body) = next_reply(&mut client).await;
    assert_eq!(topic, "lonely");
    assert!(body["Error"].as_str().unwrap().starts_with("Topic must be"));
    backend.server.shutdown();
}

#[tokio::test]
async fn full_dispatch_queue_rejects_publish() {
    let backend = backend().await;
    let options = GateOptions {
        concurrent_tasks: 1,
        ..GateOptions::default()
    };
    let gate = Gate::builder()
        .options(options)
        .resolver(backend.resolver.clone())
        .build();
    let mut client = connect(&gate, 0).await;

    publish(&mut client, "echo@1/HD_slow/1", b"{}").await;
    wait_for(|| backend.hits.load(Ordering::SeqCst) == 1).await;
    publish(&mut client, "echo@1/HD_slow/2", b"{}").await;

    let (topic, body) = next_reply(&mut client).await;
    assert_eq!(topic, "echo@1/HD_slow/2");
    assert_eq!(body["Error"], "the work queue is full!");

    backend.gate_open.add_permits(1);
    let (topic, body) = next_reply(&mut client).await;
    assert_eq!(topic, "echo@1/HD_slow/1");
    assert_eq!(body["Result"], "done");
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
    backend.server.shutdown();
}

#[tokio::test]
async fn qos1_publish_is_acknowledged() {
    let backend = backend().await;
    let gate = Gate::builder().resolver(backend.resolver.clone()).build();
    let mut client = connect(&gate, 0).await;

    let mut packet = Publish::new("echo@1/HD_echo", Bytes::from_static(b"{}"));
    packet.qos = QoS::AtLeastOnce;
    packet.packet_id = Some(9);
    client.send(Packet::Publish(packet)).await.unwrap();

    assert_matches!(client.next().await, Some(Ok(Packet::PubAck(9))));
    wait_for(|| backend.hits.load(Ordering::SeqCst) == 1).await;
    backend.server.shutdown();
}

struct Upper;

#[async_trait]
impl RouteHandler for Upper {
    async fn on_route(&self, _session: &Session, topic: &str, body: Bytes) -> RouteOutcome {
        if topic == "quiet" {
            return RouteOutcome::silent();
        }
        let text = String::from_utf8_lossy(&body).to_uppercase();
        RouteOutcome::reply(CallResult::PreEncoded(Bytes::from(text)))
    }
}

struct Prefix;

impl SendHook for Prefix {
    fn transform(&self, _session: &Session, _topic: &str, body: Bytes) -> Result<Bytes, String> {
        let mut out = b"> ".to_vec();
        out.extend_from_slice(&body);
        Ok(Bytes::from(out))
    }
}

#[tokio::test]
async fn custom_route_and_send_hook() {
    let gate = Gate::builder()
        .route_handler(Arc::new(Upper))
        .send_hook(Arc::new(Prefix))
        .build();
    let mut client = connect(&gate, 0).await;

    publish(&mut client, "quiet", b"ignored").await;
    publish(&mut client, "any/topic", b"hello").await;

    assert_eq!(
        client.next().await.unwrap().unwrap(),
        Packet::Publish(Publish::new("any/topic", &b"> HELLO"[..]))
    );
}

/// Panics on `boom`, answers `big` with 2000 bytes, and echoes any other
/// topic back as the body.
struct Scripted {
    panicked: Arc<AtomicBool>,
}

#[async_trait]
impl RouteHandler for Scripted {
    async fn on_route(&self, _session: &Session, topic: &str, _body: Bytes) -> RouteOutcome {
        match topic {
            "boom" => {
                self.panicked.store(true, Ordering::SeqCst);
                panic!("route handler failed");
            }
            "big" => RouteOutcome::reply(CallResult::PreEncoded(Bytes::from(vec![b'z'; 2000]))),
            other => RouteOutcome::reply(CallResult::PreEncoded(Bytes::from(other.to_owned()))),
        }
    }
}

fn scripted_gate(options: GateOptions) -> (Arc<Gate>, Arc<AtomicBool>) {
    let panicked = Arc::new(AtomicBool::new(false));
    let gate = Gate::builder()
        .options(options)
        .route_handler(Arc::new(Scripted {
            panicked: panicked.clone(),
        }))
        .build();
    (gate, panicked)
}

#[tokio::test]
async fn panicking_dispatch_leaves_connection_serving() {
    let (gate, panicked) = scripted_gate(GateOptions {
        concurrent_tasks: 1,
        ..GateOptions::default()
    });
    let (agent, mut client) = connect_agent(&gate, 0).await;

    publish(&mut client, "boom", b"").await;
    wait_for(|| panicked.load(Ordering::SeqCst)).await;

    // The only dispatch slot must be free again.
    publish(&mut client, "after", b"").await;
    assert_eq!(
        client.next().await.unwrap().unwrap(),
        Packet::Publish(Publish::new("after", &b"after"[..]))
    );
    client.send(Packet::PingReq).await.unwrap();
    assert_matches!(client.next().await, Some(Ok(Packet::PingResp)));
    assert!(!agent.is_closed());
    assert_eq!(gate.connection_count(), 1);
}

#[tokio::test]
async fn reply_larger_than_inbound_limit_is_delivered() {
    let (gate, _) = scripted_gate(GateOptions {
        max_pack_size: 1024,
        ..GateOptions::default()
    });
    let (agent, mut client) = connect_agent(&gate, 0).await;

    publish(&mut client, "big", b"").await;
    let Some(Ok(Packet::Publish(reply))) = client.next().await else {
        panic!("expected the large reply");
    };
    assert_eq!(reply.topic, "big");
    assert_eq!(reply.payload.len(), 2000);

    publish(&mut client, "small", b"").await;
    assert_eq!(
        client.next().await.unwrap().unwrap(),
        Packet::Publish(Publish::new("small", &b"small"[..]))
    );
    assert!(!agent.is_closed());
}

#[tokio::test]
async fn close_ends_connection_whose_client_stopped_reading() {
    let gate = Gate::builder().build();
    let (server, client) = tokio::io::duplex(64);
    let (agent, handle) = gate.accept(server, "test", "10.0.0.4:1".to_owned());
    let mut client = Framed::new(client, MqttCodec::new(1024));
    client
        .send(Packet::Connect(Connect::new("stuck", 0)))
        .await
        .unwrap();

    // Far more PINGRESPs than the socket buffer holds, none of them read.
    let (sent_tx, sent_rx) = tokio::sync::oneshot::channel();
    let pinger = tokio::spawn(async move {
        for _ in 0..100 {
            client.send(Packet::PingReq).await.unwrap();
        }
        let _ = sent_tx.send(());
        let _held = client;
        std::future::pending::<()>().await;
    });
    sent_rx.await.unwrap();
    wait_for(|| gate.connection_count() == 1).await;

    agent.close();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("connection task ends after close")
        .unwrap();
    assert!(agent.is_closed());
    wait_for(|| gate.connection_count() == 0).await;
    pinger.abort();
}

#[tokio::test]
async fn client_that_never_drains_acks_is_disconnected() {
    let gate = Gate::builder()
        .options(GateOptions {
            outbound_queue: 4,
            ..GateOptions::default()
        })
        .build();
    let (server, client) = tokio::io::duplex(64);
    let (agent, handle) = gate.accept(server, "test", "10.0.0.4:2".to_owned());
    let mut client = Framed::new(client, MqttCodec::new(1024));
    client
        .send(Packet::Connect(Connect::new("stuck", 0)))
        .await
        .unwrap();

    let pinger = tokio::spawn(async move {
        for _ in 0..1000 {
            if client.send(Packet::PingReq).await.is_err() {
                break;
            }
        }
        let _held = client;
        std::future::pending::<()>().await;
    });

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("connection task ends on its own")
        .unwrap();
    assert!(agent.is_closed());
    wait_for(|| gate.connection_count() == 0).await;
    pinger.abort();
}

#[tokio::test]
async fn first_frame_must_be_connect() {
    let gate = Gate::builder().build();
    let (server, client) = tokio::io::duplex(1024);
    let (agent, handle) = gate.accept(server, "test", "10.0.0.2:1".to_owned());
    let mut client = Framed::new(client, MqttCodec::new(1024));

    client.send(Packet::PingReq).await.unwrap();
    handle.await.unwrap();
    assert!(agent.session().is_none());
    assert!(client.next().await.is_none());
}

#[tokio::test]
async fn unsupported_protocol_is_refused() {
    let gate = Gate::builder().build();
    let (server, client) = tokio::io::duplex(1024);
    let (agent, handle) = gate.accept(server, "test", "10.0.0.2:2".to_owned());
    let mut client = Framed::new(client, MqttCodec::new(1024));

    let mut connect = Connect::new("old", 0);
    connect.protocol_level = 5;
    client.send(Packet::Connect(connect)).await.unwrap();

    assert_matches!(
        client.next().await,
        Some(Ok(Packet::ConnAck(ack)))
            if ack.code == mqgate_gateway::wire::ConnectReturnCode::UnacceptableProtocol
    );
    handle.await.unwrap();
    assert!(agent.session().is_none());
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_dropped_after_handshake_window() {
    let gate = Gate::builder().build();
    let (server, mut client) = tokio::io::duplex(1024);
    let (agent, handle) = gate.accept(server, "test", "10.0.0.3:1".to_owned());

    handle.await.unwrap();
    assert!(agent.is_closed());
    assert!(agent.session().is_none());

    let mut buf = [0u8; 8];
    let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_expiry_closes_connection() {
    let gate = Gate::builder().build();
    let mut client = connect(&gate, 2).await;

    let start = tokio::time::Instant::now();
    assert!(client.next().await.is_none());
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[derive(Default)]
struct Beats(AtomicUsize);

#[async_trait]
impl StorageHandler for Beats {
    async fn heartbeat(&self, _session: &Session) {
        let _ = self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeat_is_throttled() {
    let beats = Arc::new(Beats::default());
    let gate = Gate::builder().storage(beats.clone()).build();
    let mut client = connect(&gate, 0).await;

    client.send(Packet::PingReq).await.unwrap();
    assert_matches!(client.next().await, Some(Ok(Packet::PingResp)));
    tokio::task::yield_now().await;
    assert_eq!(beats.0.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    for _ in 0..3 {
        client.send(Packet::PingReq).await.unwrap();
        assert_matches!(client.next().await, Some(Ok(Packet::PingResp)));
    }
    wait_for(|| beats.0.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(beats.0.load(Ordering::SeqCst), 1);
}
