//! Connection agent.
//!
//! One [`Agent`] owns one client connection:
//!
//! 1. handshake: the first frame must be CONNECT, answered with CONNACK;
//!    a watchdog closes connections that never send it
//! 2. receive loop: frames are read in order; PINGREQ and QoS 1 PUBLISH are
//!    acknowledged inline, then every PUBLISH/PINGREQ goes to
//!    [`Agent::on_recover`]
//! 3. dispatch: each frame runs on its own supervised task holding one of
//!    `concurrent_tasks` permits; with none free the frame is rejected
//!    with a queue-full reply instead of queuing
//! 4. teardown: on any exit the connection is closed and the disconnect
//!    observer notified once
//!
//! All outbound frames go through a single writer task, so replies from
//! concurrent workers never interleave on the wire. Replies may still leave
//! in a different order than their requests arrived. Every wait on a client
//! that has stopped reading also watches the connection's cancel token, so
//! [`Agent::close`] always ends the connection.

mod stats;

pub use stats::AgentStats;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use mqgate_core::{Argument, CallResult, Session, SessionId, TraceId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::{GateError, Result, WireError};
use crate::gate::GateContext;
use crate::metrics::{
    GATE_CONNECTIONS_ACTIVE, GATE_CONNECTIONS_TOTAL, GATE_DISCONNECTIONS_TOTAL,
    GATE_DISPATCH_DURATION_SECONDS, GATE_FRAMES_SENT_TOTAL, GATE_HANDSHAKE_TIMEOUTS_TOTAL,
    GATE_HEARTBEATS_TOTAL, GATE_PUBLISH_TOTAL, GATE_QUEUE_FULL_TOTAL, GATE_ROUTE_ERRORS_TOTAL,
};
use crate::supervise::supervise;
use crate::topic::{RouteError, TopicRoute, body_argument};
use crate::wire::{ConnAck, Connect, ConnectReturnCode, MqttCodec, Packet, Publish, QoS};

/// Error text sent back when every dispatch permit is taken.
pub const QUEUE_FULL: &str = "the work queue is full!";

/// How long a closing connection may spend flushing frames already queued.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// One client connection.
pub struct Agent {
    ctx: Arc<GateContext>,
    network: String,
    peer_addr: String,
    session: OnceLock<Session>,
    outbound: OnceLock<mpsc::Sender<Packet>>,
    slots: Arc<Semaphore>,
    stats: AgentStats,
    cancel: CancellationToken,
    closed: AtomicBool,
    discard_pending: AtomicBool,
    handshake_expired: AtomicBool,
    announced: AtomicBool,
    departed: AtomicBool,
}

/// Runs [`Agent::on_close`] however `run` exits, unwinding included.
struct Teardown(Arc<Agent>);

impl Drop for Teardown {
    fn drop(&mut self) {
        self.0.on_close();
    }
}

impl Agent {
    /// Prepare an agent for a freshly accepted connection. Cancelling
    /// `parent` closes it.
    pub fn new(
        ctx: Arc<GateContext>,
        parent: &CancellationToken,
        network: impl Into<String>,
        peer_addr: impl Into<String>,
    ) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(ctx.options.concurrent_tasks));
        Arc::new(Self {
            ctx,
            network: network.into(),
            peer_addr: peer_addr.into(),
            session: OnceLock::new(),
            outbound: OnceLock::new(),
            slots,
            stats: AgentStats::new(),
            cancel: parent.child_token(),
            closed: AtomicBool::new(false),
            discard_pending: AtomicBool::new(false),
            handshake_expired: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            departed: AtomicBool::new(false),
        })
    }

    /// Session, once the handshake has completed.
    pub fn session(&self) -> Option<&Session> {
        self.session.get()
    }

    /// Session id, once the handshake has completed.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.get().map(|s| &s.id)
    }

    /// Peer address as reported by the socket.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Traffic counters.
    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Serve the connection until it ends. Always closes it on return.
    #[instrument(skip_all, fields(peer = %self.peer_addr))]
    pub async fn run<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let _teardown = Teardown(Arc::clone(&self));
        counter!(GATE_CONNECTIONS_TOTAL).increment(1);
        self.spawn_handshake_watchdog();

        let options = &self.ctx.options;
        let (reader, writer) = tokio::io::split(stream);
        let mut frames = FramedRead::with_capacity(
            reader,
            MqttCodec::new(options.max_pack_size),
            options.buf_size,
        );
        let mut sink = FramedWrite::new(writer, MqttCodec::new(options.max_pack_size));

        let connect = self.read_connect(&mut frames).await?;
        if !matches!(
            (connect.protocol_name.as_str(), connect.protocol_level),
            ("MQTT", 4) | ("MQIsdp", 3)
        ) {
            let refuse = ConnAck {
                session_present: false,
                code: ConnectReturnCode::UnacceptableProtocol,
            };
            let _ = self.send_direct(&mut sink, Packet::ConnAck(refuse)).await;
            return Err(GateError::UnsupportedProtocol {
                name: connect.protocol_name,
                level: connect.protocol_level,
            });
        }

        let _ = self.session.set(self.create_session());
        self.send_direct(&mut sink, Packet::ConnAck(ConnAck::accepted()))
            .await?;

        let (tx, rx) = mpsc::channel(options.outbound_queue);
        let _ = self.outbound.set(tx);
        let _ = supervise("writer", Arc::clone(&self).write_loop(sink, rx));

        self.stats.mark_connected();
        self.announced.store(true, Ordering::Release);
        gauge!(GATE_CONNECTIONS_ACTIVE).increment(1.0);
        self.ctx.learner.connect(&self);
        info!(
            session_id = %self.session_id().map(SessionId::as_str).unwrap_or_default(),
            client_id = %connect.client_id,
            keep_alive = connect.keep_alive,
            "client connected"
        );

        self.receive_loop(&mut frames, connect.keep_alive).await
    }

    async fn read_connect<R>(&self, frames: &mut FramedRead<R, MqttCodec>) -> Result<Connect>
    where
        R: AsyncRead + Unpin,
    {
        let first = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                return Err(if self.handshake_expired.load(Ordering::Acquire) {
                    GateError::HandshakeTimeout
                } else {
                    GateError::Closed
                });
            }
            first = frames.next() => first,
        };
        match first {
            Some(Ok(Packet::Connect(connect))) => Ok(connect),
            Some(Ok(other)) => Err(GateError::ExpectedConnect(other.name())),
            Some(Err(e)) => Err(e.into()),
            None => Err(GateError::ClosedBeforeHandshake),
        }
    }

    async fn send_direct<W>(
        &self,
        sink: &mut FramedWrite<W, MqttCodec>,
        packet: Packet,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(GateError::Closed),
            sent = sink.send(packet) => sent.map_err(GateError::from),
        }
    }

    fn create_session(&self) -> Session {
        let mut session = Session::new(&self.network, &self.peer_addr, &self.ctx.server_id);
        session.judge_guest(self.ctx.judge_guest.as_ref());
        session.create_trace();
        session
    }

    fn spawn_handshake_watchdog(self: &Arc<Self>) {
        let agent: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let over_time = self.ctx.options.over_time;
        let _ = supervise("handshake-watchdog", async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(over_time) => {
                    let Some(agent) = agent.upgrade() else { return };
                    if agent.session.get().is_none() {
                        agent.handshake_expired.store(true, Ordering::Release);
                        counter!(GATE_HANDSHAKE_TIMEOUTS_TOTAL).increment(1);
                        warn!(peer = %agent.peer_addr, "no CONNECT within {over_time:?}, closing");
                        agent.close();
                    }
                }
            }
        });
    }

    async fn receive_loop<R>(
        self: &Arc<Self>,
        frames: &mut FramedRead<R, MqttCodec>,
        keep_alive: u16,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let idle = (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500));
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                next = next_frame(frames, idle) => next?,
            };
            let Some(packet) = next else {
                debug!("peer closed connection");
                return Ok(());
            };
            match packet {
                Packet::Publish(publish) => {
                    if let (QoS::AtLeastOnce, Some(id)) = (publish.qos, publish.packet_id) {
                        self.enqueue(Packet::PubAck(id))?;
                    }
                    self.on_recover(Packet::Publish(publish));
                }
                Packet::PingReq => {
                    self.enqueue(Packet::PingResp)?;
                    self.on_recover(Packet::PingReq);
                }
                Packet::Disconnect => {
                    debug!("client sent DISCONNECT");
                    return Ok(());
                }
                Packet::Connect(_) => return Err(GateError::DuplicateConnect),
                other => debug!(packet = other.name(), "ignoring client packet"),
            }
        }
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        mut sink: FramedWrite<W, MqttCodec>,
        mut rx: mpsc::Receiver<Packet>,
    ) where
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            let packet = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                packet = rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            let sent = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                sent = sink.send(packet) => sent,
            };
            match sent {
                Ok(()) => counter!(GATE_FRAMES_SENT_TOTAL).increment(1),
                Err(WireError::Io(e)) => {
                    warn!(peer = %self.peer_addr, error = %e, "write failed, closing connection");
                    self.close();
                    return;
                }
                Err(e) => error!(peer = %self.peer_addr, error = %e, "dropping unencodable frame"),
            }
        }

        rx.close();
        let discard = self.discard_pending.load(Ordering::Acquire);
        let flush = async {
            if !discard {
                while let Ok(packet) = rx.try_recv() {
                    if sink.feed(packet).await.is_err() {
                        return;
                    }
                }
            }
            if let Err(e) = sink.close().await {
                debug!(peer = %self.peer_addr, error = %e, "shutdown of write half failed");
            }
        };
        if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
            debug!(peer = %self.peer_addr, "peer not reading, abandoning queued frames");
        }
    }

    /// Hand a post-handshake frame to a dispatch worker, or reject it when
    /// every permit is taken. Never waits for the frame to be processed.
    pub fn on_recover(self: &Arc<Self>, packet: Packet) {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => {
                let agent = Arc::clone(self);
                let _ = supervise("dispatch", async move {
                    let _permit = permit;
                    agent.dispatch(packet).await;
                });
            }
            Err(_) => {
                counter!(GATE_QUEUE_FULL_TOTAL).increment(1);
                match packet {
                    Packet::Publish(publish) => {
                        warn!(topic = %publish.topic, "dispatch queue full, rejecting publish");
                        let rejected = self
                            .frame_result(&publish.topic, None, QUEUE_FULL)
                            .and_then(|body| self.try_write_msg(&publish.topic, body));
                        if let Err(e) = rejected {
                            debug!(topic = %publish.topic, error = %e, "queue-full reply not delivered");
                        }
                    }
                    other => debug!(packet = other.name(), "dispatch queue full, dropping"),
                }
            }
        }
    }

    /// Process one frame. Runs on a dispatch worker.
    pub async fn dispatch(&self, packet: Packet) {
        let start = Instant::now();
        match packet {
            Packet::Publish(publish) => {
                self.stats.record_received();
                counter!(GATE_PUBLISH_TOTAL).increment(1);
                self.route(&publish).await;
                self.heartbeat().await;
            }
            Packet::PingReq => self.heartbeat().await,
            other => debug!(packet = other.name(), "nothing to dispatch"),
        }
        histogram!(GATE_DISPATCH_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
    }

    async fn route(&self, publish: &Publish) {
        let Some(session) = self.session.get() else {
            return;
        };
        let topic = publish.topic.as_str();

        if let Some(handler) = &self.ctx.route_handler {
            let outcome = handler.on_route(session, topic, publish.payload.clone()).await;
            if outcome.reply {
                self.reply(topic, outcome.result, outcome.error.as_deref().unwrap_or(""))
                    .await;
            }
            return;
        }

        let route = match TopicRoute::parse(topic) {
            Ok(route) => route,
            Err(e) => {
                self.route_failed(topic, &e, true).await;
                return;
            }
        };
        match self.call(session, topic, &route, &publish.payload).await {
            Ok(Some(result)) => self.reply(topic, Some(result), "").await,
            Ok(None) => {}
            Err(e) => self.route_failed(topic, &e, route.wants_reply()).await,
        }
    }

    async fn call(
        &self,
        session: &Session,
        topic: &str,
        route: &TopicRoute<'_>,
        body: &[u8],
    ) -> std::result::Result<Option<CallResult>, RouteError> {
        route.check_handler()?;
        let endpoint = self
            .ctx
            .resolver
            .resolve(route.service)
            .ok_or_else(|| RouteError::ServiceNotFound(route.service.to_owned()))?;
        let payload = body_argument(body)?;

        let request = session.for_request(topic);
        let session_arg =
            Argument::session(&request).map_err(|e| RouteError::Session(e.to_string()))?;
        let args = vec![session_arg, payload];

        if route.wants_reply() {
            return endpoint
                .call_args(route.handler, args, request.trace_id)
                .await
                .map(Some)
                .map_err(|e| RouteError::Call(e.to_string()));
        }
        if let Err(e) = endpoint
            .call_no_reply(route.handler, args, request.trace_id)
            .await
        {
            warn!(topic, handler = route.handler, error = %e, "fire-and-forget call failed");
        }
        Ok(None)
    }

    async fn route_failed(&self, topic: &str, err: &RouteError, reply: bool) {
        counter!(GATE_ROUTE_ERRORS_TOTAL, "reason" => err.reason()).increment(1);
        if reply {
            warn!(topic, error = %err, "route failed");
            self.reply(topic, None, &err.to_string()).await;
        } else {
            warn!(topic, error = %err, "route failed, no reply owed");
        }
    }

    async fn heartbeat(&self) {
        let Some(storage) = &self.ctx.storage else {
            return;
        };
        let Some(session) = self.session.get() else {
            return;
        };
        if self
            .stats
            .try_claim_heartbeat(Instant::now(), self.ctx.options.heartbeat)
        {
            counter!(GATE_HEARTBEATS_TOTAL).increment(1);
            storage.heartbeat(session).await;
        }
    }

    async fn reply(&self, topic: &str, result: Option<CallResult>, error: &str) {
        if let Err(e) = self.to_result(topic, result, error).await {
            debug!(topic, error = %e, "reply not delivered");
        }
    }

    /// Frame a call result for the client on `topic`.
    ///
    /// Pre-encoded results are written as-is; anything else goes through the
    /// result marshaler. If marshaling fails, the marshaler's own error is
    /// sent instead.
    pub async fn to_result(
        &self,
        topic: &str,
        result: Option<CallResult>,
        error: &str,
    ) -> Result<()> {
        let body = self.frame_result(topic, result, error)?;
        self.write_msg(topic, body).await
    }

    fn frame_result(
        &self,
        topic: &str,
        result: Option<CallResult>,
        error: &str,
    ) -> Result<Bytes> {
        let value = match result {
            Some(CallResult::PreEncoded(body)) => return Ok(body),
            Some(CallResult::Value(value)) => Some(value),
            None => None,
        };
        let trace_id = self
            .session
            .get()
            .map(|s| s.trace_id.clone())
            .unwrap_or_else(TraceId::new);
        match self.ctx.marshaler.marshal(&trace_id, value.as_ref(), error) {
            Ok(body) => Ok(body),
            Err(e) => {
                error!(topic, error = %e, "failed to marshal result");
                self.ctx
                    .marshaler
                    .marshal(&trace_id, None, &e)
                    .map_err(GateError::Marshal)
            }
        }
    }

    /// Send a PUBLISH to the client through the send hook, waiting for room
    /// in the outbound queue until the connection closes.
    pub async fn write_msg(&self, topic: &str, body: Bytes) -> Result<()> {
        let (outbound, packet) = self.publish_packet(topic, body)?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(GateError::Closed),
            sent = outbound.send(packet) => sent.map_err(|_| GateError::Closed),
        }?;
        self.stats.record_sent();
        Ok(())
    }

    /// Like [`Agent::write_msg`], but fails with [`GateError::OutboundFull`]
    /// instead of waiting when the client is behind.
    pub fn try_write_msg(&self, topic: &str, body: Bytes) -> Result<()> {
        let (outbound, packet) = self.publish_packet(topic, body)?;
        outbound.try_send(packet).map_err(queue_error)?;
        self.stats.record_sent();
        Ok(())
    }

    fn publish_packet(
        &self,
        topic: &str,
        body: Bytes,
    ) -> Result<(&mpsc::Sender<Packet>, Packet)> {
        let (Some(session), Some(outbound)) = (self.session.get(), self.outbound.get()) else {
            return Err(GateError::NotConnected);
        };
        if self.is_closed() {
            return Err(GateError::Closed);
        }
        let body = match &self.ctx.send_hook {
            Some(hook) => hook
                .transform(session, topic, body)
                .map_err(GateError::SendHook)?,
            None => body,
        };
        Ok((outbound, Packet::Publish(Publish::new(topic, body))))
    }

    /// Queue a protocol acknowledgement. A client too far behind to take one
    /// more is disconnected.
    fn enqueue(&self, packet: Packet) -> Result<()> {
        let outbound = self.outbound.get().ok_or(GateError::NotConnected)?;
        outbound.try_send(packet).map_err(queue_error)
    }

    /// Close the connection; frames already queued are still flushed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.peer_addr, "closing connection");
        self.cancel.cancel();
    }

    /// Close the connection, dropping queued frames.
    pub fn destroy(&self) {
        self.discard_pending.store(true, Ordering::Release);
        self.close();
    }

    /// Final teardown: close, then tell the observer, once. A panicking
    /// observer is logged and otherwise ignored.
    pub fn on_close(self: &Arc<Self>) {
        self.close();
        if self.departed.swap(true, Ordering::AcqRel) {
            return;
        }
        counter!(GATE_DISCONNECTIONS_TOTAL).increment(1);
        if !self.announced.load(Ordering::Acquire) {
            return;
        }
        gauge!(GATE_CONNECTIONS_ACTIVE).decrement(1.0);

        let learner = Arc::clone(&self.ctx.learner);
        if std::panic::catch_unwind(AssertUnwindSafe(|| learner.disconnect(self))).is_err() {
            error!(peer = %self.peer_addr, "disconnect observer panicked");
        }
        info!(
            session_id = %self.session_id().map(SessionId::as_str).unwrap_or_default(),
            received = self.stats.received(),
            sent = self.stats.sent(),
            "client disconnected"
        );
    }
}

fn queue_error(err: mpsc::error::TrySendError<Packet>) -> GateError {
    match err {
        mpsc::error::TrySendError::Full(_) => GateError::OutboundFull,
        mpsc::error::TrySendError::Closed(_) => GateError::Closed,
    }
}

async fn next_frame<R>(
    frames: &mut FramedRead<R, MqttCodec>,
    idle: Option<Duration>,
) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let next = match idle {
        Some(limit) => tokio::time::timeout(limit, frames.next())
            .await
            .map_err(|_| GateError::KeepAliveTimeout)?,
        None => frames.next().await,
    };
    next.transpose().map_err(GateError::from)
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("peer_addr", &self.peer_addr)
            .field("session_id", &self.session_id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
