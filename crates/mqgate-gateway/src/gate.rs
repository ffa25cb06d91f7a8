//! Gate: accepts connections, tracks live agents, pushes messages to them.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use mqgate_core::session::guest_until_bound;
use mqgate_core::{ArgKind, Argument, CallResult};
use mqgate_rpc::{HandlerError, HandlerRegistry};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::Agent;
use crate::errors::{GateError, Result};
use crate::hooks::{
    AgentLearner, GuestJudge, ResultMarshaler, RouteHandler, SendHook, ServiceResolver,
    StorageHandler,
};
use crate::marshal::JsonResultMarshaler;
use crate::options::GateOptions;
use crate::resolver::StaticResolver;
use crate::supervise::supervise;

/// Everything an agent needs from its gate. Shared by all agents.
pub struct GateContext {
    /// Per-connection limits and timers.
    pub options: GateOptions,
    /// Id stamped on every session.
    pub server_id: String,
    /// Service lookup for default routing.
    pub resolver: Arc<dyn ServiceResolver>,
    /// Replaces default routing when set.
    pub route_handler: Option<Arc<dyn RouteHandler>>,
    /// Heartbeat target.
    pub storage: Option<Arc<dyn StorageHandler>>,
    /// Outbound body transform.
    pub send_hook: Option<Arc<dyn SendHook>>,
    /// Lifecycle observer.
    pub learner: Arc<dyn AgentLearner>,
    /// Guest classification for new sessions.
    pub judge_guest: GuestJudge,
    /// Reply body encoder.
    pub marshaler: Arc<dyn ResultMarshaler>,
}

/// Keeps the gate's session table in step with agent lifecycle, then
/// forwards to the user's observer.
struct Registry {
    agents: Arc<DashMap<String, Arc<Agent>>>,
    inner: Option<Arc<dyn AgentLearner>>,
}

impl AgentLearner for Registry {
    fn connect(&self, agent: &Arc<Agent>) {
        if let Some(id) = agent.session_id() {
            let _ = self.agents.insert(id.to_string(), Arc::clone(agent));
        }
        if let Some(inner) = &self.inner {
            inner.connect(agent);
        }
    }

    fn disconnect(&self, agent: &Arc<Agent>) {
        if let Some(id) = agent.session_id() {
            let _ = self
                .agents
                .remove_if(id.as_str(), |_, current| Arc::ptr_eq(current, agent));
        }
        if let Some(inner) = &self.inner {
            inner.disconnect(agent);
        }
    }
}

/// Builder for [`Gate`]. Only the resolver is usually worth setting; every
/// other collaborator has a default or is optional.
#[derive(Default)]
pub struct GateBuilder {
    options: GateOptions,
    server_id: String,
    resolver: Option<Arc<dyn ServiceResolver>>,
    route_handler: Option<Arc<dyn RouteHandler>>,
    storage: Option<Arc<dyn StorageHandler>>,
    send_hook: Option<Arc<dyn SendHook>>,
    learner: Option<Arc<dyn AgentLearner>>,
    judge_guest: Option<GuestJudge>,
    marshaler: Option<Arc<dyn ResultMarshaler>>,
}

impl GateBuilder {
    /// Connection limits and timers.
    #[must_use]
    pub fn options(mut self, options: GateOptions) -> Self {
        self.options = options;
        self
    }

    /// Id stamped on sessions.
    #[must_use]
    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Service lookup; defaults to an empty [`StaticResolver`].
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace default topic routing.
    #[must_use]
    pub fn route_handler(mut self, handler: Arc<dyn RouteHandler>) -> Self {
        self.route_handler = Some(handler);
        self
    }

    /// Receive session heartbeats.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageHandler>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Transform outbound bodies.
    #[must_use]
    pub fn send_hook(mut self, hook: Arc<dyn SendHook>) -> Self {
        self.send_hook = Some(hook);
        self
    }

    /// Observe connects and disconnects.
    #[must_use]
    pub fn learner(mut self, learner: Arc<dyn AgentLearner>) -> Self {
        self.learner = Some(learner);
        self
    }

    /// Guest classification; defaults to "no user id bound".
    #[must_use]
    pub fn judge_guest(mut self, judge: GuestJudge) -> Self {
        self.judge_guest = Some(judge);
        self
    }

    /// Reply encoder; defaults to [`JsonResultMarshaler`].
    #[must_use]
    pub fn marshaler(mut self, marshaler: Arc<dyn ResultMarshaler>) -> Self {
        self.marshaler = Some(marshaler);
        self
    }

    /// Finish the gate.
    pub fn build(self) -> Arc<Gate> {
        let agents = Arc::new(DashMap::new());
        let registry = Registry {
            agents: Arc::clone(&agents),
            inner: self.learner,
        };
        let ctx = GateContext {
            options: self.options,
            server_id: self.server_id,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(StaticResolver::new())),
            route_handler: self.route_handler,
            storage: self.storage,
            send_hook: self.send_hook,
            learner: Arc::new(registry),
            judge_guest: self
                .judge_guest
                .unwrap_or_else(|| Arc::new(guest_until_bound)),
            marshaler: self
                .marshaler
                .unwrap_or_else(|| Arc::new(JsonResultMarshaler)),
        };
        Arc::new(Gate {
            ctx: Arc::new(ctx),
            agents,
            token: CancellationToken::new(),
        })
    }
}

/// Client gateway. Connected agents are addressable by session id.
pub struct Gate {
    ctx: Arc<GateContext>,
    agents: Arc<DashMap<String, Arc<Agent>>>,
    token: CancellationToken,
}

impl Gate {
    /// Start configuring a gate.
    pub fn builder() -> GateBuilder {
        GateBuilder::default()
    }

    /// Shared agent context.
    pub fn context(&self) -> &Arc<GateContext> {
        &self.ctx
    }

    /// Accept TCP connections until `shutdown` fires, then close every
    /// connection.
    #[instrument(skip_all, fields(addr))]
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        let _ = tracing::Span::current().record("addr", tracing::field::display(addr));
        info!(server_id = %self.ctx.server_id, "gate listening on {addr}");

        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "could not set TCP_NODELAY");
            }
            let _ = self.accept(stream, "tcp", peer.to_string());
        }

        info!(connections = self.connection_count(), "gate stopping, closing connections");
        self.close_all();
        Ok(())
    }

    /// Run an agent on an already-established stream.
    pub fn accept<S>(&self, stream: S, network: &str, peer_addr: String) -> (Arc<Agent>, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let agent = Agent::new(Arc::clone(&self.ctx), &self.token, network, peer_addr);
        let runner = Arc::clone(&agent);
        let handle = supervise("connection", async move {
            match runner.run(stream).await {
                Ok(()) => {}
                Err(e @ (GateError::Closed | GateError::ClosedBeforeHandshake)) => {
                    debug!(error = %e, "connection ended");
                }
                Err(e) => warn!(error = %e, "connection ended with error"),
            }
        });
        (agent, handle)
    }

    /// Close every connection, including ones still handshaking.
    pub fn close_all(&self) {
        self.token.cancel();
    }

    /// Live agent for a session.
    pub fn agent(&self, session_id: &str) -> Option<Arc<Agent>> {
        self.agents.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of handshaken, still-registered connections.
    pub fn connection_count(&self) -> usize {
        self.agents.len()
    }

    /// Push a message to one session. Fails with
    /// [`GateError::OutboundFull`] rather than waiting on a client that is
    /// behind.
    pub fn send(&self, session_id: &str, topic: &str, body: Bytes) -> Result<()> {
        let agent = self
            .agent(session_id)
            .ok_or_else(|| GateError::NoSuchSession(session_id.to_owned()))?;
        agent.try_write_msg(topic, body)
    }

    /// Push a message to every session. Returns how many accepted it;
    /// clients that are behind are skipped.
    pub fn broadcast(&self, topic: &str, body: Bytes) -> usize {
        let agents: Vec<Arc<Agent>> = self
            .agents
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut delivered = 0;
        for agent in agents {
            match agent.try_write_msg(topic, body.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = agent.peer_addr(), error = %e, "broadcast skipped agent"),
            }
        }
        delivered
    }

    /// Close one session's connection.
    pub fn kick(&self, session_id: &str) -> Result<()> {
        let agent = self
            .agent(session_id)
            .ok_or_else(|| GateError::NoSuchSession(session_id.to_owned()))?;
        agent.close();
        Ok(())
    }

    /// Expose `Send`, `Broadcast` and `Kick` to backend services.
    ///
    /// Arguments are positional: session id (string), topic (string), body.
    /// `Broadcast` takes topic and body only; `Kick` takes the session id.
    pub fn control_handlers(self: &Arc<Self>, registry: &mut HandlerRegistry) {
        let gate = Arc::clone(self);
        registry.register_fn("Send", move |args: Vec<Argument>| {
            let gate = Arc::clone(&gate);
            async move {
                let session_id = string_arg(&args, 0, "session id")?;
                let topic = string_arg(&args, 1, "topic")?;
                gate.send(&session_id, &topic, body_arg(&args, 2))
                    .map_err(handler_error)?;
                Ok(CallResult::Value(Value::Null))
            }
        });

        let gate = Arc::clone(self);
        registry.register_fn("Broadcast", move |args: Vec<Argument>| {
            let gate = Arc::clone(&gate);
            async move {
                let topic = string_arg(&args, 0, "topic")?;
                let delivered = gate.broadcast(&topic, body_arg(&args, 1));
                Ok(CallResult::Value(json!(delivered)))
            }
        });

        let gate = Arc::clone(self);
        registry.register_fn("Kick", move |args: Vec<Argument>| {
            let gate = Arc::clone(&gate);
            async move {
                let session_id = string_arg(&args, 0, "session id")?;
                gate.kick(&session_id).map_err(handler_error)?;
                Ok(CallResult::Value(Value::Null))
            }
        });
    }
}

fn string_arg(args: &[Argument], index: usize, name: &str) -> std::result::Result<String, HandlerError> {
    match args.get(index) {
        Some(arg) if arg.kind == ArgKind::String => {
            String::from_utf8(arg.data.clone()).map_err(|_| HandlerError::InvalidArgs {
                message: format!("{name} is not valid UTF-8"),
            })
        }
        Some(arg) => Err(HandlerError::InvalidArgs {
            message: format!("{name} must be a string, got {:?}", arg.kind),
        }),
        None => Err(HandlerError::InvalidArgs {
            message: format!("missing {name}"),
        }),
    }
}

fn body_arg(args: &[Argument], index: usize) -> Bytes {
    args.get(index)
        .map(|arg| Bytes::from(arg.data.clone()))
        .unwrap_or_default()
}

fn handler_error(e: GateError) -> HandlerError {
    match e {
        GateError::NoSuchSession(_) => HandlerError::NotFound {
            message: e.to_string(),
        },
        other => HandlerError::Internal {
            message: other.to_string(),
        },
    }
}
