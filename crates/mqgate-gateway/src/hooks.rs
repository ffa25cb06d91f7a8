//! Collaborators the gateway calls out to.
//!
//! Only [`ServiceResolver`] and [`ResultMarshaler`] are required; the rest
//! are optional and skipped when not configured.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mqgate_core::{CallResult, Session, TraceId};
use mqgate_rpc::ServiceEndpoint;
use serde_json::Value;

use crate::agent::Agent;

/// Finds a live service instance for a topic's service reference.
pub trait ServiceResolver: Send + Sync {
    /// `service_ref` is `type` or `type@id`.
    fn resolve(&self, service_ref: &str) -> Option<Arc<dyn ServiceEndpoint>>;
}

/// Observes connection lifecycle.
///
/// Called synchronously from the connection task; keep it cheap.
pub trait AgentLearner: Send + Sync {
    /// Handshake completed.
    fn connect(&self, agent: &Arc<Agent>);
    /// Connection closed. Only called for agents that were announced by
    /// [`connect`](Self::connect).
    fn disconnect(&self, agent: &Arc<Agent>);
}

/// Receives throttled liveness notifications for storage-backed sessions.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    /// The session was active within the last heartbeat interval.
    async fn heartbeat(&self, session: &Session);
}

/// What a custom route decided for one publish.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteOutcome {
    /// Whether a reply frame is written.
    pub reply: bool,
    /// Result to reply with.
    pub result: Option<CallResult>,
    /// Error to reply with; takes the error field when set.
    pub error: Option<String>,
}

impl RouteOutcome {
    /// Nothing to send back.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Reply with a result.
    pub fn reply(result: CallResult) -> Self {
        Self {
            reply: true,
            result: Some(result),
            error: None,
        }
    }

    /// Reply with an error.
    pub fn reply_error(error: impl Into<String>) -> Self {
        Self {
            reply: true,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Replaces default topic routing entirely when configured.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Handle one publish.
    async fn on_route(&self, session: &Session, topic: &str, body: Bytes) -> RouteOutcome;
}

/// Last look at every outbound message body.
pub trait SendHook: Send + Sync {
    /// Return the body to send, or an error to drop the message.
    fn transform(&self, session: &Session, topic: &str, body: Bytes) -> Result<Bytes, String>;
}

/// Builds the reply body for a call result.
pub trait ResultMarshaler: Send + Sync {
    /// `error` is empty on success.
    fn marshal(
        &self,
        trace_id: &TraceId,
        result: Option<&Value>,
        error: &str,
    ) -> Result<Bytes, String>;
}

/// Guest-classification predicate applied to every new session.
pub type GuestJudge = Arc<dyn Fn(&Session) -> bool + Send + Sync>;
