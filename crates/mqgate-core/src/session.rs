//! Per-connection session identity.
//!
//! A [`Session`] is created once when a client completes its handshake and
//! is owned by that connection's agent. Every dispatched request works on a
//! clone produced by [`Session::for_request`], which stamps the triggering
//! topic and changes nothing else, so concurrent workers never share a
//! mutable instance.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, Result};
use crate::ids::{SessionId, TraceId};

/// Identity and trace context of one client connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Generated unique session id.
    pub id: SessionId,
    /// Network of the peer address (`"tcp"`, `"memory"`, ...).
    pub network: String,
    /// Peer address as reported by the socket.
    pub peer_addr: String,
    /// Id of the gateway server instance that owns the connection.
    pub server_id: String,
    /// User id bound by a backend after login; `None` until then.
    pub user_id: Option<String>,
    /// Free-form key/value settings shared with backends.
    pub settings: HashMap<String, String>,
    /// Trace context for calls issued on behalf of this session.
    pub trace_id: TraceId,
    /// Topic of the request this clone was made for. Unset on the base session.
    pub topic: Option<String>,
    /// Result of the gateway's guest-classification predicate.
    pub guest: bool,
}

impl Session {
    /// Create a session for a freshly accepted peer.
    pub fn new(
        network: impl Into<String>,
        peer_addr: impl Into<String>,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            network: network.into(),
            peer_addr: peer_addr.into(),
            server_id: server_id.into(),
            user_id: None,
            settings: HashMap::new(),
            trace_id: TraceId::new(),
            topic: None,
            guest: true,
        }
    }

    /// Apply a guest-classification predicate and record its verdict.
    pub fn judge_guest(&mut self, judge: impl Fn(&Session) -> bool) {
        self.guest = judge(self);
    }

    /// Start a fresh trace context.
    pub fn create_trace(&mut self) {
        self.trace_id = TraceId::new();
    }

    /// Whether the session was classified as a guest.
    pub fn is_guest(&self) -> bool {
        self.guest
    }

    /// Shallow clone carrying the topic of the request being dispatched.
    #[must_use]
    pub fn for_request(&self, topic: &str) -> Self {
        let mut session = self.clone();
        session.topic = Some(topic.to_owned());
        session
    }

    /// Serialize for transport as a call argument.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|source| CoreError::Encode {
            what: "session",
            source,
        })
    }

    /// Decode a session argument.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|source| CoreError::Decode {
            what: "session",
            source,
        })
    }
}

/// Default guest predicate: a session without a bound user is a guest.
pub fn guest_until_bound(session: &Session) -> bool {
    session.user_id.is_none()
}
