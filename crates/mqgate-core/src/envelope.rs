//! Call envelope, call result, and typed argument blobs.
//!
//! `RpcInfo` is what a caller publishes to a service instance's mailbox;
//! `ResultInfo` is what the service publishes back to `reply_to`. Both are
//! bincode-encoded. Arguments travel as `(kind, bytes)` pairs so a receiver
//! can decode each one without guessing its type.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CoreError, Result};
use crate::ids::{CallId, TraceId};
use crate::session::Session;

/// Type tag of an argument blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgKind {
    /// No value.
    Null,
    /// UTF-8 text.
    String,
    /// Opaque bytes.
    Bytes,
    /// A JSON document (already validated by the producer).
    Json,
    /// A bincode-encoded [`Session`].
    Session,
    /// A reply body already encoded for the client; written through unchanged.
    PreEncoded,
}

/// One typed argument or result blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argument {
    /// How `data` is to be interpreted.
    pub kind: ArgKind,
    /// Raw bytes.
    pub data: Vec<u8>,
}

impl Argument {
    /// Empty argument.
    pub fn null() -> Self {
        Self {
            kind: ArgKind::Null,
            data: Vec::new(),
        }
    }

    /// Text argument.
    pub fn string(s: impl Into<String>) -> Self {
        Self {
            kind: ArgKind::String,
            data: s.into().into_bytes(),
        }
    }

    /// Opaque byte argument.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ArgKind::Bytes,
            data: data.into(),
        }
    }

    /// JSON argument from raw bytes that the caller has already validated.
    pub fn json_raw(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ArgKind::Json,
            data: data.into(),
        }
    }

    /// JSON argument from a value.
    pub fn json(value: &Value) -> Result<Self> {
        Ok(Self::json_raw(serde_json::to_vec(value)?))
    }

    /// Session argument.
    pub fn session(session: &Session) -> Result<Self> {
        Ok(Self {
            kind: ArgKind::Session,
            data: session.to_bytes()?,
        })
    }

    /// Pre-encoded reply body.
    pub fn pre_encoded(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ArgKind::PreEncoded,
            data: data.into(),
        }
    }

    /// Decode a JSON argument.
    pub fn as_json(&self) -> Result<Value> {
        self.expect_kind(ArgKind::Json)?;
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Decode a session argument.
    pub fn as_session(&self) -> Result<Session> {
        self.expect_kind(ArgKind::Session)?;
        Session::from_bytes(&self.data)
    }

    fn expect_kind(&self, expected: ArgKind) -> Result<()> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(CoreError::ArgumentKind {
                expected,
                found: self.kind,
            })
        }
    }
}

/// Result value at the reply boundary.
///
/// Resolved once when a reply frame is built: pre-encoded bodies are
/// written verbatim, values go through the result marshaler.
#[derive(Clone, Debug, PartialEq)]
pub enum CallResult {
    /// Body already encoded for the client.
    PreEncoded(Bytes),
    /// Any other value.
    Value(Value),
}

impl CallResult {
    /// Interpret a result blob received from a service.
    pub fn from_argument(arg: Argument) -> Result<Self> {
        let value = match arg.kind {
            ArgKind::PreEncoded => return Ok(Self::PreEncoded(Bytes::from(arg.data))),
            ArgKind::Null => Value::Null,
            ArgKind::String => Value::String(String::from_utf8_lossy(&arg.data).into_owned()),
            ArgKind::Bytes => Value::String(BASE64.encode(&arg.data)),
            ArgKind::Json => serde_json::from_slice(&arg.data)?,
            ArgKind::Session => serde_json::to_value(Session::from_bytes(&arg.data)?)?,
        };
        Ok(Self::Value(value))
    }

    /// Encode for the result envelope.
    pub fn into_argument(self) -> Result<Argument> {
        match self {
            Self::PreEncoded(bytes) => Ok(Argument::pre_encoded(bytes.to_vec())),
            Self::Value(Value::Null) => Ok(Argument::null()),
            Self::Value(Value::String(s)) => Ok(Argument::string(s)),
            Self::Value(value) => Argument::json(&value),
        }
    }
}

impl From<Value> for CallResult {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Call request published to a service instance's mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcInfo {
    /// Call id, echoed back in the result.
    pub cid: CallId,
    /// Handler name on the target service.
    pub handler: String,
    /// Whether the caller is waiting for a result.
    pub reply: bool,
    /// Mailbox the result must be published to. Empty when `reply` is false.
    pub reply_to: String,
    /// Unix-millisecond deadline after which the call is dropped; `0` = none.
    pub expired_at_ms: i64,
    /// Trace context of the originating session.
    pub trace_id: TraceId,
    /// Positional arguments.
    pub args: Vec<Argument>,
}

impl RpcInfo {
    /// Fire-and-forget envelope.
    pub fn new(handler: impl Into<String>, args: Vec<Argument>, trace_id: TraceId) -> Self {
        Self {
            cid: CallId::new(),
            handler: handler.into(),
            reply: false,
            reply_to: String::new(),
            expired_at_ms: 0,
            trace_id,
            args,
        }
    }

    /// Request a reply on `addr`.
    #[must_use]
    pub fn with_reply_to(mut self, addr: impl Into<String>) -> Self {
        self.reply = true;
        self.reply_to = addr.into();
        self
    }

    /// Drop the call if it is not executed within `ttl` from now.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.expired_at_ms = now_ms().saturating_add(ttl_ms);
        self
    }

    /// Whether the deadline, if any, has passed at `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expired_at_ms > 0 && now_ms > self.expired_at_ms
    }

    /// Binary encoding for the transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|source| CoreError::Encode {
            what: "call envelope",
            source,
        })
    }

    /// Decode an envelope received from the transport.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|source| CoreError::Decode {
            what: "call envelope",
            source,
        })
    }
}

/// Success or failure of one call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Handler returned a value.
    Ok(Argument),
    /// Handler or dispatch failed with this message.
    Err(String),
}

/// Reply published to a call's `reply_to` mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultInfo {
    /// Id of the call this answers.
    pub cid: CallId,
    /// Result or error string; exactly one is meaningful.
    pub outcome: Outcome,
}

impl ResultInfo {
    /// Successful result.
    pub fn ok(cid: CallId, result: Argument) -> Self {
        Self {
            cid,
            outcome: Outcome::Ok(result),
        }
    }

    /// Failed result.
    pub fn err(cid: CallId, error: impl Into<String>) -> Self {
        Self {
            cid,
            outcome: Outcome::Err(error.into()),
        }
    }

    /// Binary encoding for the transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|source| CoreError::Encode {
            what: "call result",
            source,
        })
    }

    /// Decode a result received from the transport.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|source| CoreError::Decode {
            what: "call result",
            source,
        })
    }

    /// Convert into the caller-facing result, flattening decode failures
    /// into the error string.
    pub fn into_call_result(self) -> std::result::Result<CallResult, String> {
        match self.outcome {
            Outcome::Ok(arg) => CallResult::from_argument(arg).map_err(|e| e.to_string()),
            Outcome::Err(e) => Err(e),
        }
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
