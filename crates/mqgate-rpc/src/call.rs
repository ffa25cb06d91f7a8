//! A received call and the two seams around it.

use std::sync::Arc;

use async_trait::async_trait;
use mqgate_core::{ResultInfo, RpcInfo};
use tokio::time::Instant;

use crate::errors::Result;

/// One inbound call, handed from the server to the executor.
pub struct CallInfo {
    /// Decoded request.
    pub envelope: RpcInfo,
    /// Result to publish. Filled by the executor before calling back.
    pub result: Option<ResultInfo>,
    /// Where to send the result.
    pub responder: Arc<dyn Responder>,
    /// When the server received the call.
    pub received_at: Instant,
}

impl CallInfo {
    /// Wrap a decoded envelope.
    pub fn new(envelope: RpcInfo, responder: Arc<dyn Responder>) -> Self {
        Self {
            envelope,
            result: None,
            responder,
            received_at: Instant::now(),
        }
    }

    /// Mailbox the result goes to.
    pub fn reply_to(&self) -> &str {
        &self.envelope.reply_to
    }

    /// Whether the caller waits for a result.
    pub fn wants_reply(&self) -> bool {
        self.envelope.reply && !self.envelope.reply_to.is_empty()
    }
}

impl std::fmt::Debug for CallInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInfo")
            .field("cid", &self.envelope.cid)
            .field("handler", &self.envelope.handler)
            .field("reply_to", &self.envelope.reply_to)
            .field("has_result", &self.result.is_some())
            .finish_non_exhaustive()
    }
}

/// Publishes a finished call's result back to its caller.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Publish `call.result` to `call.reply_to()`.
    async fn callback(&self, call: CallInfo) -> Result<()>;
}

/// Runs calls received by a server.
///
/// An executor must call [`Responder::callback`] exactly once for every
/// call that wants a reply.
#[async_trait]
pub trait CallExecutor: Send + Sync {
    /// Execute one call.
    async fn execute(&self, call: CallInfo);
}
