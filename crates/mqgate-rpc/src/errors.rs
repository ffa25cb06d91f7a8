//! Transport, call and handler error types.

use mqgate_core::CoreError;
use thiserror::Error;

/// Errors raised by a [`Transport`](crate::transport::Transport) or its subscriptions.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A bounded wait elapsed without a message. Not a failure.
    #[error("timed out waiting for a message")]
    Timeout,

    /// The subscription or transport has been shut down.
    #[error("subscription closed")]
    Closed,

    /// Another subscriber already owns this mailbox.
    #[error("mailbox '{0}' already has a subscriber")]
    AlreadySubscribed(String),

    /// A call envelope or result could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CoreError),

    /// The call had no result or no address to publish it to.
    #[error("call {cid} has nothing to reply: {reason}")]
    NoReply {
        /// Call id.
        cid: String,
        /// What was missing.
        reason: &'static str,
    },
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Why a call made through a [`ServiceEndpoint`](crate::client::ServiceEndpoint) failed.
#[derive(Debug, Error)]
pub enum CallError {
    /// The remote handler reported an error; the message is passed through verbatim.
    #[error("{0}")]
    Remote(String),

    /// No reply arrived in time.
    #[error("call to '{handler}' timed out")]
    Timeout {
        /// Handler that was called.
        handler: String,
    },

    /// Publishing or receiving failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Arguments or reply could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CoreError),
}

/// Error returned by an [`RpcHandler`](crate::registry::RpcHandler).
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Arguments missing or of the wrong kind.
    #[error("{message}")]
    InvalidArgs {
        /// Description of what is wrong.
        message: String,
    },

    /// Something the handler needed does not exist.
    #[error("{message}")]
    NotFound {
        /// Description.
        message: String,
    },

    /// Handler failed.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        Self::InvalidArgs {
            message: err.to_string(),
        }
    }
}
