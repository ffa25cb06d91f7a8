//! # mqgate-core
//!
//! Foundation types shared by the gateway and the RPC transport.
//!
//! - **Branded IDs**: `SessionId`, `TraceId`, `CallId` as newtypes for type safety
//! - **Session**: per-connection identity, cloned per dispatched request
//! - **Envelope**: the binary call request (`RpcInfo`) and its reply (`ResultInfo`)
//! - **Arguments**: typed argument blobs and the `CallResult` reply union
//! - **Errors**: `CoreError` via `thiserror`

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod session;

pub use envelope::{ArgKind, Argument, CallResult, Outcome, ResultInfo, RpcInfo};
pub use errors::{CoreError, Result};
pub use ids::{CallId, SessionId, TraceId};
pub use session::Session;
