//! # mqgate-rpc
//!
//! Request/response over a publish/subscribe transport.
//!
//! - [`transport`]: the `Transport` / `Subscription` seam and message type
//! - [`memory`]: in-process `MemoryTransport` (dashmap of mailboxes)
//! - [`server`]: `TransportServer`, which owns one inbound mailbox, decodes
//!   call envelopes, hands them to a `CallExecutor`, and publishes results
//!   to each call's reply address
//! - [`registry`]: `HandlerRegistry`, the name → handler call executor
//! - [`client`]: `RpcClient`, the caller side, correlating replies through a
//!   private inbox

#![deny(unsafe_code)]

pub mod call;
pub mod client;
pub mod errors;
pub mod memory;
pub mod registry;
pub mod server;
pub mod transport;

pub use call::{CallExecutor, CallInfo, Responder};
pub use client::{RpcClient, ServiceEndpoint};
pub use errors::{CallError, HandlerError, Result, TransportError};
pub use memory::MemoryTransport;
pub use registry::{HandlerRegistry, RpcHandler};
pub use server::TransportServer;
pub use transport::{Message, Subscription, Transport};
