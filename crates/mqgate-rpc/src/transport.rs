//! The publish/subscribe seam.
//!
//! Any broker that can hand out unique inbox addresses, deliver to a single
//! subscriber per address, and fan a published payload to that subscriber
//! can carry mqgate calls. [`MemoryTransport`](crate::memory::MemoryTransport)
//! is the in-process implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Result;

/// One delivered message.
#[derive(Clone, Debug)]
pub struct Message {
    /// Address the message was published to.
    pub subject: String,
    /// Opaque payload.
    pub payload: Bytes,
}

/// A publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Generate a fresh, unique mailbox address.
    fn new_inbox(&self) -> String;

    /// Subscribe to `subject`, returning a pull-style subscription.
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>>;

    /// Publish `payload` to `subject`. Publishing to an address with no
    /// subscriber is not an error.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
}

/// A pull-style subscription to one mailbox.
#[async_trait]
pub trait Subscription: Send {
    /// Subscribed address.
    fn subject(&self) -> &str;

    /// Wait up to `wait` for the next message.
    ///
    /// Returns [`TransportError::Timeout`](crate::TransportError::Timeout)
    /// when the wait elapses and
    /// [`TransportError::Closed`](crate::TransportError::Closed) once the
    /// subscription has ended.
    async fn next_msg(&mut self, wait: Duration) -> Result<Message>;

    /// Stop receiving. Idempotent.
    async fn unsubscribe(&mut self) -> Result<()>;
}
