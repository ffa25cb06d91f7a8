//! In-process transport: one bounded mailbox per subscribed address.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{Result, TransportError};
use crate::transport::{Message, Subscription, Transport};

/// Default mailbox depth.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process publish/subscribe transport.
///
/// Cheap to clone; clones share the same mailbox table.
#[derive(Clone)]
pub struct MemoryTransport {
    mailboxes: Arc<DashMap<String, mpsc::Sender<Message>>>,
    capacity: usize,
}

impl MemoryTransport {
    /// Create a transport with the default mailbox depth.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a transport whose mailboxes hold up to `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            mailboxes: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live mailboxes.
    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::now_v7().simple())
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        match self.mailboxes.entry(subject.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Err(TransportError::AlreadySubscribed(subject.to_owned()));
                }
                let _ = entry.insert(tx.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let _ = entry.insert(tx.clone());
            }
        }
        debug!(subject, "mailbox subscribed");
        Ok(Box::new(MemorySubscription {
            subject: subject.to_owned(),
            rx,
            own: tx,
            mailboxes: Arc::clone(&self.mailboxes),
            closed: false,
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        // Clone the sender out so the shard lock is not held across the await.
        let Some(sender) = self.mailboxes.get(subject).map(|s| s.clone()) else {
            debug!(subject, "publish to address with no subscriber");
            return Ok(());
        };
        let message = Message {
            subject: subject.to_owned(),
            payload,
        };
        if sender.send(message).await.is_err() {
            debug!(subject, "subscriber gone, dropping message");
            let _ = self
                .mailboxes
                .remove_if(subject, |_, s| s.same_channel(&sender));
        }
        Ok(())
    }
}

struct MemorySubscription {
    subject: String,
    rx: mpsc::Receiver<Message>,
    own: mpsc::Sender<Message>,
    mailboxes: Arc<DashMap<String, mpsc::Sender<Message>>>,
    closed: bool,
}

impl MemorySubscription {
    fn detach(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        let own = &self.own;
        let _ = self
            .mailboxes
            .remove_if(&self.subject, |_, s| s.same_channel(own));
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn next_msg(&mut self, wait: Duration) -> Result<Message> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if !self.closed {
            debug!(subject = %self.subject, "mailbox unsubscribed");
        }
        self.detach();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe("svc.a").await.unwrap();
        transport
            .publish("svc.a", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        let msg = sub.next_msg(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.subject, "svc.a");
        assert_eq!(&msg.payload[..], b"hi");
        sub.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_ok() {
        let transport = MemoryTransport::new();
        transport
            .publish("nobody", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(transport.mailbox_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn next_msg_times_out() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe("quiet").await.unwrap();
        let err = sub.next_msg(Duration::from_millis(50)).await.unwrap_err();
        assert_matches!(err, TransportError::Timeout);
        sub.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_closes_and_frees_address() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe("svc.b").await.unwrap();
        assert_eq!(transport.mailbox_count(), 1);

        sub.unsubscribe().await.unwrap();
        sub.unsubscribe().await.unwrap();
        assert_eq!(transport.mailbox_count(), 0);
        assert_matches!(
            sub.next_msg(Duration::from_millis(10)).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn second_subscriber_rejected() {
        let transport = MemoryTransport::new();
        let mut first = transport.subscribe("svc.c").await.unwrap();
        let second = transport.subscribe("svc.c").await;
        assert!(matches!(
            second,
            Err(TransportError::AlreadySubscribed(ref s)) if s == "svc.c"
        ));
        first.unsubscribe().await.unwrap();

        let mut third = transport.subscribe("svc.c").await.unwrap();
        third.unsubscribe().await.unwrap();
    }

    #[test]
    fn inboxes_are_unique() {
        let transport = MemoryTransport::new();
        let a = transport.new_inbox();
        let b = transport.new_inbox();
        assert_ne!(a, b);
        assert!(a.starts_with("_INBOX."));
    }
}
