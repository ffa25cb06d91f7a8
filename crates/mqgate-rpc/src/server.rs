//! RPC transport server.
//!
//! Binds one inbox on the transport and runs a receive task that decodes
//! call envelopes and hands each to a [`CallExecutor`], inline. Results come
//! back through [`TransportServer::callback`], which publishes them to the
//! caller's reply address.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use mqgate_core::{ResultInfo, RpcInfo};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::call::{CallExecutor, CallInfo, Responder};
use crate::errors::{Result, TransportError};
use crate::transport::{Message, Subscription, Transport};

/// Receives calls on one inbox and publishes their results.
pub struct TransportServer {
    addr: String,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportServer {
    /// Bind a fresh inbox and start the receive task.
    ///
    /// The subscription is in place before this returns, so calls published
    /// to [`addr`](Self::addr) right afterwards are not lost.
    pub async fn start(
        transport: Arc<dyn Transport>,
        executor: Arc<dyn CallExecutor>,
        wait: Duration,
    ) -> Result<Arc<Self>> {
        let addr = transport.new_inbox();
        Self::start_at(transport, executor, wait, addr).await
    }

    /// Like [`start`](Self::start), on a caller-chosen address.
    pub async fn start_at(
        transport: Arc<dyn Transport>,
        executor: Arc<dyn CallExecutor>,
        wait: Duration,
        addr: String,
    ) -> Result<Arc<Self>> {
        let subscription = transport.subscribe(&addr).await?;
        let server = Arc::new(Self {
            addr,
            transport,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&server).receive_loop(subscription, executor, wait));
        *server.task.lock() = Some(handle);
        info!(addr = %server.addr, "transport server started");
        Ok(server)
    }

    /// Inbox address this server receives on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the receive task. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        info!(addr = %self.addr, "transport server shutting down");
    }

    /// Wait for the receive task to finish after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(addr = %self.addr, error = %e, "receive task ended abnormally");
            }
        }
    }

    #[instrument(skip_all, fields(addr = %self.addr))]
    async fn receive_loop(
        self: Arc<Self>,
        mut subscription: Box<dyn Subscription>,
        executor: Arc<dyn CallExecutor>,
        wait: Duration,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = subscription.next_msg(wait) => next,
            };
            match next {
                Ok(message) => self.handle_message(&executor, message).await,
                Err(TransportError::Timeout) => {}
                Err(TransportError::Closed) => {
                    warn!("subscription closed, stopping receive loop");
                    break;
                }
                Err(e) => error!(error = %e, "receive failed"),
            }
        }

        if let Err(e) = subscription.unsubscribe().await {
            warn!(error = %e, "unsubscribe failed");
        }
        self.closed.store(true, Ordering::Release);
        debug!("receive loop stopped");
    }

    async fn handle_message(self: &Arc<Self>, executor: &Arc<dyn CallExecutor>, message: Message) {
        let envelope = match RpcInfo::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, len = message.payload.len(), "dropping undecodable call");
                return;
            }
        };

        let cid = envelope.cid.clone();
        let handler = envelope.handler.clone();
        let responder: Arc<dyn Responder> = Arc::clone(self) as Arc<dyn Responder>;
        let call = CallInfo::new(envelope, responder);

        // Inline on the receive task; the spawn only isolates panics.
        let executor = Arc::clone(executor);
        let run = tokio::spawn(async move { executor.execute(call).await });
        if let Err(e) = run.await {
            counter!("rpc_executor_faults_total").increment(1);
            error!(%cid, handler, error = %e, "call executor faulted");
        }
    }

    async fn publish_result(&self, reply_to: &str, result: &ResultInfo) -> Result<()> {
        let bytes = result.encode()?;
        self.transport.publish(reply_to, Bytes::from(bytes)).await
    }
}

#[async_trait]
impl Responder for TransportServer {
    async fn callback(&self, call: CallInfo) -> Result<()> {
        let cid = call.envelope.cid.to_string();
        if call.reply_to().is_empty() {
            return Err(TransportError::NoReply {
                cid,
                reason: "no reply address",
            });
        }
        let Some(result) = call.result.as_ref() else {
            return Err(TransportError::NoReply {
                cid,
                reason: "no result",
            });
        };
        self.publish_result(call.reply_to(), result).await
    }
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use mqgate_core::{Argument, Outcome, TraceId};
    use std::sync::atomic::AtomicUsize;

    /// Answers every call with its first argument, counting executions.
    struct Echo {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl CallExecutor for Echo {
        async fn execute(&self, mut call: CallInfo) {
            let _ = self.runs.fetch_add(1, Ordering::SeqCst);
            if !call.wants_reply() {
                return;
            }
            let first = call.envelope.args.first().cloned().unwrap_or_else(Argument::null);
            call.result = Some(ResultInfo::ok(call.envelope.cid.clone(), first));
            let responder = Arc::clone(&call.responder);
            responder.callback(call).await.unwrap();
        }
    }

    struct Panics;

    #[async_trait]
    impl CallExecutor for Panics {
        async fn execute(&self, _call: CallInfo) {
            panic!("executor exploded");
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            runs: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn call_is_answered_once_on_reply_address() {
        let transport = Arc::new(MemoryTransport::new());
        let executor = echo();
        let server = TransportServer::start(
            transport.clone(),
            executor.clone(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let inbox = transport.new_inbox();
        let mut replies = transport.subscribe(&inbox).await.unwrap();
        let envelope = RpcInfo::new("HD_echo", vec![Argument::string("hi")], TraceId::new())
            .with_reply_to(inbox.clone());
        transport
            .publish(server.addr(), Bytes::from(envelope.encode().unwrap()))
            .await
            .unwrap();

        let msg = replies.next_msg(Duration::from_secs(1)).await.unwrap();
        let result = ResultInfo::decode(&msg.payload).unwrap();
        assert_eq!(result.cid, envelope.cid);
        assert_eq!(result.outcome, Outcome::Ok(Argument::string("hi")));

        assert!(matches!(
            replies.next_msg(Duration::from_millis(100)).await,
            Err(TransportError::Timeout)
        ));
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);

        replies.unsubscribe().await.unwrap();
        server.shutdown();
        server.join().await;
    }

    #[tokio::test]
    async fn garbage_is_dropped_and_loop_continues() {
        let transport = Arc::new(MemoryTransport::new());
        let executor = echo();
        let server = TransportServer::start(
            transport.clone(),
            executor.clone(),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        transport
            .publish(server.addr(), Bytes::from_static(b"\xff\xff\xff"))
            .await
            .unwrap();
        let envelope = RpcInfo::new("HD_echo", vec![], TraceId::new());
        transport
            .publish(server.addr(), Bytes::from(envelope.encode().unwrap()))
            .await
            .unwrap();

        for _ in 0..50 {
            if executor.runs.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
        server.shutdown();
        server.join().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_frees_inbox() {
        let transport = Arc::new(MemoryTransport::new());
        let server = TransportServer::start(transport.clone(), echo(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(transport.mailbox_count(), 1);

        server.shutdown();
        server.shutdown();
        server.join().await;
        server.join().await;

        assert!(server.is_closed());
        assert_eq!(transport.mailbox_count(), 0);
    }

    #[tokio::test]
    async fn executor_panic_does_not_stop_the_loop() {
        let transport = Arc::new(MemoryTransport::new());
        let server = TransportServer::start(
            transport.clone(),
            Arc::new(Panics),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        for _ in 0..2 {
            let envelope = RpcInfo::new("HD_x", vec![], TraceId::new());
            transport
                .publish(server.addr(), Bytes::from(envelope.encode().unwrap()))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.is_closed());
        assert_eq!(transport.mailbox_count(), 1);

        server.shutdown();
        server.join().await;
    }

    #[tokio::test]
    async fn callback_without_result_is_an_error() {
        let transport = Arc::new(MemoryTransport::new());
        let server = TransportServer::start(transport.clone(), echo(), Duration::from_millis(20))
            .await
            .unwrap();

        let envelope =
            RpcInfo::new("HD_echo", vec![], TraceId::new()).with_reply_to("_INBOX.nobody");
        let call = CallInfo::new(envelope, server.clone());
        let err = server.callback(call).await.unwrap_err();
        assert!(matches!(err, TransportError::NoReply { reason: "no result", .. }));

        server.shutdown();
        server.join().await;
    }
}
