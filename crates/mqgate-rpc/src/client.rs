//! Caller side of the RPC transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use mqgate_core::{Argument, CallResult, ResultInfo, RpcInfo, TraceId};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{CallError, TransportError};
use crate::transport::{Subscription, Transport};

/// A callable remote service instance.
#[async_trait]
pub trait ServiceEndpoint: Send + Sync {
    /// Address of the instance's inbox.
    fn addr(&self) -> &str;

    /// Call `handler` and wait for its result.
    async fn call_args(
        &self,
        handler: &str,
        args: Vec<Argument>,
        trace_id: TraceId,
    ) -> Result<CallResult, CallError>;

    /// Call `handler` without waiting for, or asking for, a result.
    async fn call_no_reply(
        &self,
        handler: &str,
        args: Vec<Argument>,
        trace_id: TraceId,
    ) -> Result<(), CallError>;
}

/// [`ServiceEndpoint`] over a [`Transport`], correlating replies through a
/// private inbox per call.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    target: String,
    timeout: Duration,
}

impl RpcClient {
    /// Client for the server listening on `target`.
    pub fn new(transport: Arc<dyn Transport>, target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            target: target.into(),
            timeout,
        }
    }

    /// Reply timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn await_reply(
        &self,
        subscription: &mut dyn Subscription,
        envelope: &RpcInfo,
    ) -> Result<ResultInfo, CallError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match subscription.next_msg(remaining).await {
                Ok(message) => message,
                Err(TransportError::Timeout) => {
                    return Err(CallError::Timeout {
                        handler: envelope.handler.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            let result = ResultInfo::decode(&message.payload)?;
            if result.cid == envelope.cid {
                return Ok(result);
            }
            debug!(expected = %envelope.cid, got = %result.cid, "discarding stray reply");
        }
    }
}

#[async_trait]
impl ServiceEndpoint for RpcClient {
    fn addr(&self) -> &str {
        &self.target
    }

    async fn call_args(
        &self,
        handler: &str,
        args: Vec<Argument>,
        trace_id: TraceId,
    ) -> Result<CallResult, CallError> {
        counter!("rpc_client_calls_total", "handler" => handler.to_owned()).increment(1);
        let inbox = self.transport.new_inbox();
        let mut subscription = self.transport.subscribe(&inbox).await?;

        let envelope = RpcInfo::new(handler, args, trace_id)
            .with_reply_to(inbox)
            .with_ttl(self.timeout);
        let outcome = match envelope.encode() {
            Ok(bytes) => match self.transport.publish(&self.target, Bytes::from(bytes)).await {
                Ok(()) => self.await_reply(subscription.as_mut(), &envelope).await,
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        };

        if let Err(e) = subscription.unsubscribe().await {
            warn!(error = %e, "failed to release reply inbox");
        }

        outcome?.into_call_result().map_err(CallError::Remote)
    }

    async fn call_no_reply(
        &self,
        handler: &str,
        args: Vec<Argument>,
        trace_id: TraceId,
    ) -> Result<(), CallError> {
        counter!("rpc_client_calls_total", "handler" => handler.to_owned()).increment(1);
        let envelope = RpcInfo::new(handler, args, trace_id);
        let bytes = envelope.encode()?;
        self.transport.publish(&self.target, Bytes::from(bytes)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn call_times_out_without_server() {
        let transport = Arc::new(MemoryTransport::new());
        let client = RpcClient::new(transport.clone(), "_INBOX.none", Duration::from_secs(2));

        let err = client
            .call_args("HD_ping", vec![], TraceId::new())
            .await
            .unwrap_err();

        assert_matches!(err, CallError::Timeout { handler } if handler == "HD_ping");
        assert_eq!(transport.mailbox_count(), 0);
    }

    #[tokio::test]
    async fn stray_reply_is_ignored() {
        let transport = Arc::new(MemoryTransport::new());
        let client = RpcClient::new(transport.clone(), "svc", Duration::from_secs(1));
        let mut server = transport.subscribe("svc").await.unwrap();

        let replier = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let msg = server.next_msg(Duration::from_secs(1)).await.unwrap();
                let envelope = RpcInfo::decode(&msg.payload).unwrap();
                let stray = ResultInfo::err(mqgate_core::CallId::new(), "wrong call");
                let real = ResultInfo::ok(
                    envelope.cid.clone(),
                    Argument::json(&json!({"pong": true})).unwrap(),
                );
                for result in [stray, real] {
                    transport
                        .publish(&envelope.reply_to, Bytes::from(result.encode().unwrap()))
                        .await
                        .unwrap();
                }
                server.unsubscribe().await.unwrap();
            })
        };

        let result = client
            .call_args("HD_ping", vec![], TraceId::new())
            .await
            .unwrap();
        assert_eq!(result, CallResult::Value(json!({"pong": true})));
        replier.await.unwrap();
    }

    #[tokio::test]
    async fn no_reply_envelope_has_no_reply_address() {
        let transport = Arc::new(MemoryTransport::new());
        let client = RpcClient::new(transport.clone(), "svc", Duration::from_secs(1));
        let mut server = transport.subscribe("svc").await.unwrap();

        client
            .call_no_reply("HD_note", vec![Argument::string("x")], TraceId::new())
            .await
            .unwrap();

        let msg = server.next_msg(Duration::from_secs(1)).await.unwrap();
        let envelope = RpcInfo::decode(&msg.payload).unwrap();
        assert!(!envelope.reply);
        assert!(envelope.reply_to.is_empty());
        assert_eq!(envelope.handler, "HD_note");
        server.unsubscribe().await.unwrap();
    }
}
