//! Handler registry: the name → handler [`CallExecutor`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use mqgate_core::envelope::now_ms;
use mqgate_core::{Argument, CallResult, ResultInfo};
use tracing::{debug, error, warn};

use crate::call::{CallExecutor, CallInfo};
use crate::errors::HandlerError;

/// A named remote function.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Run the function on positional arguments.
    async fn handle(&self, args: Vec<Argument>) -> Result<CallResult, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(Vec<Argument>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CallResult, HandlerError>> + Send + 'static,
{
    async fn handle(&self, args: Vec<Argument>) -> Result<CallResult, HandlerError> {
        (self.0)(args).await
    }
}

/// Maps handler names to [`RpcHandler`]s and executes calls against them.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
    timeout: Duration,
}

impl HandlerRegistry {
    /// Longest a handler may run by default.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-call handler timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register(&mut self, name: &str, handler: impl RpcHandler + 'static) {
        let _ = self.handlers.insert(name.to_owned(), Arc::new(handler));
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(Vec<Argument>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallResult, HandlerError>> + Send + 'static,
    {
        self.register(name, FnHandler(f));
    }

    /// Whether a handler exists for `name`.
    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `handler` on `args` and build the result envelope.
    async fn run(&self, call: &mut CallInfo) -> ResultInfo {
        let cid = call.envelope.cid.clone();
        let name = call.envelope.handler.clone();
        counter!("rpc_calls_total", "handler" => name.clone()).increment(1);

        let Some(handler) = self.handlers.get(&name) else {
            counter!("rpc_call_errors_total", "handler" => name.clone(), "error_type" => "not_found")
                .increment(1);
            return ResultInfo::err(cid, format!("Remote function({name}) not found"));
        };

        let args = std::mem::take(&mut call.envelope.args);
        let start = std::time::Instant::now();
        let outcome = tokio::time::timeout(self.timeout, handler.handle(args)).await;
        histogram!("rpc_call_duration_seconds", "handler" => name.clone())
            .record(start.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(result)) => match result.into_argument() {
                Ok(arg) => ResultInfo::ok(cid, arg),
                Err(e) => {
                    error!(handler = %name, error = %e, "failed to encode handler result");
                    ResultInfo::err(cid, e.to_string())
                }
            },
            Ok(Err(e)) => {
                counter!("rpc_call_errors_total", "handler" => name.clone(), "error_type" => "handler")
                    .increment(1);
                debug!(handler = %name, error = %e, "handler returned error");
                ResultInfo::err(cid, e.to_string())
            }
            Err(_elapsed) => {
                counter!("rpc_call_errors_total", "handler" => name.clone(), "error_type" => "timeout")
                    .increment(1);
                error!(handler = %name, "handler timed out after {:?}", self.timeout);
                ResultInfo::err(cid, format!("Handler for '{name}' timed out"))
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallExecutor for HandlerRegistry {
    async fn execute(&self, mut call: CallInfo) {
        if call.envelope.is_expired_at(now_ms()) {
            warn!(
                cid = %call.envelope.cid,
                handler = %call.envelope.handler,
                "call expired before execution, dropping"
            );
            counter!("rpc_calls_expired_total").increment(1);
            return;
        }

        let result = self.run(&mut call).await;
        if !call.wants_reply() {
            if let mqgate_core::Outcome::Err(e) = &result.outcome {
                warn!(handler = %call.envelope.handler, error = %e, "no-reply call failed");
            }
            return;
        }

        call.result = Some(result);
        let responder = Arc::clone(&call.responder);
        let cid = call.envelope.cid.clone();
        if let Err(e) = responder.callback(call).await {
            error!(%cid, error = %e, "failed to publish call result");
        }
    }
}
