//! RPC transport settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timers of the RPC transport server and client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcSettings {
    /// Bounded wait of the transport server's receive loop, in milliseconds.
    pub wait_timeout_ms: u64,
    /// How long a caller waits for a reply, in milliseconds.
    pub call_timeout_ms: u64,
    /// Capacity of each in-process mailbox.
    pub mailbox_capacity: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 60_000,
            call_timeout_ms: 10_000,
            mailbox_capacity: 1024,
        }
    }
}

impl RpcSettings {
    /// Receive-loop wait.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Caller reply timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
