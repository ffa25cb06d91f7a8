//! Client-facing gateway settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-connection limits and timers of the gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GateSettings {
    /// TCP address the gateway listens on.
    pub listen_addr: String,
    /// Id of this gateway instance, recorded on every session.
    pub server_id: String,
    /// Maximum dispatch workers running at once per connection.
    pub concurrent_tasks: usize,
    /// Read/write buffer size per connection in bytes.
    pub buf_size: usize,
    /// Largest accepted wire frame in bytes.
    pub max_pack_size: usize,
    /// Time a client has to complete the handshake, in milliseconds.
    pub over_time_ms: u64,
    /// Minimum interval between storage heartbeats per connection, in milliseconds.
    pub heartbeat_ms: u64,
    /// Capacity of the per-connection outbound frame queue.
    pub outbound_queue: usize,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3563".to_string(),
            server_id: "gate@1".to_string(),
            concurrent_tasks: 20,
            buf_size: 2048,
            max_pack_size: 65_535,
            over_time_ms: 10_000,
            heartbeat_ms: 60_000,
            outbound_queue: 256,
        }
    }
}

impl GateSettings {
    /// Handshake deadline.
    pub fn over_time(&self) -> Duration {
        Duration::from_millis(self.over_time_ms)
    }

    /// Storage heartbeat interval.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}
