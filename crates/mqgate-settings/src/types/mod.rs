//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial
//! JSON files are accepted and missing fields keep their default.

mod gate;
mod logging;
mod rpc;

pub use gate::*;
pub use logging::*;
pub use rpc::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "gate": { "listenAddr": "0.0.0.0:1883", "concurrentTasks": 50 },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqgateSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// Client-facing gateway settings.
    pub gate: GateSettings,
    /// RPC transport settings.
    pub rpc: RpcSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for MqgateSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "mqgate".to_string(),
            gate: GateSettings::default(),
            rpc: RpcSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl MqgateSettings {
    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.gate.concurrent_tasks == 0 {
            return Err(SettingsError::InvalidValue(
                "gate.concurrentTasks must be at least 1".into(),
            ));
        }
        if self.gate.buf_size == 0 {
            return Err(SettingsError::InvalidValue(
                "gate.bufSize must be at least 1".into(),
            ));
        }
        if self.gate.max_pack_size < 2 {
            return Err(SettingsError::InvalidValue(
                "gate.maxPackSize must be at least 2".into(),
            ));
        }
        if self.rpc.wait_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "rpc.waitTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}
