//! Per-gate connection options.

use std::time::Duration;

use mqgate_settings::GateSettings;

/// Limits and timers applied to every connection a gate accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateOptions {
    /// Dispatch workers allowed to run at once per connection.
    pub concurrent_tasks: usize,
    /// Initial read buffer capacity.
    pub buf_size: usize,
    /// Largest accepted packet remaining length.
    pub max_pack_size: usize,
    /// How long a peer has to send CONNECT.
    pub over_time: Duration,
    /// Minimum spacing between storage heartbeats.
    pub heartbeat: Duration,
    /// Outbound frames buffered ahead of the writer task.
    pub outbound_queue: usize,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self::from(&GateSettings::default())
    }
}

impl From<&GateSettings> for GateOptions {
    fn from(settings: &GateSettings) -> Self {
        Self {
            concurrent_tasks: settings.concurrent_tasks.max(1),
            buf_size: settings.buf_size,
            max_pack_size: settings.max_pack_size,
            over_time: settings.over_time(),
            heartbeat: settings.heartbeat(),
            outbound_queue: settings.outbound_queue.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let options = GateOptions::default();
        assert_eq!(options.concurrent_tasks, 20);
        assert_eq!(options.buf_size, 2048);
        assert_eq!(options.max_pack_size, 65_535);
        assert_eq!(options.over_time, Duration::from_secs(10));
        assert_eq!(options.heartbeat, Duration::from_secs(60));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let settings = GateSettings {
            outbound_queue: 0,
            ..GateSettings::default()
        };
        assert_eq!(GateOptions::from(&settings).outbound_queue, 1);
    }
}
