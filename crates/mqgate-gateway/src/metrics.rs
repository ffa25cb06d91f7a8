//! Metric names recorded through the `metrics` facade.
//!
//! No recorder is installed here; the embedding binary decides where they go.

/// Connections accepted (counter).
pub const GATE_CONNECTIONS_TOTAL: &str = "gate_connections_total";
/// Connections closed (counter).
pub const GATE_DISCONNECTIONS_TOTAL: &str = "gate_disconnections_total";
/// Connections with a completed handshake (gauge).
pub const GATE_CONNECTIONS_ACTIVE: &str = "gate_connections_active";
/// Handshakes abandoned by the watchdog (counter).
pub const GATE_HANDSHAKE_TIMEOUTS_TOTAL: &str = "gate_handshake_timeouts_total";
/// PUBLISH frames received (counter).
pub const GATE_PUBLISH_TOTAL: &str = "gate_publish_total";
/// Frames rejected because the dispatch gate was full (counter).
pub const GATE_QUEUE_FULL_TOTAL: &str = "gate_queue_full_total";
/// Routing failures (counter, labels: reason).
pub const GATE_ROUTE_ERRORS_TOTAL: &str = "gate_route_errors_total";
/// Dispatch duration seconds (histogram).
pub const GATE_DISPATCH_DURATION_SECONDS: &str = "gate_dispatch_duration_seconds";
/// Supervised tasks that panicked (counter, labels: task).
pub const GATE_TASK_PANICS_TOTAL: &str = "gate_task_panics_total";
/// Storage heartbeats sent (counter).
pub const GATE_HEARTBEATS_TOTAL: &str = "gate_heartbeats_total";
/// Frames written to clients (counter).
pub const GATE_FRAMES_SENT_TOTAL: &str = "gate_frames_sent_total";
