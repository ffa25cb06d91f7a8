//! # mqgate-gateway
//!
//! The client-facing side of mqgate.
//!
//! - [`wire`]: MQTT 3.1.1 subset codec (`MqttCodec`, `Packet`)
//! - [`topic`]: `<service>/<handler>[/<msgid>]` grammar and routing errors
//! - [`agent`]: one `Agent` per connection: handshake, bounded dispatch,
//!   routing onto backend calls, heartbeat, teardown
//! - [`gate`]: accept loop, agent registry, control handlers
//! - [`hooks`]: collaborator traits the agent calls out to
//! - [`resolver`], [`marshal`]: default collaborators
//! - [`supervise`], [`shutdown`]: task supervision and graceful shutdown

#![deny(unsafe_code)]

pub mod agent;
pub mod errors;
pub mod gate;
pub mod hooks;
pub mod marshal;
pub mod metrics;
pub mod options;
pub mod resolver;
pub mod shutdown;
pub mod supervise;
pub mod topic;
pub mod wire;

pub use agent::Agent;
pub use errors::{GateError, Result, WireError};
pub use gate::{Gate, GateBuilder, GateContext};
pub use hooks::{
    AgentLearner, GuestJudge, ResultMarshaler, RouteHandler, RouteOutcome, SendHook,
    ServiceResolver, StorageHandler,
};
pub use marshal::JsonResultMarshaler;
pub use options::GateOptions;
pub use resolver::StaticResolver;
pub use shutdown::ShutdownCoordinator;
pub use topic::{RouteError, TopicRoute};
