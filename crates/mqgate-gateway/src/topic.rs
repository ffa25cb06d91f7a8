//! Publish topic grammar: `<service>/<handler>[/<msgid>]`.
//!
//! `service` is a service reference (`type` or `type@id`), `handler` must
//! carry the [`HANDLER_PREFIX`] to be callable, and a non-empty `msgid`
//! means the client waits for a reply on the same topic.

use mqgate_core::Argument;
use thiserror::Error;

/// Prefix that marks a handler as callable from clients.
pub const HANDLER_PREFIX: &str = "HD_";

/// Why a publish could not be routed. The display strings are what the
/// client sees in the reply's error field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Not two or three `/`-separated segments.
    #[error(
        "Topic must be [moduleType@moduleID]/[handler]|[moduleType@moduleID]/[handler]/[msgid]"
    )]
    MalformedTopic,

    /// Handler is missing the callable prefix.
    #[error("Method({0}) must begin with 'HD_'")]
    BadPrefix(String),

    /// Resolver returned nothing for the service reference.
    #[error("Service(type:{0}) not found")]
    ServiceNotFound(String),

    /// Body looked like a JSON object but did not parse.
    #[error("The JSON format is incorrect")]
    BadJson,

    /// Session could not be encoded as the leading argument.
    #[error("failed to encode session: {0}")]
    Session(String),

    /// The backend call failed; message passed through verbatim.
    #[error("{0}")]
    Call(String),
}

impl RouteError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MalformedTopic => "malformed_topic",
            Self::BadPrefix(_) => "bad_prefix",
            Self::ServiceNotFound(_) => "service_not_found",
            Self::BadJson => "bad_json",
            Self::Session(_) => "session",
            Self::Call(_) => "call",
        }
    }
}

/// A parsed publish topic, borrowing from the original string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopicRoute<'a> {
    /// Service reference.
    pub service: &'a str,
    /// Handler name.
    pub handler: &'a str,
    /// Correlation id; present means a reply is owed.
    pub msg_id: Option<&'a str>,
}

impl<'a> TopicRoute<'a> {
    /// Split `topic` into its segments.
    pub fn parse(topic: &'a str) -> Result<Self, RouteError> {
        let mut parts = topic.split('/');
        let (Some(service), Some(handler)) = (parts.next(), parts.next()) else {
            return Err(RouteError::MalformedTopic);
        };
        let msg_id = parts.next();
        if parts.next().is_some() {
            return Err(RouteError::MalformedTopic);
        }
        Ok(Self {
            service,
            handler,
            msg_id: msg_id.filter(|id| !id.is_empty()),
        })
    }

    /// Whether the client expects a reply.
    pub fn wants_reply(&self) -> bool {
        self.msg_id.is_some()
    }

    /// Check the handler carries the callable prefix.
    pub fn check_handler(&self) -> Result<(), RouteError> {
        if self.handler.starts_with(HANDLER_PREFIX) {
            Ok(())
        } else {
            Err(RouteError::BadPrefix(self.handler.to_owned()))
        }
    }
}

/// Classify a publish body as the call's payload argument.
///
/// Bodies framed by `{` … `}` must be valid JSON and travel as a JSON
/// argument; everything else travels as opaque bytes.
pub fn body_argument(body: &[u8]) -> Result<Argument, RouteError> {
    if let (Some(b'{'), Some(b'}')) = (body.first(), body.last()) {
        serde_json::from_slice::<serde_json::Value>(body)
            .map_err(|_| RouteError::BadJson)?;
        return Ok(Argument::json_raw(body.to_vec()));
    }
    Ok(Argument::bytes(body.to_vec()))
}
