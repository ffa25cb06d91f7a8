//! # mqgate-logging
//!
//! Structured logging with `tracing`.
//!
//! [`init_logging`] installs a global `tracing-subscriber` (pretty or JSON
//! lines, filtered by `RUST_LOG` or the configured level) and a panic hook
//! that records every panic, with its location and a captured backtrace,
//! as an `error` event. Task panics are contained by the runtime; this hook
//! is what leaves the stack trace in the log.

#![deny(unsafe_code)]

use std::backtrace::Backtrace;
use std::panic::PanicHookInfo;

use mqgate_settings::LoggingSettings;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The configured level is not a valid filter directive.
    #[error("invalid log filter '{directive}': {message}")]
    InvalidFilter {
        /// The rejected directive.
        directive: String,
        /// Parser message.
        message: String,
    },
    /// A global subscriber was already installed.
    #[error("global tracing subscriber already installed")]
    AlreadyInitialized,
}

/// Install the global subscriber and the panic hook. Call once at startup.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), LoggingError> {
    let filter = build_filter(&settings.level)?;

    let installed = if settings.json {
        tracing_subscriber::fmt()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
    };
    installed.map_err(|_| LoggingError::AlreadyInitialized)?;

    install_panic_hook();
    tracing::debug!(level = %settings.level, json = settings.json, "logging initialized");
    Ok(())
}

/// Build the env filter: `RUST_LOG` wins, otherwise the configured directive.
pub fn build_filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(directive).map_err(|e| LoggingError::InvalidFilter {
        directive: directive.to_owned(),
        message: e.to_string(),
    })
}

/// Route panics through `tracing` with a captured backtrace.
///
/// The previous hook still runs afterwards.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let backtrace = Backtrace::force_capture();
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(
            panic = %panic_message(info),
            location,
            backtrace = %backtrace,
            "task panicked"
        );
        previous(info);
    }));
}

/// Best-effort text of a panic payload.
pub fn panic_message(info: &PanicHookInfo<'_>) -> String {
    payload_message(info.payload())
}

/// Text of a panic payload (`&str` or `String`), or a placeholder.
pub fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_message_str() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(payload_message(payload.as_ref()), "boom");
    }

    #[test]
    fn payload_message_string() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kaput"));
        assert_eq!(payload_message(payload.as_ref()), "kaput");
    }

    #[test]
    fn payload_message_other() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(payload_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn build_filter_accepts_directives() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(build_filter("info").is_ok());
        assert!(build_filter("mqgate_gateway=debug,warn").is_ok());
    }
}
