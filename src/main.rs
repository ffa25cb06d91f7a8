//! # mqgate
//!
//! Gateway binary: loads settings, starts an in-process `echo` service and
//! the gate's control service on a shared transport, then accepts client
//! connections until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mqgate_core::{Argument, CallResult};
use mqgate_gateway::{Gate, GateOptions, ShutdownCoordinator, StaticResolver};
use mqgate_rpc::{HandlerError, HandlerRegistry, MemoryTransport, RpcClient, TransportServer};
use mqgate_settings::MqgateSettings;
use serde_json::json;
use tokio::net::TcpListener;

/// MQTT-style client gateway in front of RPC services.
#[derive(Parser, Debug)]
#[command(name = "mqgate", about = "MQTT-style client gateway")]
struct Cli {
    /// Settings file (defaults to `$MQGATE_CONFIG` or `./mqgate.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding settings.
    #[arg(long)]
    listen: Option<String>,

    /// Log filter directive, overriding settings.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

fn load(cli: &Cli) -> Result<MqgateSettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(mqgate_settings::settings_path);
    let mut settings = mqgate_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(listen) = &cli.listen {
        settings.gate.listen_addr.clone_from(listen);
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    if cli.json_logs {
        settings.logging.json = true;
    }
    Ok(settings)
}

/// Demo backend: `HD_echo` returns the client's body along with the topic it
/// was published on.
fn echo_registry(settings: &MqgateSettings) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new().with_timeout(settings.rpc.call_timeout());
    registry.register_fn("HD_echo", |args: Vec<Argument>| async move {
        let session = args
            .first()
            .ok_or_else(|| HandlerError::InvalidArgs {
                message: "missing session".into(),
            })?
            .as_session()?;
        let body = match args.get(1) {
            Some(arg) => arg.as_json().unwrap_or_else(|_| json!(String::from_utf8_lossy(&arg.data))),
            None => serde_json::Value::Null,
        };
        Ok::<_, HandlerError>(CallResult::Value(json!({
            "topic": session.topic,
            "guest": session.is_guest(),
            "body": body,
        })))
    });
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    mqgate_logging::init_logging(&settings.logging).context("Failed to initialize logging")?;
    if mqgate_settings::init_settings(settings.clone()).is_err() {
        tracing::warn!("settings were already initialized");
    }

    let coordinator = ShutdownCoordinator::new();
    let transport = Arc::new(MemoryTransport::with_capacity(settings.rpc.mailbox_capacity));
    let wait = settings.rpc.wait_timeout();

    let echo = TransportServer::start(transport.clone(), Arc::new(echo_registry(&settings)), wait)
        .await
        .context("Failed to start echo service")?;
    coordinator.track_server(echo.clone());

    let resolver = Arc::new(StaticResolver::new());
    resolver.register(
        "echo@1",
        Arc::new(RpcClient::new(
            transport.clone(),
            echo.addr(),
            settings.rpc.call_timeout(),
        )),
    );

    let gate = Gate::builder()
        .options(GateOptions::from(&settings.gate))
        .server_id(settings.gate.server_id.clone())
        .resolver(resolver)
        .build();

    let mut control = HandlerRegistry::new().with_timeout(settings.rpc.call_timeout());
    gate.control_handlers(&mut control);
    let control_addr = format!("gate@{}", settings.gate.server_id);
    let control = TransportServer::start_at(transport, Arc::new(control), wait, control_addr)
        .await
        .context("Failed to start gate control service")?;
    coordinator.track_server(control.clone());

    let listener = TcpListener::bind(&settings.gate.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.gate.listen_addr))?;
    let serving = {
        let gate = Arc::clone(&gate);
        let token = coordinator.token();
        tokio::spawn(async move {
            if let Err(e) = gate.serve(listener, token).await {
                tracing::error!(error = %e, "gate stopped with error");
            }
        })
    };
    coordinator.track(serving);

    tracing::info!(
        name = %settings.name,
        echo = echo.addr(),
        control = control.addr(),
        "mqgate started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !coordinator.graceful_shutdown(None).await {
        tracing::warn!("shutdown did not finish cleanly");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
