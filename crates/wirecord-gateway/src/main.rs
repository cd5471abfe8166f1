//! Gateway client entry point
//!
//! Run with:
//! ```bash
//! BOT_TOKEN=... cargo run -p wirecord-gateway
//! ```
//!
//! Configuration is loaded from environment variables.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wirecord_common::{try_init_tracing_with_config, ClientConfig, TracingConfig};
use wirecord_gateway::GatewaySession;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Gateway client stopped");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ClientConfig::from_env().context("Failed to load configuration")?;

    if let Err(e) = try_init_tracing_with_config(TracingConfig::from_env(config.env)) {
        eprintln!("Warning: Failed to initialize tracing: {e}");
    }

    info!(
        env = ?config.env,
        shard = ?config.shard(),
        intents = config.intents.bits(),
        "Configuration loaded"
    );

    let owner = CancellationToken::new();
    let session = GatewaySession::from_config(config, &owner)?;

    session.register_command("ping", |session: GatewaySession, interaction| async move {
        session.reply_interaction(&interaction, "pong").await
    });

    // Follow the session across reconnects
    let current = Arc::new(Mutex::new(session.clone()));
    session.on_reconnect({
        let current = Arc::clone(&current);
        move |next| *current.lock() = next
    });

    session.dial().await.context("Gateway handshake failed")?;
    info!(user_id = ?session.user_id(), "Connected");

    loop {
        let active = current.lock().clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            () = active.closed() => {
                if current.lock().is_closed() {
                    break;
                }
                info!("Gateway session replaced");
            }
        }
    }

    let active = current.lock().clone();
    let terminal = active.terminal_code();
    active.exit();
    owner.cancel();

    match terminal {
        Some(code) => anyhow::bail!("gateway closed the session with code {code}"),
        None => Ok(()),
    }
}
