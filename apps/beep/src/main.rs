use anyhow::{Context, Result};
use beep::cli::Cli;
use beep::config::AppConfig;
use beep::session::{Session, SessionPlan};
use beep::telemetry::init_tracing;
use beep_webrtc::{RtcConfig, RtcConnector};
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    if let Err(err) = init_tracing(&config.log_filter) {
        eprintln!("failed to initialise tracing: {err}");
    }

    let endpoints = cli.command.endpoints();
    let rtc = RtcConfig::from_env();
    info!(
        role = ?endpoints.role,
        listen = %endpoints.listen,
        peer = %endpoints.peer,
        ice_servers = rtc.ice_servers.len(),
        tone_hz = config.clock.tone_frequency,
        "starting beep"
    );

    let plan = SessionPlan {
        endpoints,
        clock: config.clock,
        signal_retry: config.signal_retry,
    };
    let session = match Session::start(plan, &RtcConnector::new(rtc)).await {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "failed to start session");
            return Err(err).context("failed to start session");
        }
    };

    session
        .run_until(shutdown_signal())
        .await
        .context("session shutdown with error")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
