//! Inkview
//!
//! Keeps a device screen in sync with the display API.
//!
//! Usage:
//!   inkview [-c <config>] [--server <url>] [--device-id <id>] [--output <file>] [--once]
//!
//! Without `-c`, configuration is read from `~/.config/inkview/config.toml`,
//! then `/etc/inkview/config.toml`. Command line flags override the file.

mod presenter;

use anyhow::{Context, Result, bail};
use clap::Parser;
use inkview_client::{ClientConfig, ConfigInputs, HttpTransport, LoopEvent, PollLoop};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use presenter::ConsolePresenter;

/// Inkview display client.
#[derive(Parser, Debug)]
#[command(name = "inkview", version, about = "Display client for the device API")]
struct Cli {
    /// Path to config file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// API server base URL.
    #[arg(long = "server")]
    server: Option<String>,

    /// Device ID sent to the server.
    #[arg(long = "device-id")]
    device_id: Option<String>,

    /// Use this API key instead of running device setup.
    #[arg(long = "api-key")]
    api_key: Option<String>,

    /// Refresh interval until the server sends one, in seconds.
    #[arg(long = "refresh-secs")]
    refresh_secs: Option<u64>,

    /// Save every displayed image to this file.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Refresh once and exit.
    #[arg(long = "once")]
    once: bool,
}

impl Cli {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(device_id) = &self.device_id {
            config.device_id = device_id.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.api_key = Some(api_key.clone());
        }
        if let Some(secs) = self.refresh_secs {
            config.refresh_interval_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ClientConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        None => ClientConfig::load_default().context("failed to load configuration")?,
    };
    cli.apply(&mut config);

    let transport =
        Arc::new(HttpTransport::new(&config).context("failed to create HTTP client")?);
    let presenter = Arc::new(ConsolePresenter::new(
        cli.output.clone(),
        config.request_timeout(),
    )?);
    let inputs = Arc::new(ConfigInputs::from_config(&config));

    let poll = PollLoop::new(transport, presenter.clone(), inputs)
        .with_refresh_interval(config.refresh_interval());

    let result = if cli.once {
        run_once(&poll).await
    } else {
        run(&poll).await
    };

    presenter.flush().await;
    result
}

/// Setup logging to console
fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

async fn run_once(poll: &PollLoop) -> Result<()> {
    let interval = poll.execute_cycle().await?;
    info!("Display refreshed, server asks for {}s", interval.as_secs());
    Ok(())
}

/// Run the loop until Ctrl-C or a failed cycle
async fn run(poll: &PollLoop) -> Result<()> {
    let mut events = poll.subscribe();
    poll.start(true);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut failure = None;

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("failed to listen for Ctrl-C")?;
                info!("Interrupted");
                poll.stop();
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(LoopEvent::Armed { delay }) => {
                    info!("Next refresh in {}s", delay.as_secs());
                }
                Ok(LoopEvent::CycleCompleted { .. }) => {}
                Ok(LoopEvent::CycleFailed { error }) => failure = Some(error),
                Ok(LoopEvent::Stopped) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(missed)) => warn!("Missed {} loop events", missed),
            }
        }
    }

    match failure {
        Some(error) => bail!(error),
        None => Ok(()),
    }
}
