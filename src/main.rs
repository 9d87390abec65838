use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use merganser::cli::Cli;
use merganser::config::{BotConfig, FileConfig};
use merganser::gitlab::{GitLabClient, TransportConfig};
use merganser::shutdown::ShutdownFlag;
use merganser::supervisor;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "merganser=info",
        1 => "merganser=debug",
        _ => "merganser=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir()?;
    let (file, config_path) = FileConfig::load(cli.config.as_deref(), &cwd)?;
    match config_path {
        Some(ref path) => info!("loaded config from {}", path.display()),
        None => info!("no config file found, using flags and defaults"),
    }
    let config = BotConfig::resolve(&cli, file)?;

    let shutdown = ShutdownFlag::new();
    let signal_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        signal_flag.trigger();
    })
    .context("failed to install signal handler")?;

    let mut transport = TransportConfig::new(config.gitlab_url.clone(), config.auth_token.clone());
    transport.max_in_flight = config.max_in_flight_requests;
    let client = GitLabClient::new(transport);

    supervisor::run(config, &client, &shutdown)
}
