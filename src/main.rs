//! authgate - OAuth2/OIDC authenticating reverse proxy

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use authgate::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => {
            println!(
                "Configuration OK: provider={}, {} upstream(s)",
                config.provider.kind,
                config.upstreams.len()
            );
            ExitCode::SUCCESS
        }
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load, apply CLI overrides, validate
fn load_config(cli: &Cli) -> authgate::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Run the proxy until shutdown
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        provider = %config.provider.kind,
        upstreams = config.upstreams.len(),
        "Starting authgate"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
