//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::auth::Gate;
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::providers::{self, Provider};
use crate::proxy::{Backend, Dispatcher, ProxyOptions};
use crate::signing::SignatureKeys;
use crate::{Error, Result};

/// The authenticating proxy
#[derive(Debug)]
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Resolve the configured provider and build the gateway
    pub async fn new(config: Config) -> Result<Self> {
        let provider = providers::from_config(&config.provider, config.server.provider_timeout).await?;
        Self::with_provider(config, provider)
    }

    /// Build the gateway around an already constructed provider
    pub fn with_provider(config: Config, provider: Arc<dyn Provider>) -> Result<Self> {
        let signature_keys = SignatureKeys::from_config(&config.signature)
            .map_err(|e| Error::Config(e.to_string()))?;
        let options = ProxyOptions {
            pass_host_header: config.headers.pass_host_header,
            signature_keys,
            aws: config.aws.clone(),
            max_body_size: config.server.max_body_size,
            ..ProxyOptions::default()
        };
        let dispatcher = Dispatcher::from_urls(&config.upstreams, &options)?;
        let gate = Gate::from_config(&config, provider)?;

        Ok(Self {
            config,
            state: Arc::new(AppState { gate, dispatcher }),
        })
    }

    /// Router serving the proxy's endpoints and every upstream
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Serve until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;

        self.banner(addr);

        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }

    fn banner(&self, addr: SocketAddr) {
        let gate = &self.state.gate;
        info!("============================================================");
        info!("authgate v{}", env!("CARGO_PKG_VERSION"));
        info!("Listening on http://{addr}");
        info!("Provider: {}", gate.provider().data().provider_name);
        info!("Endpoints under {}", gate.proxy_prefix());
        for upstream in self.state.dispatcher.routes() {
            match upstream.backend() {
                Backend::Http(proxy) => info!(
                    "  {} -> {}{}{}",
                    upstream.prefix(),
                    proxy.target(),
                    if proxy.is_aws() { " [aws]" } else { "" },
                    if proxy.is_signed() { " [signed]" } else { "" }
                ),
                Backend::Static(files) => {
                    info!("  {} -> {}", upstream.prefix(), files.root().display());
                }
            }
        }
        if !self.config.cookie.secure {
            warn!("Cookies are not marked Secure; only use this behind plain HTTP for testing");
        }
        info!("============================================================");
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
