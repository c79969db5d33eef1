//! authgate
//!
//! Authenticating reverse proxy. Visitors complete an OAuth2/OIDC login with a
//! configured identity provider before any traffic reaches the upstreams, and
//! the verified identity is injected into every proxied request.
//!
//! # Features
//!
//! - **Stateless sessions**: encrypted, HMAC-signed session cookies
//! - **Providers**: Google, GitHub, GitLab, generic OIDC, Azure, Keycloak, Heroku, DingTalk
//! - **Upstreams**: HTTP reverse proxy, static files, AWS SigV4-signed proxy
//! - **Websockets**: byte-level tunnel for `Upgrade` requests
//! - **Request signing**: `GAP-Signature` HMAC so upstreams can verify the proxy

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod cookies;
pub mod error;
pub mod gateway;
pub mod providers;
pub mod proxy;
pub mod session;
pub mod signing;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
