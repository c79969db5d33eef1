//! Error types for authgate

use std::io;

use thiserror::Error;

/// Result type alias for authgate
pub type Result<T> = std::result::Result<T, Error>;

/// authgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration, one entry per problem found
    #[error("Invalid configuration:\n  {}", .0.join("\n  "))]
    InvalidConfig(Vec<String>),

    /// Request signing error
    #[error("Signature error: {0}")]
    Signature(#[from] authgate_core::SignatureError),

    /// Session cookie error
    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    /// Identity provider error
    #[error("Provider error: {0}")]
    Provider(#[from] crate::providers::ProviderError),

    /// Upstream route table error
    #[error("Upstream error: {0}")]
    Proxy(#[from] crate::proxy::ProxyError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_lists_every_problem() {
        let err = Error::InvalidConfig(vec![
            "missing setting: upstream".to_string(),
            "missing setting: cookie-secret".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid configuration:\n  missing setting: upstream\n  missing setting: cookie-secret"
        );
    }
}
