//! `GAP-Signature` key configuration
//!
//! Keys are given as `<algorithm>:<secret>` for the default key and
//! `<host>=<algorithm>:<secret>` for per-upstream overrides.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use authgate_core::{Algorithm, SignableRequest, SignatureError, request_signature};

use crate::config::SignatureConfig;

/// Invalid key spec
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeySpecError {
    /// Missing `:` between algorithm and secret
    #[error("invalid signature key spec {0:?}: expected <algorithm>:<secret>")]
    Format(String),

    /// Missing `=` between host and key
    #[error("invalid upstream signature key spec {0:?}: expected <host>=<algorithm>:<secret>")]
    HostFormat(String),

    /// Algorithm not supported
    #[error("unsupported signature algorithm {algorithm:?} in key spec")]
    Algorithm {
        /// The rejected algorithm name
        algorithm: String,
    },

    /// Same host configured twice
    #[error("duplicate signature key for upstream host {0:?}")]
    DuplicateHost(String),
}

/// An HMAC algorithm and shared secret
#[derive(Clone, PartialEq, Eq)]
pub struct SignatureKey {
    algorithm: Algorithm,
    secret: String,
}

impl fmt::Debug for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SignatureKey {
    /// Key from its parts
    #[must_use]
    pub fn new(algorithm: Algorithm, secret: impl Into<String>) -> Self {
        Self {
            algorithm,
            secret: secret.into(),
        }
    }

    /// Digest algorithm
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Shared secret
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// `GAP-Signature` header value for a request
    pub fn sign(&self, request: &SignableRequest<'_>) -> Result<String, SignatureError> {
        request_signature(request, self.algorithm, &self.secret)
    }
}

impl FromStr for SignatureKey {
    type Err = KeySpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (algorithm, secret) = spec
            .split_once(':')
            .ok_or_else(|| KeySpecError::Format(redact(spec)))?;
        let algorithm = algorithm.parse::<Algorithm>().map_err(|_| KeySpecError::Algorithm {
            algorithm: algorithm.to_string(),
        })?;
        Ok(Self::new(algorithm, secret))
    }
}

/// Show only the part of a spec before the secret
fn redact(spec: &str) -> String {
    match spec.split_once(':') {
        Some((head, _)) => format!("{head}:***"),
        None => format!("{}***", spec.chars().take(4).collect::<String>()),
    }
}

/// Default key plus per-host overrides
#[derive(Debug, Clone, Default)]
pub struct SignatureKeys {
    default: Option<SignatureKey>,
    by_host: HashMap<String, SignatureKey>,
}

impl SignatureKeys {
    /// Parse every key spec in the configuration
    pub fn from_config(config: &SignatureConfig) -> Result<Self, KeySpecError> {
        let default = match config.key.as_deref() {
            Some(spec) if !spec.is_empty() => Some(spec.parse::<SignatureKey>()?),
            _ => None,
        };

        let mut by_host = HashMap::new();
        for spec in &config.upstream_keys {
            let (host, key) = spec
                .split_once('=')
                .ok_or_else(|| KeySpecError::HostFormat(redact(spec)))?;
            if host.is_empty() {
                return Err(KeySpecError::HostFormat(redact(spec)));
            }
            let key: SignatureKey = key.parse()?;
            if by_host.insert(host.to_ascii_lowercase(), key).is_some() {
                return Err(KeySpecError::DuplicateHost(host.to_string()));
            }
        }

        Ok(Self { default, by_host })
    }

    /// Key used for requests to `host`. A `host:port` authority falls back
    /// to a key registered for the bare host.
    #[must_use]
    pub fn for_host(&self, host: &str) -> Option<&SignatureKey> {
        let host = host.to_ascii_lowercase();
        self.by_host
            .get(&host)
            .or_else(|| {
                host.rsplit_once(':')
                    .and_then(|(bare, _)| self.by_host.get(bare))
            })
            .or(self.default.as_ref())
    }

    /// True when no key is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_host.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(key: Option<&str>, upstream_keys: &[&str]) -> SignatureConfig {
        SignatureConfig {
            key: key.map(str::to_string),
            upstream_keys: upstream_keys.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_key() {
        let key: SignatureKey = "sha1:foobar".parse().unwrap();
        assert_eq!(key.algorithm(), Algorithm::Sha1);
        assert_eq!(key.secret(), "foobar");

        // secrets may contain ':'
        let key: SignatureKey = "sha256:a:b".parse().unwrap();
        assert_eq!(key.algorithm(), Algorithm::Sha256);
        assert_eq!(key.secret(), "a:b");
    }

    #[test]
    fn test_parse_key_errors() {
        assert!(matches!(
            "foobar".parse::<SignatureKey>(),
            Err(KeySpecError::Format(_))
        ));
        assert_eq!(
            "md5:foobar".parse::<SignatureKey>(),
            Err(KeySpecError::Algorithm {
                algorithm: "md5".to_string()
            })
        );
    }

    #[test]
    fn test_error_does_not_leak_secret() {
        let err = "supersecretvalue".parse::<SignatureKey>().unwrap_err();
        assert!(!err.to_string().contains("supersecretvalue"));
    }

    #[test]
    fn test_host_override_and_default() {
        let keys = SignatureKeys::from_config(&config(
            Some("sha1:default"),
            &["api.internal=sha256:api-secret"],
        ))
        .unwrap();

        let api = keys.for_host("API.internal").unwrap();
        assert_eq!(api.algorithm(), Algorithm::Sha256);
        assert_eq!(api.secret(), "api-secret");

        let other = keys.for_host("other.internal").unwrap();
        assert_eq!(other.secret(), "default");
    }

    #[test]
    fn test_host_with_port_falls_back_to_bare_host() {
        let keys = SignatureKeys::from_config(&config(
            None,
            &["api.internal=sha1:bare", "api.internal:9000=sha256:exact"],
        ))
        .unwrap();

        assert_eq!(keys.for_host("api.internal:8080").unwrap().secret(), "bare");
        assert_eq!(keys.for_host("api.internal:9000").unwrap().secret(), "exact");
        assert!(keys.for_host("web.internal:8080").is_none());
    }

    #[test]
    fn test_no_keys() {
        let keys = SignatureKeys::from_config(&config(None, &[])).unwrap();
        assert!(keys.is_empty());
        assert!(keys.for_host("anything").is_none());
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let err = SignatureKeys::from_config(&config(
            None,
            &["app=sha1:one", "app=sha1:two"],
        ))
        .unwrap_err();
        assert_eq!(err, KeySpecError::DuplicateHost("app".to_string()));
    }

    #[test]
    fn test_host_spec_errors() {
        assert!(matches!(
            SignatureKeys::from_config(&config(None, &["sha1:nohost"])),
            Err(KeySpecError::HostFormat(_))
        ));
        assert!(matches!(
            SignatureKeys::from_config(&config(None, &["=sha1:x"])),
            Err(KeySpecError::HostFormat(_))
        ));
        assert!(matches!(
            SignatureKeys::from_config(&config(None, &["host=md5:x"])),
            Err(KeySpecError::Algorithm { .. })
        ));
    }
}
