//! Email allowlist

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use crate::{Error, Result};

/// Accepts addresses in allowed domains or listed in the emails file
#[derive(Debug, Clone, Default)]
pub struct EmailValidator {
    allow_all: bool,
    domains: Vec<String>,
    emails: HashSet<String>,
}

impl EmailValidator {
    /// Build from domains (`*` allows any address) and an optional file
    /// holding one address per line
    pub fn new(domains: &[String], emails_file: Option<&Path>) -> Result<Self> {
        let allow_all = domains.iter().any(|d| d == "*");
        let domains = domains
            .iter()
            .filter(|d| *d != "*")
            .map(|d| format!("@{}", d.trim().trim_start_matches('@').to_lowercase()))
            .collect();

        let mut emails = HashSet::new();
        if let Some(path) = emails_file {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("reading authenticated emails file {}: {e}", path.display()))
            })?;
            emails = contents
                .lines()
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .collect();
            info!(path = %path.display(), count = emails.len(), "Loaded authenticated emails");
        }

        Ok(Self {
            allow_all,
            domains,
            emails,
        })
    }

    /// True when the allowlist is `*`
    #[must_use]
    pub fn allows_all(&self) -> bool {
        self.allow_all
    }

    /// True if `email` may log in
    #[must_use]
    pub fn validate(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return false;
        }
        if self.allow_all {
            return true;
        }
        self.emails.contains(&email) || self.domains.iter().any(|d| email.ends_with(d.as_str()))
    }
}
