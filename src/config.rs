//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::providers::ProviderKind;
use crate::signing::SignatureKeys;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` secrets
    pub env_files: Vec<String>,
    /// Listener settings
    pub server: ServerConfig,
    /// Session cookie settings
    pub cookie: CookieConfig,
    /// Identity provider settings
    pub provider: ProviderConfig,
    /// Upstream URLs (`http(s)://`, `file://`, `aws+https://`)
    pub upstreams: Vec<String>,
    /// `GAP-Signature` key specs
    pub signature: SignatureConfig,
    /// Credentials for `aws+` upstreams
    pub aws: AwsConfig,
    /// Authentication policy
    pub auth: AuthConfig,
    /// Identity headers passed upstream
    pub headers: HeadersConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // AUTHGATE_COOKIE__SECRET -> cookie.secret
        figment = figment.merge(Env::prefixed("AUTHGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.resolve_secrets();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in upstream and provider URLs
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for upstream in &mut self.upstreams {
            *upstream = expand_string(&re, upstream);
        }

        let provider = &mut self.provider;
        for url in [
            &mut provider.login_url,
            &mut provider.redeem_url,
            &mut provider.profile_url,
            &mut provider.validate_url,
            &mut provider.oidc_issuer_url,
        ]
        .into_iter()
        .flatten()
        {
            *url = expand_string(&re, url);
        }
    }

    /// Replace `env:NAME` secrets with the variable's value
    fn resolve_secrets(&mut self) {
        for secret in [
            &mut self.cookie.secret,
            &mut self.provider.client_secret,
            &mut self.aws.secret_access_key,
            &mut self.provider.dingtalk.corp_secret,
            &mut self.headers.basic_auth_password,
        ] {
            *secret = resolve_secret(secret);
        }
        if let Some(key) = self.signature.key.as_mut() {
            *key = resolve_secret(key);
        }
        for key in &mut self.signature.upstream_keys {
            *key = resolve_secret(key);
        }
    }

    /// Check the configuration, reporting every problem at once
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] listing all problems found.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.upstreams.is_empty() {
            problems.push("missing setting: upstream".to_string());
        }
        if self.cookie.secret.is_empty() {
            problems.push("missing setting: cookie-secret".to_string());
        }
        if self.provider.client_id.is_empty() {
            problems.push("missing setting: client-id".to_string());
        }
        if self.provider.client_secret.is_empty() {
            problems.push("missing setting: client-secret".to_string());
        }
        if self.auth.email_domains.is_empty() && self.auth.authenticated_emails_file.is_none() {
            problems.push(
                "missing setting for email validation: email-domain or authenticated-emails-file required"
                    .to_string(),
            );
        }

        for upstream in &self.upstreams {
            match Url::parse(upstream) {
                Ok(url) => {
                    if url.scheme().starts_with("aws+")
                        && (self.aws.access_key_id.is_empty()
                            || self.aws.secret_access_key.is_empty())
                    {
                        problems.push(format!(
                            "upstream {upstream} requires aws.access_key_id and aws.secret_access_key"
                        ));
                    }
                }
                Err(e) => problems.push(format!("error parsing upstream: {e} ({upstream})")),
            }
        }

        for pattern in &self.auth.skip_auth_regex {
            if let Err(e) = Regex::new(pattern) {
                problems.push(format!("error compiling regex={pattern:?} {e}"));
            }
        }

        if !self.auth.proxy_prefix.starts_with('/') || self.auth.proxy_prefix.ends_with('/') {
            problems.push(format!(
                "proxy_prefix must start with '/' and not end with '/' (got {:?})",
                self.auth.proxy_prefix
            ));
        }

        if !self.cookie.refresh.is_zero() && self.cookie.refresh >= self.cookie.expire {
            problems.push(format!(
                "cookie_refresh ({}s) must be less than cookie_expire ({}s)",
                self.cookie.refresh.as_secs(),
                self.cookie.expire.as_secs()
            ));
        }

        if let Some(redirect) = &self.auth.redirect_url {
            if let Err(e) = Url::parse(redirect) {
                problems.push(format!("error parsing redirect-url={redirect:?} {e}"));
            }
        }

        match self.provider.kind.parse::<ProviderKind>() {
            Ok(ProviderKind::Oidc) => {
                if self.provider.oidc_issuer_url.as_deref().is_none_or(str::is_empty) {
                    problems.push("missing setting: oidc-issuer-url".to_string());
                }
            }
            Ok(ProviderKind::DingTalk) => {
                if self.provider.dingtalk.corp_id.is_empty() {
                    problems.push("missing setting: dingtalk.corp_id".to_string());
                }
            }
            Ok(_) => {}
            Err(e) => problems.push(e.to_string()),
        }

        if let Err(e) = SignatureKeys::from_config(&self.signature) {
            problems.push(e.to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(problems))
        }
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Resolve an `env:NAME` reference. An unset variable resolves to an empty
/// secret so that validation reports it as missing.
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| {
            tracing::warn!(variable = %var_name, "Secret references unset environment variable");
            String::new()
        })
    } else {
        value.to_string()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Timeout for every call to the identity provider
    #[serde(with = "humantime_serde")]
    pub provider_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body buffered for signing (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4180,
            provider_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Session cookie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Cookie name
    pub name: String,
    /// Seed for cookie signing and encryption (optionally base64 encoded)
    pub secret: String,
    /// Optional domain to force cookies to
    pub domain: Option<String>,
    /// Cookie lifetime
    #[serde(with = "humantime_serde")]
    pub expire: Duration,
    /// Re-issue the cookie once it is older than this (0 disables)
    #[serde(with = "humantime_serde")]
    pub refresh: Duration,
    /// `Secure` flag
    pub secure: bool,
    /// `HttpOnly` flag
    pub http_only: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "_oauth2_proxy".to_string(),
            secret: String::new(),
            domain: None,
            expire: Duration::from_secs(168 * 3600),
            refresh: Duration::ZERO,
            secure: true,
            http_only: true,
        }
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider name (google, github, gitlab, oidc, azure, keycloak, heroku, dingtalk)
    pub kind: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Authorization endpoint override
    pub login_url: Option<String>,
    /// Token endpoint override
    pub redeem_url: Option<String>,
    /// Profile endpoint override
    pub profile_url: Option<String>,
    /// Token validation endpoint override
    pub validate_url: Option<String>,
    /// OAuth scope override
    pub scope: Option<String>,
    /// `approval_prompt` query parameter
    pub approval_prompt: String,
    /// Send client credentials with HTTP Basic auth instead of the form body
    pub http_basic_auth: bool,
    /// Claim holding the username (OIDC)
    pub username_claim: Option<String>,
    /// OIDC issuer, used for discovery and `id_token` verification
    pub oidc_issuer_url: Option<String>,
    /// Accept OIDC sessions whose `email_verified` claim is false
    pub insecure_skip_email_verified: bool,
    /// Restrict logins to members of this GitHub organisation
    pub github_org: Option<String>,
    /// Restrict logins to members of these GitHub teams (comma separated)
    pub github_team: Option<String>,
    /// Restrict logins to members of this GitLab group
    pub gitlab_group: Option<String>,
    /// Restrict logins to members of this Keycloak group
    pub keycloak_group: Option<String>,
    /// Azure AD tenant
    pub azure_tenant: String,
    /// Protected resource (Azure AD)
    pub resource: Option<String>,
    /// DingTalk corp settings
    pub dingtalk: DingTalkConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "google".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            login_url: None,
            redeem_url: None,
            profile_url: None,
            validate_url: None,
            scope: None,
            approval_prompt: "force".to_string(),
            http_basic_auth: false,
            username_claim: None,
            oidc_issuer_url: None,
            insecure_skip_email_verified: false,
            github_org: None,
            github_team: None,
            gitlab_group: None,
            keycloak_group: None,
            azure_tenant: "common".to_string(),
            resource: None,
            dingtalk: DingTalkConfig::default(),
        }
    }
}

/// DingTalk corp application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DingTalkConfig {
    /// Corp id (needed for department checks)
    pub corp_id: String,
    /// Corp secret
    pub corp_secret: String,
    /// Allowed department ids (empty = any)
    pub departments: Vec<String>,
}

/// Request signing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SignatureConfig {
    /// Default key spec `<algorithm>:<secret>`
    pub key: Option<String>,
    /// Per-host key specs `<host>=<algorithm>:<secret>`
    pub upstream_keys: Vec<String>,
}

/// AWS credentials for `aws+https://` upstreams
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AwsConfig {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Region override (otherwise taken from the upstream host)
    pub region: Option<String>,
    /// Service override (otherwise taken from the upstream host)
    pub service: Option<String>,
}

/// Authentication policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Allowed email domains (`*` = any)
    pub email_domains: Vec<String>,
    /// File of explicitly allowed addresses, one per line
    pub authenticated_emails_file: Option<PathBuf>,
    /// Paths matching any of these bypass authentication
    pub skip_auth_regex: Vec<String>,
    /// Let CORS preflight requests through unauthenticated
    pub skip_auth_preflight: bool,
    /// Path prefix for the proxy's own endpoints
    pub proxy_prefix: String,
    /// Absolute OAuth callback URL (derived from the request when unset)
    pub redirect_url: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            email_domains: Vec::new(),
            authenticated_emails_file: None,
            skip_auth_regex: Vec::new(),
            skip_auth_preflight: false,
            proxy_prefix: "/oauth2".to_string(),
            redirect_url: None,
        }
    }
}

/// Identity header configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadersConfig {
    /// Pass HTTP Basic auth synthesized from the session
    pub pass_basic_auth: bool,
    /// Password used in the synthesized Basic auth header
    pub basic_auth_password: String,
    /// Pass `X-Forwarded-User` and `X-Forwarded-Email`
    pub pass_user_headers: bool,
    /// Pass `X-Forwarded-Access-Token`
    pub pass_access_token: bool,
    /// Keep the client's `Host` header when proxying
    pub pass_host_header: bool,
    /// Set `X-Auth-Request-User`/`-Email` on `/auth` responses
    pub set_xauthrequest: bool,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            pass_basic_auth: true,
            basic_auth_password: String::new(),
            pass_user_headers: true,
            pass_access_token: false,
            pass_host_header: true,
            set_xauthrequest: false,
        }
    }
}

/// Human-readable duration serialization
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "168h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "168h", "100ms" or a bare number of seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
