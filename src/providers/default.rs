//! Generic OAuth2 authorization-code flow shared by every provider

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::header::ACCEPT;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{ProviderError, api::request_json};
use crate::config::ProviderConfig;
use crate::session::SessionState;

/// Lifetime assumed for a refreshable token when the provider omits
/// `expires_in`, so that the session is eventually refreshed
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Built-in endpoints of a provider, overridable from config
#[derive(Debug, Clone, Copy)]
pub(crate) struct Endpoints<'a> {
    pub login: &'a str,
    pub redeem: &'a str,
    pub profile: Option<&'a str>,
    pub validate: Option<&'a str>,
    pub scope: &'a str,
}

/// Static provider configuration with resolved endpoints.
///
/// Built once per provider instance and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ProviderData {
    /// Display name used in logs and the sign-in redirect
    pub provider_name: &'static str,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Authorization endpoint
    pub login_url: Url,
    /// Token endpoint
    pub redeem_url: Url,
    /// Profile or userinfo endpoint
    pub profile_url: Option<Url>,
    /// Token validation endpoint
    pub validate_url: Option<Url>,
    /// Requested scopes
    pub scope: String,
    /// `approval_prompt` login parameter
    pub approval_prompt: String,
    /// Send client credentials as HTTP Basic auth instead of in the form body
    pub http_basic_auth: bool,
    /// `resource` parameter sent when redeeming (Azure)
    pub protected_resource: Option<String>,
    http: reqwest::Client,
}

impl ProviderData {
    pub(crate) fn new(
        provider_name: &'static str,
        config: &ProviderConfig,
        defaults: Endpoints<'_>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        let login_url = endpoint("login_url", config.login_url.as_deref(), defaults.login)?;
        let redeem_url = endpoint("redeem_url", config.redeem_url.as_deref(), defaults.redeem)?;
        let profile_url = optional_endpoint("profile_url", config.profile_url.as_deref(), defaults.profile)?;
        let validate_url =
            optional_endpoint("validate_url", config.validate_url.as_deref(), defaults.validate)?;

        let scope = config
            .scope
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| defaults.scope.to_string());

        Ok(Self {
            provider_name,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            login_url,
            redeem_url,
            profile_url,
            validate_url,
            scope,
            approval_prompt: config.approval_prompt.clone(),
            http_basic_auth: config.http_basic_auth,
            protected_resource: config.resource.clone().filter(|r| !r.is_empty()),
            http,
        })
    }

    /// Shared HTTP client, bounded by the provider timeout
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Standard authorization URL
    pub fn login_url(&self, redirect_uri: &str, state: &str) -> Url {
        self.authorize_url(&[
            ("redirect_uri", redirect_uri),
            ("approval_prompt", self.approval_prompt.as_str()),
            ("scope", self.scope.as_str()),
            ("client_id", self.client_id.as_str()),
            ("response_type", "code"),
            ("state", state),
        ])
    }

    /// Authorization endpoint with `params` set, replacing any parameter of
    /// the same name already present on the configured URL
    pub fn authorize_url(&self, params: &[(&str, &str)]) -> Url {
        let mut url = self.login_url.clone();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !params.iter().any(|(name, _)| **name == **k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (k, v) in &kept {
                query.append_pair(k, v);
            }
            for (k, v) in params {
                query.append_pair(k, v);
            }
        }
        url
    }

    /// Redeem an authorization code for a session without identity fields
    pub async fn redeem(&self, redirect_uri: &str, code: &str) -> Result<SessionState, ProviderError> {
        self.redeem_token(redirect_uri, code).await?.into_session()
    }

    /// Exchange an authorization code at the token endpoint
    pub async fn redeem_token(&self, redirect_uri: &str, code: &str) -> Result<TokenResponse, ProviderError> {
        if code.is_empty() {
            return Err(ProviderError::MissingCode);
        }

        let mut form = vec![
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
        ];
        if let Some(resource) = &self.protected_resource {
            form.push(("resource", resource.as_str()));
        }
        self.token_request(form).await
    }

    /// Redeem a refresh token for a new access token
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        let form = vec![
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        self.token_request(form).await
    }

    async fn token_request(&self, mut form: Vec<(&str, &str)>) -> Result<TokenResponse, ProviderError> {
        if !self.http_basic_auth {
            form.push(("client_secret", self.client_secret.as_str()));
        }

        let mut request = self
            .http
            .post(self.redeem_url.clone())
            .header(ACCEPT, "application/json")
            .form(&form);
        if self.http_basic_auth {
            request = request.basic_auth(&self.client_id, Some(&self.client_secret));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status != reqwest::StatusCode::OK {
            return Err(ProviderError::Redeem(format!(
                "got {} from {:?} {body}",
                status.as_u16(),
                self.redeem_url.as_str()
            )));
        }

        let token = TokenResponse::parse(&body);
        if token.access_token.is_empty() {
            return Err(ProviderError::Redeem(format!("no access token found {body}")));
        }
        Ok(token)
    }

    /// `email` field of the profile endpoint, queried with a bearer token
    pub async fn profile_email(&self, access_token: &str) -> Result<String, ProviderError> {
        let Some(url) = &self.profile_url else {
            return Err(ProviderError::NoEmail);
        };
        let profile: Value = request_json(self.http.get(url.clone()).bearer_auth(access_token)).await?;
        match profile.get("email").and_then(Value::as_str) {
            Some(email) if !email.is_empty() => Ok(email.to_string()),
            _ => Err(ProviderError::NoEmail),
        }
    }

    /// Validate with `?access_token=` on the validate endpoint
    pub async fn validate_token(&self, access_token: &str) -> bool {
        self.validate_token_with(access_token, |request| {
            request.query(&[("access_token", access_token)])
        })
        .await
    }

    /// GET the validate endpoint, authorized by `authorize`. 200 means valid.
    pub async fn validate_token_with<F>(&self, access_token: &str, authorize: F) -> bool
    where
        F: FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send,
    {
        if access_token.is_empty() {
            return false;
        }
        let Some(url) = &self.validate_url else {
            return false;
        };

        match authorize(self.http.get(url.clone())).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                debug!(provider = self.provider_name, "Token validation succeeded");
                true
            }
            Ok(response) => {
                warn!(
                    provider = self.provider_name,
                    status = response.status().as_u16(),
                    "Token validation request failed"
                );
                false
            }
            Err(e) => {
                warn!(provider = self.provider_name, error = %e, "Token validation request failed");
                false
            }
        }
    }
}

fn endpoint(name: &str, configured: Option<&str>, default: &str) -> Result<Url, ProviderError> {
    let raw = configured.filter(|s| !s.is_empty()).unwrap_or(default);
    Url::parse(raw).map_err(|e| ProviderError::Config(format!("invalid {name} {raw:?}: {e}")))
}

fn optional_endpoint(
    name: &str,
    configured: Option<&str>,
    default: Option<&str>,
) -> Result<Option<Url>, ProviderError> {
    match configured.filter(|s| !s.is_empty()).or(default) {
        Some(raw) => endpoint(name, Some(raw), raw).map(Some),
        None => Ok(None),
    }
}

/// Token endpoint response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    /// Access token
    #[serde(default)]
    pub access_token: String,
    /// Refresh token, empty if not issued
    #[serde(default)]
    pub refresh_token: String,
    /// Lifetime of the access token in seconds
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<i64>,
    /// OIDC identity token, empty if not issued
    #[serde(default)]
    pub id_token: String,
}

impl TokenResponse {
    /// Parse a JSON body, falling back to form encoding
    pub fn parse(body: &str) -> Self {
        if let Ok(token) = serde_json::from_str::<Self>(body) {
            return token;
        }

        let mut token = Self::default();
        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            match key.as_ref() {
                "access_token" => token.access_token = value.into_owned(),
                "refresh_token" => token.refresh_token = value.into_owned(),
                "expires_in" => token.expires_in = value.trim().parse().ok(),
                "id_token" => token.id_token = value.into_owned(),
                _ => {}
            }
        }
        token
    }

    fn lifetime(&self) -> Option<i64> {
        match self.expires_in {
            Some(secs) => Some(secs),
            None if !self.refresh_token.is_empty() => Some(DEFAULT_TOKEN_LIFETIME_SECS),
            None => None,
        }
    }

    /// Session holding the tokens; identity fields left empty
    pub fn into_session(self) -> Result<SessionState, ProviderError> {
        let lifetime = self.lifetime();
        let mut session = SessionState {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            ..Default::default()
        };
        if let Some(secs) = lifetime {
            session.set_expires_in(secs)?;
        }
        Ok(session)
    }

    /// Replace the access token and expiry of `session`, and its refresh
    /// token if a new one was issued
    pub fn apply_refresh(self, session: &mut SessionState) -> Result<(), ProviderError> {
        let lifetime = self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        session.set_expires_in(lifetime)?;
        session.access_token = self.access_token;
        if !self.refresh_token.is_empty() {
            session.refresh_token = self.refresh_token;
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Int(i64),
        Float(f64),
        Text(String),
    }

    Ok(match Option::<Seconds>::deserialize(deserializer)? {
        Some(Seconds::Int(n)) => Some(n),
        Some(Seconds::Float(f)) => Some(f as i64),
        Some(Seconds::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// Decode the claims of a JWT without verifying its signature.
///
/// Only for tokens received directly from the token endpoint over TLS.
pub fn id_token_claims(id_token: &str) -> Result<Value, ProviderError> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| ProviderError::IdToken("malformed id_token".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ProviderError::IdToken(format!("failed to decode id_token claims: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// `base` with `suffix` appended to its path, query dropped
pub(crate) fn join_path(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    let path = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        suffix.trim_start_matches('/')
    );
    url.set_path(&path);
    url.set_query(None);
    url
}

/// `email_verified` claim, which some issuers send as a string
pub(crate) fn email_verified(claims: &Value) -> Option<bool> {
    match claims.get("email_verified")? {
        Value::Bool(verified) => Some(*verified),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
