//! Identity providers
//!
//! Every provider implements [`Provider`]. The generic OAuth2 behaviour lives
//! on [`ProviderData`]; providers override only the steps their API does
//! differently. [`from_config`] resolves the configured provider once at
//! startup.

mod api;
mod azure;
mod default;
mod dingtalk;
mod github;
mod gitlab;
mod google;
mod heroku;
mod keycloak;
mod oidc;
mod token_cache;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

pub use api::request_json;
pub use azure::AzureProvider;
pub use default::{ProviderData, TokenResponse, id_token_claims};
pub use dingtalk::DingTalkProvider;
pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;
pub use google::GoogleProvider;
pub use heroku::HerokuProvider;
pub use keycloak::KeycloakProvider;
pub use oidc::{IdTokenVerifier, JwksVerifier, OidcProvider};
pub use token_cache::TokenCache;

use crate::config::ProviderConfig;
use crate::session::SessionState;

/// Errors talking to an identity provider
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Callback arrived without an authorization code
    #[error("missing code")]
    MissingCode,

    /// Token endpoint refused the code or returned garbage
    #[error("redeem failed: {0}")]
    Redeem(String),

    /// Profile did not include an email
    #[error("no email address found")]
    NoEmail,

    /// Provider API returned something other than 200
    #[error("got {status} from {url:?} {body}")]
    NonSuccessStatus {
        /// HTTP status
        status: u16,
        /// Requested URL
        url: String,
        /// Response body
        body: String,
    },

    /// Provider API answered 200 with an application level error
    #[error("provider API error from {url:?}: {message}")]
    Api {
        /// Requested URL
        url: String,
        /// Provider message
        message: String,
    },

    /// Network failure or timeout
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body was not the expected JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Session lost a required membership when its token was refreshed
    #[error("membership revoked for {0}")]
    MembershipRevoked(String),

    /// Token response carried an `expires_in` no expiry can represent
    #[error("invalid expires_in: {0}")]
    Lifetime(#[from] crate::session::SessionError),

    /// `id_token` missing, unverifiable or rejected
    #[error("id_token error: {0}")]
    IdToken(String),

    /// Provider misconfiguration
    #[error("provider configuration error: {0}")]
    Config(String),
}

/// The identity provider protocol
#[async_trait]
pub trait Provider: Send + Sync {
    /// Static configuration and endpoints
    fn data(&self) -> &ProviderData;

    /// Authorization URL the browser is sent to
    fn login_url(&self, redirect_uri: &str, state: &str) -> url::Url {
        self.data().login_url(redirect_uri, state)
    }

    /// Exchange an authorization code for a session
    async fn redeem(&self, redirect_uri: &str, code: &str) -> Result<SessionState, ProviderError> {
        self.data().redeem(redirect_uri, code).await
    }

    /// Fetch the user's email with the session's access token
    async fn email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        self.data().profile_email(&session.access_token).await
    }

    /// Static membership predicate on the email address
    fn validate_group(&self, _email: &str) -> bool {
        true
    }

    /// Query the provider for the org/team/group/department memberships the
    /// configuration requires. Fails closed: `Ok(false)` when a required
    /// membership is absent.
    async fn check_membership(&self, _session: &SessionState) -> Result<bool, ProviderError> {
        Ok(true)
    }

    /// Ask the provider whether the access token is still live
    async fn validate_session_state(&self, session: &SessionState) -> bool {
        self.data().validate_token(&session.access_token).await
    }

    /// Redeem the refresh token of an expired session.
    ///
    /// Returns `Ok(false)` and leaves `session` untouched when it has not
    /// expired or cannot be refreshed. On success the access token and expiry
    /// are replaced (the refresh token only if the provider rotated it) and
    /// memberships are re-checked with the new token.
    async fn refresh_session_if_needed(
        &self,
        session: &mut SessionState,
    ) -> Result<bool, ProviderError> {
        if !session.is_expired() || session.refresh_token.is_empty() {
            return Ok(false);
        }

        let token = self.data().refresh_access_token(&session.refresh_token).await?;
        let mut refreshed = session.clone();
        token.apply_refresh(&mut refreshed)?;

        if !self.validate_group(&refreshed.email) || !self.check_membership(&refreshed).await? {
            return Err(ProviderError::MembershipRevoked(refreshed.email));
        }

        info!(
            provider = self.data().provider_name,
            session = %refreshed,
            "Refreshed access token"
        );
        *session = refreshed;
        Ok(true)
    }
}

/// Supported provider names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Google
    Google,
    /// GitHub
    GitHub,
    /// GitLab
    GitLab,
    /// Generic OpenID Connect
    Oidc,
    /// Azure AD
    Azure,
    /// Keycloak
    Keycloak,
    /// Heroku
    Heroku,
    /// DingTalk
    DingTalk,
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::GitHub),
            "gitlab" => Ok(Self::GitLab),
            "oidc" => Ok(Self::Oidc),
            "azure" => Ok(Self::Azure),
            "keycloak" => Ok(Self::Keycloak),
            "heroku" => Ok(Self::Heroku),
            "dingtalk" => Ok(Self::DingTalk),
            other => Err(ProviderError::Config(format!("unknown provider {other:?}"))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Google => "google",
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Oidc => "oidc",
            Self::Azure => "azure",
            Self::Keycloak => "keycloak",
            Self::Heroku => "heroku",
            Self::DingTalk => "dingtalk",
        };
        f.write_str(s)
    }
}

/// Build the configured provider.
///
/// OIDC discovery happens here, so this is async and runs once at startup.
pub async fn from_config(
    config: &ProviderConfig,
    timeout: Duration,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let kind: ProviderKind = config.kind.parse()?;
    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Google => Arc::new(GoogleProvider::new(config, timeout)?),
        ProviderKind::GitHub => Arc::new(GitHubProvider::new(config, timeout)?),
        ProviderKind::GitLab => Arc::new(GitLabProvider::new(config, timeout)?),
        ProviderKind::Oidc => Arc::new(OidcProvider::discover(config, timeout).await?),
        ProviderKind::Azure => Arc::new(AzureProvider::new(config, timeout)?),
        ProviderKind::Keycloak => Arc::new(KeycloakProvider::new(config, timeout)?),
        ProviderKind::Heroku => Arc::new(HerokuProvider::new(config, timeout)?),
        ProviderKind::DingTalk => Arc::new(DingTalkProvider::new(config, timeout)?),
    };
    info!(provider = provider.data().provider_name, "Identity provider ready");
    Ok(provider)
}
