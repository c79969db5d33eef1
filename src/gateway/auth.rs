//! Per-request authentication
//!
//! The session is decoded from the cookie on every request. An expired
//! session is refreshed with the provider when it carries a refresh token;
//! a cookie older than the refresh interval is re-validated and re-issued.
//! Any failure clears the cookie, so a stale session never outlives its
//! expiry.

use std::sync::Arc;

use axum::http::{
    HeaderMap, HeaderValue, Method,
    header::{AUTHORIZATION, HOST},
};
use axum_extra::extract::cookie::Cookie;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{TimeDelta, Utc};
use regex::Regex;
use tracing::{debug, info, warn};
use url::Url;

use super::email::EmailValidator;
use crate::config::{Config, HeadersConfig};
use crate::cookies::SessionCookies;
use crate::providers::{Provider, ProviderError};
use crate::session::SessionState;
use crate::{Error, Result};

/// Identity headers a client must never be able to set
pub const IDENTITY_HEADERS: [&str; 3] = [
    "x-forwarded-user",
    "x-forwarded-email",
    "x-forwarded-access-token",
];

/// Outcome of checking a request's session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    /// Valid session
    Authenticated(SessionState),
    /// No usable session; the visitor should log in
    Unauthenticated,
    /// Logged in, but not allowed
    Forbidden,
}

/// Session check result plus the cookie to send back, if any
#[derive(Debug, Clone)]
pub struct Authentication {
    /// What the session allows
    pub status: AuthStatus,
    /// Cookie re-issuing or clearing the session
    pub set_cookie: Option<Cookie<'static>>,
}

/// Authentication policy and session handling
pub struct Gate {
    provider: Arc<dyn Provider>,
    cookies: SessionCookies,
    emails: EmailValidator,
    skip_auth: Vec<Regex>,
    skip_preflight: bool,
    headers: HeadersConfig,
    proxy_prefix: String,
    redirect_url: Option<Url>,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("provider", &self.provider.data().provider_name)
            .field("proxy_prefix", &self.proxy_prefix)
            .finish_non_exhaustive()
    }
}

impl Gate {
    /// Build from validated configuration
    pub fn from_config(config: &Config, provider: Arc<dyn Provider>) -> Result<Self> {
        let skip_auth = config
            .auth
            .skip_auth_regex
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| Error::Config(format!("error compiling regex={pattern:?} {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let redirect_url = config
            .auth
            .redirect_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| Error::Config(format!("error parsing redirect-url: {e}")))?;

        Ok(Self {
            provider,
            cookies: SessionCookies::from_config(&config.cookie),
            emails: EmailValidator::new(
                &config.auth.email_domains,
                config.auth.authenticated_emails_file.as_deref(),
            )?,
            skip_auth,
            skip_preflight: config.auth.skip_auth_preflight,
            headers: config.headers.clone(),
            proxy_prefix: config.auth.proxy_prefix.clone(),
            redirect_url,
        })
    }

    /// Identity provider
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Cookie codec
    #[must_use]
    pub fn cookies(&self) -> &SessionCookies {
        &self.cookies
    }

    /// Prefix of the proxy's own endpoints
    #[must_use]
    pub fn proxy_prefix(&self) -> &str {
        &self.proxy_prefix
    }

    /// Identity header settings
    #[must_use]
    pub fn header_settings(&self) -> &HeadersConfig {
        &self.headers
    }

    /// True if `email` passes the allowlist and the provider's group rule
    #[must_use]
    pub fn is_allowed(&self, email: &str) -> bool {
        self.emails.validate(email) && self.provider.validate_group(email)
    }

    /// Login check for a new session. Sessions without an email are only
    /// admitted when every address is allowed.
    #[must_use]
    pub fn admits(&self, session: &SessionState) -> bool {
        if session.email.is_empty() {
            return !session.user.is_empty() && self.emails.allows_all();
        }
        self.is_allowed(&session.email)
    }

    /// Requests that bypass authentication
    #[must_use]
    pub fn skips_auth(&self, method: &Method, path: &str) -> bool {
        (self.skip_preflight && method == Method::OPTIONS)
            || self.skip_auth.iter().any(|re| re.is_match(path))
    }

    /// OAuth callback URL: the configured redirect URL, or one built from
    /// the request's host and `X-Forwarded-Proto`
    #[must_use]
    pub fn redirect_uri(&self, headers: &HeaderMap) -> String {
        if let Some(url) = &self.redirect_url {
            return url.to_string();
        }
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map_or("http", str::trim);
        let host = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("{scheme}://{host}{}/callback", self.proxy_prefix)
    }

    /// Load, refresh and re-validate the request's session
    pub async fn authenticate(&self, headers: &HeaderMap) -> Authentication {
        let now = Utc::now();
        let loaded = match self.cookies.load_session(headers, now) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Invalid session cookie");
                return self.reject(AuthStatus::Unauthenticated);
            }
        };
        let Some(loaded) = loaded else {
            return Authentication {
                status: AuthStatus::Unauthenticated,
                set_cookie: None,
            };
        };

        let refresh = self.cookies.refresh_interval();
        let mut save = !refresh.is_zero()
            && TimeDelta::from_std(refresh).is_ok_and(|interval| loaded.age(now) > interval);
        let mut session = loaded.session;
        let mut revalidated = false;

        match self.provider.refresh_session_if_needed(&mut session).await {
            Ok(true) => {
                save = true;
                revalidated = true;
            }
            Ok(false) => {}
            Err(ProviderError::MembershipRevoked(email)) => {
                info!(email = %email, "Membership revoked during refresh");
                return self.reject(AuthStatus::Forbidden);
            }
            Err(e) => {
                warn!(error = %e, session = %session, "Refreshing session failed");
                return self.reject(AuthStatus::Unauthenticated);
            }
        }

        if session.is_expired() {
            info!(session = %session, "Session expired");
            return self.reject(AuthStatus::Unauthenticated);
        }

        if save && !revalidated && !session.access_token.is_empty() {
            if !self.provider.validate_session_state(&session).await {
                info!(session = %session, "Access token no longer valid");
                return self.reject(AuthStatus::Unauthenticated);
            }
            debug!(session = %session, "Re-validated session");
        }

        if !session.email.is_empty() && !self.is_allowed(&session.email) {
            info!(email = %session.email, "Email no longer permitted");
            return self.reject(AuthStatus::Forbidden);
        }

        let set_cookie = if save {
            match self.cookies.session_cookie(&session, now) {
                Ok(cookie) => Some(cookie),
                Err(e) => {
                    warn!(error = %e, "Cannot re-issue session cookie");
                    None
                }
            }
        } else {
            None
        };

        Authentication {
            status: AuthStatus::Authenticated(session),
            set_cookie,
        }
    }

    fn reject(&self, status: AuthStatus) -> Authentication {
        Authentication {
            status,
            set_cookie: Some(self.cookies.clear_cookie(self.cookies.name())),
        }
    }

    /// Replace client-supplied identity headers with the session's
    pub fn inject_identity(&self, session: &SessionState, headers: &mut HeaderMap) {
        strip_identity(headers);

        let user = header_value(&session.user);
        let email = header_value(&session.email);

        if self.headers.pass_basic_auth {
            let credentials = format!("{}:{}", session.user, self.headers.basic_auth_password);
            if let Ok(value) = HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(credentials))) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if self.headers.pass_basic_auth || self.headers.pass_user_headers {
            if let Some(user) = user {
                headers.insert("x-forwarded-user", user);
            }
            if let Some(email) = email {
                headers.insert("x-forwarded-email", email);
            }
        }
        if self.headers.pass_access_token && !session.access_token.is_empty() {
            if let Some(token) = header_value(&session.access_token) {
                headers.insert("x-forwarded-access-token", token);
            }
        }
    }
}

/// Remove identity headers a client might have forged
pub fn strip_identity(headers: &mut HeaderMap) {
    for name in IDENTITY_HEADERS {
        headers.remove(name);
    }
}

/// `GAP-Auth` value: the email, or the user when there is none
#[must_use]
pub fn gap_auth(session: &SessionState) -> &str {
    if session.email.is_empty() {
        &session.user
    } else {
        &session.email
    }
}

fn header_value(value: &str) -> Option<HeaderValue> {
    if value.is_empty() {
        return None;
    }
    HeaderValue::from_str(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, CookieConfig, ProviderConfig};
    use crate::providers::ProviderData;
    use async_trait::async_trait;
    use axum::http::header::COOKIE;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Refresh {
        Nothing,
        Succeeds,
        Fails,
        Revokes,
    }

    /// Provider double with scripted refresh and validation results
    struct Scripted {
        data: ProviderData,
        refresh: Refresh,
        token_valid: AtomicBool,
        validations: AtomicUsize,
    }

    impl Scripted {
        fn new() -> Self {
            let config = ProviderConfig {
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
                ..Default::default()
            };
            Self {
                data: crate::providers::GoogleProvider::new(&config, Duration::from_secs(5))
                    .unwrap()
                    .data()
                    .clone(),
                refresh: Refresh::Nothing,
                token_valid: AtomicBool::new(true),
                validations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn data(&self) -> &ProviderData {
            &self.data
        }

        async fn validate_session_state(&self, _session: &SessionState) -> bool {
            self.validations.fetch_add(1, Ordering::SeqCst);
            self.token_valid.load(Ordering::SeqCst)
        }

        async fn refresh_session_if_needed(
            &self,
            session: &mut SessionState,
        ) -> std::result::Result<bool, ProviderError> {
            if !session.is_expired() {
                return Ok(false);
            }
            match self.refresh {
                Refresh::Nothing => Ok(false),
                Refresh::Succeeds => {
                    session.access_token = "refreshed".to_string();
                    session.set_expires_in(3600).unwrap();
                    Ok(true)
                }
                Refresh::Fails => Err(ProviderError::Redeem("invalid_grant".to_string())),
                Refresh::Revokes => Err(ProviderError::MembershipRevoked(session.email.clone())),
            }
        }
    }

    fn config(refresh: Duration) -> Config {
        Config {
            cookie: CookieConfig {
                secret: "0123456789abcdef0123456789abcdef".to_string(),
                refresh,
                ..Default::default()
            },
            auth: AuthConfig {
                email_domains: vec!["example.com".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn gate_with(provider: Scripted, refresh: Duration) -> (Gate, Arc<Scripted>) {
        let provider = Arc::new(provider);
        let gate = Gate::from_config(&config(refresh), provider.clone()).unwrap();
        (gate, provider)
    }

    fn session(email: &str) -> SessionState {
        let mut s = SessionState {
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            email: email.to_string(),
            user: email.split('@').next().unwrap_or_default().to_string(),
            ..Default::default()
        };
        s.set_expires_in(3600).unwrap();
        s
    }

    fn request_with(gate: &Gate, session: &SessionState, issued: chrono::DateTime<Utc>) -> HeaderMap {
        let set_cookie = gate.cookies().session_cookie(session, issued).unwrap();
        let pair = format!("{}={}", set_cookie.name(), set_cookie.value());
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&pair).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_no_cookie_is_unauthenticated() {
        let (gate, _) = gate_with(Scripted::new(), Duration::ZERO);
        let auth = gate.authenticate(&HeaderMap::new()).await;
        assert_eq!(auth.status, AuthStatus::Unauthenticated);
        assert!(auth.set_cookie.is_none());
    }

    #[tokio::test]
    async fn test_valid_session() {
        let (gate, provider) = gate_with(Scripted::new(), Duration::ZERO);
        let s = session("alice@example.com");
        let auth = gate.authenticate(&request_with(&gate, &s, Utc::now())).await;
        assert_eq!(auth.status, AuthStatus::Authenticated(s));
        assert!(auth.set_cookie.is_none());
        assert_eq!(provider.validations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_garbage_cookie_is_cleared() {
        let (gate, _) = gate_with(Scripted::new(), Duration::ZERO);
        let mut headers = HeaderMap::new();
        let forged = gate.cookies().sign_value("_oauth2_proxy", "a|b|c", Utc::now());
        headers.insert(COOKIE, HeaderValue::from_str(&format!("_oauth2_proxy={forged}")).unwrap());

        let auth = gate.authenticate(&headers).await;
        assert_eq!(auth.status, AuthStatus::Unauthenticated);
        assert_eq!(auth.set_cookie.unwrap().max_age(), Some(time::Duration::ZERO));
    }

    #[tokio::test]
    async fn test_expired_session_without_refresh_is_cleared() {
        let (gate, _) = gate_with(Scripted::new(), Duration::ZERO);
        let mut s = session("alice@example.com");
        s.set_expires_in(-60).unwrap();
        let auth = gate.authenticate(&request_with(&gate, &s, Utc::now())).await;
        assert_eq!(auth.status, AuthStatus::Unauthenticated);
        assert!(auth.set_cookie.is_some());
    }

    #[tokio::test]
    async fn test_expired_session_is_refreshed_and_reissued() {
        let mut provider = Scripted::new();
        provider.refresh = Refresh::Succeeds;
        let (gate, provider) = gate_with(provider, Duration::ZERO);
        let mut s = session("alice@example.com");
        s.set_expires_in(-60).unwrap();

        let auth = gate.authenticate(&request_with(&gate, &s, Utc::now())).await;
        let AuthStatus::Authenticated(refreshed) = auth.status else {
            panic!("expected authenticated");
        };
        assert_eq!(refreshed.access_token, "refreshed");
        assert!(!refreshed.is_expired());
        assert_eq!(auth.set_cookie.unwrap().name(), "_oauth2_proxy");
        // a refresh already proves the token, no extra validation call
        assert_eq!(provider.validations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_session() {
        let mut provider = Scripted::new();
        provider.refresh = Refresh::Fails;
        let (gate, _) = gate_with(provider, Duration::ZERO);
        let mut s = session("alice@example.com");
        s.set_expires_in(-60).unwrap();

        let auth = gate.authenticate(&request_with(&gate, &s, Utc::now())).await;
        assert_eq!(auth.status, AuthStatus::Unauthenticated);
        assert!(auth.set_cookie.is_some());
    }

    #[tokio::test]
    async fn test_revoked_membership_is_forbidden() {
        let mut provider = Scripted::new();
        provider.refresh = Refresh::Revokes;
        let (gate, _) = gate_with(provider, Duration::ZERO);
        let mut s = session("alice@example.com");
        s.set_expires_in(-60).unwrap();

        let auth = gate.authenticate(&request_with(&gate, &s, Utc::now())).await;
        assert_eq!(auth.status, AuthStatus::Forbidden);
    }

    #[tokio::test]
    async fn test_old_cookie_is_revalidated_and_reissued() {
        // GIVEN: a one minute refresh interval and a ten minute old cookie
        let (gate, provider) = gate_with(Scripted::new(), Duration::from_secs(60));
        let s = session("alice@example.com");
        let issued = Utc::now() - TimeDelta::minutes(10);

        let auth = gate.authenticate(&request_with(&gate, &s, issued)).await;

        // THEN: the token is checked with the provider and the cookie re-issued
        assert!(matches!(auth.status, AuthStatus::Authenticated(_)));
        assert!(auth.set_cookie.is_some());
        assert_eq!(provider.validations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_old_cookie_with_dead_token_is_cleared() {
        let provider = Scripted::new();
        provider.token_valid.store(false, Ordering::SeqCst);
        let (gate, _) = gate_with(provider, Duration::from_secs(60));
        let s = session("alice@example.com");
        let issued = Utc::now() - TimeDelta::minutes(10);

        let auth = gate.authenticate(&request_with(&gate, &s, issued)).await;
        assert_eq!(auth.status, AuthStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn test_disallowed_email_is_forbidden() {
        let (gate, _) = gate_with(Scripted::new(), Duration::ZERO);
        let s = session("mallory@elsewhere.org");
        let auth = gate.authenticate(&request_with(&gate, &s, Utc::now())).await;
        assert_eq!(auth.status, AuthStatus::Forbidden);
        assert!(auth.set_cookie.is_some());
    }

    #[test]
    fn test_inject_identity_replaces_forged_headers() {
        let (gate, _) = gate_with(Scripted::new(), Duration::ZERO);
        let s = session("alice@example.com");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", HeaderValue::from_static("root"));
        headers.insert("x-forwarded-access-token", HeaderValue::from_static("forged"));

        gate.inject_identity(&s, &mut headers);

        assert_eq!(headers["x-forwarded-user"], "alice");
        assert_eq!(headers["x-forwarded-email"], "alice@example.com");
        // "alice:" with the default empty password
        assert_eq!(headers[AUTHORIZATION], "Basic YWxpY2U6");
        assert!(headers.get("x-forwarded-access-token").is_none());
    }

    #[test]
    fn test_inject_access_token_when_enabled() {
        let mut config = config(Duration::ZERO);
        config.headers.pass_access_token = true;
        config.headers.pass_basic_auth = false;
        let gate = Gate::from_config(&config, Arc::new(Scripted::new())).unwrap();

        let mut headers = HeaderMap::new();
        gate.inject_identity(&session("alice@example.com"), &mut headers);
        assert_eq!(headers["x-forwarded-access-token"], "token");
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_skips_auth() {
        let mut config = config(Duration::ZERO);
        config.auth.skip_auth_regex = vec!["^/health$".to_string(), "^/public/".to_string()];
        config.auth.skip_auth_preflight = true;
        let gate = Gate::from_config(&config, Arc::new(Scripted::new())).unwrap();

        assert!(gate.skips_auth(&Method::GET, "/health"));
        assert!(gate.skips_auth(&Method::GET, "/public/logo.png"));
        assert!(gate.skips_auth(&Method::OPTIONS, "/private"));
        assert!(!gate.skips_auth(&Method::GET, "/private"));
    }

    #[test]
    fn test_admits_new_sessions() {
        let (gate, _) = gate_with(Scripted::new(), Duration::ZERO);
        let username_only = SessionState {
            user: "svc-robot".to_string(),
            ..Default::default()
        };
        assert!(gate.admits(&session("alice@example.com")));
        assert!(!gate.admits(&session("mallory@elsewhere.org")));
        assert!(!gate.admits(&username_only));
        assert!(!gate.admits(&SessionState::default()));

        // GIVEN: an allowlist of every address
        let mut config = config(Duration::ZERO);
        config.auth.email_domains = vec!["*".to_string()];
        let gate = Gate::from_config(&config, Arc::new(Scripted::new())).unwrap();
        assert!(gate.admits(&username_only));
        assert!(!gate.admits(&SessionState::default()));
    }

    #[test]
    fn test_redirect_uri() {
        let (gate, _) = gate_with(Scripted::new(), Duration::ZERO);
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("app.example.com"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(gate.redirect_uri(&headers), "https://app.example.com/oauth2/callback");

        let mut config = config(Duration::ZERO);
        config.auth.redirect_url = Some("https://login.example.com/oauth2/callback".to_string());
        let gate = Gate::from_config(&config, Arc::new(Scripted::new())).unwrap();
        assert_eq!(gate.redirect_uri(&headers), "https://login.example.com/oauth2/callback");
    }

    #[test]
    fn test_gap_auth_prefers_email() {
        assert_eq!(gap_auth(&session("alice@example.com")), "alice@example.com");
        let user_only = SessionState {
            user: "bob".to_string(),
            ..Default::default()
        };
        assert_eq!(gap_auth(&user_only), "bob");
    }
}
