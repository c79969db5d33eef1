//! Signed cookies
//!
//! Every value the proxy stores in a cookie is wrapped in a tamper-evident
//! envelope:
//!
//! ```text
//! base64url(payload)|<unix timestamp>|base64url(hmac-sha256(secret, name|payload|timestamp))
//! ```
//!
//! The timestamp records when the value was issued; envelopes older than the
//! cookie lifetime, or issued more than five minutes in the future, are
//! rejected.

use std::time::Duration;

use axum::http::HeaderMap;
use axum_extra::extract::{
    CookieJar,
    cookie::{Cookie, SameSite},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, KeyInit, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tracing::debug;

use crate::config::CookieConfig;
use crate::session::{Cipher, SessionError, SessionState};

const MAX_CLOCK_SKEW_MINUTES: i64 = 5;

/// A session decoded from a valid cookie
#[derive(Debug, Clone)]
pub struct LoadedSession {
    /// Decoded session
    pub session: SessionState,
    /// When the cookie was issued
    pub issued_at: DateTime<Utc>,
}

impl LoadedSession {
    /// Age of the cookie
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.issued_at
    }
}

/// Builds and reads the proxy's cookies
#[derive(Debug, Clone)]
pub struct SessionCookies {
    name: String,
    secret: String,
    domain: Option<String>,
    expire: Duration,
    refresh: Duration,
    secure: bool,
    http_only: bool,
    cipher: Cipher,
}

impl SessionCookies {
    /// Create from cookie configuration
    #[must_use]
    pub fn from_config(config: &CookieConfig) -> Self {
        Self {
            name: config.name.clone(),
            secret: config.secret.clone(),
            domain: config.domain.clone(),
            expire: config.expire,
            refresh: config.refresh,
            secure: config.secure,
            http_only: config.http_only,
            cipher: Cipher::new(&config.secret),
        }
    }

    /// Session cookie name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// CSRF cookie name
    #[must_use]
    pub fn csrf_name(&self) -> String {
        format!("{}_csrf", self.name)
    }

    /// Re-issue interval (zero = never)
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh
    }

    fn mac(&self, name: &str, payload: &str, timestamp: i64) -> Option<Vec<u8>> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes()).ok()?;
        mac.update(name.as_bytes());
        mac.update(b"|");
        mac.update(payload.as_bytes());
        mac.update(b"|");
        mac.update(timestamp.to_string().as_bytes());
        Some(mac.finalize().into_bytes().to_vec())
    }

    /// Wrap `value` in a signed envelope issued at `now`
    #[must_use]
    pub fn sign_value(&self, name: &str, value: &str, now: DateTime<Utc>) -> String {
        let payload = URL_SAFE_NO_PAD.encode(value);
        let timestamp = now.timestamp();
        let signature = self
            .mac(name, &payload, timestamp)
            .map(|m| URL_SAFE_NO_PAD.encode(m))
            .unwrap_or_default();
        format!("{payload}|{timestamp}|{signature}")
    }

    /// Unwrap a signed envelope, returning the value and its issue time
    #[must_use]
    pub fn validate_value(
        &self,
        name: &str,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Option<(String, DateTime<Utc>)> {
        let mut parts = raw.split('|');
        let (Some(payload), Some(ts), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };

        let timestamp: i64 = ts.parse().ok()?;
        let expected = self.mac(name, payload, timestamp)?;
        let provided = URL_SAFE_NO_PAD.decode(signature).ok()?;
        if !bool::from(expected.ct_eq(&provided)) {
            debug!(cookie = %name, "Cookie signature mismatch");
            return None;
        }

        let issued_at = DateTime::from_timestamp(timestamp, 0)?;
        let max_age = TimeDelta::from_std(self.expire).ok()?;
        if issued_at + max_age < now || issued_at > now + TimeDelta::minutes(MAX_CLOCK_SKEW_MINUTES) {
            debug!(cookie = %name, %issued_at, "Cookie outside its validity window");
            return None;
        }

        let value = String::from_utf8(URL_SAFE_NO_PAD.decode(payload).ok()?).ok()?;
        Some((value, issued_at))
    }

    fn build_cookie(&self, name: &str, value: String) -> Cookie<'static> {
        let mut cookie = Cookie::build((name.to_string(), value))
            .path("/")
            .http_only(self.http_only)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .build();
        if let Some(domain) = &self.domain {
            cookie.set_domain(domain.clone());
        }
        cookie
    }

    /// Cookie `name=value` living for the cookie lifetime
    #[must_use]
    pub fn make_cookie(&self, name: &str, value: &str, now: DateTime<Utc>) -> Cookie<'static> {
        let max_age = time::Duration::seconds(i64::try_from(self.expire.as_secs()).unwrap_or(i64::MAX));
        let mut cookie = self.build_cookie(name, value.to_string());
        cookie.set_max_age(max_age);
        if let Some(expires) = OffsetDateTime::from_unix_timestamp(now.timestamp())
            .ok()
            .and_then(|at| at.checked_add(max_age))
        {
            cookie.set_expires(expires);
        }
        cookie
    }

    /// Cookie that deletes `name`
    #[must_use]
    pub fn clear_cookie(&self, name: &str) -> Cookie<'static> {
        let mut cookie = self.build_cookie(name, String::new());
        cookie.make_removal();
        cookie
    }

    /// Cookie carrying an encoded session
    pub fn session_cookie(
        &self,
        session: &SessionState,
        now: DateTime<Utc>,
    ) -> Result<Cookie<'static>, SessionError> {
        let encoded = session.encode(Some(&self.cipher))?;
        let signed = self.sign_value(&self.name, &encoded, now);
        Ok(self.make_cookie(&self.name, &signed, now))
    }

    /// Cookie carrying the CSRF nonce
    #[must_use]
    pub fn csrf_cookie(&self, nonce: &str, now: DateTime<Utc>) -> Cookie<'static> {
        let name = self.csrf_name();
        let signed = self.sign_value(&name, nonce, now);
        self.make_cookie(&name, &signed, now)
    }

    /// Read and verify the CSRF nonce
    #[must_use]
    pub fn load_csrf(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Option<String> {
        let name = self.csrf_name();
        let raw = find_cookie(headers, &name)?;
        self.validate_value(&name, &raw, now).map(|(nonce, _)| nonce)
    }

    /// Load the session from the request cookies.
    ///
    /// `Ok(None)` means there is no cookie, or its envelope is invalid or
    /// expired. An envelope that verifies but does not decode is an error.
    pub fn load_session(
        &self,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<Option<LoadedSession>, SessionError> {
        let Some(raw) = find_cookie(headers, &self.name) else {
            return Ok(None);
        };
        let Some((encoded, issued_at)) = self.validate_value(&self.name, &raw, now) else {
            return Ok(None);
        };
        let session = SessionState::decode(&encoded, Some(&self.cipher))?;
        Ok(Some(LoadedSession { session, issued_at }))
    }
}

/// Find a cookie by name across all `Cookie` headers
#[must_use]
pub fn find_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(name)
        .map(|cookie| cookie.value().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, header::COOKIE};

    fn cookies() -> SessionCookies {
        SessionCookies::from_config(&CookieConfig {
            secret: "cookie-secret".to_string(),
            ..Default::default()
        })
    }

    fn headers_with(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_sign_and_validate() {
        let c = cookies();
        let now = Utc::now();
        let signed = c.sign_value("_oauth2_proxy", "a|b|c", now);
        let (value, issued) = c.validate_value("_oauth2_proxy", &signed, now).unwrap();
        assert_eq!(value, "a|b|c");
        assert_eq!(issued.timestamp(), now.timestamp());
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let c = cookies();
        let now = Utc::now();
        let signed = c.sign_value("_oauth2_proxy", "alice@example.com", now);
        let forged_payload = URL_SAFE_NO_PAD.encode("mallory@example.com");
        let mut parts: Vec<&str> = signed.split('|').collect();
        parts[0] = &forged_payload;
        assert!(c.validate_value("_oauth2_proxy", &parts.join("|"), now).is_none());
    }

    #[test]
    fn test_envelope_bound_to_cookie_name() {
        let c = cookies();
        let now = Utc::now();
        let signed = c.sign_value("_oauth2_proxy_csrf", "nonce", now);
        assert!(c.validate_value("_oauth2_proxy", &signed, now).is_none());
    }

    #[test]
    fn test_expired_envelope_rejected() {
        let c = cookies();
        let issued = Utc::now() - TimeDelta::hours(169);
        let signed = c.sign_value("_oauth2_proxy", "v", issued);
        assert!(c.validate_value("_oauth2_proxy", &signed, Utc::now()).is_none());
    }

    #[test]
    fn test_future_envelope_rejected() {
        let c = cookies();
        let issued = Utc::now() + TimeDelta::hours(1);
        let signed = c.sign_value("_oauth2_proxy", "v", issued);
        assert!(c.validate_value("_oauth2_proxy", &signed, Utc::now()).is_none());
    }

    #[test]
    fn test_malformed_envelopes_rejected() {
        let c = cookies();
        let now = Utc::now();
        for raw in ["", "abc", "a|b", "a|notanumber|c", "a|1|c|d"] {
            assert!(c.validate_value("_oauth2_proxy", raw, now).is_none(), "{raw}");
        }
    }

    #[test]
    fn test_session_cookie_round_trip() {
        let c = cookies();
        let now = Utc::now();
        let mut session = SessionState {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            email: "alice@example.com".to_string(),
            user: "alice".to_string(),
            groups: vec!["team-a".to_string()],
            ..Default::default()
        };
        session.set_expires_in(600).unwrap();

        let set_cookie = c.session_cookie(&session, now).unwrap();
        assert_eq!(set_cookie.name(), "_oauth2_proxy");
        assert_eq!(set_cookie.http_only(), Some(true));
        assert_eq!(set_cookie.secure(), Some(true));
        assert_eq!(set_cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(set_cookie.path(), Some("/"));
        assert!(set_cookie.max_age().is_some_and(|age| age > time::Duration::ZERO));
        assert!(!set_cookie.value().contains("access"));

        let headers = headers_with(&format!("other=1; _oauth2_proxy={}", set_cookie.value()));
        let loaded = c.load_session(&headers, now).unwrap().unwrap();
        assert_eq!(loaded.session, session);
        assert_eq!(loaded.age(now).num_seconds(), 0);
    }

    #[test]
    fn test_load_session_absent_or_invalid() {
        let c = cookies();
        let now = Utc::now();
        assert!(c.load_session(&HeaderMap::new(), now).unwrap().is_none());
        assert!(c.load_session(&headers_with("_oauth2_proxy=forged"), now).unwrap().is_none());
    }

    #[test]
    fn test_load_session_undecodable_is_error() {
        let c = cookies();
        let now = Utc::now();
        let signed = c.sign_value("_oauth2_proxy", "a|b", now);
        let headers = headers_with(&format!("_oauth2_proxy={signed}"));
        assert_eq!(
            c.load_session(&headers, now).unwrap_err(),
            SessionError::FieldCount(2)
        );
    }

    #[test]
    fn test_csrf_cookie() {
        let c = cookies();
        let now = Utc::now();
        let set_cookie = c.csrf_cookie("nonce123", now);
        assert_eq!(set_cookie.name(), "_oauth2_proxy_csrf");
        let headers = headers_with(&format!("_oauth2_proxy_csrf={}", set_cookie.value()));
        assert_eq!(c.load_csrf(&headers, now).as_deref(), Some("nonce123"));
    }

    #[test]
    fn test_clear_cookie() {
        let c = SessionCookies::from_config(&CookieConfig {
            secret: "s".to_string(),
            domain: Some(".example.com".to_string()),
            secure: false,
            ..Default::default()
        });
        let cleared = c.clear_cookie("_oauth2_proxy");
        assert_eq!(cleared.name(), "_oauth2_proxy");
        assert_eq!(cleared.value(), "");
        assert_eq!(cleared.max_age(), Some(time::Duration::ZERO));
        assert_eq!(cleared.path(), Some("/"));
        assert_eq!(cleared.domain().map(|d| d.trim_start_matches('.')), Some("example.com"));
        assert_ne!(cleared.secure(), Some(true));
        assert!(cleared.to_string().starts_with("_oauth2_proxy=;"));
    }

    #[test]
    fn test_find_cookie() {
        let headers = headers_with("a=1; b=2;c=3");
        assert_eq!(find_cookie(&headers, "b").as_deref(), Some("2"));
        assert_eq!(find_cookie(&headers, "c").as_deref(), Some("3"));
        assert_eq!(find_cookie(&headers, "d"), None);

        // GIVEN: cookies split across two headers
        let mut headers = headers_with("a=1");
        headers.append(COOKIE, HeaderValue::from_static("_oauth2_proxy=x|1|y"));
        assert_eq!(find_cookie(&headers, "_oauth2_proxy").as_deref(), Some("x|1|y"));
    }
}
