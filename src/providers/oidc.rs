//! Generic OpenID Connect provider
//!
//! Endpoints come from the issuer's discovery document. The `id_token`
//! returned on redeem is verified against the issuer's JWKS:
//!
//! 1. Read `kid` and `alg` from the JWT header.
//! 2. Look the key up in the cached JWKS; an unknown `kid` forces one refresh.
//! 3. Check signature, `exp`, `iss` and that `aud` contains the client id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::default::{Endpoints, email_verified};
use super::{Provider, ProviderData, ProviderError, request_json};
use crate::config::ProviderConfig;
use crate::session::SessionState;

const DEFAULT_SCOPE: &str = "openid email profile";
const JWKS_TTL: Duration = Duration::from_secs(3600);
const CLOCK_LEEWAY_SECS: u64 = 60;

/// Verifies a raw `id_token` and returns its claims
#[async_trait]
pub trait IdTokenVerifier: Send + Sync {
    /// Verified claims of `id_token`
    async fn verify(&self, id_token: &str) -> Result<Value, ProviderError>;
}

/// Subset of the discovery document we use
#[derive(Debug, Clone, Deserialize)]
struct Discovery {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    userinfo_endpoint: Option<String>,
    jwks_uri: String,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= JWKS_TTL
    }
}

/// Signature verification against the issuer's published JWKS
pub struct JwksVerifier {
    issuer: String,
    audience: String,
    jwks_uri: Url,
    http: reqwest::Client,
    cache: DashMap<String, CachedJwks>,
}

impl std::fmt::Debug for JwksVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksVerifier")
            .field("issuer", &self.issuer)
            .field("jwks_uri", &self.jwks_uri.as_str())
            .finish_non_exhaustive()
    }
}

impl JwksVerifier {
    /// Verifier for tokens issued by `issuer` to `audience`
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>, jwks_uri: Url, http: reqwest::Client) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            jwks_uri,
            http,
            cache: DashMap::new(),
        }
    }

    async fn jwks(&self, force_refresh: bool) -> Result<JwkSet, ProviderError> {
        let key = self.jwks_uri.to_string();
        if !force_refresh {
            if let Some(cached) = self.cache.get(&key) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(issuer = %self.issuer, uri = %self.jwks_uri, "Fetching JWKS");
        let keys: JwkSet = request_json(self.http.get(self.jwks_uri.clone())).await?;
        self.cache.insert(
            key,
            CachedJwks {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(keys)
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, ProviderError> {
        let jwks = self.jwks(false).await?;
        if let Some(key) = find_key(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = ?kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks(true).await?;
        find_key(&jwks, kid).ok_or_else(|| ProviderError::IdToken(format!("unknown key id {kid:?}")))
    }
}

#[async_trait]
impl IdTokenVerifier for JwksVerifier {
    async fn verify(&self, id_token: &str) -> Result<Value, ProviderError> {
        let header = jsonwebtoken::decode_header(id_token)
            .map_err(|e| ProviderError::IdToken(format!("could not decode id_token header: {e}")))?;
        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = build_validation(&header)?;
        validation.set_issuer(&[&self.issuer]);
        validation.validate_aud = false;

        let claims = jsonwebtoken::decode::<Value>(id_token, &key, &validation)
            .map_err(|e| ProviderError::IdToken(format!("could not verify id_token: {e}")))?
            .claims;

        if !audience_matches(claims.get("aud"), &self.audience) {
            return Err(ProviderError::IdToken(format!(
                "id_token audience does not include {:?}",
                self.audience
            )));
        }
        Ok(claims)
    }
}

/// Key with a matching `kid`; a key set holding a single key matches a token without one
fn find_key(jwks: &JwkSet, kid: Option<&str>) -> Option<DecodingKey> {
    let jwk = match kid {
        Some(kid) => jwks
            .keys
            .iter()
            .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?,
        None if jwks.keys.len() == 1 => &jwks.keys[0],
        None => return None,
    };

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y).ok(),
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}

fn build_validation(header: &Header) -> Result<Validation, ProviderError> {
    let alg = match header.alg {
        alg @ (Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384) => alg,
        other => {
            return Err(ProviderError::IdToken(format!(
                "unsupported id_token algorithm {other:?}"
            )));
        }
    };
    let mut validation = Validation::new(alg);
    validation.leeway = CLOCK_LEEWAY_SECS;
    Ok(validation)
}

fn audience_matches(aud: Option<&Value>, expected: &str) -> bool {
    match aud {
        Some(Value::String(s)) => s == expected,
        Some(Value::Array(values)) => values.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    }
}

/// OpenID Connect provider
pub struct OidcProvider {
    data: ProviderData,
    verifier: Arc<dyn IdTokenVerifier>,
    username_claim: Option<String>,
    skip_email_verified: bool,
}

impl std::fmt::Debug for OidcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcProvider")
            .field("data", &self.data)
            .field("username_claim", &self.username_claim)
            .finish_non_exhaustive()
    }
}

impl OidcProvider {
    /// Fetch `{issuer}/.well-known/openid-configuration` and build the provider.
    ///
    /// Endpoints set explicitly in config win over discovered ones.
    pub async fn discover(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let issuer = config
            .oidc_issuer_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::Config("oidc provider requires oidc_issuer_url".to_string()))?;
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let discovery: Discovery = request_json(http.get(&discovery_url)).await?;
        if discovery.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(ProviderError::Config(format!(
                "issuer mismatch: configured {issuer:?}, discovery document says {:?}",
                discovery.issuer
            )));
        }
        info!(issuer = %discovery.issuer, "Discovered OpenID Connect endpoints");

        let data = ProviderData::new(
            "OpenID Connect",
            config,
            Endpoints {
                login: &discovery.authorization_endpoint,
                redeem: &discovery.token_endpoint,
                profile: discovery.userinfo_endpoint.as_deref(),
                validate: discovery.userinfo_endpoint.as_deref(),
                scope: DEFAULT_SCOPE,
            },
            timeout,
        )?;

        let jwks_uri = Url::parse(&discovery.jwks_uri)
            .map_err(|e| ProviderError::Config(format!("invalid jwks_uri {:?}: {e}", discovery.jwks_uri)))?;
        let verifier = JwksVerifier::new(discovery.issuer, config.client_id.clone(), jwks_uri, data.http().clone());

        Ok(Self::with_verifier(data, Arc::new(verifier), config))
    }

    /// Build with an explicit verifier
    pub fn with_verifier(data: ProviderData, verifier: Arc<dyn IdTokenVerifier>, config: &ProviderConfig) -> Self {
        Self {
            data,
            verifier,
            username_claim: config.username_claim.clone().filter(|c| !c.is_empty()),
            skip_email_verified: config.insecure_skip_email_verified,
        }
    }

    fn username(&self, claims: &Value) -> Result<String, ProviderError> {
        let Some(name) = &self.username_claim else {
            return Ok(String::new());
        };
        match claims.get(name) {
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(user)) => Ok(user.clone()),
            Some(other) => Err(ProviderError::IdToken(format!(
                "claim {name:?} is not a string: {other}"
            ))),
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

#[async_trait]
impl Provider for OidcProvider {
    fn data(&self) -> &ProviderData {
        &self.data
    }

    async fn redeem(&self, redirect_uri: &str, code: &str) -> Result<SessionState, ProviderError> {
        let token = self.data.redeem_token(redirect_uri, code).await?;
        if token.id_token.is_empty() {
            return Err(ProviderError::IdToken(
                "token response did not contain an id_token".to_string(),
            ));
        }
        let claims = self.verifier.verify(&token.id_token).await?;
        let user = self.username(&claims)?;

        let mut email = claims
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if email.is_empty() {
            match self.data.profile_email(&token.access_token).await {
                Ok(found) => email = found,
                // The username claim identifies sessions without an email
                Err(ProviderError::NoEmail) if !user.is_empty() => {
                    debug!(user = %user, "No email for session, using username claim");
                }
                Err(ProviderError::NoEmail) => {
                    return Err(ProviderError::IdToken(
                        "neither id_token nor userinfo endpoint contained an email".to_string(),
                    ));
                }
                Err(other) => return Err(other),
            }
        }

        if !email.is_empty() && email_verified(&claims) == Some(false) {
            if !self.skip_email_verified {
                return Err(ProviderError::IdToken(format!("email {email} in id_token is not verified")));
            }
            warn!(email = %email, "Accepting unverified email");
        }

        let groups = string_list(claims.get("groups"));

        let mut session = token.into_session()?;
        session.user = match email.split_once('@') {
            Some((local, _)) => local.to_string(),
            None if email.is_empty() => user,
            None => email.clone(),
        };
        session.email = email;
        session.groups = groups;
        Ok(session)
    }

    async fn email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        if !session.email.is_empty() {
            return Ok(session.email.clone());
        }
        self.data.profile_email(&session.access_token).await
    }

    async fn validate_session_state(&self, session: &SessionState) -> bool {
        let token = session.access_token.clone();
        self.data
            .validate_token_with(&session.access_token, |request| request.bearer_auth(token))
            .await
    }
}
