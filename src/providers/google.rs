use std::time::Duration;

use async_trait::async_trait;

use super::default::{Endpoints, email_verified};
use super::{Provider, ProviderData, ProviderError, id_token_claims};
use crate::config::ProviderConfig;
use crate::session::SessionState;

const ENDPOINTS: Endpoints<'static> = Endpoints {
    login: "https://accounts.google.com/o/oauth2/auth?access_type=offline",
    redeem: "https://www.googleapis.com/oauth2/v3/token",
    profile: None,
    validate: Some("https://www.googleapis.com/oauth2/v1/tokeninfo"),
    scope: "profile email",
};

/// Google accounts. The email comes from the `id_token` returned on redeem.
#[derive(Debug)]
pub struct GoogleProvider {
    data: ProviderData,
}

impl GoogleProvider {
    /// Build from config
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            data: ProviderData::new("Google", config, ENDPOINTS, timeout)?,
        })
    }
}

fn email_from_id_token(id_token: &str) -> Result<String, ProviderError> {
    let claims = id_token_claims(id_token)?;
    let email = claims
        .get("email")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    if email_verified(&claims) != Some(true) {
        return Err(ProviderError::IdToken(format!("email {email} not listed as verified")));
    }
    Ok(email)
}

#[async_trait]
impl Provider for GoogleProvider {
    fn data(&self) -> &ProviderData {
        &self.data
    }

    async fn redeem(&self, redirect_uri: &str, code: &str) -> Result<SessionState, ProviderError> {
        let token = self.data.redeem_token(redirect_uri, code).await?;
        let email = email_from_id_token(&token.id_token)?;
        let mut session = token.into_session()?;
        session.email = email;
        Ok(session)
    }

    async fn email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        if session.email.is_empty() {
            Err(ProviderError::NoEmail)
        } else {
            Ok(session.email.clone())
        }
    }
}
