use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;

use super::default::Endpoints;
use super::{Provider, ProviderData, ProviderError, request_json};
use crate::config::ProviderConfig;
use crate::session::SessionState;

const ENDPOINTS: Endpoints<'static> = Endpoints {
    login: "https://id.heroku.com/oauth/authorize",
    redeem: "https://id.heroku.com/oauth/token",
    profile: Some("https://api.heroku.com/account"),
    validate: Some("https://id.heroku.com/oauth/authorizations"),
    scope: "identity",
};

const API_ACCEPT: &str = "application/vnd.heroku+json; version=3";

/// Heroku accounts
#[derive(Debug)]
pub struct HerokuProvider {
    data: ProviderData,
}

#[derive(Debug, Deserialize)]
struct Account {
    #[serde(default)]
    email: String,
}

impl HerokuProvider {
    /// Build from config
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            data: ProviderData::new("Heroku", config, ENDPOINTS, timeout)?,
        })
    }
}

#[async_trait]
impl Provider for HerokuProvider {
    fn data(&self) -> &ProviderData {
        &self.data
    }

    async fn email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        let Some(url) = self.data.profile_url.clone() else {
            return Err(ProviderError::NoEmail);
        };
        let account: Account = request_json(
            self.data
                .http()
                .get(url)
                .bearer_auth(&session.access_token)
                .header(ACCEPT, API_ACCEPT),
        )
        .await?;
        if account.email.is_empty() {
            return Err(ProviderError::NoEmail);
        }
        Ok(account.email)
    }

    async fn validate_session_state(&self, session: &SessionState) -> bool {
        let token = session.access_token.clone();
        self.data
            .validate_token_with(&session.access_token, |request| {
                request.bearer_auth(token).header(ACCEPT, API_ACCEPT)
            })
            .await
    }
}
