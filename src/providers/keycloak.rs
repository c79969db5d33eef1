use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::default::Endpoints;
use super::{Provider, ProviderData, ProviderError, request_json};
use crate::config::ProviderConfig;
use crate::session::SessionState;

const ENDPOINTS: Endpoints<'static> = Endpoints {
    login: "https://keycloak.org/oauth/authorize",
    redeem: "https://keycloak.org/oauth/token",
    profile: None,
    validate: Some("https://keycloak.org/api/v3/user"),
    scope: "api",
};

/// Keycloak realm, optionally restricted to one group
#[derive(Debug)]
pub struct KeycloakProvider {
    data: ProviderData,
    group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: String,
    #[serde(default)]
    groups: Vec<String>,
}

impl KeycloakProvider {
    /// Build from config
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            data: ProviderData::new("Keycloak", config, ENDPOINTS, timeout)?,
            group: config.keycloak_group.clone().filter(|g| !g.is_empty()),
        })
    }

    async fn user_info(&self, access_token: &str) -> Result<UserInfo, ProviderError> {
        let url = self
            .data
            .validate_url
            .clone()
            .ok_or_else(|| ProviderError::Config("keycloak requires validate_url".to_string()))?;
        request_json(self.data.http().get(url).bearer_auth(access_token)).await
    }
}

// Keycloak reports group paths with a leading '/'
fn group_matches(held: &str, required: &str) -> bool {
    held.trim_start_matches('/') == required.trim_start_matches('/')
}

#[async_trait]
impl Provider for KeycloakProvider {
    fn data(&self) -> &ProviderData {
        &self.data
    }

    async fn email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        let info = self.user_info(&session.access_token).await?;
        if info.email.is_empty() {
            return Err(ProviderError::NoEmail);
        }
        Ok(info.email)
    }

    async fn check_membership(&self, session: &SessionState) -> Result<bool, ProviderError> {
        let Some(required) = &self.group else {
            return Ok(true);
        };
        let info = self.user_info(&session.access_token).await?;
        if info.groups.iter().any(|g| group_matches(g, required)) {
            Ok(true)
        } else {
            info!(group = %required, email = %info.email, "Missing Keycloak group");
            Ok(false)
        }
    }

    async fn validate_session_state(&self, session: &SessionState) -> bool {
        let token = session.access_token.clone();
        self.data
            .validate_token_with(&session.access_token, |request| request.bearer_auth(token))
            .await
    }
}
