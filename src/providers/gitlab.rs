use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::default::Endpoints;
use super::{Provider, ProviderData, ProviderError, request_json};
use crate::config::ProviderConfig;
use crate::session::SessionState;

const ENDPOINTS: Endpoints<'static> = Endpoints {
    login: "https://gitlab.com/oauth/authorize",
    redeem: "https://gitlab.com/oauth/token",
    profile: None,
    validate: Some("https://gitlab.com/api/v4/user"),
    scope: "read_user",
};

/// GitLab, optionally restricted to one group
#[derive(Debug)]
pub struct GitLabProvider {
    data: ProviderData,
    group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Group {
    full_path: String,
}

impl GitLabProvider {
    /// Build from config
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let mut data = ProviderData::new("GitLab", config, ENDPOINTS, timeout)?;
        let group = config.gitlab_group.clone().filter(|g| !g.is_empty());
        if group.is_some() && !data.scope.split(' ').any(|s| s == "read_api" || s == "api") {
            data.scope.push_str(" read_api");
        }
        Ok(Self { data, group })
    }

    fn user_url(&self) -> Result<&url::Url, ProviderError> {
        self.data
            .validate_url
            .as_ref()
            .ok_or_else(|| ProviderError::Config("gitlab requires validate_url".to_string()))
    }

    fn get(&self, url: url::Url, access_token: &str) -> reqwest::RequestBuilder {
        self.data
            .http()
            .get(url)
            .query(&[("access_token", access_token)])
    }
}

#[async_trait]
impl Provider for GitLabProvider {
    fn data(&self) -> &ProviderData {
        &self.data
    }

    async fn email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        let user: Value = request_json(self.get(self.user_url()?.clone(), &session.access_token)).await?;
        match user.get("email").and_then(Value::as_str) {
            Some(email) if !email.is_empty() => Ok(email.to_string()),
            _ => Err(ProviderError::NoEmail),
        }
    }

    async fn check_membership(&self, session: &SessionState) -> Result<bool, ProviderError> {
        let Some(required) = &self.group else {
            return Ok(true);
        };
        let groups_url = self
            .user_url()?
            .join("groups")
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        let groups: Vec<Group> = request_json(
            self.get(groups_url, &session.access_token)
                .query(&[("min_access_level", "10"), ("per_page", "100")]),
        )
        .await?;

        if groups.iter().any(|g| g.full_path == *required) {
            Ok(true)
        } else {
            info!(group = %required, "Missing GitLab group");
            Ok(false)
        }
    }
}
