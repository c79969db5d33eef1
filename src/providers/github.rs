use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use tracing::{debug, info};

use super::default::{Endpoints, join_path};
use super::{Provider, ProviderData, ProviderError, request_json};
use crate::config::ProviderConfig;
use crate::session::SessionState;

const ENDPOINTS: Endpoints<'static> = Endpoints {
    login: "https://github.com/login/oauth/authorize",
    redeem: "https://github.com/login/oauth/access_token",
    profile: None,
    validate: Some("https://api.github.com/"),
    scope: "user:email",
};

const API_ACCEPT: &str = "application/vnd.github.v3+json";

/// GitHub, optionally restricted to organizations and teams
#[derive(Debug)]
pub struct GitHubProvider {
    data: ProviderData,
    orgs: Vec<String>,
    teams: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Org {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Team {
    slug: String,
    organization: Org,
}

#[derive(Debug, Deserialize)]
struct Email {
    email: String,
    #[serde(default)]
    primary: bool,
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl GitHubProvider {
    /// Build from config. `github_org` and `github_team` are comma separated.
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let mut data = ProviderData::new("GitHub", config, ENDPOINTS, timeout)?;
        let orgs = split_list(config.github_org.as_deref());
        let teams = split_list(config.github_team.as_deref());
        if !orgs.is_empty() || !teams.is_empty() {
            data.scope.push_str(" read:org");
        }
        Ok(Self { data, orgs, teams })
    }

    fn api(&self, path: &str, access_token: &str) -> reqwest::RequestBuilder {
        let base = self
            .data
            .validate_url
            .as_ref()
            .unwrap_or(&self.data.login_url);
        self.data
            .http()
            .get(join_path(base, path))
            .header(ACCEPT, API_ACCEPT)
            .header(AUTHORIZATION, format!("token {access_token}"))
    }

    async fn has_org(&self, access_token: &str) -> Result<bool, ProviderError> {
        let orgs: Vec<Org> =
            request_json(self.api("/user/orgs", access_token).query(&[("limit", "100")])).await?;

        let present: Vec<&str> = orgs
            .iter()
            .map(|o| o.login.as_str())
            .filter(|login| self.orgs.iter().any(|wanted| wanted == login))
            .collect();
        if present.is_empty() {
            info!(required = ?self.orgs, "Missing GitHub organization");
            return Ok(false);
        }
        debug!(orgs = ?present, "Found GitHub organizations");
        Ok(true)
    }

    async fn has_org_and_team(&self, access_token: &str) -> Result<bool, ProviderError> {
        let teams: Vec<Team> =
            request_json(self.api("/user/teams", access_token).query(&[("limit", "100")])).await?;

        let mut in_org = false;
        for team in &teams {
            if !self.orgs.iter().any(|org| *org == team.organization.login) {
                continue;
            }
            in_org = true;
            if self.teams.iter().any(|slug| *slug == team.slug) {
                debug!(org = %team.organization.login, team = %team.slug, "Found GitHub team");
                return Ok(true);
            }
        }

        if in_org {
            info!(required = ?self.teams, orgs = ?self.orgs, "Missing GitHub team");
        } else {
            info!(required = ?self.orgs, "Missing GitHub organization");
        }
        Ok(false)
    }
}

#[async_trait]
impl Provider for GitHubProvider {
    fn data(&self) -> &ProviderData {
        &self.data
    }

    async fn email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        let emails: Vec<Email> = request_json(self.api("/user/emails", &session.access_token)).await?;
        emails
            .into_iter()
            .find(|e| e.primary)
            .map(|e| e.email)
            .ok_or(ProviderError::NoEmail)
    }

    async fn check_membership(&self, session: &SessionState) -> Result<bool, ProviderError> {
        match (self.orgs.is_empty(), self.teams.is_empty()) {
            (true, true) => Ok(true),
            (false, true) => self.has_org(&session.access_token).await,
            (false, false) => self.has_org_and_team(&session.access_token).await,
            // Teams are scoped to organizations; a team without an org matches nothing
            (true, false) => Ok(false),
        }
    }

    async fn validate_session_state(&self, session: &SessionState) -> bool {
        let header = format!("token {}", session.access_token);
        self.data
            .validate_token_with(&session.access_token, |request| {
                request.header(AUTHORIZATION, header).header(ACCEPT, API_ACCEPT)
            })
            .await
    }
}
