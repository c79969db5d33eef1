use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::default::Endpoints;
use super::{Provider, ProviderData, ProviderError, request_json};
use crate::config::ProviderConfig;
use crate::session::SessionState;

const GRAPH_RESOURCE: &str = "https://graph.microsoft.com";
const GRAPH_ME: &str = "https://graph.microsoft.com/v1.0/me";

/// Azure Active Directory, scoped to a tenant
#[derive(Debug)]
pub struct AzureProvider {
    data: ProviderData,
    tenant: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Me {
    #[serde(default)]
    mail: Option<String>,
    #[serde(default)]
    user_principal_name: Option<String>,
}

impl AzureProvider {
    /// Build from config. Endpoints default to the configured tenant
    /// (`common` when unset).
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let tenant = if config.azure_tenant.is_empty() {
            "common".to_string()
        } else {
            config.azure_tenant.clone()
        };
        let login = format!("https://login.microsoftonline.com/{tenant}/oauth2/authorize");
        let redeem = format!("https://login.microsoftonline.com/{tenant}/oauth2/token");

        let mut data = ProviderData::new(
            "Azure",
            config,
            Endpoints {
                login: &login,
                redeem: &redeem,
                profile: Some(GRAPH_ME),
                validate: Some(GRAPH_ME),
                scope: "openid",
            },
            timeout,
        )?;
        if data.protected_resource.is_none() {
            data.protected_resource = Some(GRAPH_RESOURCE.to_string());
        }
        Ok(Self { data, tenant })
    }

    /// Directory tenant
    pub fn tenant(&self) -> &str {
        &self.tenant
    }
}

#[async_trait]
impl Provider for AzureProvider {
    fn data(&self) -> &ProviderData {
        &self.data
    }

    async fn email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        let Some(url) = self.data.profile_url.clone() else {
            return Err(ProviderError::NoEmail);
        };
        let me: Me = request_json(self.data.http().get(url).bearer_auth(&session.access_token)).await?;
        me.mail
            .filter(|m| !m.is_empty())
            .or(me.user_principal_name.filter(|u| !u.is_empty()))
            .ok_or(ProviderError::NoEmail)
    }

    async fn validate_session_state(&self, session: &SessionState) -> bool {
        let token = session.access_token.clone();
        self.data
            .validate_token_with(&session.access_token, |request| request.bearer_auth(token))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::api::serve;
    use axum::{Form, Json, Router, routing::{get, post}};
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_tenant_scoped_defaults() {
        let config = ProviderConfig {
            azure_tenant: "contoso".to_string(),
            ..Default::default()
        };
        let p = AzureProvider::new(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(p.tenant(), "contoso");
        assert_eq!(
            p.data().login_url.as_str(),
            "https://login.microsoftonline.com/contoso/oauth2/authorize"
        );
        assert_eq!(
            p.data().redeem_url.as_str(),
            "https://login.microsoftonline.com/contoso/oauth2/token"
        );
        assert_eq!(p.data().protected_resource.as_deref(), Some(GRAPH_RESOURCE));

        let common = AzureProvider::new(&ProviderConfig::default(), Duration::from_secs(5)).unwrap();
        assert_eq!(common.tenant(), "common");
    }

    #[tokio::test]
    async fn test_redeem_sends_resource() {
        let app = Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form["resource"], "https://graph.microsoft.com");
                Json(json!({"access_token": "a", "refresh_token": "r", "expires_in": "3599"}))
            }),
        );
        let base = serve(app).await;
        let config = ProviderConfig {
            redeem_url: Some(format!("{base}/token")),
            ..Default::default()
        };
        let p = AzureProvider::new(&config, Duration::from_secs(5)).unwrap();
        let session = p.redeem("https://my.test/cb", "code").await.unwrap();
        assert_eq!(session.access_token, "a");
        assert_eq!(session.refresh_token, "r");
    }

    #[tokio::test]
    async fn test_email_falls_back_to_user_principal_name() {
        let app = Router::new()
            .route("/with-mail", get(|| async { Json(json!({"mail": "user@contoso.com", "userPrincipalName": "upn@contoso.com"})) }))
            .route("/upn-only", get(|| async { Json(json!({"mail": null, "userPrincipalName": "upn@contoso.com"})) }))
            .route("/nothing", get(|| async { Json(json!({"displayName": "x"})) }));
        let base = serve(app).await;

        let session = SessionState {
            access_token: "t".to_string(),
            ..Default::default()
        };
        let email = |path: &'static str| {
            let config = ProviderConfig {
                profile_url: Some(format!("{base}{path}")),
                ..Default::default()
            };
            let p = AzureProvider::new(&config, Duration::from_secs(5)).unwrap();
            let session = session.clone();
            async move { p.email_address(&session).await }
        };

        assert_eq!(email("/with-mail").await.unwrap(), "user@contoso.com");
        assert_eq!(email("/upn-only").await.unwrap(), "upn@contoso.com");
        assert!(matches!(email("/nothing").await, Err(ProviderError::NoEmail)));
    }
}
