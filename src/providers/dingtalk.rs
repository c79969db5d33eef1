//! DingTalk QR-code login
//!
//! The authorization code is exchanged with an app token for a persistent
//! code and then an SNS token. Emails and departments are only visible
//! through the corp API, which needs a separate corp access token.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::info;
use url::Url;

use super::default::Endpoints;
use super::{Provider, ProviderData, ProviderError, TokenCache, request_json};
use crate::config::{DingTalkConfig, ProviderConfig};
use crate::session::SessionState;

const ENDPOINTS: Endpoints<'static> = Endpoints {
    login: "https://oapi.dingtalk.com/connect/qrconnect",
    redeem: "https://oapi.dingtalk.com/login/oauth/access_token",
    profile: None,
    validate: Some("https://oapi.dingtalk.com/"),
    scope: "snsapi_login",
};

/// Corp tokens live 7200s; renew a minute early
const CORP_TOKEN_TTL: Duration = Duration::from_secs(7200 - 60);
const SNS_TOKEN_MARGIN_SECS: i64 = 60;

/// DingTalk, optionally restricted to departments of one corp
#[derive(Debug)]
pub struct DingTalkProvider {
    data: ProviderData,
    corp: DingTalkConfig,
    departments: HashSet<i64>,
    corp_token: TokenCache,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct PersistentCode {
    persistent_code: String,
    openid: String,
}

#[derive(Debug, Deserialize)]
struct SnsToken {
    sns_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct SnsUser {
    user_info: SnsUserInfo,
}

#[derive(Debug, Deserialize)]
struct SnsUserInfo {
    unionid: String,
}

#[derive(Debug, Deserialize)]
struct UserId {
    userid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CorpUser {
    #[serde(default)]
    email: String,
    #[serde(default)]
    org_email: String,
    #[serde(default)]
    department: Vec<i64>,
}

impl DingTalkProvider {
    /// Build from config. Department ids that do not parse are a config error.
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let data = ProviderData::new("DingTalk", config, ENDPOINTS, timeout)?;
        let departments = config
            .dingtalk
            .departments
            .iter()
            .map(|d| {
                d.trim()
                    .parse::<i64>()
                    .map_err(|_| ProviderError::Config(format!("invalid dingtalk department id {d:?}")))
            })
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(Self {
            data,
            corp: config.dingtalk.clone(),
            departments,
            corp_token: TokenCache::new(CORP_TOKEN_TTL),
        })
    }

    /// API endpoint on the redeem host
    fn api_url(&self, path: &str) -> Url {
        let mut url = self.data.redeem_url.clone();
        url.set_path(path);
        url.set_query(None);
        url
    }

    async fn call<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder, path: &str) -> Result<T, ProviderError> {
        // Errors arrive as 200 with a non-zero errcode and none of the payload fields
        let value: Value = request_json(request).await?;
        let errcode = value.get("errcode").and_then(Value::as_i64).unwrap_or(0);
        if errcode != 0 {
            let errmsg = value.get("errmsg").and_then(Value::as_str).unwrap_or_default();
            return Err(ProviderError::Api {
                url: self.api_url(path).to_string(),
                message: format!("error code {errcode} {errmsg}"),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ProviderError> {
        let request = self.data.http().get(self.api_url(path)).query(query);
        self.call(request, path).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        access_token: &str,
        body: serde_json::Value,
    ) -> Result<T, ProviderError> {
        let request = self
            .data
            .http()
            .post(self.api_url(path))
            .query(&[("access_token", access_token)])
            .json(&body);
        self.call(request, path).await
    }

    async fn app_access_token(&self) -> Result<String, ProviderError> {
        let token: AccessToken = self
            .get(
                "/sns/gettoken",
                &[
                    ("appid", self.data.client_id.as_str()),
                    ("appsecret", self.data.client_secret.as_str()),
                ],
            )
            .await?;
        Ok(token.access_token)
    }

    async fn corp_access_token(&self) -> Result<String, ProviderError> {
        if self.corp.corp_id.is_empty() {
            return Err(ProviderError::Config(
                "dingtalk.corp_id is required to look up users".to_string(),
            ));
        }
        self.corp_token
            .get_or_refresh(|| async {
                let token: AccessToken = self
                    .get(
                        "/gettoken",
                        &[
                            ("appkey", self.corp.corp_id.as_str()),
                            ("appsecret", self.corp.corp_secret.as_str()),
                        ],
                    )
                    .await?;
                info!("Refreshed DingTalk corp access token");
                Ok(token.access_token)
            })
            .await
    }

    async fn corp_user(&self, sns_token: &str) -> Result<CorpUser, ProviderError> {
        let sns_user: SnsUser = self.get("/sns/getuserinfo", &[("sns_token", sns_token)]).await?;
        let corp_token = self.corp_access_token().await?;
        let user_id: UserId = self
            .get(
                "/user/getUseridByUnionid",
                &[
                    ("access_token", corp_token.as_str()),
                    ("unionid", sns_user.user_info.unionid.as_str()),
                ],
            )
            .await?;
        self.get(
            "/user/get",
            &[
                ("access_token", corp_token.as_str()),
                ("userid", user_id.userid.as_str()),
            ],
        )
        .await
    }
}

#[async_trait]
impl Provider for DingTalkProvider {
    fn data(&self) -> &ProviderData {
        &self.data
    }

    fn login_url(&self, redirect_uri: &str, state: &str) -> Url {
        self.data.authorize_url(&[
            ("redirect_uri", redirect_uri),
            ("scope", self.data.scope.as_str()),
            ("appid", self.data.client_id.as_str()),
            ("response_type", "code"),
            ("state", state),
        ])
    }

    async fn redeem(&self, _redirect_uri: &str, code: &str) -> Result<SessionState, ProviderError> {
        if code.is_empty() {
            return Err(ProviderError::MissingCode);
        }

        let app_token = self.app_access_token().await?;
        let persistent: PersistentCode = self
            .post("/sns/get_persistent_code", &app_token, json!({"tmp_auth_code": code}))
            .await?;
        let sns: SnsToken = self
            .post(
                "/sns/get_sns_token",
                &app_token,
                json!({
                    "openid": persistent.openid,
                    "persistent_code": persistent.persistent_code,
                }),
            )
            .await?;

        let mut session = SessionState {
            access_token: sns.sns_token,
            ..Default::default()
        };
        session.set_expires_in(sns.expires_in.saturating_sub(SNS_TOKEN_MARGIN_SECS))?;
        Ok(session)
    }

    async fn email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        let user = self.corp_user(&session.access_token).await?;
        if !user.org_email.is_empty() {
            Ok(user.org_email)
        } else if !user.email.is_empty() {
            Ok(user.email)
        } else {
            Err(ProviderError::NoEmail)
        }
    }

    async fn check_membership(&self, session: &SessionState) -> Result<bool, ProviderError> {
        if self.departments.is_empty() {
            return Ok(true);
        }
        let user = self.corp_user(&session.access_token).await?;
        if user.department.iter().any(|d| self.departments.contains(d)) {
            Ok(true)
        } else {
            info!(departments = ?user.department, "Missing DingTalk department");
            Ok(false)
        }
    }

    async fn validate_session_state(&self, session: &SessionState) -> bool {
        if session.access_token.is_empty() {
            return false;
        }
        self.get::<SnsUser>("/sns/getuserinfo", &[("sns_token", session.access_token.as_str())])
            .await
            .is_ok()
    }
}
