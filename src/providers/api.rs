//! JSON helpers for provider APIs

use serde::de::DeserializeOwned;

use super::ProviderError;

/// Send `request`, require a 200 and decode the body as JSON
pub async fn request_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, ProviderError> {
    let response = request.send().await?;
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await?;

    if status != reqwest::StatusCode::OK {
        return Err(ProviderError::NonSuccessStatus {
            status: status.as_u16(),
            url,
            body,
        });
    }

    Ok(serde_json::from_str(&body)?)
}

/// Run `app` on an ephemeral local port and return its base URL
#[cfg(test)]
pub(crate) async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}
