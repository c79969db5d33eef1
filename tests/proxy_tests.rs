//! End-to-end proxy tests: a real gateway in front of real upstream servers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use authgate::config::{Config, ProviderConfig};
use authgate::cookies::SessionCookies;
use authgate::gateway::Gateway;
use authgate::providers::{GoogleProvider, Provider};
use authgate::session::SessionState;
use authgate_core::{SignableRequest, validate_request};
use axum::{
    Json, Router,
    body::Bytes,
    http::{HeaderMap, Method, Uri},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest, http::HeaderValue};

const COOKIE_SECRET: &str = "0123456789abcdef0123456789abcdef";
const SIGNING_SECRET: &str = "upstream-secret";

/// Upstream that reports what it received
async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let target = uri.path_and_query().map_or("/", |pq| pq.as_str()).to_string();
    let validation = validate_request(
        &SignableRequest::new(&method, &target, &headers).with_body(&body),
        SIGNING_SECRET,
    );
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    Json(json!({
        "method": method.as_str(),
        "target": target,
        "user": header("x-forwarded-user"),
        "email": header("x-forwarded-email"),
        "gap_auth": header("gap-auth"),
        "authorization": header("authorization"),
        "forwarded_for": header("x-forwarded-for"),
        "signature": validation.result.to_string(),
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn spawn_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Router::new().fallback(echo)).await.unwrap();
    });
    format!("http://{addr}")
}

/// Websocket upstream echoing every text frame back in upper case
async fn spawn_websocket_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        if ws.send(Message::text(text.to_uppercase())).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    format!("http://{addr}")
}

fn provider() -> Arc<dyn Provider> {
    let config = ProviderConfig {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        ..Default::default()
    };
    Arc::new(GoogleProvider::new(&config, Duration::from_secs(5)).unwrap())
}

fn config(upstreams: Vec<String>) -> Config {
    let mut config = Config::default();
    config.cookie.secret = COOKIE_SECRET.to_string();
    config.auth.email_domains = vec!["example.com".to_string()];
    config.auth.skip_auth_regex = vec!["^/public/".to_string()];
    config.signature.key = Some(format!("sha1:{SIGNING_SECRET}"));
    config.upstreams = upstreams;
    config
}

async fn spawn_gateway(config: Config) -> String {
    let gateway = Gateway::with_provider(config, provider()).unwrap();
    let app = gateway.router();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    format!("http://{addr}")
}

fn session_cookie(config: &Config, email: &str) -> String {
    let mut session = SessionState {
        access_token: "access".to_string(),
        email: email.to_string(),
        user: email.split('@').next().unwrap().to_string(),
        ..Default::default()
    };
    session.set_expires_in(3600).unwrap();
    let set_cookie = SessionCookies::from_config(&config.cookie)
        .session_cookie(&session, Utc::now())
        .unwrap();
    format!("{}={}", set_cookie.name(), set_cookie.value())
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_authenticated_request_is_signed_and_identified() {
    let upstream = spawn_upstream().await;
    let config = config(vec![format!("{upstream}/")]);
    let cookie = session_cookie(&config, "alice@example.com");
    let gateway = spawn_gateway(config).await;

    let response = client()
        .post(format!("{gateway}/api/items?sort=asc"))
        .header("cookie", &cookie)
        .header("content-type", "application/json")
        .header("x-forwarded-user", "root")
        .body(r#"{"name":"widget"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["gap-auth"], "alice@example.com");
    assert_eq!(
        response.headers()["gap-upstream-address"],
        upstream.trim_start_matches("http://")
    );

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["method"], "POST");
    assert_eq!(body["target"], "/api/items?sort=asc");
    assert_eq!(body["user"], "alice");
    assert_eq!(body["email"], "alice@example.com");
    assert_eq!(body["gap_auth"], "alice@example.com");
    // "alice:" with an empty basic auth password
    assert_eq!(body["authorization"], "Basic YWxpY2U6");
    assert_eq!(body["forwarded_for"], "127.0.0.1");
    assert_eq!(body["signature"], "match");
    assert_eq!(body["body"], r#"{"name":"widget"}"#);
}

#[tokio::test]
async fn test_unauthenticated_get_redirects_to_login() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(config(vec![format!("{upstream}/")])).await;

    let response = client().get(format!("{gateway}/app?q=1")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/oauth2/start?rd=%2Fapp%3Fq%3D1");
}

#[tokio::test]
async fn test_unauthenticated_post_is_unauthorized() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(config(vec![format!("{upstream}/")])).await;

    let response = client().post(format!("{gateway}/app")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_email_outside_allowed_domains_is_forbidden() {
    let upstream = spawn_upstream().await;
    let config = config(vec![format!("{upstream}/")]);
    let cookie = session_cookie(&config, "mallory@elsewhere.org");
    let gateway = spawn_gateway(config).await;

    let response = client()
        .get(format!("{gateway}/app"))
        .header("cookie", cookie)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let cleared = response.headers()["set-cookie"].to_str().unwrap();
    assert!(cleared.starts_with("_oauth2_proxy=;"));
}

#[tokio::test]
async fn test_tampered_cookie_redirects_to_login() {
    let upstream = spawn_upstream().await;
    let config = config(vec![format!("{upstream}/")]);
    let cookie = session_cookie(&config, "alice@example.com");
    let gateway = spawn_gateway(config).await;

    // flip the last character of the MAC
    let mut tampered = cookie.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == 'A' { 'B' } else { 'A' });

    let response = client()
        .get(format!("{gateway}/app"))
        .header("cookie", tampered)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn test_skip_auth_path_is_proxied_without_identity() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(config(vec![format!("{upstream}/")])).await;

    let response = client()
        .get(format!("{gateway}/public/logo.png"))
        .header("x-forwarded-user", "root")
        .header("x-forwarded-email", "root@example.com")
        .header("gap-auth", "root")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["user"], "");
    assert_eq!(body["email"], "");
    assert_eq!(body["gap_auth"], "");
}

#[tokio::test]
async fn test_longest_prefix_wins() {
    // GIVEN: "/" on one upstream and "/api/" on another
    let root = spawn_upstream().await;
    let api = spawn_upstream().await;
    let config = config(vec![format!("{root}/"), format!("{api}/api/")]);
    let cookie = session_cookie(&config, "alice@example.com");
    let gateway = spawn_gateway(config).await;

    let response = client()
        .get(format!("{gateway}/api/v1/things"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();

    // THEN: the more specific upstream answers
    assert_eq!(
        response.headers()["gap-upstream-address"],
        api.trim_start_matches("http://")
    );

    let response = client()
        .get(format!("{gateway}/other"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers()["gap-upstream-address"],
        root.trim_start_matches("http://")
    );
}

#[tokio::test]
async fn test_unrouted_path_is_not_found() {
    let upstream = spawn_upstream().await;
    let config = config(vec![format!("{upstream}/api/")]);
    let cookie = session_cookie(&config, "alice@example.com");
    let gateway = spawn_gateway(config).await;

    let response = client()
        .get(format!("{gateway}/elsewhere"))
        .header("cookie", cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dead_upstream_is_bad_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let config = config(vec![format!("http://{dead}/")]);
    let cookie = session_cookie(&config, "alice@example.com");
    let gateway = spawn_gateway(config).await;

    let response = client()
        .get(format!("{gateway}/app"))
        .header("cookie", cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_static_files_upstream() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), "hello from disk").unwrap();

    let config = config(vec![format!("file://{}#/static/", dir.path().display())]);
    let cookie = session_cookie(&config, "alice@example.com");
    let gateway = spawn_gateway(config).await;

    let response = client()
        .get(format!("{gateway}/static/hello.txt"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hello from disk");

    let response = client()
        .get(format!("{gateway}/static/missing.txt"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_websocket_is_tunneled() {
    let upstream = spawn_websocket_upstream().await;
    let config = config(vec![format!("{upstream}/")]);
    let cookie = session_cookie(&config, "alice@example.com");
    let gateway = spawn_gateway(config).await;

    let mut request = format!("{}/ws", gateway.replacen("http://", "ws://", 1))
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("cookie", HeaderValue::from_str(&cookie).unwrap());

    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);

    ws.send(Message::text("hello")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "HELLO");

    ws.send(Message::text("again")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "AGAIN");

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_websocket_requires_login() {
    let upstream = spawn_websocket_upstream().await;
    let gateway = spawn_gateway(config(vec![format!("{upstream}/")])).await;

    let request = format!("{}/ws", gateway.replacen("http://", "ws://", 1))
        .into_client_request()
        .unwrap();
    let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 302);
        }
        other => panic!("expected an HTTP error, got {other:?}"),
    }
}
