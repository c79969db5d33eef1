//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{
        HeaderMap, HeaderValue, Method, Request, StatusCode,
        header::{LOCATION, SET_COOKIE},
        uri::PathAndQuery,
    },
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::cookie::Cookie;
use chrono::Utc;
use rand::RngExt;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use super::auth::{AuthStatus, Gate, gap_auth, strip_identity};
use crate::proxy::{Dispatcher, GAP_AUTH_HEADER};

/// Shared application state
#[derive(Debug)]
pub struct AppState {
    /// Session checks and identity injection
    pub gate: Gate,
    /// Upstream route table
    pub dispatcher: Dispatcher,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let prefix = state.gate.proxy_prefix().trim_end_matches('/').to_string();

    Router::new()
        .route("/ping", get(ping_handler))
        .route("/robots.txt", get(robots_handler))
        .route(&format!("{prefix}/start"), get(start_handler))
        .route(&format!("{prefix}/callback"), get(callback_handler))
        .route(&format!("{prefix}/sign_in"), get(sign_in_handler))
        .route(
            &format!("{prefix}/sign_out"),
            get(sign_out_handler).post(sign_out_handler),
        )
        .route(&format!("{prefix}/auth"), get(auth_handler))
        .fallback(proxy_handler)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RedirectParams {
    rd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn ping_handler() -> &'static str {
    "OK"
}

async fn robots_handler() -> &'static str {
    "User-agent: *\nDisallow: /"
}

/// GET {prefix}/start - set the CSRF cookie and send the browser to the provider
async fn start_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<RedirectParams>,
) -> Response {
    let gate = &state.gate;
    let nonce_bytes: [u8; 32] = rand::rng().random();
    let nonce = hex::encode(nonce_bytes);
    let rd = local_redirect(params.rd.as_deref());

    let redirect_uri = gate.redirect_uri(&headers);
    let login_url = gate.provider().login_url(&redirect_uri, &format!("{nonce}:{rd}"));
    debug!(redirect_uri = %redirect_uri, rd = %rd, "Starting login");

    with_cookies(
        redirect(login_url.as_str()),
        [gate.cookies().csrf_cookie(&nonce, Utc::now())],
    )
}

/// GET {prefix}/callback - finish the authorization code flow
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let gate = &state.gate;
    let now = Utc::now();
    let clear_csrf = gate.cookies().clear_cookie(&gate.cookies().csrf_name());

    if let Some(error) = params.error {
        warn!(error = %error, "Provider returned an error to the callback");
        return with_cookies(
            (StatusCode::FORBIDDEN, format!("Login failed: {error}")).into_response(),
            [clear_csrf],
        );
    }

    let Some((nonce, rd)) = params.state.as_deref().and_then(|s| s.split_once(':')) else {
        return with_cookies(
            (StatusCode::BAD_REQUEST, "Invalid state").into_response(),
            [clear_csrf],
        );
    };

    let Some(expected) = gate.cookies().load_csrf(&headers, now) else {
        warn!("Callback without a CSRF cookie");
        return with_cookies(
            (StatusCode::FORBIDDEN, "Missing CSRF cookie").into_response(),
            [clear_csrf],
        );
    };
    if !bool::from(expected.as_bytes().ct_eq(nonce.as_bytes())) {
        warn!("CSRF token mismatch");
        return with_cookies(
            (StatusCode::FORBIDDEN, "CSRF token mismatch").into_response(),
            [clear_csrf],
        );
    }

    let code = params.code.unwrap_or_default();
    let redirect_uri = gate.redirect_uri(&headers);
    let provider = gate.provider();

    let mut session = match provider.redeem(&redirect_uri, &code).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Error redeeming code");
            return with_cookies(internal_error(), [clear_csrf]);
        }
    };

    if session.email.is_empty() && session.user.is_empty() {
        match provider.email_address(&session).await {
            Ok(email) => session.email = email,
            Err(e) => {
                error!(error = %e, "Error fetching email address");
                return with_cookies(internal_error(), [clear_csrf]);
            }
        }
    }
    if session.user.is_empty() {
        session.user = session.email.split('@').next().unwrap_or_default().to_string();
    }

    if let Err(e) = session.check_encodable() {
        warn!(error = %e, "Rejecting session");
        return with_cookies(forbidden(), [clear_csrf]);
    }

    if !gate.admits(&session) {
        info!(email = %session.email, user = %session.user, "Account not permitted");
        return with_cookies(forbidden(), [clear_csrf]);
    }
    match provider.check_membership(&session).await {
        Ok(true) => {}
        Ok(false) => {
            info!(email = %session.email, "Required membership missing");
            return with_cookies(forbidden(), [clear_csrf]);
        }
        Err(e) => {
            error!(error = %e, email = %session.email, "Error checking membership");
            return with_cookies(internal_error(), [clear_csrf]);
        }
    }

    let session_cookie = match gate.cookies().session_cookie(&session, now) {
        Ok(cookie) => cookie,
        Err(e) => {
            error!(error = %e, "Error encoding session");
            return with_cookies(internal_error(), [clear_csrf]);
        }
    };

    info!(session = %session, "Authentication complete");
    with_cookies(redirect(&local_redirect(Some(rd))), [clear_csrf, session_cookie])
}

/// GET {prefix}/sign_in - no sign-in page; go straight to the provider
async fn sign_in_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RedirectParams>,
) -> Response {
    let rd = local_redirect(params.rd.as_deref());
    redirect(&start_url(state.gate.proxy_prefix(), &rd))
}

/// {prefix}/sign_out - drop the session cookie
async fn sign_out_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RedirectParams>,
) -> Response {
    let cookies = state.gate.cookies();
    let clear = cookies.clear_cookie(cookies.name());
    with_cookies(redirect(&local_redirect(params.rd.as_deref())), [clear])
}

/// GET {prefix}/auth - for `auth_request` style front proxies
async fn auth_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let auth = state.gate.authenticate(&headers).await;
    let response = match &auth.status {
        AuthStatus::Authenticated(session) => {
            let mut response = StatusCode::ACCEPTED.into_response();
            if state.gate.header_settings().set_xauthrequest {
                let out = response.headers_mut();
                if let Ok(user) = HeaderValue::from_str(&session.user) {
                    out.insert("x-auth-request-user", user);
                }
                if !session.email.is_empty() {
                    if let Ok(email) = HeaderValue::from_str(&session.email) {
                        out.insert("x-auth-request-email", email);
                    }
                }
            }
            response
        }
        AuthStatus::Unauthenticated | AuthStatus::Forbidden => {
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    };
    with_cookies(response, auth.set_cookie)
}

/// Everything else: authenticate, then forward upstream
async fn proxy_handler(State(state): State<Arc<AppState>>, mut request: Request<Body>) -> Response {
    let gate = &state.gate;

    if gate.skips_auth(request.method(), request.uri().path()) {
        strip_identity(request.headers_mut());
        return state.dispatcher.dispatch(request, None).await;
    }

    let auth = gate.authenticate(request.headers()).await;
    let response = match auth.status {
        AuthStatus::Authenticated(session) => {
            gate.inject_identity(&session, request.headers_mut());
            let gap = gap_auth(&session).to_string();
            let mut response = state.dispatcher.dispatch(request, Some(&gap)).await;
            if let Ok(value) = HeaderValue::from_str(&gap) {
                response.headers_mut().insert(GAP_AUTH_HEADER, value);
            }
            response
        }
        AuthStatus::Unauthenticated => {
            if request.method() == Method::GET || request.method() == Method::HEAD {
                let rd = request.uri().path_and_query().map_or("/", PathAndQuery::as_str);
                redirect(&start_url(gate.proxy_prefix(), rd))
            } else {
                (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
            }
        }
        AuthStatus::Forbidden => forbidden(),
    };
    with_cookies(response, auth.set_cookie)
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "Permission Denied").into_response()
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error").into_response()
}

fn redirect(location: &str) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

fn with_cookies(
    mut response: Response,
    cookies: impl IntoIterator<Item = Cookie<'static>>,
) -> Response {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

fn start_url(prefix: &str, rd: &str) -> String {
    let rd: String = url::form_urlencoded::byte_serialize(rd.as_bytes()).collect();
    format!("{}/start?rd={rd}", prefix.trim_end_matches('/'))
}

/// Post-login destination; only paths on this host are honoured
fn local_redirect(rd: Option<&str>) -> String {
    match rd {
        Some(rd) if rd.starts_with('/') && !rd.starts_with("//") && !rd.starts_with("/\\") => {
            rd.to_string()
        }
        _ => "/".to_string(),
    }
}
