//! Websocket tunnel
//!
//! A reverse proxy that speaks HTTP cannot carry an upgraded connection, so
//! upgrade requests are replayed on a fresh connection to the upstream and,
//! once the upstream switches protocols, bytes are copied between the two
//! connections until either side closes. Frames are never inspected.
//! `https` upstreams are dialled over TLS.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{
        HeaderMap, Request, StatusCode,
        header::{CONNECTION, HeaderName, UPGRADE},
    },
    response::Response,
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::ProxyError;
use super::http::{HttpProxy, client_addr, request_target};

/// True when `header` lists `token` (comma separated, case-insensitive)
fn header_has_token(headers: &HeaderMap, header: HeaderName, token: &str) -> bool {
    headers
        .get_all(header)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// True for `Connection: upgrade` plus `Upgrade: websocket`
#[must_use]
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    header_has_token(headers, CONNECTION, "upgrade") && header_has_token(headers, UPGRADE, "websocket")
}

trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> UpstreamIo for T {}

/// TLS client settings for tunnels: `base`, or the web PKI roots, speaking
/// HTTP/1.1 only
pub(crate) fn tunnel_tls_config(
    base: Option<&rustls::ClientConfig>,
) -> Result<Arc<rustls::ClientConfig>, ProxyError> {
    let mut config = match base {
        Some(config) => config.clone(),
        None => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
            rustls::ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| ProxyError::Tls(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

async fn dial(proxy: &HttpProxy) -> Result<Box<dyn UpstreamIo>, ProxyError> {
    let target = proxy.target();
    let host = target
        .host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = target.port_or_known_default().unwrap_or(80);

    let stream = tokio::time::timeout(proxy.connect_timeout(), TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| ProxyError::Dial(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
        .map_err(ProxyError::Dial)?;

    let Some(tls) = proxy.tls() else {
        return Ok(Box::new(stream));
    };
    let server_name = ServerName::try_from(host).map_err(|e| ProxyError::InvalidUpstream {
        url: target.to_string(),
        reason: e.to_string(),
    })?;
    let stream = tokio::time::timeout(
        proxy.connect_timeout(),
        TlsConnector::from(Arc::clone(tls)).connect(server_name, stream),
    )
    .await
    .map_err(|_| ProxyError::Dial(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")))?
    .map_err(ProxyError::Dial)?;
    Ok(Box::new(stream))
}

pub(crate) async fn tunnel(
    proxy: &HttpProxy,
    mut request: Request<Body>,
    gap_auth: Option<&str>,
) -> Result<Response, ProxyError> {
    let target = proxy.target();
    let stream = dial(proxy).await?;

    let Some(client_upgrade) = request.extensions_mut().remove::<OnUpgrade>() else {
        return Err(ProxyError::NotUpgradable);
    };

    let remote = client_addr(&request);
    let path = request_target(request.uri()).to_string();
    let mut headers = proxy.outbound_headers(request.headers(), remote, gap_auth, true);
    proxy.sign(request.method(), &path, &mut headers, b"")?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::Handshake(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!(error = %e, "Upstream websocket connection closed with error");
        }
    });

    let mut upstream_request = Request::new(Body::empty());
    *upstream_request.method_mut() = request.method().clone();
    *upstream_request.uri_mut() = request.uri().path_and_query().map_or_else(
        || axum::http::Uri::from_static("/"),
        |pq| axum::http::Uri::from(pq.clone()),
    );
    *upstream_request.headers_mut() = headers;

    let mut response = sender
        .send_request(upstream_request)
        .await
        .map_err(|e| ProxyError::Handshake(e.to_string()))?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(ProxyError::Handshake(format!(
            "upstream answered {} for {path}",
            response.status()
        )));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let (parts, _) = response.into_parts();
    debug!(path = %path, upstream = %target, "Websocket tunnel established");
    tokio::spawn(relay(client_upgrade, upstream_upgrade, path));

    Ok(Response::from_parts(parts, Body::empty()))
}

/// Copy bytes both ways until both directions finish; an error in either
/// direction drops both connections.
async fn relay(client: OnUpgrade, upstream: OnUpgrade, path: String) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, path = %path, "Websocket upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(path = %path, sent, received, "Websocket tunnel closed");
        }
        Err(e) => {
            debug!(path = %path, error = %e, "Websocket tunnel closed with error");
        }
    }
}
