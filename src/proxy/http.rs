//! HTTP reverse proxy backend

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, Uri,
        header::{CONNECTION, CONTENT_LENGTH, HOST},
    },
    response::Response,
};
use authgate_core::{SIGNATURE_HEADER, SignableRequest};
use chrono::Utc;
use tracing::debug;
use url::Url;

use super::{AwsSigner, GAP_AUTH_HEADER, ProxyError, ProxyOptions, authority, websocket};
use crate::signing::SignatureKey;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Forwards requests to a single upstream origin
#[derive(Debug)]
pub struct HttpProxy {
    target: Url,
    client: reqwest::Client,
    pass_host_header: bool,
    signer: Option<SignatureKey>,
    aws: Option<AwsSigner>,
    max_body_size: usize,
    connect_timeout: std::time::Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl HttpProxy {
    /// Proxy to `target` (scheme and authority only)
    pub fn new(
        target: Url,
        options: &ProxyOptions,
        signer: Option<SignatureKey>,
        aws: Option<AwsSigner>,
    ) -> Result<Self, ProxyError> {
        // Redirects and content encodings belong to the client, not the proxy
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .connect_timeout(options.connect_timeout)
            .build()?;
        let tls = if target.scheme() == "https" {
            Some(websocket::tunnel_tls_config(options.upstream_tls.as_deref())?)
        } else {
            None
        };

        Ok(Self {
            target,
            client,
            pass_host_header: options.pass_host_header,
            signer,
            aws,
            max_body_size: options.max_body_size,
            connect_timeout: options.connect_timeout,
            tls,
        })
    }

    /// Upstream origin
    #[must_use]
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// True when requests carry a `GAP-Signature`
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.signer.is_some()
    }

    /// True when requests are signed for AWS
    #[must_use]
    pub fn is_aws(&self) -> bool {
        self.aws.is_some()
    }

    pub(crate) fn connect_timeout(&self) -> std::time::Duration {
        self.connect_timeout
    }

    pub(crate) fn tls(&self) -> Option<&Arc<rustls::ClientConfig>> {
        self.tls.as_ref()
    }

    /// Upstream URL for an inbound request target, kept as sent so that
    /// encoded path segments reach the upstream unchanged
    pub(crate) fn upstream_url(&self, target: &str) -> Result<Url, ProxyError> {
        let raw = format!("{}://{}{target}", self.target.scheme(), authority(&self.target));
        Url::parse(&raw).map_err(|e| ProxyError::InvalidUpstream {
            url: raw,
            reason: e.to_string(),
        })
    }

    /// Headers for the outbound request.
    ///
    /// Hop-by-hop headers are dropped unless `upgrade` is set, `Host` is
    /// either passed through or rewritten to the upstream, and any inbound
    /// `GAP-Auth`/`GAP-Signature` is replaced by our own.
    pub(crate) fn outbound_headers(
        &self,
        inbound: &HeaderMap,
        remote: Option<SocketAddr>,
        gap_auth: Option<&str>,
        upgrade: bool,
    ) -> HeaderMap {
        let listed: Vec<String> = inbound
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .collect();

        let mut headers = HeaderMap::with_capacity(inbound.len() + 3);
        for (name, value) in inbound {
            let keep_for_upgrade = upgrade && matches!(name.as_str(), "connection" | "upgrade");
            if name == HOST || (!keep_for_upgrade && is_hop_by_hop(name, &listed)) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let host = if self.pass_host_header {
            inbound.get(HOST).cloned()
        } else {
            None
        };
        let host = host.or_else(|| HeaderValue::from_str(&authority(&self.target)).ok());
        if let Some(host) = host {
            headers.insert(HOST, host);
        }

        if let Some(addr) = remote {
            let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{prior}, {}", addr.ip()),
                None => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        headers.remove(GAP_AUTH_HEADER);
        headers.remove(SIGNATURE_HEADER);
        if let Some(value) = gap_auth.and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(GAP_AUTH_HEADER, value);
        }
        headers
    }

    /// Attach the `GAP-Signature` header when a key is configured
    pub(crate) fn sign(
        &self,
        method: &Method,
        target: &str,
        headers: &mut HeaderMap,
        body: &[u8],
    ) -> Result<(), ProxyError> {
        let Some(key) = &self.signer else {
            return Ok(());
        };
        let signature = key.sign(&SignableRequest::new(method, target, headers).with_body(body))?;
        if let Ok(value) = HeaderValue::from_str(&signature) {
            headers.insert(SIGNATURE_HEADER, value);
        }
        Ok(())
    }

    /// Forward a request and stream the upstream response back
    pub async fn forward(
        &self,
        request: Request<Body>,
        gap_auth: Option<&str>,
    ) -> Result<Response, ProxyError> {
        let remote = client_addr(&request);
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|_| ProxyError::BodyTooLarge)?;

        let target = request_target(&parts.uri);
        let url = self.upstream_url(target)?;
        let mut headers = self.outbound_headers(&parts.headers, remote, gap_auth, false);
        // The buffered body has a known length even if it arrived chunked
        if !body.is_empty() || headers.contains_key(CONTENT_LENGTH) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }

        if let Some(aws) = &self.aws {
            aws.sign(&parts.method, &url, &mut headers, &body, Utc::now());
        }
        self.sign(&parts.method, target, &mut headers, &body)?;

        debug!(method = %parts.method, upstream = %url, "Forwarding request");
        let response = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let mut out = Response::new(Body::from_stream(response.bytes_stream()));
        *out.status_mut() = status;
        for (name, value) in &headers {
            if !is_hop_by_hop(name, &[]) {
                out.headers_mut().append(name.clone(), value.clone());
            }
        }
        Ok(out)
    }

    /// Tunnel a websocket upgrade to the upstream
    pub async fn tunnel(
        &self,
        request: Request<Body>,
        gap_auth: Option<&str>,
    ) -> Result<Response, ProxyError> {
        super::websocket::tunnel(self, request, gap_auth).await
    }
}

/// Request target (path and query) as it appeared on the request line
pub(crate) fn request_target(uri: &Uri) -> &str {
    uri.path_and_query().map_or("/", |pq| pq.as_str())
}

pub(crate) fn client_addr<B>(request: &Request<B>) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Hop-by-hop headers, plus any named in the request's `Connection` header
fn is_hop_by_hop(name: &HeaderName, listed: &[String]) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    ) || listed.iter().any(|l| l == name.as_str())
}
