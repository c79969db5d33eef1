//! Upstream dispatch
//!
//! Upstreams are registered by URL. The URL's path is the route prefix, its
//! scheme picks the backend:
//!
//! - `http://`, `https://`: reverse proxy ([`http`])
//! - `file:///root#/prefix/`: static files from `/root`, mounted at the
//!   fragment (or at the path itself when there is no fragment)
//! - `aws+http://`, `aws+https://`: reverse proxy whose requests are signed
//!   with AWS Signature Version 4 ([`aws`])
//!
//! Routing follows `ServeMux` rules: a prefix ending in `/` matches every
//! path below it, any other prefix matches only itself, and the longest
//! matching prefix wins.

pub mod aws;
mod http;
mod static_files;
pub mod websocket;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::AwsConfig;
use crate::signing::{SignatureKey, SignatureKeys};

pub use self::aws::AwsSigner;
pub use self::http::HttpProxy;
pub use self::static_files::StaticFiles;
pub use self::websocket::is_websocket_request;

/// Response header naming the upstream that served the request
pub const UPSTREAM_ADDRESS_HEADER: &str = "GAP-Upstream-Address";

/// Internal identity header, echoed upstream and signed
pub const GAP_AUTH_HEADER: &str = "GAP-Auth";

/// Dispatch failures, each mapped to an HTTP status
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No route matches the path
    #[error("no upstream for {0}")]
    NoRoute(String),

    /// Upstream URL cannot be served
    #[error("invalid upstream {url:?}: {reason}")]
    InvalidUpstream {
        /// The configured URL
        url: String,
        /// What is wrong with it
        reason: String,
    },

    /// Two upstreams claim the same prefix
    #[error("duplicate upstream path {0:?}")]
    DuplicatePrefix(String),

    /// Forwarding the request failed
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Request body exceeds the buffering limit
    #[error("request body too large")]
    BodyTooLarge,

    /// Could not open a connection to the upstream
    #[error("couldn't connect to backend server: {0}")]
    Dial(std::io::Error),

    /// The client connection cannot be taken over for an upgrade
    #[error("connection does not support upgrades")]
    NotUpgradable,

    /// The upstream websocket handshake failed
    #[error("websocket unavailable: {0}")]
    Handshake(String),

    /// TLS client settings could not be built
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Signing the outbound request failed
    #[error("signing failed: {0}")]
    Signature(#[from] authgate_core::SignatureError),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NoRoute(_) => StatusCode::NOT_FOUND,
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Dial(_) | Self::Handshake(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidUpstream { .. }
            | Self::DuplicatePrefix(_)
            | Self::NotUpgradable
            | Self::Tls(_)
            | Self::Signature(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Proxy error");
        } else {
            debug!(error = %self, "Proxy request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

/// Settings shared by every upstream
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Keep the client's `Host` header instead of the upstream's
    pub pass_host_header: bool,
    /// `GAP-Signature` keys
    pub signature_keys: SignatureKeys,
    /// Credentials for `aws+` upstreams
    pub aws: AwsConfig,
    /// Largest request body buffered before forwarding
    pub max_body_size: usize,
    /// Timeout for upstream connects
    pub connect_timeout: Duration,
    /// TLS client settings for websocket tunnels to `https` upstreams;
    /// `None` trusts the bundled web PKI roots
    pub upstream_tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            pass_host_header: true,
            signature_keys: SignatureKeys::default(),
            aws: AwsConfig::default(),
            max_body_size: 10 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            upstream_tls: None,
        }
    }
}

/// What an upstream forwards to
#[derive(Debug)]
pub enum Backend {
    /// Plain or AWS-signed reverse proxy
    Http(HttpProxy),
    /// Local directory
    Static(StaticFiles),
}

/// One routed upstream
#[derive(Debug)]
pub struct Upstream {
    prefix: String,
    url: Url,
    backend: Backend,
}

impl Upstream {
    /// Parse an upstream URL and build its backend
    pub fn from_url(raw: &str, options: &ProxyOptions) -> Result<Self, ProxyError> {
        let invalid = |reason: String| ProxyError::InvalidUpstream {
            url: raw.to_string(),
            reason,
        };
        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {
                let prefix = route_prefix(url.path());
                let target = origin(&url).map_err(invalid)?;
                let signer = signing_key_for(&options.signature_keys, &target);
                let proxy = HttpProxy::new(target, options, signer, None)?;
                Ok(Self::http(prefix, url, proxy))
            }
            "aws+http" | "aws+https" => {
                let inner = raw.strip_prefix("aws+").unwrap_or(raw);
                let stripped = Url::parse(inner).map_err(|e| invalid(e.to_string()))?;
                let prefix = route_prefix(stripped.path());
                let target = origin(&stripped).map_err(invalid)?;
                let aws = AwsSigner::for_host(&options.aws, target.host_str().unwrap_or_default())
                    .map_err(invalid)?;
                let mut aws_options = options.clone();
                aws_options.pass_host_header = false;
                let signer = signing_key_for(&options.signature_keys, &target);
                let proxy = HttpProxy::new(target, &aws_options, signer, Some(aws))?;
                Ok(Self::http(prefix, stripped, proxy))
            }
            "file" => {
                let root = PathBuf::from(url.path());
                let prefix = match url.fragment() {
                    Some(fragment) if !fragment.is_empty() => fragment.to_string(),
                    _ => url.path().to_string(),
                };
                Ok(Self {
                    backend: Backend::Static(StaticFiles::new(&prefix, root)),
                    prefix,
                    url,
                })
            }
            other => Err(invalid(format!("unknown upstream protocol {other}"))),
        }
    }

    fn http(prefix: String, url: Url, proxy: HttpProxy) -> Self {
        Self {
            prefix,
            url,
            backend: Backend::Http(proxy),
        }
    }

    /// Route prefix
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Configured URL
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Backend kind
    #[must_use]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// True when `path` falls under this upstream
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix.ends_with('/') {
            path.starts_with(&self.prefix)
        } else {
            path == self.prefix
        }
    }

    /// Forward a request. `gap_auth` is the authenticated identity, set on
    /// the outbound request and covered by its signature.
    pub async fn serve(&self, request: Request<Body>, gap_auth: Option<&str>) -> Response {
        let mut response = match &self.backend {
            Backend::Http(proxy) if is_websocket_request(request.headers()) => {
                proxy.tunnel(request, gap_auth).await
            }
            Backend::Http(proxy) => proxy.forward(request, gap_auth).await,
            Backend::Static(files) => Ok(files.serve(request).await),
        }
        .unwrap_or_else(IntoResponse::into_response);

        if let Backend::Http(proxy) = &self.backend {
            if let Ok(value) = HeaderValue::from_str(&authority(proxy.target())) {
                response.headers_mut().insert(UPSTREAM_ADDRESS_HEADER, value);
            }
        }
        response
    }
}

/// External source of routes, consulted before the static table
pub trait RouteResolver: Send + Sync {
    /// Upstream serving `path`, if this resolver knows one
    fn resolve(&self, path: &str) -> Option<Arc<Upstream>>;
}

/// Resolver that never resolves anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscovery;

impl RouteResolver for NoDiscovery {
    fn resolve(&self, _path: &str) -> Option<Arc<Upstream>> {
        None
    }
}

/// Longest-prefix route table
pub struct Dispatcher {
    routes: Vec<Arc<Upstream>>,
    resolver: Arc<dyn RouteResolver>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Build the table from upstream URLs
    pub fn from_urls(urls: &[String], options: &ProxyOptions) -> Result<Self, ProxyError> {
        let upstreams = urls
            .iter()
            .map(|raw| Upstream::from_url(raw, options))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(upstreams)
    }

    /// Build the table. Identical prefixes are rejected.
    pub fn new(upstreams: Vec<Upstream>) -> Result<Self, ProxyError> {
        let mut routes: Vec<Arc<Upstream>> = Vec::with_capacity(upstreams.len());
        for upstream in upstreams {
            if routes.iter().any(|r| r.prefix == upstream.prefix) {
                return Err(ProxyError::DuplicatePrefix(upstream.prefix));
            }
            match &upstream.backend {
                Backend::Http(proxy) => info!(
                    path = %upstream.prefix,
                    upstream = %proxy.target(),
                    aws = proxy.is_aws(),
                    signed = proxy.is_signed(),
                    "Mapping path to upstream"
                ),
                Backend::Static(files) => info!(
                    path = %upstream.prefix,
                    root = %files.root().display(),
                    "Mapping path to file system"
                ),
            }
            routes.push(Arc::new(upstream));
        }
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self {
            routes,
            resolver: Arc::new(NoDiscovery),
        })
    }

    /// Consult `resolver` before the static table
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn RouteResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Registered upstreams, longest prefix first
    pub fn routes(&self) -> impl Iterator<Item = &Upstream> {
        self.routes.iter().map(AsRef::as_ref)
    }

    /// Upstream for `path`
    #[must_use]
    pub fn route(&self, path: &str) -> Option<Arc<Upstream>> {
        self.resolver
            .resolve(path)
            .or_else(|| self.routes.iter().find(|r| r.matches(path)).cloned())
    }

    /// Route and forward a request
    pub async fn dispatch(&self, request: Request<Body>, gap_auth: Option<&str>) -> Response {
        let path = request.uri().path().to_string();
        match self.route(&path) {
            Some(upstream) => {
                debug!(path = %path, prefix = %upstream.prefix, "Dispatching");
                upstream.serve(request, gap_auth).await
            }
            None => {
                warn!(path = %path, "No upstream matches path");
                ProxyError::NoRoute(path).into_response()
            }
        }
    }
}

fn route_prefix(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// Scheme and authority of `url`, without path, query or fragment
fn origin(url: &Url) -> Result<Url, String> {
    if url.host_str().is_none_or(str::is_empty) {
        return Err("missing host".to_string());
    }
    let mut target = url.clone();
    target.set_path("");
    target.set_query(None);
    target.set_fragment(None);
    Ok(target)
}

/// `host[:port]` of `url`
pub(crate) fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Key used to sign requests to `url`
pub(crate) fn signing_key_for(keys: &SignatureKeys, url: &Url) -> Option<SignatureKey> {
    keys.for_host(&authority(url)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignatureConfig;

    fn dispatcher(urls: &[&str]) -> Dispatcher {
        let urls: Vec<String> = urls.iter().map(|s| (*s).to_string()).collect();
        Dispatcher::from_urls(&urls, &ProxyOptions::default()).unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let d = dispatcher(&["http://127.0.0.1:8080/", "http://127.0.0.1:8081/foo/"]);
        assert_eq!(d.route("/foo/bar").unwrap().prefix(), "/foo/");
        assert_eq!(d.route("/foobar").unwrap().prefix(), "/");
        assert_eq!(d.route("/").unwrap().prefix(), "/");
    }

    #[test]
    fn test_prefix_without_trailing_slash_is_exact() {
        let d = dispatcher(&["http://127.0.0.1:8080/exact"]);
        assert!(d.route("/exact").is_some());
        assert!(d.route("/exact/below").is_none());
        assert!(d.route("/other").is_none());
    }

    #[test]
    fn test_empty_path_routes_root() {
        let d = dispatcher(&["http://127.0.0.1:8080"]);
        assert_eq!(d.route("/anything").unwrap().prefix(), "/");
    }

    #[test]
    fn test_file_upstream_uses_fragment_as_prefix() {
        let d = dispatcher(&["file:///var/www/static#/static/", "file:///srv/docs/"]);
        let files = d.route("/static/app.css").unwrap();
        assert_eq!(files.prefix(), "/static/");
        let Backend::Static(static_files) = files.backend() else {
            panic!("expected static backend");
        };
        assert_eq!(static_files.root(), std::path::Path::new("/var/www/static"));

        assert_eq!(d.route("/srv/docs/index.html").unwrap().prefix(), "/srv/docs/");
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let urls = vec![
            "http://127.0.0.1:8080/api/".to_string(),
            "http://127.0.0.1:8081/api/".to_string(),
        ];
        let err = Dispatcher::from_urls(&urls, &ProxyOptions::default()).unwrap_err();
        assert!(matches!(err, ProxyError::DuplicatePrefix(p) if p == "/api/"));
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let err = Upstream::from_url("ftp://example.com/", &ProxyOptions::default()).unwrap_err();
        assert!(err.to_string().contains("unknown upstream protocol ftp"));
    }

    #[test]
    fn test_aws_upstream_needs_credentials() {
        let err = Upstream::from_url(
            "aws+https://search-logs.eu-west-1.es.amazonaws.com/logs/",
            &ProxyOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidUpstream { .. }));

        let options = ProxyOptions {
            aws: AwsConfig {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let upstream = Upstream::from_url(
            "aws+https://search-logs.eu-west-1.es.amazonaws.com/logs/",
            &options,
        )
        .unwrap();
        assert_eq!(upstream.prefix(), "/logs/");
        let Backend::Http(proxy) = upstream.backend() else {
            panic!("expected http backend");
        };
        assert!(proxy.is_aws());
        assert_eq!(proxy.target().as_str(), "https://search-logs.eu-west-1.es.amazonaws.com/");
    }

    #[test]
    fn test_signing_key_selected_per_host() {
        let options = ProxyOptions {
            signature_keys: SignatureKeys::from_config(&SignatureConfig {
                key: None,
                upstream_keys: vec!["signed.internal=sha1:secret".to_string()],
            })
            .unwrap(),
            ..Default::default()
        };
        let signed = Upstream::from_url("http://signed.internal:8080/", &options).unwrap();
        let plain = Upstream::from_url("http://plain.internal:8080/plain/", &options).unwrap();
        let (Backend::Http(signed), Backend::Http(plain)) = (signed.backend(), plain.backend()) else {
            panic!("expected http backends");
        };
        assert!(signed.is_signed());
        assert!(!plain.is_signed());
    }

    struct Fixed(Arc<Upstream>);

    impl RouteResolver for Fixed {
        fn resolve(&self, path: &str) -> Option<Arc<Upstream>> {
            path.starts_with("/discovered/").then(|| self.0.clone())
        }
    }

    #[test]
    fn test_resolver_consulted_first() {
        let discovered =
            Arc::new(Upstream::from_url("http://10.0.0.7:9000/discovered/", &ProxyOptions::default()).unwrap());
        let d = dispatcher(&["http://127.0.0.1:8080/"]).with_resolver(Arc::new(Fixed(discovered)));

        let hit = d.route("/discovered/x").unwrap();
        assert_eq!(hit.url().as_str(), "http://10.0.0.7:9000/discovered/");
        assert_eq!(d.route("/elsewhere").unwrap().prefix(), "/");
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(ProxyError::NoRoute("/x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyError::Dial(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyError::NotUpgradable.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ProxyError::Handshake("x".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ProxyError::Handshake("x".into()).to_string(),
            "websocket unavailable: x"
        );
    }
}
