use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    http::{Request, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::debug;

/// Serves a directory below a path prefix
#[derive(Debug, Clone)]
pub struct StaticFiles {
    prefix: String,
    root: PathBuf,
    service: ServeDir,
}

impl StaticFiles {
    /// Serve `root`, stripping `prefix` from request paths
    pub fn new(prefix: &str, root: PathBuf) -> Self {
        Self {
            prefix: prefix.to_string(),
            service: ServeDir::new(&root),
            root,
        }
    }

    /// Directory being served
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve one request
    pub async fn serve(&self, mut request: Request<Body>) -> Response {
        let Some(uri) = self.strip_prefix(request.uri()) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        debug!(path = %uri.path(), root = %self.root.display(), "Serving file");
        *request.uri_mut() = uri;

        match self.service.clone().oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        }
    }

    fn strip_prefix(&self, uri: &Uri) -> Option<Uri> {
        let rest = uri.path().strip_prefix(self.prefix.as_str())?;
        let mut path = if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        };
        if let Some(query) = uri.query() {
            path.push('?');
            path.push_str(query);
        }
        path.parse().ok()
    }
}
