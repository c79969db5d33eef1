//! Lazily refreshed access token owned by one provider instance

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use super::ProviderError;

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// A single access token with a fixed lifetime.
///
/// The lock is held while a refresh is in flight, so concurrent callers
/// wait for that refresh instead of issuing their own.
pub struct TokenCache {
    state: Mutex<Option<CachedToken>>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl TokenCache {
    /// Empty cache; fetched tokens are reused for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(None),
            ttl,
        }
    }

    /// Cached token, or the result of `fetch` if there is none or it expired
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, ProviderError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<String, ProviderError>> + Send,
    {
        let mut state = self.state.lock().await;
        if let Some(token) = state.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        debug!("Refreshing cached access token");
        let value = fetch().await?;
        *state = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(value)
    }

    /// Drop the cached token so the next call refetches
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}
