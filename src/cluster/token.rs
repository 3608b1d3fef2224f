//! Bearer tokens for the cluster API server.
//!
//! A token is a presigned caller-identity URL, base64url-encoded without
//! padding and prefixed with [`TOKEN_PREFIX`]. The presigned request is
//! valid for 15 minutes; tokens are reused for 14.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::provider::IdentityApi;
use crate::Result;

/// Prefix of every cluster bearer token
pub const TOKEN_PREFIX: &str = "k8s-aws-v1.";

/// How long a token is reused
pub const TOKEN_TTL: Duration = Duration::from_secs(14 * 60);

/// Encode a presigned URL as a bearer token
pub fn encode_token(presigned_url: &str) -> String {
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(presigned_url))
}

/// Caching token source for one cluster
pub struct TokenProvider {
    identity: Arc<dyn IdentityApi>,
    cluster_name: String,
    cache: Mutex<Option<(String, Instant)>>,
}

impl TokenProvider {
    /// Provider for `cluster_name`
    pub fn new(identity: Arc<dyn IdentityApi>, cluster_name: impl Into<String>) -> Self {
        Self {
            identity,
            cluster_name: cluster_name.into(),
            cache: Mutex::new(None),
        }
    }

    /// A valid token, presigning a new one when the cached one expired
    pub async fn token(&self) -> Result<String> {
        if let Some((token, expires)) = self.cache.lock().as_ref() {
            if Instant::now() < *expires {
                return Ok(token.clone());
            }
        }

        let url = self.identity.presign_caller_identity(&self.cluster_name).await?;
        let token = encode_token(&url);
        *self.cache.lock() = Some((token.clone(), Instant::now() + TOKEN_TTL));
        debug!(cluster = %self.cluster_name, "refreshed bearer token");
        Ok(token)
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("cluster_name", &self.cluster_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockIdentityApi;
    use std::sync::atomic::{AtomicU32, Ordering};

    const URL: &str = "https://sts.us-west-2.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15&X-Amz-Expires=60";

    #[test]
    fn token_is_prefixed_base64url_without_padding() {
        let token = encode_token(URL);
        let body = token.strip_prefix(TOKEN_PREFIX).unwrap();
        assert!(!body.contains('='));
        assert!(!body.contains('+') && !body.contains('/'));
        assert_eq!(URL_SAFE_NO_PAD.decode(body).unwrap(), URL.as_bytes());
    }

    /// Story: tokens are presigned once and reused until they expire
    #[tokio::test(start_paused = true)]
    async fn story_tokens_are_cached_for_fourteen_minutes() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut identity = MockIdentityApi::new();
        identity
            .expect_presign_caller_identity()
            .withf(|name| name == "test-001")
            .returning(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(URL.to_string())
            });
        let provider = TokenProvider::new(Arc::new(identity), "test-001");

        let first = provider.token().await.unwrap();
        tokio::time::advance(Duration::from_secs(13 * 60)).await;
        let second = provider.token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        provider.token().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
