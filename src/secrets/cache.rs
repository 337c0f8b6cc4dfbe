//! Short-lived in-memory credential cache
//!
//! Holds secrets the user asked to remember for this process (key
//! passphrases, prompted passwords before they are persisted). Entries
//! expire after a TTL; expiry is checked on read and a tokio timer
//! evicts them eagerly when a runtime is available.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;
use zeroize::Zeroizing;

use super::prompt::{PromptProvider, PromptRequest};

/// Default lifetime of a cached key passphrase
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

struct CachedSecret {
    value: Zeroizing<String>,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct CredentialCache {
    entries: Arc<DashMap<String, CachedSecret>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(
            key.to_string(),
            CachedSecret {
                value: Zeroizing::new(value.to_string()),
                expires_at,
            },
        );

        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let entries = Arc::clone(&self.entries);
            let key = key.to_string();
            rt.spawn(async move {
                tokio::time::sleep_until(expires_at).await;
                // A newer entry under the same key carries a later deadline
                entries.remove_if(&key, |_, v| v.expires_at <= Instant::now());
            });
        }
    }

    pub fn get(&self, key: &str) -> Option<Zeroizing<String>> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Remove and return a cached secret
    pub fn take(&self, key: &str) -> Option<Zeroizing<String>> {
        let (_, entry) = self.entries.remove(key)?;
        (entry.expires_at > Instant::now()).then_some(entry.value)
    }

    pub fn forget(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Return the cached secret, or prompt and cache the answer when the
    /// user ticks "remember". `None` means the user cancelled.
    pub async fn get_or_prompt(
        &self,
        key: &str,
        request: PromptRequest,
        prompts: &dyn PromptProvider,
        ttl: Duration,
    ) -> Option<Zeroizing<String>> {
        if let Some(hit) = self.get(key) {
            debug!("Credential cache hit for {}", key);
            return Some(hit);
        }

        let response = prompts.prompt_secret(request.with_remember()).await?;
        if response.remember {
            self.remember(key, &response.value, ttl);
        }
        Some(response.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::PromptResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPrompt {
        calls: AtomicUsize,
        remember: bool,
    }

    #[async_trait]
    impl PromptProvider for CountingPrompt {
        async fn prompt_secret(&self, request: PromptRequest) -> Option<PromptResponse> {
            assert!(request.offer_remember);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(PromptResponse {
                value: Zeroizing::new("secret".to_string()),
                remember: self.remember,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = CredentialCache::new();
        cache.remember("key", "pass", Duration::from_secs(60));
        assert_eq!(cache.get("key").as_deref().map(String::as_str), Some("pass"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("key").is_none());
    }

    #[tokio::test]
    async fn test_take_removes_entry() {
        let cache = CredentialCache::new();
        cache.remember("key", "pass", DEFAULT_TTL);
        assert!(cache.take("key").is_some());
        assert!(cache.take("key").is_none());
    }

    #[tokio::test]
    async fn test_get_or_prompt_caches_when_remembered() {
        let cache = CredentialCache::new();
        let prompt = CountingPrompt {
            calls: AtomicUsize::new(0),
            remember: true,
        };

        for _ in 0..3 {
            let v = cache
                .get_or_prompt("pp", PromptRequest::secret("Passphrase"), &prompt, DEFAULT_TTL)
                .await;
            assert_eq!(v.as_deref().map(String::as_str), Some("secret"));
        }
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_prompt_without_remember_asks_again() {
        let cache = CredentialCache::new();
        let prompt = CountingPrompt {
            calls: AtomicUsize::new(0),
            remember: false,
        };

        cache
            .get_or_prompt("pp", PromptRequest::secret("Passphrase"), &prompt, DEFAULT_TTL)
            .await;
        cache
            .get_or_prompt("pp", PromptRequest::secret("Passphrase"), &prompt, DEFAULT_TTL)
            .await;
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 2);
    }
}
