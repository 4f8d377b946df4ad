//! Read-through cache for conversation history, details and listings.
//!
//! Concurrent readers of the same key share one in-flight fetch. An entry
//! invalidated while its fetch is still running hands the result to the
//! readers already waiting, but does not keep it.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::api::{
    ApiError, ChatBackend, ConversationDetails, ConversationFilter, ConversationListResponse,
};
use crate::core::message::{expand_history, Message};
use crate::core::reconcile::sort_messages;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<Arc<V>, ApiError>>>;

struct Slot<V> {
    value: Option<(Arc<V>, Instant)>,
    stale: bool,
    in_flight: Option<SharedFetch<V>>,
    generation: u64,
}

struct Slots<K, V> {
    entries: HashMap<K, Slot<V>>,
    next_generation: u64,
}

impl<K: Eq + Hash, V> Slots<K, V> {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// A keyed cache of fetched values with a freshness window.
pub struct QueryCache<K, V> {
    slots: Arc<Mutex<Slots<K, V>>>,
    ttl: Duration,
}

impl<K, V> Clone for QueryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            ttl: self.ttl,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> QueryCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                entries: HashMap::new(),
                next_generation: 0,
            })),
            ttl,
        }
    }

    /// Return the cached value when fresh, otherwise join or start a fetch.
    pub async fn get<F>(&self, key: K, fetch: F) -> Result<Arc<V>, ApiError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<V, ApiError>>,
    {
        let shared = {
            let mut slots = lock(&self.slots);
            let generation = slots.bump();
            let slot = slots.entries.entry(key.clone()).or_insert_with(|| Slot {
                value: None,
                stale: false,
                in_flight: None,
                generation,
            });

            if let Some((value, fetched_at)) = &slot.value {
                if !slot.stale && fetched_at.elapsed() < self.ttl {
                    debug!(?key, "cache hit");
                    return Ok(Arc::clone(value));
                }
            }

            match slot.in_flight.clone() {
                Some(pending) => {
                    debug!(?key, "joining in-flight fetch");
                    pending
                }
                None => {
                    debug!(?key, "cache miss");
                    let pending = self.spawn_fetch(key, slot.generation, fetch());
                    slot.in_flight = Some(pending.clone());
                    pending
                }
            }
        };
        shared.await
    }

    fn spawn_fetch(
        &self,
        key: K,
        generation: u64,
        fetch: BoxFuture<'static, Result<V, ApiError>>,
    ) -> SharedFetch<V> {
        let slots = Arc::clone(&self.slots);
        async move {
            let result = fetch.await.map(Arc::new);
            let mut slots = lock(&slots);
            if let Some(slot) = slots.entries.get_mut(&key) {
                if slot.generation == generation {
                    slot.in_flight = None;
                    if let Ok(value) = &result {
                        slot.value = Some((Arc::clone(value), Instant::now()));
                        slot.stale = false;
                    }
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Last stored value, fresh or not.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        lock(&self.slots)
            .entries
            .get(key)
            .and_then(|slot| slot.value.as_ref().map(|(value, _)| Arc::clone(value)))
    }

    /// Mark the entry stale and detach any fetch already running for it.
    pub fn invalidate(&self, key: &K) {
        let mut slots = lock(&self.slots);
        let generation = slots.bump();
        if let Some(slot) = slots.entries.get_mut(key) {
            slot.stale = true;
            slot.in_flight = None;
            slot.generation = generation;
        }
    }

    pub fn invalidate_all(&self) {
        let mut slots = lock(&self.slots);
        let generation = slots.bump();
        for slot in slots.entries.values_mut() {
            slot.stale = true;
            slot.in_flight = None;
            slot.generation = generation;
        }
    }

    pub fn remove(&self, key: &K) {
        lock(&self.slots).entries.remove(key);
    }

    pub fn clear(&self) {
        lock(&self.slots).entries.clear();
    }
}

/// Run `op` up to `attempts` times with linear backoff. Only errors that
/// [`ApiError::is_retryable`] accepts are repeated.
pub async fn fetch_with_retries<T, F, Fut>(
    what: &str,
    attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && err.is_retryable() => {
                warn!(what, attempt, error = %err, "fetch failed; retrying");
                tokio::time::sleep(delay * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub history_ttl: Duration,
    pub details_ttl: Duration,
    pub list_ttl: Duration,
    pub history_page_size: u32,
    pub fetch_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            history_ttl: Duration::from_secs(5),
            details_ttl: Duration::from_secs(300),
            list_ttl: Duration::from_secs(120),
            history_page_size: 50,
            fetch_attempts: 3,
            retry_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListKey {
    pub user_id: String,
    pub filter: ConversationFilter,
}

/// Backend reads for one signed-in user.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct SessionCache {
    backend: Arc<dyn ChatBackend>,
    user_id: String,
    settings: CacheSettings,
    history: QueryCache<ConversationKey, Vec<Message>>,
    details: QueryCache<ConversationKey, ConversationDetails>,
    lists: QueryCache<ListKey, ConversationListResponse>,
}

impl SessionCache {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        user_id: impl Into<String>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            history: QueryCache::new(settings.history_ttl),
            details: QueryCache::new(settings.details_ttl),
            lists: QueryCache::new(settings.list_ttl),
            backend,
            user_id: user_id.into(),
            settings,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn key(&self, conversation_id: &str) -> ConversationKey {
        ConversationKey {
            conversation_id: conversation_id.to_string(),
            user_id: self.user_id.clone(),
        }
    }

    /// Confirmed messages for a conversation, oldest first.
    pub async fn get_history(&self, conversation_id: &str) -> Result<Arc<Vec<Message>>, ApiError> {
        let backend = Arc::clone(&self.backend);
        let conversation_id = conversation_id.to_string();
        let user_id = self.user_id.clone();
        let settings = self.settings.clone();
        let key = self.key(&conversation_id);

        self.history
            .get(key, move || {
                async move {
                    let page = fetch_with_retries(
                        "history",
                        settings.fetch_attempts,
                        settings.retry_delay,
                        || {
                            backend.get_conversation_history(
                                &conversation_id,
                                &user_id,
                                settings.history_page_size,
                                0,
                            )
                        },
                    )
                    .await?;
                    let mut messages = expand_history(&conversation_id, &page.history);
                    sort_messages(&mut messages);
                    Ok(messages)
                }
                .boxed()
            })
            .await
    }

    pub fn cached_history(&self, conversation_id: &str) -> Option<Arc<Vec<Message>>> {
        self.history.peek(&self.key(conversation_id))
    }

    pub async fn get_details(
        &self,
        conversation_id: &str,
    ) -> Result<Arc<ConversationDetails>, ApiError> {
        let backend = Arc::clone(&self.backend);
        let conversation_id = conversation_id.to_string();
        let user_id = self.user_id.clone();
        let settings = self.settings.clone();
        let key = self.key(&conversation_id);

        self.details
            .get(key, move || {
                async move {
                    fetch_with_retries(
                        "details",
                        settings.fetch_attempts,
                        settings.retry_delay,
                        || backend.get_conversation_details(&conversation_id, &user_id),
                    )
                    .await
                }
                .boxed()
            })
            .await
    }

    pub async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Arc<ConversationListResponse>, ApiError> {
        let backend = Arc::clone(&self.backend);
        let user_id = self.user_id.clone();
        let settings = self.settings.clone();
        let key = ListKey {
            user_id: user_id.clone(),
            filter: filter.clone(),
        };
        let filter = filter.clone();

        self.lists
            .get(key, move || {
                async move {
                    fetch_with_retries(
                        "conversations",
                        settings.fetch_attempts,
                        settings.retry_delay,
                        || backend.list_conversations(&user_id, &filter),
                    )
                    .await
                }
                .boxed()
            })
            .await
    }

    /// Force the next read of this conversation to go to the backend.
    pub fn invalidate(&self, conversation_id: &str) {
        let key = self.key(conversation_id);
        self.history.invalidate(&key);
        self.details.invalidate(&key);
    }

    pub fn invalidate_details(&self, conversation_id: &str) {
        self.details.invalidate(&self.key(conversation_id));
    }

    pub fn remove(&self, conversation_id: &str) {
        let key = self.key(conversation_id);
        self.history.remove(&key);
        self.details.remove(&key);
    }

    pub fn invalidate_conversations(&self) {
        self.lists.invalidate_all();
    }

    pub fn clear(&self) {
        self.history.clear();
        self.details.clear();
        self.lists.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{at, FakeBackend};

    fn fast_settings() -> CacheSettings {
        CacheSettings {
            retry_delay: Duration::from_millis(1),
            ..CacheSettings::default()
        }
    }

    fn cache_with(backend: &Arc<FakeBackend>) -> SessionCache {
        SessionCache::new(backend.clone(), "u-1", fast_settings())
    }

    #[tokio::test]
    async fn fresh_history_is_served_from_cache() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_turn("c-1", "t1", "Hello", "Hi there", at(0));
        let cache = cache_with(&backend);

        let first = cache.get_history("c-1").await.unwrap();
        let second = cache.get_history("c-1").await.unwrap();

        assert_eq!(first.len(), 2);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.history_calls("c-1"), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refetch() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_turn("c-1", "t1", "Hello", "Hi there", at(0));
        let cache = cache_with(&backend);

        cache.get_history("c-1").await.unwrap();
        backend.push_turn("c-1", "t2", "Again", "Sure", at(10));
        cache.invalidate("c-1");
        let refreshed = cache.get_history("c-1").await.unwrap();

        assert_eq!(refreshed.len(), 4);
        assert_eq!(backend.history_calls("c-1"), 2);
        assert_eq!(cache.cached_history("c-1").unwrap().len(), 4);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let backend = Arc::new(FakeBackend::new());
        let settings = CacheSettings {
            history_ttl: Duration::ZERO,
            ..fast_settings()
        };
        let cache = SessionCache::new(backend.clone(), "u-1", settings);

        cache.get_history("c-1").await.unwrap();
        cache.get_history("c-1").await.unwrap();
        assert_eq!(backend.history_calls("c-1"), 2);
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_fetch() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_turn("c-1", "t1", "Hello", "Hi there", at(0));
        backend.close_history_gate();
        let cache = cache_with(&backend);

        let a = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_history("c-1").await }
        });
        let b = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_history("c-1").await }
        });
        backend.wait_for_history_calls("c-1", 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.open_history_gate();

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.history_calls("c-1"), 1);
    }

    #[tokio::test]
    async fn fetch_started_before_invalidation_is_not_kept() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_turn("c-1", "t1", "Hello", "Hi there", at(0));
        backend.close_history_gate();
        let cache = cache_with(&backend);

        let waiter = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_history("c-1").await }
        });
        backend.wait_for_history_calls("c-1", 1).await;
        cache.invalidate("c-1");
        backend.open_history_gate();

        assert_eq!(waiter.await.unwrap().unwrap().len(), 2);
        assert!(cache.cached_history("c-1").is_none());

        cache.get_history("c-1").await.unwrap();
        assert_eq!(backend.history_calls("c-1"), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_surfaced() {
        let backend = Arc::new(FakeBackend::new());
        let cache = cache_with(&backend);

        backend.fail_history(2, ApiError::Network("connection reset".into()));
        assert!(cache.get_history("c-1").await.is_ok());
        assert_eq!(backend.history_calls("c-1"), 3);

        cache.invalidate("c-1");
        backend.fail_history(5, ApiError::Network("connection reset".into()));
        let err = cache.get_history("c-1").await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
        assert_eq!(backend.history_calls("c-1"), 6);
    }

    #[tokio::test]
    async fn unauthorized_is_never_retried() {
        let backend = Arc::new(FakeBackend::new());
        let cache = cache_with(&backend);
        backend.fail_history(1, ApiError::Unauthorized);

        assert_eq!(
            cache.get_history("c-1").await.unwrap_err(),
            ApiError::Unauthorized
        );
        assert_eq!(backend.history_calls("c-1"), 1);
    }

    #[tokio::test]
    async fn remove_and_clear_evict_entries() {
        let backend = Arc::new(FakeBackend::new());
        let cache = cache_with(&backend);

        cache.get_history("c-1").await.unwrap();
        cache.get_details("c-1").await.unwrap();
        cache.remove("c-1");
        assert!(cache.cached_history("c-1").is_none());

        cache.list_conversations(&ConversationFilter::default()).await.unwrap();
        cache.invalidate_conversations();
        cache.list_conversations(&ConversationFilter::default()).await.unwrap();
        assert_eq!(backend.calls_matching("list"), 2);

        cache.get_history("c-2").await.unwrap();
        cache.clear();
        assert!(cache.cached_history("c-2").is_none());
    }

    #[tokio::test]
    async fn entries_are_keyed_per_user() {
        let backend = Arc::new(FakeBackend::new());
        let alice = SessionCache::new(backend.clone(), "alice", fast_settings());
        let bob = SessionCache::new(backend.clone(), "bob", fast_settings());

        alice.get_history("c-1").await.unwrap();
        bob.get_history("c-1").await.unwrap();
        assert_eq!(backend.history_calls("c-1"), 2);
    }
}
