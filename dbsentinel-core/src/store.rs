//! Statement interning.
//!
//! Statements are content-addressed: the first instance registered for an
//! id is the one every later caller gets back. Lookups go through a bounded
//! LRU cache and fall back to a durable [`StatementStore`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::statement::Statement;

/// Durable key/value storage of statements.
#[async_trait]
pub trait StatementStore: Send + Sync + std::fmt::Debug {
    /// Loads a statement by id.
    async fn find(&self, id: &str) -> Result<Option<Statement>>;

    /// Stores a statement under its id.
    async fn add(&self, statement: &Statement) -> Result<()>;
}

/// Store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStatementStore {
    statements: DashMap<String, Statement>,
}

impl MemoryStatementStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored statements
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[async_trait]
impl StatementStore for MemoryStatementStore {
    async fn find(&self, id: &str) -> Result<Option<Statement>> {
        Ok(self.statements.get(id).map(|entry| entry.value().clone()))
    }

    async fn add(&self, statement: &Statement) -> Result<()> {
        self.statements
            .entry(statement.id().to_string())
            .or_insert_with(|| statement.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, (Arc<Statement>, u64)>,
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl CacheState {
    fn touch(&mut self, id: &str) -> Option<Arc<Statement>> {
        self.tick = self.tick.wrapping_add(1);
        let tick = self.tick;
        let (statement, used) = self.entries.get_mut(id)?;
        self.recency.remove(&*used);
        *used = tick;
        self.recency.insert(tick, id.to_string());
        Some(Arc::clone(statement))
    }
}

/// Bounded least-recently-used cache of statements.
#[derive(Debug)]
pub struct StatementCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl StatementCache {
    /// Creates a cache holding at most `capacity` statements.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Cached statement, marked as recently used
    pub fn get(&self, id: &str) -> Option<Arc<Statement>> {
        self.state.lock().touch(id)
    }

    /// Caches a statement unless its id is already present.
    ///
    /// Returns the cached instance, which is the existing one when the id
    /// was already cached.
    pub fn insert_if_absent(&self, statement: Arc<Statement>) -> Arc<Statement> {
        let mut state = self.state.lock();
        if let Some(existing) = state.touch(statement.id()) {
            return existing;
        }

        state.tick = state.tick.wrapping_add(1);
        let tick = state.tick;
        let id = statement.id().to_string();
        state.recency.insert(tick, id.clone());
        state.entries.insert(id, (Arc::clone(&statement), tick));

        while state.entries.len() > self.capacity {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
            debug!("Evicted statement {} from cache", oldest);
        }
        statement
    }

    /// Returns true when the id is cached. Does not affect recency.
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    /// Number of cached statements
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true when the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached statements
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Two-tier statement lookup and registration.
#[derive(Debug)]
pub struct StatementRegistry {
    cache: StatementCache,
    store: Arc<dyn StatementStore>,
}

impl StatementRegistry {
    /// Creates a registry over a store.
    pub fn new(store: Arc<dyn StatementStore>, capacity: usize) -> Self {
        Self {
            cache: StatementCache::new(capacity),
            store,
        }
    }

    /// In-memory tier
    pub const fn cache(&self) -> &StatementCache {
        &self.cache
    }

    /// Looks a statement up, promoting store hits into the cache.
    ///
    /// # Errors
    /// Returns the store error on a cache miss.
    pub async fn get_statement(&self, id: &str) -> Result<Option<Arc<Statement>>> {
        if let Some(statement) = self.cache.get(id) {
            return Ok(Some(statement));
        }
        let Some(stored) = self.store.find(id).await? else {
            return Ok(None);
        };
        debug!("Promoted statement {} from store", id);
        Ok(Some(self.cache.insert_if_absent(Arc::new(stored))))
    }

    /// Registers a statement and returns the canonical instance for its id.
    ///
    /// The first registration of an id wins; later ones get the first
    /// instance back and are not stored again.
    ///
    /// # Errors
    /// Returns the store error; nothing is cached then.
    pub async fn register_statement(&self, statement: Arc<Statement>) -> Result<Arc<Statement>> {
        if let Some(existing) = self.cache.get(statement.id()) {
            return Ok(existing);
        }
        self.store.add(&statement).await?;
        Ok(self.cache.insert_if_absent(statement))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::MonitorError;

    fn statement(sql: &str) -> Arc<Statement> {
        Arc::new(Statement::new(sql, "app").unwrap())
    }

    #[derive(Debug)]
    struct FailingStore;

    #[async_trait]
    impl StatementStore for FailingStore {
        async fn find(&self, _id: &str) -> Result<Option<Statement>> {
            Ok(None)
        }

        async fn add(&self, _statement: &Statement) -> Result<()> {
            Err(MonitorError::configuration("store is read-only"))
        }
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let store = Arc::new(MemoryStatementStore::new());
        let registry = StatementRegistry::new(store.clone(), 16);
        let a = statement("select * from orders");
        let a_prime = Arc::new(Statement::new("/* retry */ select * from orders  ", "batch").unwrap());
        assert_eq!(a.id(), a_prime.id());

        let first = registry.register_statement(a.clone()).await.unwrap();
        let second = registry.register_statement(a_prime).await.unwrap();

        assert!(Arc::ptr_eq(&first, &a));
        assert!(Arc::ptr_eq(&second, &a));
        assert_eq!(second.user_name(), "app");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_hit_is_promoted() {
        let store = Arc::new(MemoryStatementStore::new());
        let stored = Statement::new("update t set a = 1", "app").unwrap();
        store.add(&stored).await.unwrap();
        let registry = StatementRegistry::new(store, 16);

        let found = registry.get_statement(stored.id()).await.unwrap().unwrap();
        let again = registry.get_statement(stored.id()).await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&found, &again));
        assert!(registry.cache().contains(stored.id()));
        assert!(registry.get_statement("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let registry = StatementRegistry::new(Arc::new(FailingStore), 16);
        let result = registry.register_statement(statement("select 1")).await;
        assert!(result.is_err());
        assert!(registry.cache().is_empty());
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let cache = StatementCache::new(2);
        let a = cache.insert_if_absent(statement("select 1"));
        let b = cache.insert_if_absent(statement("select 2"));
        assert!(cache.get(a.id()).is_some());

        cache.insert_if_absent(statement("select 3"));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(a.id()));
        assert!(!cache.contains(b.id()));
    }

    #[test]
    fn test_cache_capacity_is_at_least_one() {
        let cache = StatementCache::new(0);
        cache.insert_if_absent(statement("select 1"));
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
    }
}
