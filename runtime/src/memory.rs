//! In-memory repository backend.
//!
//! A `HashMap` behind an `RwLock` with the same compare-and-swap semantics a
//! database backend must provide. The binary runs on it; tests wrap it to
//! inject faults.

use eventflow_core::entity::{Entity, EntityKey, EntityType};
use eventflow_core::repository::{
    ExpectedVersion, Mutation, Repository, RepositoryError, WriteOutcome,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// In-memory repository with optimistic concurrency.
///
/// Clones share the same storage.
///
/// # Example
///
/// ```
/// use eventflow_runtime::memory::InMemoryRepository;
/// use eventflow_core::repository::{ExpectedVersion, Mutation, Repository, WriteOutcome};
/// use eventflow_core::EntityKey;
///
/// # async fn example(key: EntityKey) -> Result<(), Box<dyn std::error::Error>> {
/// let repo = InMemoryRepository::new();
///
/// // Deleting an absent key at an exact version is a mismatch
/// let outcome = repo.write(key, Mutation::Delete, ExpectedVersion::Exact(1)).await?;
/// assert_eq!(outcome, WriteOutcome::VersionMismatch { current: None });
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryRepository {
    data: Arc<RwLock<HashMap<EntityKey, Entity>>>,
    writes: Arc<AtomicU64>,
}

impl InMemoryRepository {
    /// Create a new empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> RwLockReadGuard<'_, HashMap<EntityKey, Entity>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn data_mut(&self) -> RwLockWriteGuard<'_, HashMap<EntityKey, Entity>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entity as-is, bypassing version checks.
    ///
    /// Used to import records and to build states a crash could leave behind.
    /// A version of `0` is stored as `1`.
    pub fn seed(&self, mut entity: Entity) {
        if entity.version() == 0 {
            entity.set_version(1);
        }
        self.data_mut().insert(entity.key(), entity);
    }

    /// Remove a record, bypassing version checks
    pub fn remove(&self, key: &EntityKey) -> Option<Entity> {
        self.data_mut().remove(key)
    }

    /// Current record under `key`
    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.data().get(key).cloned()
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Check if the repository is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Number of committed writes so far
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn apply(
        &self,
        key: EntityKey,
        mutation: Mutation,
        expected: ExpectedVersion,
    ) -> Result<WriteOutcome, RepositoryError> {
        let mut data = self.data_mut();
        let current = data.get(&key).map(Entity::version);

        if !expected.matches(current) {
            return Ok(WriteOutcome::VersionMismatch { current });
        }

        let outcome = match mutation {
            Mutation::Put(mut entity) => {
                if entity.key() != key {
                    return Err(RepositoryError::KeyMismatch { key });
                }
                let version = current.map_or(1, |v| v + 1);
                entity.set_version(version);
                data.insert(key, entity);
                WriteOutcome::Committed(version)
            }
            Mutation::Delete => {
                data.remove(&key);
                WriteOutcome::Committed(0)
            }
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

impl Repository for InMemoryRepository {
    fn read(&self, key: EntityKey) -> BoxFuture<'_, Result<Option<Entity>, RepositoryError>> {
        let entity = self.get(&key);
        Box::pin(async move { Ok(entity) })
    }

    fn write(
        &self,
        key: EntityKey,
        mutation: Mutation,
        expected: ExpectedVersion,
    ) -> BoxFuture<'_, Result<WriteOutcome, RepositoryError>> {
        let outcome = self.apply(key, mutation, expected);
        Box::pin(async move { outcome })
    }

    fn list(&self, entity_type: EntityType) -> BoxFuture<'_, Result<Vec<Entity>, RepositoryError>> {
        let entities: Vec<Entity> = self
            .data()
            .values()
            .filter(|entity| entity.key().entity_type() == entity_type)
            .cloned()
            .collect();
        Box::pin(async move { Ok(entities) })
    }
}
