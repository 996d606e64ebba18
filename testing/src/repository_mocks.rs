//! Fault injection over any repository.
//!
//! [`FaultyRepository`] wraps a repository (by default the runtime's
//! [`InMemoryRepository`]) and injects write failures or delays per entity
//! type, to exercise compensation and reconciliation.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use eventflow_core::entity::{Entity, EntityKey, EntityType};
use eventflow_core::repository::{
    ExpectedVersion, Mutation, Repository, RepositoryError, WriteOutcome,
};
pub use eventflow_runtime::memory::InMemoryRepository;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Default)]
struct Faults {
    /// Remaining failing writes per entity type
    failing: HashMap<EntityType, u32>,
    /// Delay before each write per entity type
    delays: HashMap<EntityType, Duration>,
    /// Fail every read
    reads_down: bool,
}

/// Repository wrapper that injects failures.
///
/// ```
/// use eventflow_testing::{FaultyRepository, InMemoryRepository};
/// use eventflow_core::EntityType;
///
/// let faulty = FaultyRepository::new(InMemoryRepository::new());
/// faulty.fail_writes(EntityType::User, 2);
/// ```
#[derive(Clone, Debug)]
pub struct FaultyRepository<R = InMemoryRepository> {
    inner: R,
    faults: Arc<Mutex<Faults>>,
}

impl<R: Repository> FaultyRepository<R> {
    /// Wrap `inner` with no faults configured
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// The wrapped repository
    #[must_use]
    pub const fn inner(&self) -> &R {
        &self.inner
    }

    /// Fail the next `times` writes to entities of `entity_type`
    pub fn fail_writes(&self, entity_type: EntityType, times: u32) {
        self.faults.lock().unwrap().failing.insert(entity_type, times);
    }

    /// Fail every write to entities of `entity_type` until [`heal`](Self::heal)
    pub fn fail_all_writes(&self, entity_type: EntityType) {
        self.fail_writes(entity_type, u32::MAX);
    }

    /// Delay every write to entities of `entity_type`
    pub fn delay_writes(&self, entity_type: EntityType, delay: Duration) {
        self.faults.lock().unwrap().delays.insert(entity_type, delay);
    }

    /// Fail every read until [`heal`](Self::heal)
    pub fn fail_reads(&self) {
        self.faults.lock().unwrap().reads_down = true;
    }

    /// Remove every configured fault
    pub fn heal(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    fn take_write_fault(&self, entity_type: EntityType) -> (bool, Option<Duration>) {
        let mut faults = self.faults.lock().unwrap();
        let delay = faults.delays.get(&entity_type).copied();
        let fail = match faults.failing.get_mut(&entity_type) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        };
        (fail, delay)
    }
}

impl<R: Repository> Repository for FaultyRepository<R> {
    fn read(&self, key: EntityKey) -> BoxFuture<'_, Result<Option<Entity>, RepositoryError>> {
        if self.faults.lock().unwrap().reads_down {
            return Box::pin(async {
                Err(RepositoryError::Unavailable("injected read failure".to_string()))
            });
        }
        self.inner.read(key)
    }

    fn write(
        &self,
        key: EntityKey,
        mutation: Mutation,
        expected: ExpectedVersion,
    ) -> BoxFuture<'_, Result<WriteOutcome, RepositoryError>> {
        let (fail, delay) = self.take_write_fault(key.entity_type());
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(RepositoryError::Unavailable(format!(
                    "injected write failure for {key}"
                )));
            }
            self.inner.write(key, mutation, expected).await
        })
    }

    fn list(&self, entity_type: EntityType) -> BoxFuture<'_, Result<Vec<Entity>, RepositoryError>> {
        if self.faults.lock().unwrap().reads_down {
            return Box::pin(async {
                Err(RepositoryError::Unavailable("injected read failure".to_string()))
            });
        }
        self.inner.list(entity_type)
    }
}
