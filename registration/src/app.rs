//! Application wiring.
//!
//! [`EventFlowApp`] builds the five components over one repository and one
//! clock, connects observers (resuming or falling back to a full resync) and
//! spawns the periodic maintenance jobs.

use crate::config::Config;
use crate::coordinator::RegistrationCoordinator;
use crate::ledger::CapacityLedger;
use crate::lifecycle::{EventDraft, EventLifecycleManager};
use crate::notifier::{ChangeNotifier, NotifierError, ResumeFrom, Subscription};
use crate::synchronizer::ConsistencySynchronizer;
use eventflow_core::environment::Clock;
use eventflow_core::{
    Caller, ChangeDraft, ChangePayload, Entity, EntityType, ExpectedVersion, IdentityProvider,
    Mutation, Record, RegistrationError, Repository, Role, SessionId, UserAccount, UserId,
    Visibility,
};
use eventflow_runtime::background::{BackgroundJob, PeriodicTask};
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Full state visible to one observer at a feed position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedSnapshot {
    /// Feed position the snapshot is at least as new as
    pub position: u64,
    /// One entry per visible record, with its current version
    pub entries: Vec<ChangeDraft>,
}

/// A connected observer.
#[derive(Debug)]
pub struct ObserverConnection {
    /// Present when the observer could not resume and must replace its state
    pub snapshot: Option<FeedSnapshot>,
    /// Live changes after the snapshot (or after the resumed position)
    pub subscription: Subscription,
}

/// The registration system, wired.
pub struct EventFlowApp {
    config: Config,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    ledger: Arc<CapacityLedger>,
    notifier: ChangeNotifier,
    synchronizer: Arc<ConsistencySynchronizer>,
    coordinator: Arc<RegistrationCoordinator>,
    lifecycle: Arc<EventLifecycleManager>,
}

impl std::fmt::Debug for EventFlowApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFlowApp")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventFlowApp {
    /// Wire every component over `repository`.
    #[must_use]
    pub fn new(config: Config, repository: Arc<dyn Repository>, clock: Arc<dyn Clock>) -> Self {
        let notifier = ChangeNotifier::new(&config.notifier);
        let ledger = Arc::new(CapacityLedger::new(
            Arc::clone(&repository),
            Arc::clone(&clock),
            &config.ledger,
        ));
        let synchronizer = Arc::new(ConsistencySynchronizer::new(
            Arc::clone(&repository),
            Arc::clone(&ledger),
            notifier.clone(),
            Arc::clone(&clock),
            &config.sync,
        ));
        let coordinator = Arc::new(RegistrationCoordinator::new(
            Arc::clone(&repository),
            Arc::clone(&ledger),
            Arc::clone(&synchronizer),
            notifier.clone(),
            config.retry.policy(),
            config.ledger.lease_ttl(),
        ));
        let lifecycle = Arc::new(EventLifecycleManager::new(
            Arc::clone(&repository),
            Arc::clone(&ledger),
            Arc::clone(&coordinator),
            notifier.clone(),
            Arc::clone(&clock),
        ));

        Self {
            config,
            repository,
            clock,
            ledger,
            notifier,
            synchronizer,
            coordinator,
            lifecycle,
        }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Registration coordinator
    #[must_use]
    pub fn coordinator(&self) -> &RegistrationCoordinator {
        &self.coordinator
    }

    /// Lifecycle manager
    #[must_use]
    pub fn lifecycle(&self) -> &EventLifecycleManager {
        &self.lifecycle
    }

    /// Consistency synchronizer
    #[must_use]
    pub fn synchronizer(&self) -> &ConsistencySynchronizer {
        &self.synchronizer
    }

    /// Capacity ledger
    #[must_use]
    pub fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    /// Change notifier
    #[must_use]
    pub const fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Resolve the caller of the current request.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::Unauthorized`] when the provider rejects the request.
    pub async fn authenticate(
        &self,
        identity: &dyn IdentityProvider,
    ) -> Result<Caller, RegistrationError> {
        identity
            .authenticate()
            .await
            .map_err(|e| RegistrationError::Unauthorized(e.to_string()))
    }

    /// Connect an observer, resuming after `resume` when possible.
    ///
    /// When there is nothing to resume from, or the position fell out of the
    /// retained feed, the observer is subscribed first and then handed a
    /// snapshot of everything it may see; changes racing with the snapshot
    /// show up on the subscription with versions the observer can compare.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::Internal`] if the snapshot cannot be read.
    #[tracing::instrument(skip(self), fields(user_id = %caller.user_id))]
    pub async fn connect_observer(
        &self,
        session: SessionId,
        caller: Caller,
        resume: Option<u64>,
    ) -> Result<ObserverConnection, RegistrationError> {
        if let Some(position) = resume {
            match self
                .notifier
                .subscribe(session, caller, ResumeFrom::After(position))
            {
                Ok(subscription) => {
                    return Ok(ObserverConnection {
                        snapshot: None,
                        subscription,
                    });
                }
                Err(NotifierError::ResyncRequired { requested, oldest }) => {
                    info!(
                        %session,
                        requested,
                        oldest,
                        "Resume not possible; sending full snapshot"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        let subscription = self.notifier.subscribe(session, caller, ResumeFrom::Latest)?;
        let snapshot = self.snapshot(&caller).await?;
        Ok(ObserverConnection {
            snapshot: Some(snapshot),
            subscription,
        })
    }

    /// Everything `caller` may observe, at the current feed position.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::Internal`] on storage failure.
    pub async fn snapshot(&self, caller: &Caller) -> Result<FeedSnapshot, RegistrationError> {
        let position = self.notifier.head_position();
        let visibility = Visibility::for_caller(caller);
        let mut entries = Vec::new();

        for entity_type in [EntityType::Event, EntityType::Registration, EntityType::User] {
            for entity in self.repository.list(entity_type).await? {
                let key = entity.key();
                if !visibility.admits(&key) {
                    continue;
                }
                let version = entity.version();
                let payload = match entity {
                    Entity::Event(event) => ChangePayload::EventUpserted(event.summary()),
                    Entity::Registration(row) => ChangePayload::Registration(row.summary()),
                    Entity::User(user) => ChangePayload::UserUpserted(user.summary()),
                };
                entries.push(ChangeDraft::new(key, version, payload));
            }
        }

        Ok(FeedSnapshot { position, entries })
    }

    /// Spawn reconciliation and lease sweeping; both stop when `shutdown` fires.
    #[must_use]
    pub fn spawn_background(
        &self,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<(&'static str, JoinHandle<()>)> {
        let reconcile: Arc<dyn BackgroundJob> = Arc::new(ReconcileJob {
            synchronizer: Arc::clone(&self.synchronizer),
        });
        let sweep: Arc<dyn BackgroundJob> = Arc::new(LeaseSweepJob {
            ledger: Arc::clone(&self.ledger),
        });

        vec![
            (
                reconcile.name(),
                PeriodicTask::new(
                    Arc::clone(&reconcile),
                    self.config.sync.reconcile_interval(),
                    shutdown.subscribe(),
                )
                .spawn(),
            ),
            (
                sweep.name(),
                PeriodicTask::new(
                    Arc::clone(&sweep),
                    self.config.ledger.lease_ttl(),
                    shutdown.subscribe(),
                )
                .spawn(),
            ),
        ]
    }

    /// Provision a demo administrator and a few events.
    ///
    /// The administrator is written straight to the repository since there
    /// is no administrator yet to provision it. Returns the administrator.
    ///
    /// # Errors
    ///
    /// [`RegistrationError`] if any write fails.
    pub async fn seed_demo(&self) -> Result<Caller, RegistrationError> {
        let admin = UserAccount {
            id: UserId::new(),
            role: Role::Admin,
            name: "Campus Administrator".to_string(),
            email: "admin@campus.example".to_string(),
            student_id: "ADMIN-001".to_string(),
            department: "Student Affairs".to_string(),
            registered_events: BTreeSet::new(),
            created_at: self.clock.now(),
            version: 0,
        };
        let key = admin.key();
        let caller = Caller::admin(admin.id);
        self.repository
            .write(key, Mutation::Put(admin.into_entity()), ExpectedVersion::Absent)
            .await?;

        let demo = [
            ("Rust Systems Workshop", "2025-11-20", "14:00", "Lab 3", "technical", 30),
            ("Autumn Music Night", "2025-11-08", "19:30", "Main Auditorium", "cultural", 200),
            ("Inter-Faculty Football Cup", "2025-10-25", "09:00", "North Field", "sports", 22),
            ("Research Methods Seminar", "2025-11-03", "10:00", "Room B204", "academic", 40),
        ];
        for (title, date, time, location, category, capacity) in demo {
            self.lifecycle
                .create_event(
                    &caller,
                    EventDraft {
                        title: title.to_string(),
                        description: String::new(),
                        date: date.to_string(),
                        time: time.to_string(),
                        location: location.to_string(),
                        category: category.to_string(),
                        capacity,
                    },
                )
                .await?;
        }

        info!(admin = %caller.user_id, "Seeded demo data");
        Ok(caller)
    }
}

struct ReconcileJob {
    synchronizer: Arc<ConsistencySynchronizer>,
}

impl BackgroundJob for ReconcileJob {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.synchronizer
                .reconcile()
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    }
}

struct LeaseSweepJob {
    ledger: Arc<CapacityLedger>,
}

impl BackgroundJob for LeaseSweepJob {
    fn name(&self) -> &'static str {
        "lease_sweep"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let released = self.ledger.sweep_expired();
            if released > 0 {
                warn!(released, "Swept expired reservations");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use eventflow_runtime::background::await_shutdown;
    use eventflow_testing::{InMemoryRepository, StaticIdentity, test_clock};
    use std::time::Duration;

    fn app() -> EventFlowApp {
        EventFlowApp::new(
            Config::default(),
            Arc::new(InMemoryRepository::new()),
            Arc::new(test_clock()),
        )
    }

    #[tokio::test]
    async fn demo_seed_provisions_admin_and_events() {
        let app = app();
        let admin = app.seed_demo().await.unwrap();

        assert!(admin.is_admin());
        assert_eq!(app.lifecycle().list_events().await.unwrap().len(), 4);
        assert!(app.lifecycle().list_users(&admin).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn authentication_maps_rejection_to_unauthorized() {
        let app = app();
        let caller = Caller::participant(UserId::new());

        assert_eq!(
            app.authenticate(&StaticIdentity::authenticated(caller)).await,
            Ok(caller)
        );
        assert!(matches!(
            app.authenticate(&StaticIdentity::anonymous()).await,
            Err(RegistrationError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn background_jobs_stop_on_shutdown() {
        let app = app();
        let (shutdown, _) = broadcast::channel(1);
        let handles = app.spawn_background(&shutdown);
        let names: Vec<&str> = handles.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["reconcile", "lease_sweep"]);

        shutdown.send(()).unwrap();
        await_shutdown(handles, Duration::from_secs(1)).await;
    }
}
