//! Change notifier: ordered, filtered, resumable fan-out of committed changes.
//!
//! # Architecture
//!
//! ```text
//! Coordinator / Lifecycle / Reconcile        ChangeNotifier                 Observers
//!              │                                   │                            │
//!              ├─ publish([ChangeDraft]) ─────────>│                            │
//!              │                                   ├─ drop stale versions       │
//!              │                                   ├─ assign feed positions     │
//!              │                                   ├─ append to retained log    │
//!              │                                   ├─ filter by visibility ────>│ admin: everything
//!              │                                   │                       ────>│ participant: events + own rows
//! ```
//!
//! Every observer has its own bounded channel. Publishing never waits on an
//! observer: a full or closed channel drops that observer only, and it comes
//! back by resubscribing from its last acknowledged position.
//!
//! Observers belong to a session. A session is bound to one identity; when a
//! different identity subscribes under the same session (or the session logs
//! out) every earlier subscription of that session is purged first, so no
//! change meant for one account reaches a dashboard now showing another.

use crate::config::NotifierConfig;
use eventflow_core::{
    Caller, ChangeDraft, EntityKey, RegistrationError, SessionId, SubscriptionId, VersionedChange,
    Visibility,
};
use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors from subscription management.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifierError {
    /// The requested position can no longer be resumed from
    #[error("Resync required: position {requested} is outside the retained feed (oldest {oldest})")]
    ResyncRequired {
        /// Position the observer asked to resume after
        requested: u64,
        /// Oldest position still retained
        oldest: u64,
    },

    /// No such subscription
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),
}

impl From<NotifierError> for RegistrationError {
    fn from(error: NotifierError) -> Self {
        Self::Internal(error.to_string())
    }
}

/// Where a new subscription starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Only changes published from now on
    Latest,
    /// Every retained change after this feed position, then live changes
    After(u64),
}

struct Observer {
    session: SessionId,
    visibility: Visibility,
    sender: mpsc::Sender<VersionedChange>,
    last_delivered: u64,
    last_acked: u64,
}

struct FeedState {
    head: u64,
    log: VecDeque<VersionedChange>,
    latest_versions: HashMap<EntityKey, u64>,
    observers: HashMap<SubscriptionId, Observer>,
    sessions: HashMap<SessionId, Caller>,
}

impl FeedState {
    fn oldest_retained(&self) -> u64 {
        self.log.front().map_or(self.head + 1, |change| change.position)
    }

    fn purge_session(&mut self, session: SessionId) -> usize {
        let before = self.observers.len();
        self.observers.retain(|_, observer| observer.session != session);
        before - self.observers.len()
    }
}

/// Fan-out hub for committed changes.
///
/// Cheap to clone; clones share the same feed.
#[derive(Clone)]
pub struct ChangeNotifier {
    state: Arc<Mutex<FeedState>>,
    retention: usize,
    channel_capacity: usize,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("retention", &self.retention)
            .field("channel_capacity", &self.channel_capacity)
            .finish_non_exhaustive()
    }
}

impl ChangeNotifier {
    /// Create a notifier with the configured retention and buffer sizes.
    #[must_use]
    pub fn new(config: &NotifierConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState {
                head: 0,
                log: VecDeque::with_capacity(config.retention),
                latest_versions: HashMap::new(),
                observers: HashMap::new(),
                sessions: HashMap::new(),
            })),
            retention: config.retention.max(1),
            channel_capacity: config.channel_capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish committed changes.
    ///
    /// Drafts whose version is not newer than the last published version of
    /// the same entity are suppressed while that version is still retained.
    /// Returns the changes actually appended to the feed.
    pub fn publish(&self, drafts: Vec<ChangeDraft>) -> Vec<VersionedChange> {
        if drafts.is_empty() {
            return Vec::new();
        }

        let mut state = self.lock();
        let mut published = Vec::with_capacity(drafts.len());
        let mut dropped: Vec<SubscriptionId> = Vec::new();

        for draft in drafts {
            if state
                .latest_versions
                .get(&draft.entity)
                .is_some_and(|latest| *latest >= draft.version)
            {
                debug!(entity = %draft.entity, version = draft.version, "Suppressed stale change");
                continue;
            }

            state.head += 1;
            let change = VersionedChange {
                position: state.head,
                entity_type: draft.entity.entity_type(),
                entity: draft.entity,
                version: draft.version,
                payload: draft.payload,
            };
            state.latest_versions.insert(change.entity, change.version);
            state.log.push_back(change.clone());
            while state.log.len() > self.retention {
                let Some(expired) = state.log.pop_front() else {
                    break;
                };
                // Versions are only tracked while their change is retained.
                if state.latest_versions.get(&expired.entity) == Some(&expired.version) {
                    state.latest_versions.remove(&expired.entity);
                }
            }

            for (id, observer) in &mut state.observers {
                if dropped.contains(id) {
                    continue;
                }
                if !observer.visibility.admits(&change.entity) {
                    observer.last_delivered = change.position;
                    continue;
                }
                match observer.sender.try_send(change.clone()) {
                    Ok(()) => observer.last_delivered = change.position,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            subscription = %id,
                            last_acked = observer.last_acked,
                            "Observer lagging; dropping subscription"
                        );
                        dropped.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(subscription = %id, "Observer disconnected; dropping subscription");
                        dropped.push(*id);
                    }
                }
            }

            published.push(change);
        }

        for id in dropped {
            state.observers.remove(&id);
            crate::metrics::record_observer_dropped();
        }

        published
    }

    /// Subscribe an observer.
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::ResyncRequired`] when `resume` points before
    /// the retained window, after the head of the feed, or at more backlog
    /// than the observer's channel holds.
    pub fn subscribe(
        &self,
        session: SessionId,
        caller: Caller,
        resume: ResumeFrom,
    ) -> Result<Subscription, NotifierError> {
        let mut state = self.lock();

        if let Some(previous) = state.sessions.get(&session).copied() {
            if previous != caller {
                let purged = state.purge_session(session);
                info!(
                    %session,
                    previous_user = %previous.user_id,
                    user_id = %caller.user_id,
                    purged,
                    "Identity changed; purged session subscriptions"
                );
            }
        }

        let visibility = Visibility::for_caller(&caller);
        let (sender, receiver) = mpsc::channel(self.channel_capacity);

        let start = match resume {
            ResumeFrom::Latest => state.head,
            ResumeFrom::After(position) => {
                let oldest = state.oldest_retained();
                if position > state.head || position + 1 < oldest {
                    return Err(NotifierError::ResyncRequired {
                        requested: position,
                        oldest,
                    });
                }
                let backlog: Vec<&VersionedChange> = state
                    .log
                    .iter()
                    .filter(|change| change.position > position)
                    .filter(|change| visibility.admits(&change.entity))
                    .collect();
                if backlog.len() > self.channel_capacity {
                    return Err(NotifierError::ResyncRequired {
                        requested: position,
                        oldest,
                    });
                }
                for change in backlog {
                    if sender.try_send(change.clone()).is_err() {
                        return Err(NotifierError::ResyncRequired {
                            requested: position,
                            oldest,
                        });
                    }
                }
                position
            }
        };

        let id = SubscriptionId::new();
        state.sessions.insert(session, caller);
        let head = state.head;
        state.observers.insert(
            id,
            Observer {
                session,
                visibility,
                sender,
                last_delivered: head,
                last_acked: start,
            },
        );
        debug!(
            subscription = %id,
            %session,
            user_id = %caller.user_id,
            from = start,
            "Observer subscribed"
        );

        Ok(Subscription {
            id,
            receiver,
            feed: Arc::downgrade(&self.state),
        })
    }

    /// Record that an observer has processed every change up to `position`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::UnknownSubscription`] if the subscription was
    /// dropped or never existed.
    pub fn acknowledge(&self, id: SubscriptionId, position: u64) -> Result<(), NotifierError> {
        let mut state = self.lock();
        let observer = state
            .observers
            .get_mut(&id)
            .ok_or(NotifierError::UnknownSubscription(id))?;
        observer.last_acked = observer.last_acked.max(position.min(observer.last_delivered));
        Ok(())
    }

    /// Last position acknowledged by an observer.
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::UnknownSubscription`] for unknown ids.
    pub fn last_acknowledged(&self, id: SubscriptionId) -> Result<u64, NotifierError> {
        self.lock()
            .observers
            .get(&id)
            .map(|observer| observer.last_acked)
            .ok_or(NotifierError::UnknownSubscription(id))
    }

    /// Remove a subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().observers.remove(&id).is_some()
    }

    /// Drop every subscription of a session and unbind its identity.
    ///
    /// Returns the number of subscriptions removed.
    pub fn logout(&self, session: SessionId) -> usize {
        let mut state = self.lock();
        state.sessions.remove(&session);
        let purged = state.purge_session(session);
        info!(%session, purged, "Session logged out");
        purged
    }

    /// Position of the most recently published change (`0` before the first)
    #[must_use]
    pub fn head_position(&self) -> u64 {
        self.lock().head
    }

    /// Oldest position still available for resumption
    #[must_use]
    pub fn oldest_retained(&self) -> u64 {
        self.lock().oldest_retained()
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().observers.len()
    }

    #[cfg(test)]
    fn tracked_versions(&self) -> usize {
        self.lock().latest_versions.len()
    }
}

/// A live, filtered change feed.
///
/// Yields changes in feed order. The stream ends when the notifier drops the
/// subscription (lagging observer, logout or identity change). Dropping the
/// `Subscription` unsubscribes it.
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<VersionedChange>,
    feed: Weak<Mutex<FeedState>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Subscription {
    /// Subscription id, used to acknowledge and unsubscribe
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next change; `None` once the subscription was dropped.
    pub async fn recv(&mut self) -> Option<VersionedChange> {
        self.receiver.recv().await
    }

    /// Take the next buffered change without waiting.
    pub fn try_recv(&mut self) -> Option<VersionedChange> {
        self.receiver.try_recv().ok()
    }

    /// Drain every buffered change.
    pub fn drain(&mut self) -> Vec<VersionedChange> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Stream for Subscription {
    type Item = VersionedChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observers
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use eventflow_core::{
        ChangePayload, EventId, RegistrationStatus, RegistrationSummary, UserId,
    };

    fn notifier(retention: usize, channel_capacity: usize) -> ChangeNotifier {
        ChangeNotifier::new(&NotifierConfig {
            retention,
            channel_capacity,
        })
    }

    fn deleted(event_id: EventId, version: u64) -> ChangeDraft {
        ChangeDraft::new(EntityKey::Event(event_id), version, ChangePayload::EventDeleted(event_id))
    }

    fn row(event_id: EventId, user_id: UserId, version: u64) -> ChangeDraft {
        ChangeDraft::new(
            EntityKey::Registration(event_id, user_id),
            version,
            ChangePayload::Registration(RegistrationSummary {
                event_id,
                user_id,
                status: RegistrationStatus::Confirmed,
                committed_at: version,
                cancel_reason: None,
            }),
        )
    }

    #[test]
    fn positions_increase_and_stale_versions_are_suppressed() {
        let notifier = notifier(16, 16);
        let event = EventId::new();

        let first = notifier.publish(vec![deleted(event, 2)]);
        let stale = notifier.publish(vec![deleted(event, 2), deleted(event, 1)]);
        let newer = notifier.publish(vec![deleted(event, 3)]);

        assert_eq!(first[0].position, 1);
        assert!(stale.is_empty());
        assert_eq!(newer[0].position, 2);
        assert_eq!(notifier.head_position(), 2);
    }

    #[test]
    fn version_tracking_is_bounded_by_retention() {
        let notifier = notifier(4, 16);
        for _ in 0..50 {
            let event = EventId::new();
            notifier.publish(vec![row(event, UserId::new(), 1), deleted(event, 2)]);
        }

        assert_eq!(notifier.head_position(), 100);
        assert!(notifier.tracked_versions() <= 4);
    }

    #[test]
    fn participant_only_sees_own_registrations() {
        let notifier = notifier(16, 16);
        let me = UserId::new();
        let other = UserId::new();
        let event = EventId::new();
        let mut sub = notifier
            .subscribe(SessionId::new(), Caller::participant(me), ResumeFrom::Latest)
            .unwrap();

        notifier.publish(vec![row(event, other, 1), row(event, me, 1), deleted(event, 1)]);

        let seen: Vec<EntityKey> = sub.drain().into_iter().map(|c| c.entity).collect();
        assert_eq!(seen, vec![EntityKey::Registration(event, me), EntityKey::Event(event)]);
    }

    #[test]
    fn resume_replays_after_position() {
        let notifier = notifier(16, 16);
        let caller = Caller::admin(UserId::new());
        let events: Vec<EventId> = (0..4).map(|_| EventId::new()).collect();
        notifier.publish(events.iter().map(|e| deleted(*e, 1)).collect());

        let mut sub = notifier
            .subscribe(SessionId::new(), caller, ResumeFrom::After(2))
            .unwrap();

        let positions: Vec<u64> = sub.drain().into_iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![3, 4]);
    }

    #[test]
    fn resume_outside_retention_requires_resync() {
        let notifier = notifier(2, 16);
        let caller = Caller::admin(UserId::new());
        notifier.publish((0..5).map(|_| deleted(EventId::new(), 1)).collect());

        let err = notifier
            .subscribe(SessionId::new(), caller, ResumeFrom::After(1))
            .unwrap_err();
        assert_eq!(err, NotifierError::ResyncRequired { requested: 1, oldest: 4 });

        assert!(notifier.subscribe(SessionId::new(), caller, ResumeFrom::After(3)).is_ok());
        assert!(matches!(
            notifier.subscribe(SessionId::new(), caller, ResumeFrom::After(9)),
            Err(NotifierError::ResyncRequired { .. })
        ));
    }

    #[test]
    fn lagging_observer_is_dropped_without_affecting_others() {
        let notifier = notifier(16, 1);
        let caller = Caller::admin(UserId::new());
        let slow = notifier
            .subscribe(SessionId::new(), caller, ResumeFrom::Latest)
            .unwrap();
        let mut fast = notifier
            .subscribe(SessionId::new(), caller, ResumeFrom::Latest)
            .unwrap();

        notifier.publish(vec![deleted(EventId::new(), 1)]);
        assert_eq!(fast.drain().len(), 1);
        notifier.publish(vec![deleted(EventId::new(), 1)]);

        assert!(notifier.last_acknowledged(slow.id()).is_err());
        assert_eq!(fast.drain().len(), 1);
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[test]
    fn identity_change_purges_session() {
        let notifier = notifier(16, 16);
        let session = SessionId::new();
        let alice = Caller::participant(UserId::new());
        let bob = Caller::participant(UserId::new());

        let mut old = notifier.subscribe(session, alice, ResumeFrom::Latest).unwrap();
        let _new = notifier.subscribe(session, bob, ResumeFrom::Latest).unwrap();

        assert_eq!(notifier.subscriber_count(), 1);
        assert!(old.try_recv().is_none());
        assert!(notifier.last_acknowledged(old.id()).is_err());
    }

    #[test]
    fn logout_removes_all_session_subscriptions() {
        let notifier = notifier(16, 16);
        let session = SessionId::new();
        let caller = Caller::participant(UserId::new());
        let _a = notifier.subscribe(session, caller, ResumeFrom::Latest).unwrap();
        let _b = notifier.subscribe(session, caller, ResumeFrom::Latest).unwrap();

        assert_eq!(notifier.logout(session), 2);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn acknowledge_never_passes_delivered_position() {
        let notifier = notifier(16, 16);
        let sub = notifier
            .subscribe(SessionId::new(), Caller::admin(UserId::new()), ResumeFrom::Latest)
            .unwrap();
        notifier.publish(vec![deleted(EventId::new(), 1)]);

        notifier.acknowledge(sub.id(), 10).unwrap();
        assert_eq!(notifier.last_acknowledged(sub.id()).unwrap(), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let notifier = notifier(16, 16);
        let sub = notifier
            .subscribe(SessionId::new(), Caller::admin(UserId::new()), ResumeFrom::Latest)
            .unwrap();
        assert_eq!(notifier.subscriber_count(), 1);
        drop(sub);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscription_is_a_stream() {
        use futures::StreamExt;

        let notifier = notifier(16, 16);
        let mut sub = notifier
            .subscribe(SessionId::new(), Caller::admin(UserId::new()), ResumeFrom::Latest)
            .unwrap();
        notifier.publish(vec![deleted(EventId::new(), 1)]);

        let change = sub.next().await.unwrap();
        assert_eq!(change.position, 1);
    }
}
