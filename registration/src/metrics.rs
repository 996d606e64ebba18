//! Business metrics for the registration system.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `eventflow_registrations_total{outcome}` - Registration requests by outcome
//! - `eventflow_cancellations_total{reason}` - Cancellations by reason
//! - `eventflow_reconcile_repairs_total{kind}` - Repairs made by reconciliation
//! - `eventflow_leases_expired_total` - Reservations released by lease expiry
//! - `eventflow_observers_dropped_total` - Observers dropped for lagging or disconnecting
//! - `eventflow_events_created_total` - Events created
//!
//! ## Gauges
//! - `eventflow_capacity_remaining{event_id}` - Free slots per event
//!
//! ## Histograms
//! - `eventflow_registration_duration_seconds` - End-to-end registration latency

use eventflow_core::{CancelReason, EventId};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use std::time::Duration;

/// Initialize and register all business metrics descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "eventflow_registrations_total",
        "Registration requests by outcome (confirmed, capacity_exceeded, duplicate, unavailable, rejected)"
    );
    describe_histogram!(
        "eventflow_registration_duration_seconds",
        "Time taken to process a registration request"
    );
    describe_counter!(
        "eventflow_cancellations_total",
        "Cancelled registrations by reason"
    );
    describe_counter!(
        "eventflow_reconcile_repairs_total",
        "Divergences repaired by reconciliation, by kind"
    );
    describe_counter!(
        "eventflow_leases_expired_total",
        "Uncommitted reservations released because their lease expired"
    );
    describe_counter!(
        "eventflow_observers_dropped_total",
        "Observers dropped because their channel was full or closed"
    );
    describe_counter!(
        "eventflow_events_created_total",
        "Total number of events created"
    );
    describe_gauge!(
        "eventflow_capacity_remaining",
        "Free slots per event"
    );

    tracing::info!("Business metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Outcome label of a registration request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Registration committed
    Confirmed,
    /// Event full
    CapacityExceeded,
    /// Already registered
    Duplicate,
    /// Retries exhausted
    Unavailable,
    /// Any other rejection (validation, authorization, missing records)
    Rejected,
}

impl RegistrationOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::Duplicate => "duplicate",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
        }
    }
}

/// Record the outcome and latency of a registration request.
pub fn record_registration(outcome: RegistrationOutcome, elapsed: Duration) {
    metrics::counter!("eventflow_registrations_total", "outcome" => outcome.as_str()).increment(1);
    metrics::histogram!("eventflow_registration_duration_seconds").record(elapsed.as_secs_f64());
    tracing::debug!(outcome = outcome.as_str(), "Recorded registration metric");
}

/// Record a committed cancellation.
pub fn record_cancellation(reason: CancelReason) {
    metrics::counter!("eventflow_cancellations_total", "reason" => reason.as_str()).increment(1);
}

/// Record one reconciliation repair.
pub fn record_repair(kind: &'static str) {
    metrics::counter!("eventflow_reconcile_repairs_total", "kind" => kind).increment(1);
}

/// Record reservations released by lease expiry.
pub fn record_leases_expired(count: usize) {
    metrics::counter!("eventflow_leases_expired_total").increment(count as u64);
}

/// Record an observer dropped by the notifier.
pub fn record_observer_dropped() {
    metrics::counter!("eventflow_observers_dropped_total").increment(1);
}

/// Record an event creation.
pub fn record_event_created() {
    metrics::counter!("eventflow_events_created_total").increment(1);
}

/// Record the free slots of an event.
pub fn record_capacity_remaining(event_id: EventId, remaining: u32) {
    metrics::gauge!("eventflow_capacity_remaining", "event_id" => event_id.to_string())
        .set(f64::from(remaining));
}
