//! Identity collaborator contract.
//!
//! Authentication happens outside the registration system. A provider is
//! consulted once per request and yields the explicit [`Caller`] passed to
//! every operation.

use crate::types::Caller;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// The request carried no valid identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unauthenticated: {reason}")]
pub struct Unauthenticated {
    /// Why authentication failed
    pub reason: String,
}

impl Unauthenticated {
    /// Build the error
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Resolves the identity behind the current request.
pub trait IdentityProvider: Send + Sync {
    /// Authenticate the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Unauthenticated`] when no valid identity is present.
    fn authenticate(&self)
    -> Pin<Box<dyn Future<Output = Result<Caller, Unauthenticated>> + Send + '_>>;
}
