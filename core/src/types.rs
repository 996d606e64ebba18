//! Identifiers and caller context.
//!
//! Every identifier is a UUID newtype so an `EventId` can never be passed where
//! a `UserId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an event
    EventId
);

uuid_id!(
    /// Unique identifier for a user account (participant or administrator)
    UserId
);

uuid_id!(
    /// Unique identifier for a provisional slot reservation
    ReservationId
);

uuid_id!(
    /// Unique identifier for one observer subscription
    SubscriptionId
);

uuid_id!(
    /// Unique identifier for an observer session (one connected dashboard)
    SessionId
);

/// Role of an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Manages events and accounts, sees every feed
    Admin,
    /// Registers for events, sees public events and their own registrations
    Participant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Participant => write!(f, "participant"),
        }
    }
}

/// Authenticated caller context.
///
/// Passed explicitly to every coordinator and lifecycle operation; there is no
/// process-wide "current user".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    /// Authenticated account id
    pub user_id: UserId,
    /// Role of the account
    pub role: Role,
}

impl Caller {
    /// Caller context for an administrator
    #[must_use]
    pub const fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }

    /// Caller context for a participant
    #[must_use]
    pub const fn participant(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Participant,
        }
    }

    /// Whether the caller holds the admin role
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }
}

/// Event category, as offered by the administration form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Lectures, seminars, workshops
    Academic,
    /// Festivals, performances
    Cultural,
    /// Tournaments, matches
    Sports,
    /// Hackathons, tech talks
    Technical,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Academic => "academic",
            Self::Cultural => "cultural",
            Self::Sports => "sports",
            Self::Technical => "technical",
        };
        f.write_str(name)
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "academic" => Ok(Self::Academic),
            "cultural" => Ok(Self::Cultural),
            "sports" => Ok(Self::Sports),
            "technical" => Ok(Self::Technical),
            other => Err(format!("unknown category '{other}'")),
        }
    }
}
