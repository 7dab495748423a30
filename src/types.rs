#![forbid(unsafe_code)]

//! Record identifiers and audit stamps shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                $name(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

record_id!(
    /// Internal row identifier of a biosample.
    BiosampleId
);
record_id!(
    /// Internal row identifier of a storage location.
    LocationId
);
record_id!(
    /// Internal row identifier of a biotype.
    BiotypeId
);
record_id!(
    /// Internal row identifier of a study.
    StudyId
);
record_id!(
    /// Identifier of a study group.
    GroupId
);
record_id!(
    /// Identifier of a treatment phase.
    PhaseId
);

/// The acting user of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Login name, recorded in audit stamps.
    pub username: String,
    /// Departments/groups the user belongs to.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Whether the user bypasses rights checks.
    #[serde(default)]
    pub admin: bool,
}

impl User {
    /// Creates a regular user without group memberships.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            groups: Vec::new(),
            admin: false,
        }
    }

    /// Adds a group membership.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// Returns true when the user is a member of `group`.
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Creator/updater stamps carried by every persisted record.
///
/// `updated_at` is the last-modified value compared by the concurrency guard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    /// User that first saved the record.
    pub created_by: String,
    /// Time of the first save.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// User that last saved the record.
    pub updated_by: String,
    /// Time of the last save.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Audit {
    /// Stamps a record that is saved for the first time.
    pub fn created(user: &User, now: OffsetDateTime) -> Self {
        Self {
            created_by: user.username.clone(),
            created_at: now,
            updated_by: user.username.clone(),
            updated_at: now,
        }
    }

    /// Returns a copy stamped as updated by `user` at `now`.
    pub fn touched(&self, user: &User, now: OffsetDateTime) -> Self {
        Self {
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            updated_by: user.username.clone(),
            updated_at: now,
        }
    }
}

/// Stamps `audit` for a save happening at `now`: creates it for new records,
/// touches it for existing ones.
pub fn stamp(audit: &Option<Audit>, user: &User, now: OffsetDateTime) -> Audit {
    match audit {
        Some(existing) => existing.touched(user, now),
        None => Audit::created(user, now),
    }
}
