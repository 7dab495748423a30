//! Rights collaborator.
//!
//! The engine asks a [`Rights`] implementation before every mutation and turns
//! a refusal into [`TrackError::Rights`].

use crate::error::{Result, TrackError};
use crate::model::{Biosample, Biotype, Location, Privacy, Study};
use crate::types::User;

/// A record presented to the rights collaborator.
#[derive(Debug, Clone, Copy)]
pub enum Entity<'a> {
    /// A biosample.
    Biosample(&'a Biosample),
    /// A storage location.
    Location(&'a Location),
    /// A biotype.
    Biotype(&'a Biotype),
    /// A study.
    Study(&'a Study),
}

impl Entity<'_> {
    /// Label used in errors.
    pub fn label(&self) -> String {
        match self {
            Entity::Biosample(b) => b.label(),
            Entity::Location(l) => format!("location '{}'", l.name),
            Entity::Biotype(t) => format!("biotype '{}'", t.name),
            Entity::Study(s) => format!("study {}", s.study_code),
        }
    }
}

/// Read/edit/delete permission checks.
pub trait Rights: Send + Sync {
    /// Whether `user` may see `entity`.
    fn can_read(&self, entity: Entity<'_>, user: &User) -> bool;
    /// Whether `user` may create or modify `entity`.
    fn can_edit(&self, entity: Entity<'_>, user: &User) -> bool;
    /// Whether `user` may delete `entity`.
    fn can_delete(&self, entity: Entity<'_>, user: &User) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Rights for AllowAll {
    fn can_read(&self, _: Entity<'_>, _: &User) -> bool {
        true
    }

    fn can_edit(&self, _: Entity<'_>, _: &User) -> bool {
        true
    }

    fn can_delete(&self, _: Entity<'_>, _: &User) -> bool {
        true
    }
}

/// Group-based policy.
///
/// Admins may do anything. Restricted locations are editable by their owning
/// group only, and private ones are hidden from everyone else. Biotypes and
/// studies need membership of `curators`. A saved biosample may be deleted by
/// the user who created it.
#[derive(Debug, Clone)]
pub struct GroupRights {
    curators: String,
}

impl GroupRights {
    /// Policy whose schema editors belong to `curators`.
    pub fn new(curators: impl Into<String>) -> Self {
        Self {
            curators: curators.into(),
        }
    }

    fn owns(location: &Location, user: &User) -> bool {
        location
            .owner_group
            .as_deref()
            .is_some_and(|group| user.in_group(group))
    }
}

impl Rights for GroupRights {
    fn can_read(&self, entity: Entity<'_>, user: &User) -> bool {
        match entity {
            _ if user.admin => true,
            Entity::Location(l) if l.privacy == Privacy::Private => Self::owns(l, user),
            _ => true,
        }
    }

    fn can_edit(&self, entity: Entity<'_>, user: &User) -> bool {
        match entity {
            _ if user.admin => true,
            Entity::Location(l) if l.privacy.is_restricted() => Self::owns(l, user),
            Entity::Location(_) | Entity::Biosample(_) => true,
            Entity::Biotype(_) | Entity::Study(_) => user.in_group(&self.curators),
        }
    }

    fn can_delete(&self, entity: Entity<'_>, user: &User) -> bool {
        match entity {
            _ if user.admin => true,
            Entity::Biosample(b) => b
                .audit
                .as_ref()
                .is_some_and(|audit| audit.created_by == user.username),
            other => self.can_edit(other, user),
        }
    }
}

/// Fails with [`TrackError::Rights`] unless `user` may edit `entity`.
pub fn ensure_edit(rights: &dyn Rights, entity: Entity<'_>, user: &User) -> Result<()> {
    if rights.can_edit(entity, user) {
        Ok(())
    } else {
        Err(refused("edit", entity, user))
    }
}

/// Fails with [`TrackError::Rights`] unless `user` may delete `entity`.
pub fn ensure_delete(rights: &dyn Rights, entity: Entity<'_>, user: &User) -> Result<()> {
    if rights.can_delete(entity, user) {
        Ok(())
    } else {
        Err(refused("delete", entity, user))
    }
}

fn refused(action: &'static str, entity: Entity<'_>, user: &User) -> TrackError {
    TrackError::Rights {
        action,
        record: entity.label(),
        user: user.username.clone(),
    }
}
