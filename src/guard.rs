//! Optimistic concurrency guard.
//!
//! Every already-persisted record of a batch carries the `updated_at` stamp it
//! was loaded with. Before anything is written the guard re-reads the
//! committed stamp; a strictly newer committed stamp means someone else saved
//! in between and the whole batch is refused. A copy without stamps of a
//! record that is already committed counts as loaded before any save.
//!
//! The checked stamps are registered on the transaction, which verifies them
//! again inside the backend's atomic commit.

use time::OffsetDateTime;
use tracing::debug;

use crate::error::{Result, TrackError};
use crate::model::{Biosample, Location, Study};
use crate::store::{RecordKey, Transaction};
use crate::types::Audit;

/// A record kind the guard can check.
pub trait Tracked {
    /// Name used in conflict errors.
    const ENTITY: &'static str;

    /// Primary key.
    fn record_key(&self) -> RecordKey;

    /// Stamps carried by the in-memory copy.
    fn audit(&self) -> Option<&Audit>;

    /// Label used in conflict errors.
    fn label(&self) -> String;
}

impl Tracked for Biosample {
    const ENTITY: &'static str = "biosample";

    fn record_key(&self) -> RecordKey {
        RecordKey::Biosample(self.id)
    }

    fn audit(&self) -> Option<&Audit> {
        self.audit.as_ref()
    }

    fn label(&self) -> String {
        Biosample::label(self)
    }
}

impl Tracked for Location {
    const ENTITY: &'static str = "location";

    fn record_key(&self) -> RecordKey {
        RecordKey::Location(self.id)
    }

    fn audit(&self) -> Option<&Audit> {
        self.audit.as_ref()
    }

    fn label(&self) -> String {
        self.name.clone()
    }
}

impl Tracked for Study {
    const ENTITY: &'static str = "study";

    fn record_key(&self) -> RecordKey {
        RecordKey::Study(self.id)
    }

    fn audit(&self) -> Option<&Audit> {
        self.audit.as_ref()
    }

    fn label(&self) -> String {
        self.study_code.clone()
    }
}

/// Last-modified comparison over a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcurrencyGuard;

impl ConcurrencyGuard {
    /// Checks every record of `batch` against its committed copy.
    ///
    /// Records with no committed copy are new and skipped. A record whose
    /// committed row vanished is left for the caller's own existence checks.
    pub fn check<T: Tracked>(&self, tx: &mut Transaction, batch: &[T]) -> Result<()> {
        let mut checked = 0usize;
        for record in batch {
            let key = record.record_key();
            let committed = tx.fetch_committed(&key)?;
            let Some(current) = committed.as_ref().and_then(|r| r.audit()) else {
                continue;
            };
            checked += 1;
            let loaded_at = record
                .audit()
                .map_or(OffsetDateTime::UNIX_EPOCH, |loaded| loaded.updated_at);
            if current.updated_at > loaded_at {
                return Err(TrackError::Conflict {
                    entity: T::ENTITY,
                    record: record.label(),
                    other_editor: current.updated_by.clone(),
                    committed_at: current.updated_at,
                    loaded_at,
                });
            }
            tx.expect_unchanged(key, current.updated_at);
        }
        debug!(entity = T::ENTITY, checked, "guard.check");
        Ok(())
    }
}
