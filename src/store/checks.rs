//! Checks a backend runs inside its atomic write section.

use tracing::debug;

use super::{BiosampleQuery, Expected, Record, RecordKey, Write};
use crate::error::{Result, TrackError, ValidationKind};
use crate::model::Biosample;

/// Committed state as seen from inside a backend's write section.
pub(crate) trait CommitView {
    /// One record.
    fn record(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// Biosamples matching `query`.
    fn biosamples(&self, query: &BiosampleQuery) -> Result<Vec<Biosample>>;
}

/// Refuses the write-set when a record moved past the stamp it was read with.
///
/// Records that vanished are left to the write itself, which reports them as
/// missing.
pub(crate) fn verify_expected(view: &dyn CommitView, expected: &[Expected]) -> Result<()> {
    for expectation in expected {
        let Some(current) = view.record(&expectation.key)? else {
            continue;
        };
        let Some(audit) = current.audit() else {
            continue;
        };
        if audit.updated_at != expectation.updated_at {
            return Err(TrackError::Conflict {
                entity: current.entity(),
                record: current.label(),
                other_editor: audit.updated_by.clone(),
                committed_at: audit.updated_at,
                loaded_at: expectation.updated_at,
            });
        }
    }
    debug!(checked = expected.len(), "store.check.expected");
    Ok(())
}

/// Checks every biosample written by `writes` against the state the writes
/// produced: sample ids stay unique and grid slots are held by one sample,
/// or by samples sharing one multi-occupancy container.
pub(crate) fn verify_biosamples(view: &dyn CommitView, writes: &[Write]) -> Result<()> {
    for write in writes {
        let (Write::Insert(Record::Biosample(sample)) | Write::Update(Record::Biosample(sample))) =
            write
        else {
            continue;
        };
        if !sample.sample_id.is_empty() {
            let holders = view.biosamples(&BiosampleQuery::SampleId(sample.sample_id.clone()))?;
            if holders.iter().any(|other| other.id != sample.id) {
                return Err(TrackError::validation(
                    sample.label(),
                    ValidationKind::DuplicateSampleId(sample.sample_id.clone()),
                ));
            }
        }
        let Some((location_id, pos)) = sample.placement() else {
            continue;
        };
        let neighbours = view.biosamples(&BiosampleQuery::InLocation(location_id))?;
        let Some(occupant) = neighbours
            .iter()
            .find(|other| other.id != sample.id && other.pos == pos && !sample.shares_slot_with(other))
        else {
            continue;
        };
        let (location, label) = match view.record(&RecordKey::Location(location_id))? {
            Some(Record::Location(location)) => {
                let label = location.format_position(pos);
                (location.name, label)
            }
            _ => (format!("location {location_id}"), pos.to_string()),
        };
        return Err(TrackError::validation(
            sample.label(),
            ValidationKind::PositionOccupied {
                location,
                label,
                occupant: occupant
                    .container_id()
                    .map_or_else(|| occupant.label(), str::to_string),
            },
        ));
    }
    Ok(())
}
