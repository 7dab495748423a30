#![forbid(unsafe_code)]

//! Location hierarchy and grid positions.
//!
//! [`LocationGrid`] validates location saves (naming, type, privacy, grid
//! dimensions, acyclic parent chain), remaps occupied positions when a grid is
//! resized and checks that biosample placements never collide.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::allocator::SequenceAllocator;
use crate::clock::AuditClock;
use crate::config::GridConfig;
use crate::error::{Result, TrackError, ValidationKind};
use crate::guard::ConcurrencyGuard;
use crate::model::{Biosample, Location, NO_POSITION};
use crate::rights::{self, Entity, Rights};
use crate::store::{BiosampleQuery, LocationQuery, Record, RecordKey, Transaction};
use crate::types::{stamp, LocationId, User};

/// Outcome of [`LocationGrid::persist_locations`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationReport {
    /// Locations saved for the first time.
    pub inserted: usize,
    /// Existing locations updated.
    pub updated: usize,
    /// Biosamples whose position changed because their grid was resized.
    pub relocated: usize,
}

/// Who occupies a slot.
struct Occupant {
    container_id: Option<String>,
    shareable: bool,
    label: String,
}

impl Occupant {
    fn of(sample: &Biosample) -> Self {
        Self {
            container_id: sample.container_id().map(str::to_string),
            shareable: sample
                .container
                .as_ref()
                .is_some_and(|c| c.container_type.is_multiple()),
            label: sample.label(),
        }
    }

    fn describe(&self) -> String {
        self.container_id.clone().unwrap_or_else(|| self.label.clone())
    }

    fn admits(&self, other: &Occupant) -> bool {
        self.shareable
            && other.shareable
            && self.container_id.is_some()
            && self.container_id == other.container_id
    }
}

/// Location rules and position arithmetic.
pub struct LocationGrid {
    config: GridConfig,
    allocator: Arc<SequenceAllocator>,
    rights: Arc<dyn Rights>,
    clock: Arc<AuditClock>,
}

impl LocationGrid {
    /// Creates the service.
    pub fn new(
        config: GridConfig,
        allocator: Arc<SequenceAllocator>,
        rights: Arc<dyn Rights>,
        clock: Arc<AuditClock>,
    ) -> Self {
        Self {
            config,
            allocator,
            rights,
            clock,
        }
    }

    /// Validates and stages a batch of locations, remapping the positions of
    /// samples stored in resized grids.
    ///
    /// On success `batch` is updated with allocated codes and audit stamps.
    /// On failure nothing is staged and `batch` is untouched.
    pub fn persist_locations(
        &self,
        tx: &mut Transaction,
        user: &User,
        batch: &mut [Location],
    ) -> Result<LocationReport> {
        ConcurrencyGuard.check(tx, batch)?;
        for location in batch.iter() {
            rights::ensure_edit(self.rights.as_ref(), Entity::Location(location), user)?;
        }
        let mut work: Vec<Location> = batch.to_vec();
        self.validate_batch(tx, &work)?;

        let mut relocated: Vec<Biosample> = Vec::new();
        for location in &work {
            if let Some(old) = tx.committed_location(location.id)? {
                if old.labeling != location.labeling
                    || old.rows != location.rows
                    || old.cols != location.cols
                {
                    relocated.extend(self.plan_resize(tx, &old, location)?);
                }
            }
        }

        let mut report = LocationReport::default();
        for location in &mut work {
            if location.code.as_deref().map_or(true, str::is_empty) {
                location.code = Some(self.allocator.next_location_code()?);
            }
            let previous = tx.location(location.id)?;
            let existed = previous.is_some();
            let base = previous.and_then(|p| p.audit);
            location.audit = Some(stamp(&base, user, self.clock.tick()));
            tx.put(Record::Location(location.clone()))?;
            if existed {
                report.updated += 1;
            } else {
                report.inserted += 1;
            }
        }
        for mut sample in relocated {
            sample.audit = Some(stamp(&sample.audit, user, self.clock.tick()));
            tx.update(Record::Biosample(sample))?;
            report.relocated += 1;
        }
        batch.clone_from_slice(&work);
        info!(
            inserted = report.inserted,
            updated = report.updated,
            relocated = report.relocated,
            "grid.persist.done"
        );
        Ok(report)
    }

    /// Checks every location rule against the batch and committed state.
    pub fn validate_batch(&self, tx: &Transaction, batch: &[Location]) -> Result<()> {
        let in_batch: FxHashMap<LocationId, &Location> =
            batch.iter().map(|l| (l.id, l)).collect();
        if in_batch.len() < batch.len() {
            let mut seen = HashSet::new();
            if let Some(repeated) = batch.iter().find(|l| !seen.insert(l.id)) {
                return Err(TrackError::validation(
                    &repeated.name,
                    ValidationKind::RepeatedInBatch(format!("location {}", repeated.id)),
                ));
            }
        }
        let mut sibling_names: HashSet<(Option<LocationId>, String)> = HashSet::new();
        for location in batch {
            validate_fields(location)?;
            let key = (location.parent, location.name.trim().to_lowercase());
            if !sibling_names.insert(key) {
                return Err(duplicate_name(location, "another location of this batch"));
            }
            let siblings = tx.query_locations(&LocationQuery::Named {
                parent: location.parent,
                name: location.name.trim().to_string(),
            })?;
            if let Some(other) = siblings
                .iter()
                .find(|s| s.id != location.id && !in_batch.contains_key(&s.id))
            {
                return Err(duplicate_name(location, &format!("location {}", other.id)));
            }
            self.check_chain(tx, location, &in_batch)?;
        }
        Ok(())
    }

    /// Walks the parent chain of `location`, resolving batch members first.
    fn check_chain(
        &self,
        tx: &Transaction,
        location: &Location,
        in_batch: &FxHashMap<LocationId, &Location>,
    ) -> Result<()> {
        let mut seen = HashSet::from([location.id]);
        let mut next = location.parent;
        let mut depth = 0usize;
        while let Some(id) = next {
            depth += 1;
            if depth > self.config.max_depth {
                return Err(TrackError::validation(
                    &location.name,
                    ValidationKind::HierarchyTooDeep(self.config.max_depth),
                ));
            }
            if !seen.insert(id) {
                return Err(TrackError::validation(
                    &location.name,
                    ValidationKind::Cycle(location.name.clone()),
                ));
            }
            next = match in_batch.get(&id) {
                Some(parent) => parent.parent,
                None => match tx.location(id)? {
                    Some(parent) => parent.parent,
                    None => {
                        return Err(TrackError::validation(
                            &location.name,
                            ValidationKind::MissingLocation(id.0),
                        ))
                    }
                },
            };
        }
        Ok(())
    }

    /// Computes the new positions of the samples stored in `old` when it is
    /// saved as `new`. Returns only the samples whose position changes.
    pub fn plan_resize(
        &self,
        tx: &Transaction,
        old: &Location,
        new: &Location,
    ) -> Result<Vec<Biosample>> {
        let occupants = tx.query_biosamples(&BiosampleQuery::InLocation(old.id))?;
        let mut changed = Vec::new();
        match (old.has_grid(), new.has_grid()) {
            (true, true) => {
                let mut overflow: Option<(i32, i32)> = None;
                let mut moves = Vec::new();
                for sample in &occupants {
                    let Some((row, col)) = old.row_col(sample.pos) else {
                        continue;
                    };
                    if row >= new.rows || col >= new.cols {
                        let (r, c) = overflow.unwrap_or((0, 0));
                        overflow = Some((r.max(row + 1), c.max(col + 1)));
                    }
                    moves.push((sample, row, col));
                }
                if let Some((min_rows, min_cols)) = overflow {
                    return Err(TrackError::validation(
                        &new.name,
                        ValidationKind::GridTooSmall {
                            location: new.name.clone(),
                            min_rows: min_rows.max(new.rows),
                            min_cols: min_cols.max(new.cols),
                        },
                    ));
                }
                for (sample, row, col) in moves {
                    let pos = new.pos_of(row, col).unwrap_or(NO_POSITION);
                    if pos != sample.pos {
                        let mut moved = sample.clone();
                        moved.pos = pos;
                        changed.push(moved);
                    }
                }
            }
            (true, false) => {
                for sample in occupants.iter().filter(|s| s.pos != NO_POSITION) {
                    let mut moved = sample.clone();
                    moved.pos = NO_POSITION;
                    changed.push(moved);
                }
            }
            (false, true) => {
                // Samples sharing a multi-occupancy container share a slot.
                let mut slots: BTreeMap<String, i32> = BTreeMap::new();
                let mut assigned = Vec::with_capacity(occupants.len());
                for sample in &occupants {
                    let occupant = Occupant::of(sample);
                    let slot_key = match (&occupant.container_id, occupant.shareable) {
                        (Some(id), true) => format!("container:{id}"),
                        _ => format!("sample:{}", sample.id),
                    };
                    let next = slots.len() as i32;
                    let pos = *slots.entry(slot_key).or_insert(next);
                    assigned.push((sample, pos));
                }
                if slots.len() as i64 > i64::from(new.capacity()) {
                    return Err(TrackError::validation(
                        &new.name,
                        ValidationKind::GridOverflow {
                            location: new.name.clone(),
                            count: slots.len(),
                            capacity: new.capacity(),
                        },
                    ));
                }
                for (sample, pos) in assigned {
                    let mut moved = sample.clone();
                    moved.pos = pos;
                    changed.push(moved);
                }
            }
            (false, false) => {}
        }
        debug!(
            location = %new.name,
            occupants = occupants.len(),
            moved = changed.len(),
            "grid.resize"
        );
        Ok(changed)
    }

    /// Validates the placement of every biosample of a batch.
    ///
    /// Positions in locations without a grid are cleared. Slots are checked
    /// against committed occupants outside the batch and against earlier
    /// members of the batch.
    pub fn check_placements(&self, tx: &Transaction, batch: &mut [Biosample]) -> Result<()> {
        let batch_ids: HashSet<_> = batch.iter().map(|b| b.id).collect();
        let mut locations: FxHashMap<LocationId, Location> = FxHashMap::default();
        let mut slots: FxHashMap<(LocationId, i32), Occupant> = FxHashMap::default();

        for sample in batch.iter_mut() {
            let Some(location_id) = sample.location else {
                sample.pos = NO_POSITION;
                continue;
            };
            if !locations.contains_key(&location_id) {
                let location = tx.location(location_id)?.ok_or_else(|| {
                    TrackError::validation(
                        sample.label(),
                        ValidationKind::MissingLocation(location_id.0),
                    )
                })?;
                for other in tx.query_biosamples(&BiosampleQuery::InLocation(location_id))? {
                    if batch_ids.contains(&other.id) || other.pos < 0 {
                        continue;
                    }
                    slots.insert((location_id, other.pos), Occupant::of(&other));
                }
                locations.insert(location_id, location);
            }
            let Some(location) = locations.get(&location_id) else {
                continue;
            };
            if !location.has_grid() {
                sample.pos = NO_POSITION;
                continue;
            }
            if sample.pos == NO_POSITION {
                continue;
            }
            if sample.pos < 0 || sample.pos >= location.capacity() {
                return Err(TrackError::validation(
                    sample.label(),
                    ValidationKind::PositionOutOfRange {
                        location: location.name.clone(),
                        pos: sample.pos,
                        capacity: location.capacity(),
                    },
                ));
            }
            let incoming = Occupant::of(sample);
            match slots.get(&(location_id, sample.pos)) {
                Some(existing) if !existing.admits(&incoming) => {
                    return Err(TrackError::validation(
                        sample.label(),
                        ValidationKind::PositionOccupied {
                            location: location.name.clone(),
                            label: location.format_position(sample.pos),
                            occupant: existing.describe(),
                        },
                    ));
                }
                Some(_) => {}
                None => {
                    slots.insert((location_id, sample.pos), incoming);
                }
            }
        }
        Ok(())
    }

    /// Slash-separated names from the root down to `id`.
    pub fn full_path(&self, tx: &Transaction, id: LocationId) -> Result<String> {
        let mut names = Vec::new();
        let mut next = Some(id);
        while let Some(current) = next {
            if names.len() > self.config.max_depth {
                return Err(TrackError::validation(
                    id.to_string(),
                    ValidationKind::HierarchyTooDeep(self.config.max_depth),
                ));
            }
            let location = tx
                .location(current)?
                .ok_or_else(|| TrackError::not_found("location", current))?;
            names.push(location.name);
            next = location.parent;
        }
        names.reverse();
        Ok(names.join("/"))
    }

    /// Unoccupied slots of a gridded location, in ascending order.
    pub fn free_positions(&self, tx: &Transaction, id: LocationId) -> Result<Vec<i32>> {
        let location = tx
            .location(id)?
            .ok_or_else(|| TrackError::not_found("location", id))?;
        let taken: HashSet<i32> = tx
            .query_biosamples(&BiosampleQuery::InLocation(id))?
            .into_iter()
            .map(|b| b.pos)
            .collect();
        Ok((0..location.capacity())
            .filter(|pos| !taken.contains(pos))
            .collect())
    }

    /// Stages deletion of empty locations.
    pub fn delete_locations(
        &self,
        tx: &mut Transaction,
        user: &User,
        ids: &[LocationId],
    ) -> Result<usize> {
        let doomed: HashSet<LocationId> = ids.iter().copied().collect();
        for &id in ids {
            let location = tx
                .location(id)?
                .ok_or_else(|| TrackError::not_found("location", id))?;
            rights::ensure_delete(self.rights.as_ref(), Entity::Location(&location), user)?;
            let has_children = tx
                .query_locations(&LocationQuery::ChildrenOf(Some(id)))?
                .iter()
                .any(|child| !doomed.contains(&child.id));
            let has_samples = !tx
                .query_biosamples(&BiosampleQuery::InLocation(id))?
                .is_empty();
            if has_children || has_samples {
                return Err(TrackError::validation(
                    &location.name,
                    ValidationKind::NotEmpty(location.name.clone()),
                ));
            }
        }
        for &id in ids {
            tx.delete(RecordKey::Location(id))?;
        }
        debug!(count = ids.len(), "grid.delete");
        Ok(ids.len())
    }
}

fn duplicate_name(location: &Location, other: &str) -> TrackError {
    TrackError::validation(
        &location.name,
        ValidationKind::DuplicateName {
            name: location.name.clone(),
            other: other.to_string(),
        },
    )
}

fn validate_fields(location: &Location) -> Result<()> {
    let name = location.name.trim();
    if name.is_empty() {
        return Err(TrackError::validation(
            format!("location {}", location.id),
            ValidationKind::MissingField("name".into()),
        ));
    }
    if name.contains('/') {
        return Err(TrackError::validation(
            name,
            ValidationKind::InvalidLocationName(name.to_string()),
        ));
    }
    if location.location_type.is_none() {
        return Err(TrackError::validation(
            name,
            ValidationKind::MissingLocationType,
        ));
    }
    if location.privacy.is_restricted()
        && location.owner_group.as_deref().map_or(true, |g| g.trim().is_empty())
    {
        return Err(TrackError::validation(
            name,
            ValidationKind::MissingOwnerGroup(format!("{:?}", location.privacy).to_lowercase()),
        ));
    }
    if location.labeling != crate::model::Labeling::None
        && (location.rows <= 0 || location.cols <= 0)
    {
        return Err(TrackError::validation(
            name,
            ValidationKind::InvalidDimensions {
                rows: location.rows,
                cols: location.cols,
            },
        ));
    }
    Ok(())
}
