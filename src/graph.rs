#![forbid(unsafe_code)]

//! Sample graph: batch persistence of biosamples.
//!
//! [`SampleGraph::persist_batch`] runs the whole save pipeline for a batch of
//! new and existing biosamples: stale-edit detection, id allocation,
//! validation, placement, lineage, study context propagation, formulas and
//! containers. Nothing is staged in the transaction unless every step passes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use time::macros::format_description;
use time::Date;
use tracing::{debug, info, warn};

use crate::allocator::{PatternContext, SequenceAllocator};
use crate::cache::Cache;
use crate::clock::AuditClock;
use crate::error::{Result, TrackError, ValidationKind};
use crate::expr::{format_number, CompiledExpr, ExpressionEngine};
use crate::grid::LocationGrid;
use crate::guard::ConcurrencyGuard;
use crate::model::{Biosample, Biotype, Container, FieldKind, Study};
use crate::rights::{self, Entity, Rights};
use crate::store::{BiosampleQuery, Record, RecordKey, Transaction};
use crate::types::{stamp, BiosampleId, BiotypeId, GroupId, LocationId, PhaseId, StudyId, User};

/// Outcome of a successful [`SampleGraph::persist_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    /// Samples saved for the first time.
    pub inserted: usize,
    /// Samples of the batch that already existed.
    pub updated: usize,
    /// Descendants outside the batch rewritten by propagation.
    pub propagated: usize,
    /// Sample ids allocated for samples that had none.
    pub allocated: Vec<String>,
    /// Soft failures, such as formulas that could not be evaluated.
    pub warnings: Vec<String>,
}

/// Derived lineage and study context of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Lineage {
    top_parent: Option<BiosampleId>,
    study: Option<StudyId>,
    group: Option<GroupId>,
    phase: Option<PhaseId>,
}

impl Lineage {
    fn of(sample: &Biosample) -> Self {
        Self {
            top_parent: sample.top_parent,
            study: sample.inherited_study,
            group: sample.inherited_group,
            phase: sample.inherited_phase,
        }
    }

    fn write_to(self, sample: &mut Biosample) {
        sample.top_parent = self.top_parent;
        sample.inherited_study = self.study;
        sample.inherited_group = self.group;
        sample.inherited_phase = self.phase;
    }

    /// Context of a child given its parent's new and previous context.
    ///
    /// A value the child carries locally survives unless it merely mirrored
    /// the parent's previous value.
    fn derive(child: &Biosample, parent_new: Lineage, parent_old: Lineage) -> Self {
        let top_parent = parent_new.top_parent;
        if let Some(study) = child.attached_study {
            return Self {
                top_parent,
                study: Some(study),
                group: child.inherited_group,
                phase: child.inherited_phase,
            };
        }
        let group = match child.inherited_group {
            Some(local) if Some(local) != parent_old.group => Some(local),
            _ => parent_new.group,
        };
        let phase = match child.inherited_phase {
            Some(local) if Some(local) != parent_old.phase => Some(local),
            _ => parent_new.phase,
        };
        Self {
            top_parent,
            study: parent_new.study,
            group,
            phase,
        }
    }
}

/// Batch persistence of biosamples.
pub struct SampleGraph {
    allocator: Arc<SequenceAllocator>,
    grid: Arc<LocationGrid>,
    rights: Arc<dyn Rights>,
    expressions: Arc<dyn ExpressionEngine>,
    formulas: Arc<Cache<String, Arc<CompiledExpr>>>,
    clock: Arc<AuditClock>,
}

impl SampleGraph {
    /// Wires the collaborators.
    pub fn new(
        allocator: Arc<SequenceAllocator>,
        grid: Arc<LocationGrid>,
        rights: Arc<dyn Rights>,
        expressions: Arc<dyn ExpressionEngine>,
        formulas: Arc<Cache<String, Arc<CompiledExpr>>>,
        clock: Arc<AuditClock>,
    ) -> Self {
        Self {
            allocator,
            grid,
            rights,
            expressions,
            formulas,
            clock,
        }
    }

    /// Validates and stages a batch of biosamples.
    ///
    /// On success `batch` reflects what was staged (allocated ids, derived
    /// lineage, formulas, container ids, audit stamps). On failure nothing is
    /// staged and `batch` is untouched; identifiers allocated on the way are
    /// not reused.
    pub fn persist_batch(
        &self,
        tx: &mut Transaction,
        user: &User,
        batch: &mut [Biosample],
    ) -> Result<PersistReport> {
        let mut report = PersistReport::default();
        let mut work: Vec<Biosample> = batch.to_vec();

        let mut index: HashMap<BiosampleId, usize> = HashMap::with_capacity(work.len());
        for (i, sample) in work.iter().enumerate() {
            if index.insert(sample.id, i).is_some() {
                return Err(TrackError::validation(
                    sample.label(),
                    ValidationKind::RepeatedInBatch(format!("biosample {}", sample.id)),
                ));
            }
        }

        ConcurrencyGuard.check(tx, &work)?;
        for sample in &work {
            rights::ensure_edit(self.rights.as_ref(), Entity::Biosample(sample), user)?;
        }

        let biotypes = load_biotypes(tx, &work)?;
        let mut studies: HashMap<StudyId, Study> = HashMap::new();

        self.assign_sample_ids(tx, &mut work, &index, &mut studies, &mut report)?;
        self.validate_names(tx, &work, &biotypes, &index)?;
        self.validate_metadata(tx, &work, &biotypes)?;
        self.grid.check_placements(tx, &mut work)?;

        let order = lineage_order(tx, &work, &index)?;
        self.reconcile_studies(tx, &mut work, &index, &order, &mut studies)?;
        let descendants = self.propagate(tx, &work, &index, &mut studies)?;

        self.evaluate_formulas(&mut work, &biotypes, &mut report);
        self.resolve_containers(tx, &mut work, &biotypes)?;

        for sample in &mut work {
            let previous = tx.biosample(sample.id)?;
            let existed = previous.is_some();
            let base = previous.and_then(|p| p.audit);
            sample.audit = Some(stamp(&base, user, self.clock.tick()));
            tx.put(Record::Biosample(sample.clone()))?;
            if existed {
                report.updated += 1;
            } else {
                report.inserted += 1;
            }
        }
        for mut child in descendants {
            child.audit = Some(stamp(&child.audit, user, self.clock.tick()));
            tx.update(Record::Biosample(child))?;
            report.propagated += 1;
        }

        batch.clone_from_slice(&work);
        info!(
            tx_id = tx.id(),
            inserted = report.inserted,
            updated = report.updated,
            propagated = report.propagated,
            warnings = report.warnings.len(),
            "graph.persist.done"
        );
        Ok(report)
    }

    fn assign_sample_ids(
        &self,
        tx: &Transaction,
        work: &mut [Biosample],
        index: &HashMap<BiosampleId, usize>,
        studies: &mut HashMap<StudyId, Study>,
        report: &mut PersistReport,
    ) -> Result<()> {
        for i in 0..work.len() {
            let trimmed = work[i].sample_id.trim().to_string();
            if !trimmed.is_empty() {
                work[i].sample_id = trimmed;
                continue;
            }
            let biotype = tx
                .biotype(work[i].biotype)?
                .ok_or_else(|| missing_biotype(&work[i]))?;
            let mut ctx = PatternContext::today();
            if let Some(study) = context_study(tx, work, index, i)? {
                ctx = ctx.with_study(load_study(tx, studies, study)?.study_code.clone());
            }
            let id = self.allocator.next_sample_id(&biotype.prefix, &ctx)?;
            debug!(sample = %work[i].id, sample_id = %id, "graph.sample_id.allocated");
            report.allocated.push(id.clone());
            work[i].sample_id = id;
        }

        let mut seen: HashSet<&str> = HashSet::with_capacity(work.len());
        for sample in work.iter() {
            if sample.sample_id.chars().any(char::is_whitespace) {
                return Err(TrackError::validation(
                    sample.label(),
                    ValidationKind::WhitespaceInSampleId(sample.sample_id.clone()),
                ));
            }
            if !seen.insert(sample.sample_id.as_str()) {
                return Err(duplicate_id(sample));
            }
            let clash = tx
                .query_biosamples(&BiosampleQuery::SampleId(sample.sample_id.clone()))?
                .into_iter()
                .any(|other| !index.contains_key(&other.id));
            if clash {
                return Err(duplicate_id(sample));
            }
        }
        Ok(())
    }

    fn validate_names(
        &self,
        tx: &Transaction,
        work: &[Biosample],
        biotypes: &HashMap<BiotypeId, Biotype>,
        index: &HashMap<BiosampleId, usize>,
    ) -> Result<()> {
        let mut seen: HashSet<(BiotypeId, String)> = HashSet::new();
        for sample in work {
            let Some(biotype) = biotypes.get(&sample.biotype) else {
                return Err(missing_biotype(sample));
            };
            let name = sample.name.as_deref().map(str::trim).unwrap_or("");
            if name.is_empty() {
                if biotype.name_required {
                    return Err(TrackError::validation(
                        sample.label(),
                        ValidationKind::MissingField("name".into()),
                    ));
                }
                continue;
            }
            if !biotype.name_unique {
                continue;
            }
            if !seen.insert((biotype.id, name.to_lowercase())) {
                return Err(duplicate_name(sample, name, "another sample of this batch"));
            }
            let others = tx.query_biosamples(&BiosampleQuery::Named {
                biotype: biotype.id,
                name: name.to_string(),
            })?;
            if let Some(other) = others.iter().find(|o| !index.contains_key(&o.id)) {
                return Err(duplicate_name(sample, name, &other.label()));
            }
        }
        Ok(())
    }

    fn validate_metadata(
        &self,
        tx: &Transaction,
        work: &[Biosample],
        biotypes: &HashMap<BiotypeId, Biotype>,
    ) -> Result<()> {
        let batch_ids: HashSet<&str> = work.iter().map(|s| s.sample_id.as_str()).collect();
        for sample in work {
            let Some(biotype) = biotypes.get(&sample.biotype) else {
                return Err(missing_biotype(sample));
            };
            for field in &biotype.fields {
                if matches!(field.kind, FieldKind::Formula(_)) {
                    continue;
                }
                let value = sample
                    .metadata
                    .get(&field.name)
                    .map(|v| v.trim())
                    .unwrap_or("");
                if value.is_empty() {
                    if field.required {
                        return Err(TrackError::validation(
                            sample.label(),
                            ValidationKind::MissingField(field.name.clone()),
                        ));
                    }
                    continue;
                }
                let invalid = |reason: &str| {
                    TrackError::validation(
                        sample.label(),
                        ValidationKind::InvalidMetadata {
                            field: field.name.clone(),
                            value: value.to_string(),
                            reason: reason.to_string(),
                        },
                    )
                };
                match &field.kind {
                    FieldKind::Alpha | FieldKind::Formula(_) => {}
                    FieldKind::Number => {
                        if value.parse::<f64>().map_or(true, |n| !n.is_finite()) {
                            return Err(invalid("not a number"));
                        }
                    }
                    FieldKind::Date => {
                        if Date::parse(value, format_description!("[year]-[month]-[day]")).is_err()
                        {
                            return Err(invalid("expected YYYY-MM-DD"));
                        }
                    }
                    FieldKind::List(choices) => {
                        if !choices.iter().any(|c| c == value) {
                            return Err(invalid("not one of the allowed choices"));
                        }
                    }
                    FieldKind::Biosample => {
                        let resolved = batch_ids.contains(value)
                            || !tx
                                .query_biosamples(&BiosampleQuery::SampleId(value.to_string()))?
                                .is_empty();
                        if !resolved {
                            return Err(TrackError::validation(
                                sample.label(),
                                ValidationKind::UnresolvedReference {
                                    field: field.name.clone(),
                                    reference: value.to_string(),
                                },
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies attachment boundaries and parent inheritance to the batch,
    /// parents before children, then checks group and phase membership.
    fn reconcile_studies(
        &self,
        tx: &Transaction,
        work: &mut [Biosample],
        index: &HashMap<BiosampleId, usize>,
        order: &[(usize, BiosampleId)],
        studies: &mut HashMap<StudyId, Study>,
    ) -> Result<()> {
        let mut outside: HashMap<BiosampleId, Lineage> = HashMap::new();
        for &(i, top_parent) in order {
            let lineage = match work[i].parent {
                None => {
                    let sample = &work[i];
                    Lineage {
                        top_parent: Some(top_parent),
                        study: sample.attached_study.or(sample.inherited_study),
                        group: sample.inherited_group,
                        phase: sample.inherited_phase,
                    }
                }
                Some(parent) => {
                    let parent_old = tx
                        .biosample(parent)?
                        .as_ref()
                        .map(Lineage::of)
                        .unwrap_or_default();
                    let parent_new = resolve_lineage(tx, work, index, &mut outside, parent)?;
                    let mut lineage = Lineage::derive(&work[i], parent_new, parent_old);
                    lineage.top_parent = Some(top_parent);
                    lineage
                }
            };
            lineage.write_to(&mut work[i]);
            check_membership(tx, studies, &work[i])?;
        }
        Ok(())
    }

    /// Breadth-first rewrite of committed descendants of the batch.
    ///
    /// Attachment boundaries keep their own study context; only `top_parent`
    /// flows through them.
    fn propagate(
        &self,
        tx: &Transaction,
        work: &[Biosample],
        index: &HashMap<BiosampleId, usize>,
        studies: &mut HashMap<StudyId, Study>,
    ) -> Result<Vec<Biosample>> {
        let mut queue: VecDeque<(BiosampleId, Lineage, Lineage)> = VecDeque::new();
        for sample in work {
            let old = tx
                .biosample(sample.id)?
                .as_ref()
                .map(Lineage::of)
                .unwrap_or_default();
            queue.push_back((sample.id, Lineage::of(sample), old));
        }
        let mut visited: HashSet<BiosampleId> = index.keys().copied().collect();
        let mut changed = Vec::new();
        while let Some((parent, parent_new, parent_old)) = queue.pop_front() {
            if parent_new == parent_old && !index.contains_key(&parent) {
                continue;
            }
            for child in tx.query_biosamples(&BiosampleQuery::ChildrenOf(parent))? {
                if !visited.insert(child.id) {
                    continue;
                }
                let old = Lineage::of(&child);
                let new = Lineage::derive(&child, parent_new, parent_old);
                if new == old {
                    continue;
                }
                let mut updated = child;
                new.write_to(&mut updated);
                check_membership(tx, studies, &updated)?;
                queue.push_back((updated.id, new, old));
                changed.push(updated);
            }
        }
        if !changed.is_empty() {
            debug!(count = changed.len(), "graph.propagate");
        }
        Ok(changed)
    }

    /// Formula failures leave the field empty and are reported as warnings.
    fn evaluate_formulas(
        &self,
        work: &mut [Biosample],
        biotypes: &HashMap<BiotypeId, Biotype>,
        report: &mut PersistReport,
    ) {
        for sample in work.iter_mut() {
            let Some(biotype) = biotypes.get(&sample.biotype) else {
                continue;
            };
            for (field, text) in biotype.formulas() {
                let outcome = self
                    .compiled(text)
                    .and_then(|expr| self.expressions.evaluate(&expr, &sample.metadata));
                let value = match outcome {
                    Ok(value) => format_number(value),
                    Err(err) => {
                        warn!(
                            sample = %sample.label(),
                            field,
                            error = %err,
                            "graph.formula.failed"
                        );
                        report
                            .warnings
                            .push(format!("{}: formula '{field}' failed: {err}", sample.label()));
                        String::new()
                    }
                };
                sample.metadata.insert(field.to_string(), value);
            }
        }
    }

    fn compiled(&self, text: &str) -> std::result::Result<Arc<CompiledExpr>, crate::expr::ExprError> {
        let key = text.to_string();
        if let Some(expr) = self.formulas.get(&key) {
            return Ok(expr);
        }
        let expr = Arc::new(self.expressions.compile(text)?);
        self.formulas.put(key, Arc::clone(&expr));
        Ok(expr)
    }

    /// Allocates missing container ids and enforces occupancy rules.
    fn resolve_containers(
        &self,
        tx: &Transaction,
        work: &mut [Biosample],
        biotypes: &HashMap<BiotypeId, Biotype>,
    ) -> Result<()> {
        for sample in work.iter_mut() {
            if sample.container.is_none() {
                if let Some(ty) = biotypes.get(&sample.biotype).and_then(|t| t.container_type) {
                    sample.container = Some(Container::new(ty));
                }
            }
            if let Some(container) = sample.container.as_mut() {
                let missing = container
                    .container_id
                    .as_deref()
                    .map_or(true, |id| id.trim().is_empty());
                if missing {
                    container.container_id =
                        Some(self.allocator.next_container_id(container.container_type)?);
                }
            }
        }

        let batch_ids: HashSet<BiosampleId> = work.iter().map(|s| s.id).collect();
        let mut groups: BTreeMap<String, Vec<Biosample>> = BTreeMap::new();
        for sample in work.iter() {
            if let Some(id) = sample.container_id() {
                groups.entry(id.to_string()).or_default().push(sample.clone());
            }
        }
        for (container_id, mut occupants) in groups {
            occupants.extend(
                tx.query_biosamples(&BiosampleQuery::InContainer(container_id.clone()))?
                    .into_iter()
                    .filter(|other| !batch_ids.contains(&other.id)),
            );
            if occupants.len() < 2 {
                continue;
            }
            if let Some(exclusive) = occupants.iter().find_map(|s| {
                s.container
                    .as_ref()
                    .filter(|c| !c.container_type.is_multiple())
            }) {
                return Err(TrackError::validation(
                    occupants[0].label(),
                    ValidationKind::ContainerNotShared {
                        container_id: container_id.clone(),
                        container_type: exclusive.container_type.to_string(),
                    },
                ));
            }
            let first = &occupants[0];
            let study = first.inherited_study;
            let placement: (Option<LocationId>, i32) = (first.location, first.pos);
            for other in &occupants[1..] {
                if other.inherited_study != study {
                    return Err(TrackError::validation(
                        other.label(),
                        ValidationKind::ContainerStudyMismatch(container_id.clone()),
                    ));
                }
                if (other.location, other.pos) != placement {
                    return Err(TrackError::validation(
                        other.label(),
                        ValidationKind::ContainerPlacementMismatch(container_id.clone()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Stages deletion of leaf biosamples.
    ///
    /// A sample with children outside `ids` is refused.
    pub fn delete_biosamples(
        &self,
        tx: &mut Transaction,
        user: &User,
        ids: &[BiosampleId],
    ) -> Result<usize> {
        let doomed: HashSet<BiosampleId> = ids.iter().copied().collect();
        for &id in ids {
            let sample = tx
                .biosample(id)?
                .ok_or_else(|| TrackError::not_found("biosample", id))?;
            rights::ensure_delete(self.rights.as_ref(), Entity::Biosample(&sample), user)?;
            let orphans = tx
                .query_biosamples(&BiosampleQuery::ChildrenOf(id))?
                .into_iter()
                .any(|child| !doomed.contains(&child.id));
            if orphans {
                return Err(TrackError::validation(
                    sample.label(),
                    ValidationKind::NotEmpty(sample.label()),
                ));
            }
        }
        for &id in ids {
            tx.delete(RecordKey::Biosample(id))?;
        }
        debug!(count = ids.len(), "graph.delete");
        Ok(ids.len())
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, tx: &Transaction, id: BiosampleId) -> Result<Vec<Biosample>> {
        let start = tx
            .biosample(id)?
            .ok_or_else(|| TrackError::not_found("biosample", id))?;
        let mut seen = HashSet::from([id]);
        let mut out = Vec::new();
        let mut next = start.parent;
        while let Some(parent) = next {
            if !seen.insert(parent) {
                return Err(TrackError::validation(
                    start.label(),
                    ValidationKind::Cycle(start.label()),
                ));
            }
            let Some(sample) = tx.biosample(parent)? else {
                break;
            };
            next = sample.parent;
            out.push(sample);
        }
        Ok(out)
    }

    /// Descendants of `id` in breadth-first order.
    pub fn descendants(&self, tx: &Transaction, id: BiosampleId) -> Result<Vec<Biosample>> {
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for child in tx.query_biosamples(&BiosampleQuery::ChildrenOf(current))? {
                if seen.insert(child.id) {
                    queue.push_back(child.id);
                    out.push(child);
                }
            }
        }
        Ok(out)
    }
}

fn load_biotypes(tx: &Transaction, work: &[Biosample]) -> Result<HashMap<BiotypeId, Biotype>> {
    let mut out = HashMap::new();
    for sample in work {
        if out.contains_key(&sample.biotype) {
            continue;
        }
        let biotype = tx
            .biotype(sample.biotype)?
            .ok_or_else(|| missing_biotype(sample))?;
        out.insert(sample.biotype, biotype);
    }
    Ok(out)
}

fn load_study<'a>(
    tx: &Transaction,
    studies: &'a mut HashMap<StudyId, Study>,
    id: StudyId,
) -> Result<&'a Study> {
    if !studies.contains_key(&id) {
        let study = tx
            .study(id)?
            .ok_or_else(|| TrackError::not_found("study", id))?;
        studies.insert(id, study);
    }
    studies
        .get(&id)
        .ok_or_else(|| TrackError::not_found("study", id))
}

/// Study used for `{StudyId}` in the sample id of `work[i]`.
fn context_study(
    tx: &Transaction,
    work: &[Biosample],
    index: &HashMap<BiosampleId, usize>,
    i: usize,
) -> Result<Option<StudyId>> {
    let sample = &work[i];
    if let Some(study) = sample.attached_study.or(sample.inherited_study) {
        return Ok(Some(study));
    }
    let Some(parent) = sample.parent else {
        return Ok(None);
    };
    Ok(match index.get(&parent) {
        Some(&p) => work[p].attached_study.or(work[p].inherited_study),
        None => tx.biosample(parent)?.and_then(|p| p.inherited_study),
    })
}

/// Walks every parent chain of the batch. Returns batch positions ordered
/// by chain depth, each paired with its root ancestor.
fn lineage_order(
    tx: &Transaction,
    work: &[Biosample],
    index: &HashMap<BiosampleId, usize>,
) -> Result<Vec<(usize, BiosampleId)>> {
    let mut order = Vec::with_capacity(work.len());
    for (i, sample) in work.iter().enumerate() {
        let mut seen = HashSet::from([sample.id]);
        let mut root = sample.id;
        let mut next = sample.parent;
        while let Some(parent) = next {
            if !seen.insert(parent) {
                return Err(TrackError::validation(
                    sample.label(),
                    ValidationKind::Cycle(sample.label()),
                ));
            }
            root = parent;
            next = match index.get(&parent) {
                Some(&p) => work[p].parent,
                None => match tx.biosample(parent)? {
                    Some(committed) => committed.parent,
                    None => {
                        return Err(TrackError::validation(
                            sample.label(),
                            ValidationKind::MissingParent(parent.0),
                        ))
                    }
                },
            };
        }
        order.push((seen.len(), i, root));
    }
    order.sort_by_key(|&(depth, i, _)| (depth, i));
    Ok(order.into_iter().map(|(_, i, root)| (i, root)).collect())
}

/// New lineage of `id`: the reconciled value for batch members, otherwise
/// the committed record re-derived from its own (resolved) parent.
///
/// Batch members must already be reconciled, which holds when callers follow
/// [`lineage_order`].
fn resolve_lineage(
    tx: &Transaction,
    work: &[Biosample],
    index: &HashMap<BiosampleId, usize>,
    outside: &mut HashMap<BiosampleId, Lineage>,
    id: BiosampleId,
) -> Result<Lineage> {
    if let Some(&i) = index.get(&id) {
        return Ok(Lineage::of(&work[i]));
    }
    if let Some(lineage) = outside.get(&id) {
        return Ok(*lineage);
    }
    let committed = tx
        .biosample(id)?
        .ok_or_else(|| TrackError::not_found("biosample", id))?;
    let lineage = match committed.parent {
        None => Lineage::of(&committed),
        Some(parent) => {
            let parent_old = tx
                .biosample(parent)?
                .as_ref()
                .map(Lineage::of)
                .unwrap_or_default();
            let parent_new = resolve_lineage(tx, work, index, outside, parent)?;
            Lineage::derive(&committed, parent_new, parent_old)
        }
    };
    outside.insert(id, lineage);
    Ok(lineage)
}

/// The sample's study must exist, and its group and phase must belong to it.
fn check_membership(
    tx: &Transaction,
    studies: &mut HashMap<StudyId, Study>,
    sample: &Biosample,
) -> Result<()> {
    let consistent = match sample.inherited_study {
        None => sample.inherited_group.is_none() && sample.inherited_phase.is_none(),
        Some(study) => {
            let study = load_study(tx, studies, study)?;
            sample
                .inherited_group
                .map_or(true, |g| study.groups.contains(&g))
                && sample
                    .inherited_phase
                    .map_or(true, |p| study.phases.contains(&p))
        }
    };
    if consistent {
        Ok(())
    } else {
        Err(TrackError::validation(
            sample.label(),
            ValidationKind::StudyMismatch(sample.label()),
        ))
    }
}

fn missing_biotype(sample: &Biosample) -> TrackError {
    TrackError::validation(
        sample.label(),
        ValidationKind::MissingBiotype(sample.biotype.0),
    )
}

fn duplicate_id(sample: &Biosample) -> TrackError {
    TrackError::validation(
        sample.label(),
        ValidationKind::DuplicateSampleId(sample.sample_id.clone()),
    )
}

fn duplicate_name(sample: &Biosample, name: &str, other: &str) -> TrackError {
    TrackError::validation(
        sample.label(),
        ValidationKind::DuplicateName {
            name: name.to_string(),
            other: other.to_string(),
        },
    )
}
