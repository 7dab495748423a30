#![forbid(unsafe_code)]

//! Engine facade.
//!
//! [`Tracker`] owns the shared services (allocator pools, caches, audit clock)
//! and the background cache sweeper, and hands out explicit [`Transaction`]
//! values. The `save_*` helpers run one batch in its own transaction and undo
//! process-wide state when the batch fails.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::allocator::{PatternContext, SequenceAllocator};
use crate::cache::{Cache, CacheSweeper, PoolKey, Sweep};
use crate::clock::AuditClock;
use crate::config::EngineConfig;
use crate::error::{Result, TrackError, ValidationKind};
use crate::expr::{ArithmeticEngine, CompiledExpr, ExpressionEngine};
use crate::graph::{PersistReport, SampleGraph};
use crate::grid::{LocationGrid, LocationReport};
use crate::guard::ConcurrencyGuard;
use crate::model::{Biosample, Biotype, Location, SequenceCategory, Study};
use crate::rights::{self, AllowAll, Entity, Rights};
use crate::store::{Backend, MemoryBackend, Record, RecordKind, Transaction};
use crate::types::{stamp, BiosampleId, BiotypeId, LocationId, StudyId, User};

/// Builder for [`Tracker`].
pub struct TrackerBuilder {
    backend: Arc<dyn Backend>,
    config: EngineConfig,
    rights: Arc<dyn Rights>,
    expressions: Arc<dyn ExpressionEngine>,
    sweeper: bool,
}

impl TrackerBuilder {
    /// Replaces the default configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs a rights collaborator (default: [`AllowAll`]).
    pub fn rights(mut self, rights: Arc<dyn Rights>) -> Self {
        self.rights = rights;
        self
    }

    /// Installs an expression collaborator (default: [`ArithmeticEngine`]).
    pub fn expressions(mut self, expressions: Arc<dyn ExpressionEngine>) -> Self {
        self.expressions = expressions;
        self
    }

    /// Skips the background sweeper thread; expired entries are then only
    /// dropped lazily on lookup.
    pub fn without_sweeper(mut self) -> Self {
        self.sweeper = false;
        self
    }

    /// Wires the services and starts the sweeper.
    pub fn build(self) -> Result<Tracker> {
        let observed: Arc<Cache<PoolKey, u64>> =
            Arc::new(Cache::new("allocator.observed", &self.config.cache));
        let formulas: Arc<Cache<String, Arc<CompiledExpr>>> =
            Arc::new(Cache::new("graph.formulas", &self.config.cache));
        let clock = Arc::new(AuditClock::new());
        let allocator = Arc::new(SequenceAllocator::new(
            Arc::clone(&self.backend),
            self.config.allocator.clone(),
            Arc::clone(&observed),
        ));
        let grid = Arc::new(LocationGrid::new(
            self.config.grid.clone(),
            Arc::clone(&allocator),
            Arc::clone(&self.rights),
            Arc::clone(&clock),
        ));
        let graph = SampleGraph::new(
            Arc::clone(&allocator),
            Arc::clone(&grid),
            Arc::clone(&self.rights),
            Arc::clone(&self.expressions),
            Arc::clone(&formulas),
            Arc::clone(&clock),
        );
        let sweeper = if self.sweeper {
            let targets: Vec<Arc<dyn Sweep>> = vec![
                Arc::clone(&observed) as Arc<dyn Sweep>,
                Arc::clone(&formulas) as Arc<dyn Sweep>,
            ];
            Some(CacheSweeper::spawn(
                targets,
                self.config.cache.sweep_interval(),
            )?)
        } else {
            None
        };
        info!(
            backend = self.backend.name(),
            sweeper = sweeper.is_some(),
            "engine.start"
        );
        Ok(Tracker {
            backend: self.backend,
            config: self.config,
            rights: self.rights,
            observed,
            formulas,
            clock,
            allocator,
            grid,
            graph,
            sweeper,
        })
    }
}

/// The sample-tracking engine.
pub struct Tracker {
    backend: Arc<dyn Backend>,
    config: EngineConfig,
    rights: Arc<dyn Rights>,
    observed: Arc<Cache<PoolKey, u64>>,
    formulas: Arc<Cache<String, Arc<CompiledExpr>>>,
    clock: Arc<AuditClock>,
    allocator: Arc<SequenceAllocator>,
    grid: Arc<LocationGrid>,
    graph: SampleGraph,
    sweeper: Option<CacheSweeper>,
}

impl Tracker {
    /// Starts building a tracker over `backend`.
    pub fn builder(backend: Arc<dyn Backend>) -> TrackerBuilder {
        TrackerBuilder {
            backend,
            config: EngineConfig::default(),
            rights: Arc::new(AllowAll),
            expressions: Arc::new(ArithmeticEngine),
            sweeper: true,
        }
    }

    /// Tracker over a fresh [`MemoryBackend`] with default settings.
    pub fn in_memory() -> Result<Self> {
        Self::builder(Arc::new(MemoryBackend::new())).build()
    }

    /// Persistence backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sequence allocator.
    pub fn allocator(&self) -> &SequenceAllocator {
        &self.allocator
    }

    /// Location service.
    pub fn grid(&self) -> &LocationGrid {
        &self.grid
    }

    /// Sample graph.
    pub fn graph(&self) -> &SampleGraph {
        &self.graph
    }

    /// Memoised observed maxima of the allocator.
    pub fn observed_cache(&self) -> &Cache<PoolKey, u64> {
        &self.observed
    }

    /// Compiled formulas.
    pub fn formula_cache(&self) -> &Cache<String, Arc<CompiledExpr>> {
        &self.formulas
    }

    /// Sweeper handle, if running.
    pub fn sweeper(&self) -> Option<&CacheSweeper> {
        self.sweeper.as_ref()
    }

    /// Opens a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::begin(Arc::clone(&self.backend))
    }

    /// Fresh internal id for a new biosample.
    pub fn new_biosample_id(&self) -> Result<BiosampleId> {
        self.backend.next_record_id().map(BiosampleId)
    }

    /// Fresh internal id for a new location.
    pub fn new_location_id(&self) -> Result<LocationId> {
        self.backend.next_record_id().map(LocationId)
    }

    /// Fresh internal id for a new biotype.
    pub fn new_biotype_id(&self) -> Result<BiotypeId> {
        self.backend.next_record_id().map(BiotypeId)
    }

    /// Fresh internal id for a new study.
    pub fn new_study_id(&self) -> Result<StudyId> {
        self.backend.next_record_id().map(StudyId)
    }

    /// Next sample id for `biotype`, as a batch save would allocate it.
    pub fn next_sample_id(&self, biotype: BiotypeId, ctx: &PatternContext) -> Result<String> {
        let biotype = self
            .begin()
            .biotype(biotype)?
            .ok_or_else(|| TrackError::not_found("biotype", biotype))?;
        self.allocator.next_sample_id(&biotype.prefix, ctx)
    }

    /// Stored sequence rows.
    pub fn sequences(&self) -> Result<Vec<crate::model::BarcodeSequence>> {
        Ok(self
            .backend
            .scan(RecordKind::Sequence)?
            .into_iter()
            .filter_map(|record| match record {
                Record::Sequence(seq) => Some(seq),
                _ => None,
            })
            .collect())
    }

    /// Stages a biosample batch in `tx`.
    pub fn persist_batch(
        &self,
        tx: &mut Transaction,
        user: &User,
        batch: &mut [Biosample],
    ) -> Result<PersistReport> {
        self.graph.persist_batch(tx, user, batch)
    }

    /// Stages a location batch in `tx`.
    pub fn persist_locations(
        &self,
        tx: &mut Transaction,
        user: &User,
        batch: &mut [Location],
    ) -> Result<LocationReport> {
        self.grid.persist_locations(tx, user, batch)
    }

    /// Saves a biosample batch in its own transaction.
    ///
    /// `batch` is updated only once the commit has landed.
    pub fn save_biosamples(&self, user: &User, batch: &mut [Biosample]) -> Result<PersistReport> {
        let mut work = batch.to_vec();
        let report = self.in_transaction(|tx| self.graph.persist_batch(tx, user, &mut work))?;
        batch.clone_from_slice(&work);
        Ok(report)
    }

    /// Saves a location batch in its own transaction.
    ///
    /// `batch` is updated only once the commit has landed.
    pub fn save_locations(&self, user: &User, batch: &mut [Location]) -> Result<LocationReport> {
        let mut work = batch.to_vec();
        let report = self.in_transaction(|tx| self.grid.persist_locations(tx, user, &mut work))?;
        batch.clone_from_slice(&work);
        Ok(report)
    }

    /// Creates or replaces a biotype. Pattern pools and compiled formulas are
    /// dropped since they may depend on the old definition.
    pub fn save_biotype(&self, user: &User, biotype: &Biotype) -> Result<()> {
        rights::ensure_edit(self.rights.as_ref(), Entity::Biotype(biotype), user)?;
        let name = biotype.name.trim();
        if name.is_empty() {
            return Err(TrackError::validation(
                format!("biotype {}", biotype.id),
                ValidationKind::MissingField("name".into()),
            ));
        }
        if biotype.prefix.chars().any(char::is_whitespace) {
            return Err(TrackError::validation(
                name,
                ValidationKind::WhitespaceInSampleId(biotype.prefix.clone()),
            ));
        }
        self.in_transaction(|tx| {
            let clash = tx.scan(RecordKind::Biotype)?.into_iter().any(|r| match r {
                Record::Biotype(other) => {
                    other.id != biotype.id && other.name.trim().eq_ignore_ascii_case(name)
                }
                _ => false,
            });
            if clash {
                return Err(TrackError::validation(
                    name,
                    ValidationKind::DuplicateName {
                        name: name.to_string(),
                        other: "another biotype".into(),
                    },
                ));
            }
            tx.put(Record::Biotype(biotype.clone()))
        })?;
        self.invalidate();
        debug!(biotype = %biotype.name, "engine.biotype.saved");
        Ok(())
    }

    /// Creates or updates a study.
    pub fn save_study(&self, user: &User, study: &mut Study) -> Result<()> {
        rights::ensure_edit(self.rights.as_ref(), Entity::Study(study), user)?;
        let mut work = study.clone();
        self.in_transaction(|tx| {
            ConcurrencyGuard.check(tx, std::slice::from_ref(&work))?;
            let base = tx.study(work.id)?.and_then(|previous| previous.audit);
            work.audit = Some(stamp(&base, user, self.clock.tick()));
            tx.put(Record::Study(work.clone()))
        })?;
        *study = work;
        Ok(())
    }

    /// Discards `tx` and every piece of process-wide state that may reflect it.
    pub fn rollback(&self, tx: Transaction) -> Result<()> {
        let result = tx.rollback();
        self.invalidate();
        result
    }

    /// Drops allocator pools and cached lookups. Call after rollbacks, schema
    /// changes or reverted edits.
    pub fn invalidate(&self) {
        self.allocator.reset();
        self.formulas.clear();
    }

    /// Drops pools and memoised maxima for one identifier family whose
    /// formatted patterns start with `prefix`.
    pub fn invalidate_prefix(&self, category: SequenceCategory, prefix: &str) -> usize {
        let dropped = self.observed.invalidate(category, prefix);
        self.allocator.reset();
        dropped
    }

    fn in_transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut tx = self.begin();
        match body(&mut tx) {
            Ok(value) => match tx.commit() {
                Ok(_) => Ok(value),
                Err(err) => {
                    warn!(error = %err, "engine.commit.failed");
                    self.invalidate();
                    Err(err)
                }
            },
            Err(err) => {
                debug!(error = %err, "engine.batch.aborted");
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "engine.rollback.failed");
                }
                self.invalidate();
                Err(err)
            }
        }
    }
}
