use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{
    identifier_of, Backend, BiosampleQuery, Expected, LocationQuery, Record, RecordKey,
    RecordKind, Write,
};
use crate::cache::PoolKey;
use crate::error::{Result, TrackError};
use crate::model::{BarcodeSequence, Biosample, Biotype, Location, SequenceCategory, Study};
use crate::types::{BiosampleId, BiotypeId, LocationId, StudyId};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting reads and writes.
    Active,
    /// Writes have been applied to the backend.
    Committed,
    /// Writes have been discarded.
    RolledBack,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitSummary {
    /// Records created.
    pub inserted: usize,
    /// Records replaced.
    pub updated: usize,
    /// Records removed.
    pub deleted: usize,
}

/// An explicit session over a [`Backend`].
///
/// Writes are buffered until [`Transaction::commit`], which hands them to the
/// backend as one atomic unit. Reads see committed state overlaid with this
/// transaction's own staged writes. A transaction dropped while active is
/// discarded.
///
/// Every record staged for update or delete carries the `updated_at` it had
/// when first read; the commit is refused if another writer moved it since.
pub struct Transaction {
    backend: Arc<dyn Backend>,
    id: u64,
    state: TxState,
    staged: Vec<Write>,
    overlay: FxHashMap<RecordKey, Option<Record>>,
    expected: FxHashMap<RecordKey, OffsetDateTime>,
}

impl Transaction {
    /// Opens a transaction on `backend`.
    pub fn begin(backend: Arc<dyn Backend>) -> Self {
        let id = NEXT_TX_ID.fetch_add(1, Ordering::Relaxed);
        debug!(tx_id = id, backend = backend.name(), "store.tx.begin");
        Self {
            backend,
            id,
            state: TxState::Active,
            staged: Vec::new(),
            overlay: FxHashMap::default(),
            expected: FxHashMap::default(),
        }
    }

    /// Process-unique transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Number of staged writes.
    pub fn pending_writes(&self) -> usize {
        self.staged.len()
    }

    /// The backend this transaction writes to.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(TrackError::TransactionClosed)
        }
    }

    /// Issues a fresh internal record id. Ids are not returned on rollback.
    pub fn next_record_id(&self) -> Result<u64> {
        self.ensure_active()?;
        self.backend.next_record_id()
    }

    /// Reads a record as this transaction sees it.
    pub fn fetch(&self, key: &RecordKey) -> Result<Option<Record>> {
        self.ensure_active()?;
        match self.overlay.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.backend.fetch(key),
        }
    }

    /// Reads the committed copy, ignoring staged writes.
    pub fn fetch_committed(&self, key: &RecordKey) -> Result<Option<Record>> {
        self.ensure_active()?;
        self.backend.fetch(key)
    }

    /// Reads a biosample.
    pub fn biosample(&self, id: BiosampleId) -> Result<Option<Biosample>> {
        match self.fetch(&RecordKey::Biosample(id))? {
            Some(Record::Biosample(sample)) => Ok(Some(sample)),
            _ => Ok(None),
        }
    }

    /// Reads the committed copy of a biosample.
    pub fn committed_biosample(&self, id: BiosampleId) -> Result<Option<Biosample>> {
        match self.fetch_committed(&RecordKey::Biosample(id))? {
            Some(Record::Biosample(sample)) => Ok(Some(sample)),
            _ => Ok(None),
        }
    }

    /// Reads a location.
    pub fn location(&self, id: LocationId) -> Result<Option<Location>> {
        match self.fetch(&RecordKey::Location(id))? {
            Some(Record::Location(location)) => Ok(Some(location)),
            _ => Ok(None),
        }
    }

    /// Reads the committed copy of a location.
    pub fn committed_location(&self, id: LocationId) -> Result<Option<Location>> {
        match self.fetch_committed(&RecordKey::Location(id))? {
            Some(Record::Location(location)) => Ok(Some(location)),
            _ => Ok(None),
        }
    }

    /// Reads a biotype.
    pub fn biotype(&self, id: BiotypeId) -> Result<Option<Biotype>> {
        match self.fetch(&RecordKey::Biotype(id))? {
            Some(Record::Biotype(biotype)) => Ok(Some(biotype)),
            _ => Ok(None),
        }
    }

    /// Reads a study.
    pub fn study(&self, id: StudyId) -> Result<Option<Study>> {
        match self.fetch(&RecordKey::Study(id))? {
            Some(Record::Study(study)) => Ok(Some(study)),
            _ => Ok(None),
        }
    }

    /// Reads a barcode sequence row.
    pub fn sequence(&self, key: &PoolKey) -> Result<Option<BarcodeSequence>> {
        match self.fetch(&RecordKey::Sequence(key.clone()))? {
            Some(Record::Sequence(seq)) => Ok(Some(seq)),
            _ => Ok(None),
        }
    }

    /// Runs a biosample query, merging staged writes into committed results.
    pub fn query_biosamples(&self, query: &BiosampleQuery) -> Result<Vec<Biosample>> {
        self.ensure_active()?;
        let mut out: Vec<Biosample> = self
            .backend
            .query_biosamples(query)?
            .into_iter()
            .filter(|b| !self.overlay.contains_key(&RecordKey::Biosample(b.id)))
            .collect();
        out.extend(self.overlay.values().filter_map(|staged| match staged {
            Some(Record::Biosample(b)) if query.matches(b) => Some(b.clone()),
            _ => None,
        }));
        out.sort_by_key(|b| b.id);
        Ok(out)
    }

    /// Runs a location query, merging staged writes into committed results.
    pub fn query_locations(&self, query: &LocationQuery) -> Result<Vec<Location>> {
        self.ensure_active()?;
        let mut out: Vec<Location> = self
            .backend
            .query_locations(query)?
            .into_iter()
            .filter(|l| !self.overlay.contains_key(&RecordKey::Location(l.id)))
            .collect();
        out.extend(self.overlay.values().filter_map(|staged| match staged {
            Some(Record::Location(l)) if query.matches(l) => Some(l.clone()),
            _ => None,
        }));
        out.sort_by_key(|l| l.id);
        Ok(out)
    }

    /// Identifiers of `category` starting with `head`, staged ones included.
    pub fn existing_identifiers(&self, category: SequenceCategory, head: &str) -> Result<Vec<String>> {
        self.ensure_active()?;
        let mut out = self.backend.existing_identifiers(category, head)?;
        out.extend(
            self.overlay
                .values()
                .flatten()
                .filter_map(|record| identifier_of(record, category))
                .filter(|id| id.starts_with(head))
                .map(str::to_string),
        );
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Every record of `kind` as this transaction sees it.
    pub fn scan(&self, kind: RecordKind) -> Result<Vec<Record>> {
        self.ensure_active()?;
        let mut out: Vec<Record> = self
            .backend
            .scan(kind)?
            .into_iter()
            .filter(|r| !self.overlay.contains_key(&r.key()))
            .collect();
        out.extend(
            self.overlay
                .values()
                .flatten()
                .filter(|r| r.kind() == kind)
                .cloned(),
        );
        Ok(out)
    }

    /// Requires the committed copy of `key` to still carry `updated_at` when
    /// this transaction commits. The first expectation per record wins.
    pub fn expect_unchanged(&mut self, key: RecordKey, updated_at: OffsetDateTime) {
        self.expected.entry(key).or_insert(updated_at);
    }

    /// Records the committed stamp of `key` unless an expectation exists.
    fn expect_committed(&mut self, key: &RecordKey) -> Result<()> {
        if self.expected.contains_key(key) {
            return Ok(());
        }
        if let Some(audit) = self.backend.fetch(key)?.as_ref().and_then(Record::audit) {
            self.expected.insert(key.clone(), audit.updated_at);
        }
        Ok(())
    }

    /// Stages creation of `record`.
    pub fn insert(&mut self, record: Record) -> Result<()> {
        let key = record.key();
        if self.fetch(&key)?.is_some() {
            return Err(TrackError::Storage(format!("duplicate key {key:?}")));
        }
        self.overlay.insert(key, Some(record.clone()));
        self.staged.push(Write::Insert(record));
        Ok(())
    }

    /// Stages replacement of an existing `record`.
    pub fn update(&mut self, record: Record) -> Result<()> {
        let key = record.key();
        if self.fetch(&key)?.is_none() {
            return Err(TrackError::not_found("record", format!("{key:?}")));
        }
        self.expect_committed(&key)?;
        self.overlay.insert(key, Some(record.clone()));
        self.staged.push(Write::Update(record));
        Ok(())
    }

    /// Stages an insert or an update, whichever applies.
    pub fn put(&mut self, record: Record) -> Result<()> {
        if self.fetch(&record.key())?.is_some() {
            self.update(record)
        } else {
            self.insert(record)
        }
    }

    /// Stages removal of `key`.
    pub fn delete(&mut self, key: RecordKey) -> Result<()> {
        if self.fetch(&key)?.is_none() {
            return Err(TrackError::not_found("record", format!("{key:?}")));
        }
        self.expect_committed(&key)?;
        self.overlay.insert(key.clone(), None);
        self.staged.push(Write::Delete(key));
        Ok(())
    }

    /// Collapses staged writes to one write per record, keeping first-touch
    /// order. Returns the number of writes left.
    pub fn flush(&mut self) -> Result<usize> {
        self.ensure_active()?;
        let mut order: Vec<RecordKey> = Vec::new();
        let mut folded: FxHashMap<RecordKey, Option<Write>> = FxHashMap::default();
        for write in self.staged.drain(..) {
            let key = write.key();
            match folded.get_mut(&key) {
                None => {
                    order.push(key.clone());
                    folded.insert(key, Some(write));
                }
                Some(slot) => {
                    *slot = match (slot.take(), write) {
                        (Some(Write::Insert(_)), Write::Update(record)) => {
                            Some(Write::Insert(record))
                        }
                        (Some(Write::Insert(_)), Write::Delete(_)) => None,
                        (None, Write::Insert(record)) => Some(Write::Insert(record)),
                        (Some(Write::Delete(_)), Write::Insert(record)) => {
                            Some(Write::Update(record))
                        }
                        (_, later) => Some(later),
                    };
                }
            }
        }
        self.staged = order
            .into_iter()
            .filter_map(|key| folded.remove(&key).flatten())
            .collect();
        Ok(self.staged.len())
    }

    /// Applies every staged write atomically.
    ///
    /// Fails with a conflict when a record staged for update or delete was
    /// committed by someone else after this transaction read it. A failed
    /// commit leaves the transaction rolled back.
    pub fn commit(mut self) -> Result<CommitSummary> {
        self.flush()?;
        let mut summary = CommitSummary::default();
        for write in &self.staged {
            match write {
                Write::Insert(_) => summary.inserted += 1,
                Write::Update(_) => summary.updated += 1,
                Write::Delete(_) => summary.deleted += 1,
            }
        }
        if !self.staged.is_empty() {
            let expected: Vec<Expected> = self
                .expected
                .iter()
                .map(|(key, updated_at)| Expected {
                    key: key.clone(),
                    updated_at: *updated_at,
                })
                .collect();
            if let Err(err) = self.backend.apply_guarded(&self.staged, &expected) {
                self.state = TxState::RolledBack;
                warn!(tx_id = self.id, error = %err, "store.tx.commit_failed");
                return Err(err);
            }
        }
        self.state = TxState::Committed;
        self.staged.clear();
        self.overlay.clear();
        self.expected.clear();
        debug!(
            tx_id = self.id,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            "store.tx.commit"
        );
        Ok(summary)
    }

    /// Discards every staged write.
    pub fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        let discarded = self.staged.len();
        self.staged.clear();
        self.overlay.clear();
        self.expected.clear();
        self.state = TxState::RolledBack;
        debug!(tx_id = self.id, discarded, "store.tx.rollback");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active && !self.staged.is_empty() {
            warn!(
                tx_id = self.id,
                discarded = self.staged.len(),
                "store.tx.dropped_active"
            );
        }
    }
}
