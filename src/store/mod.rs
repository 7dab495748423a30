#![forbid(unsafe_code)]

//! Persistence collaborator.
//!
//! A [`Backend`] offers the few primitives the engine relies on: keyed fetch,
//! typed parameterised queries, an atomic multi-record write and a record id
//! counter. [`Transaction`] layers a buffered write-set over a backend and is
//! the explicit session value every engine operation receives.

mod checks;
mod memory;
mod sqlite;
mod tx;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cache::PoolKey;
use crate::error::Result;
use crate::model::{BarcodeSequence, Biosample, Biotype, Location, SequenceCategory, Study};
use crate::types::{Audit, BiosampleId, BiotypeId, LocationId, StudyId};

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use tx::{CommitSummary, Transaction, TxState};

/// Primary key of any persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// A biosample row.
    Biosample(BiosampleId),
    /// A location row.
    Location(LocationId),
    /// A biotype row.
    Biotype(BiotypeId),
    /// A study row.
    Study(StudyId),
    /// A barcode sequence row.
    Sequence(PoolKey),
}

/// Record families, used for full scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Biosamples.
    Biosample,
    /// Locations.
    Location,
    /// Biotypes.
    Biotype,
    /// Studies.
    Study,
    /// Barcode sequences.
    Sequence,
}

/// Any persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Record {
    /// A biosample.
    Biosample(Biosample),
    /// A location.
    Location(Location),
    /// A biotype.
    Biotype(Biotype),
    /// A study.
    Study(Study),
    /// A barcode sequence.
    Sequence(BarcodeSequence),
}

impl Record {
    /// Primary key of the record.
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Biosample(b) => RecordKey::Biosample(b.id),
            Record::Location(l) => RecordKey::Location(l.id),
            Record::Biotype(t) => RecordKey::Biotype(t.id),
            Record::Study(s) => RecordKey::Study(s.id),
            Record::Sequence(seq) => {
                RecordKey::Sequence(PoolKey::new(seq.category, seq.pattern.clone()))
            }
        }
    }

    /// Record family.
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Biosample(_) => RecordKind::Biosample,
            Record::Location(_) => RecordKind::Location,
            Record::Biotype(_) => RecordKind::Biotype,
            Record::Study(_) => RecordKind::Study,
            Record::Sequence(_) => RecordKind::Sequence,
        }
    }

    /// Audit stamps of auditable records.
    pub fn audit(&self) -> Option<&Audit> {
        match self {
            Record::Biosample(b) => b.audit.as_ref(),
            Record::Location(l) => l.audit.as_ref(),
            Record::Study(s) => s.audit.as_ref(),
            Record::Biotype(_) | Record::Sequence(_) => None,
        }
    }

    /// Entity name used in errors.
    pub fn entity(&self) -> &'static str {
        match self {
            Record::Biosample(_) => "biosample",
            Record::Location(_) => "location",
            Record::Biotype(_) => "biotype",
            Record::Study(_) => "study",
            Record::Sequence(_) => "barcode sequence",
        }
    }

    /// Label used in errors.
    pub fn label(&self) -> String {
        match self {
            Record::Biosample(b) => b.label(),
            Record::Location(l) => l.name.clone(),
            Record::Biotype(t) => t.name.clone(),
            Record::Study(s) => s.study_code.clone(),
            Record::Sequence(seq) => seq.pattern.clone(),
        }
    }
}

impl RecordKey {
    /// Record family of the key.
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordKey::Biosample(_) => RecordKind::Biosample,
            RecordKey::Location(_) => RecordKind::Location,
            RecordKey::Biotype(_) => RecordKind::Biotype,
            RecordKey::Study(_) => RecordKind::Study,
            RecordKey::Sequence(_) => RecordKind::Sequence,
        }
    }
}

/// One staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Create a record; fails if the key exists.
    Insert(Record),
    /// Replace a record; fails if the key is missing.
    Update(Record),
    /// Remove a record.
    Delete(RecordKey),
}

impl Write {
    /// Key the write targets.
    pub fn key(&self) -> RecordKey {
        match self {
            Write::Insert(record) | Write::Update(record) => record.key(),
            Write::Delete(key) => key.clone(),
        }
    }
}

/// Stamp a committed record must still carry when a write-set lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    /// Record the expectation is about.
    pub key: RecordKey,
    /// `updated_at` the record carried when it was read.
    pub updated_at: OffsetDateTime,
}

/// Parameterised biosample lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BiosampleQuery {
    /// Exact sample id.
    SampleId(String),
    /// Direct children of a biosample.
    ChildrenOf(BiosampleId),
    /// Samples stored in a location.
    InLocation(LocationId),
    /// Samples sharing a container id.
    InContainer(String),
    /// Samples of a biotype carrying a name (case-insensitive).
    Named {
        /// Biotype scope.
        biotype: BiotypeId,
        /// Name to look for.
        name: String,
    },
}

impl BiosampleQuery {
    /// Evaluates the query against one record.
    pub fn matches(&self, sample: &Biosample) -> bool {
        match self {
            BiosampleQuery::SampleId(id) => sample.sample_id == *id,
            BiosampleQuery::ChildrenOf(parent) => sample.parent == Some(*parent),
            BiosampleQuery::InLocation(location) => sample.location == Some(*location),
            BiosampleQuery::InContainer(container) => {
                sample.container_id() == Some(container.as_str())
            }
            BiosampleQuery::Named { biotype, name } => {
                sample.biotype == *biotype
                    && sample
                        .name
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(name))
            }
        }
    }
}

/// Parameterised location lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationQuery {
    /// Direct children of a location, or the roots for `None`.
    ChildrenOf(Option<LocationId>),
    /// Siblings under `parent` with a name (case-insensitive).
    Named {
        /// Enclosing location.
        parent: Option<LocationId>,
        /// Name to look for.
        name: String,
    },
}

impl LocationQuery {
    /// Evaluates the query against one record.
    pub fn matches(&self, location: &Location) -> bool {
        match self {
            LocationQuery::ChildrenOf(parent) => location.parent == *parent,
            LocationQuery::Named { parent, name } => {
                location.parent == *parent && location.name.eq_ignore_ascii_case(name)
            }
        }
    }
}

/// Identifier value of `record` in `category`, if any.
pub(crate) fn identifier_of(record: &Record, category: SequenceCategory) -> Option<&str> {
    match (category, record) {
        (SequenceCategory::Sample, Record::Biosample(b)) if !b.sample_id.is_empty() => {
            Some(b.sample_id.as_str())
        }
        (SequenceCategory::Container, Record::Biosample(b)) => b.container_id(),
        (SequenceCategory::Location, Record::Location(l)) => l.code.as_deref(),
        _ => None,
    }
}

/// Storage primitives required by the engine.
///
/// Implementations must make [`Backend::apply_guarded`] and
/// [`Backend::advance_sequence`] atomic with respect to every other writer of
/// the same store, including other processes sharing a database file.
pub trait Backend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Reads one committed record.
    fn fetch(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// Runs a biosample query against committed state.
    fn query_biosamples(&self, query: &BiosampleQuery) -> Result<Vec<Biosample>>;

    /// Runs a location query against committed state.
    fn query_locations(&self, query: &LocationQuery) -> Result<Vec<Location>>;

    /// Committed identifiers of `category` starting with `head`.
    fn existing_identifiers(&self, category: SequenceCategory, head: &str) -> Result<Vec<String>>;

    /// Every committed record of `kind`, ordered by key.
    fn scan(&self, kind: RecordKind) -> Result<Vec<Record>>;

    /// Issues a fresh internal record id.
    fn next_record_id(&self) -> Result<u64>;

    /// Applies `writes` atomically once every expectation holds.
    ///
    /// Inside the same atomic section the backend refuses the write-set when
    /// an expected stamp moved, when a written biosample reuses another
    /// record's sample id or when it lands on an occupied grid slot.
    fn apply_guarded(&self, writes: &[Write], expected: &[Expected]) -> Result<()>;

    /// Applies `writes` atomically without stamp expectations.
    fn apply(&self, writes: &[Write]) -> Result<()> {
        self.apply_guarded(writes, &[])
    }

    /// Reads the `last_barcode` of a sequence row and replaces it with the
    /// value `advance` computes from it, as one atomic step. Returns the
    /// stored value.
    fn advance_sequence(
        &self,
        key: &PoolKey,
        advance: &mut dyn FnMut(Option<&str>) -> Result<String>,
    ) -> Result<String>;
}
