use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::checks::{self, CommitView};
use super::{
    identifier_of, Backend, BiosampleQuery, Expected, LocationQuery, Record, RecordKey,
    RecordKind, Write,
};
use crate::cache::PoolKey;
use crate::error::{Result, TrackError};
use crate::model::{BarcodeSequence, Biosample, Biotype, Location, SequenceCategory, Study};
use crate::types::{BiosampleId, BiotypeId, LocationId, StudyId};

#[derive(Clone, Default)]
struct Tables {
    biosamples: BTreeMap<BiosampleId, Biosample>,
    locations: BTreeMap<LocationId, Location>,
    biotypes: BTreeMap<BiotypeId, Biotype>,
    studies: BTreeMap<StudyId, Study>,
    sequences: BTreeMap<PoolKey, BarcodeSequence>,
}

impl Tables {
    fn get(&self, key: &RecordKey) -> Option<Record> {
        match key {
            RecordKey::Biosample(id) => self.biosamples.get(id).cloned().map(Record::Biosample),
            RecordKey::Location(id) => self.locations.get(id).cloned().map(Record::Location),
            RecordKey::Biotype(id) => self.biotypes.get(id).cloned().map(Record::Biotype),
            RecordKey::Study(id) => self.studies.get(id).cloned().map(Record::Study),
            RecordKey::Sequence(key) => self.sequences.get(key).cloned().map(Record::Sequence),
        }
    }

    fn contains(&self, key: &RecordKey) -> bool {
        match key {
            RecordKey::Biosample(id) => self.biosamples.contains_key(id),
            RecordKey::Location(id) => self.locations.contains_key(id),
            RecordKey::Biotype(id) => self.biotypes.contains_key(id),
            RecordKey::Study(id) => self.studies.contains_key(id),
            RecordKey::Sequence(key) => self.sequences.contains_key(key),
        }
    }

    fn store(&mut self, record: Record) {
        match record {
            Record::Biosample(b) => {
                self.biosamples.insert(b.id, b);
            }
            Record::Location(l) => {
                self.locations.insert(l.id, l);
            }
            Record::Biotype(t) => {
                self.biotypes.insert(t.id, t);
            }
            Record::Study(s) => {
                self.studies.insert(s.id, s);
            }
            Record::Sequence(seq) => {
                self.sequences
                    .insert(PoolKey::new(seq.category, seq.pattern.clone()), seq);
            }
        }
    }

    fn remove(&mut self, key: &RecordKey) {
        match key {
            RecordKey::Biosample(id) => {
                self.biosamples.remove(id);
            }
            RecordKey::Location(id) => {
                self.locations.remove(id);
            }
            RecordKey::Biotype(id) => {
                self.biotypes.remove(id);
            }
            RecordKey::Study(id) => {
                self.studies.remove(id);
            }
            RecordKey::Sequence(key) => {
                self.sequences.remove(key);
            }
        }
    }

    fn apply(&mut self, write: &Write) -> Result<()> {
        let key = write.key();
        match write {
            Write::Insert(record) => {
                if self.contains(&key) {
                    return Err(TrackError::Storage(format!("duplicate key {key:?}")));
                }
                self.store(record.clone());
            }
            Write::Update(record) => {
                if !self.contains(&key) {
                    return Err(TrackError::not_found("record", format!("{key:?}")));
                }
                self.store(record.clone());
            }
            Write::Delete(_) => self.remove(&key),
        }
        Ok(())
    }
}

impl CommitView for Tables {
    fn record(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.get(key))
    }

    fn biosamples(&self, query: &BiosampleQuery) -> Result<Vec<Biosample>> {
        Ok(self
            .biosamples
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect())
    }
}

/// In-process backend holding every table in memory.
///
/// Commits are checked and applied to a copy of the tables under the write
/// lock and swapped in, so a failing write leaves committed state untouched.
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn bump_ids_past(&self, id: u64) {
        self.next_id.fetch_max(id + 1, Ordering::Relaxed);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn fetch(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.tables.read().get(key))
    }

    fn query_biosamples(&self, query: &BiosampleQuery) -> Result<Vec<Biosample>> {
        self.tables.read().biosamples(query)
    }

    fn query_locations(&self, query: &LocationQuery) -> Result<Vec<Location>> {
        Ok(self
            .tables
            .read()
            .locations
            .values()
            .filter(|l| query.matches(l))
            .cloned()
            .collect())
    }

    fn existing_identifiers(&self, category: SequenceCategory, head: &str) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let records: Box<dyn Iterator<Item = Record> + '_> = match category {
            SequenceCategory::Sample | SequenceCategory::Container => Box::new(
                tables.biosamples.values().cloned().map(Record::Biosample),
            ),
            SequenceCategory::Location => {
                Box::new(tables.locations.values().cloned().map(Record::Location))
            }
        };
        let mut out: Vec<String> = records
            .filter_map(|record| identifier_of(&record, category).map(str::to_string))
            .filter(|id| id.starts_with(head))
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    fn scan(&self, kind: RecordKind) -> Result<Vec<Record>> {
        let tables = self.tables.read();
        let out = match kind {
            RecordKind::Biosample => tables
                .biosamples
                .values()
                .cloned()
                .map(Record::Biosample)
                .collect(),
            RecordKind::Location => tables
                .locations
                .values()
                .cloned()
                .map(Record::Location)
                .collect(),
            RecordKind::Biotype => tables
                .biotypes
                .values()
                .cloned()
                .map(Record::Biotype)
                .collect(),
            RecordKind::Study => tables.studies.values().cloned().map(Record::Study).collect(),
            RecordKind::Sequence => tables
                .sequences
                .values()
                .cloned()
                .map(Record::Sequence)
                .collect(),
        };
        Ok(out)
    }

    fn next_record_id(&self) -> Result<u64> {
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn apply_guarded(&self, writes: &[Write], expected: &[Expected]) -> Result<()> {
        let mut tables = self.tables.write();
        checks::verify_expected(&*tables, expected)?;
        let mut next = tables.clone();
        for write in writes {
            next.apply(write)?;
            let raw = match write.key() {
                RecordKey::Biosample(id) => id.0,
                RecordKey::Location(id) => id.0,
                RecordKey::Biotype(id) => id.0,
                RecordKey::Study(id) => id.0,
                RecordKey::Sequence(_) => 0,
            };
            self.bump_ids_past(raw);
        }
        checks::verify_biosamples(&next, writes)?;
        *tables = next;
        Ok(())
    }

    fn advance_sequence(
        &self,
        key: &PoolKey,
        advance: &mut dyn FnMut(Option<&str>) -> Result<String>,
    ) -> Result<String> {
        let mut tables = self.tables.write();
        let current = tables.sequences.get(key).map(|seq| seq.last_barcode.clone());
        let last_barcode = advance(current.as_deref())?;
        tables.sequences.insert(
            key.clone(),
            BarcodeSequence {
                category: key.category,
                pattern: key.pattern.clone(),
                last_barcode: last_barcode.clone(),
            },
        );
        Ok(last_barcode)
    }
}
