use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::ConfigError;
use crate::engine::Tracker;
use crate::error::TrackError;
use crate::model::{Biosample, Biotype, Container, ContainerType, Location, Study};
use crate::store::{BiosampleQuery, LocationQuery, Record, RecordKind, Transaction};
use crate::types::{BiosampleId, BiotypeId, LocationId, StudyId, User};

const COL_SAMPLE_ID: &str = "sample_id";
const COL_BIOTYPE: &str = "biotype";
const COL_NAME: &str = "name";
const COL_PARENT: &str = "parent";
const COL_CONTAINER_TYPE: &str = "container_type";
const COL_CONTAINER_ID: &str = "container_id";
const COL_LOCATION: &str = "location";
const COL_POSITION: &str = "position";
const COL_STUDY: &str = "study";

const FIXED_COLUMNS: [&str; 9] = [
    COL_SAMPLE_ID,
    COL_BIOTYPE,
    COL_NAME,
    COL_PARENT,
    COL_CONTAINER_TYPE,
    COL_CONTAINER_ID,
    COL_LOCATION,
    COL_POSITION,
    COL_STUDY,
];

/// Error type for CLI operations.
#[derive(Error, Debug)]
pub enum CliError {
    /// Generic error message.
    #[error("{0}")]
    Message(String),
    /// A row of the input file is malformed.
    #[error("row {row}: {message}")]
    Row {
        /// One-based data row number.
        row: usize,
        /// What is wrong.
        message: String,
    },
    /// IO error from file operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// CSV parsing or writing error.
    #[error(transparent)]
    Csv(#[from] csv::Error),
    /// Engine error.
    #[error(transparent)]
    Track(#[from] TrackError),
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<&str> for CliError {
    fn from(value: &str) -> Self {
        CliError::Message(value.to_string())
    }
}

impl From<String> for CliError {
    fn from(value: String) -> Self {
        CliError::Message(value)
    }
}

/// Configuration for a biosample import.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// CSV file to read.
    pub path: PathBuf,
    /// Field delimiter.
    pub delimiter: u8,
}

/// Summary of an import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    /// Rows saved as new biosamples.
    pub inserted: usize,
    /// Rows that updated an existing biosample.
    pub updated: usize,
    /// Descendants rewritten by propagation.
    pub propagated: usize,
    /// Sample ids allocated for rows without one.
    pub allocated: Vec<String>,
    /// Soft failures.
    pub warnings: Vec<String>,
}

/// Configuration for a biosample export.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// CSV file to write.
    pub path: PathBuf,
    /// Field delimiter.
    pub delimiter: u8,
}

/// Summary of an export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportSummary {
    /// Biosamples written.
    pub exported: usize,
}

struct Lookups {
    biotypes: HashMap<String, Biotype>,
    studies: HashMap<String, StudyId>,
}

impl Lookups {
    fn load(tx: &Transaction) -> Result<Self, CliError> {
        let mut biotypes = HashMap::new();
        for record in tx.scan(RecordKind::Biotype)? {
            if let Record::Biotype(biotype) = record {
                biotypes.insert(biotype.name.trim().to_lowercase(), biotype);
            }
        }
        let mut studies = HashMap::new();
        for record in tx.scan(RecordKind::Study)? {
            if let Record::Study(study) = record {
                studies.insert(study.study_code.clone(), study.id);
            }
        }
        Ok(Self { biotypes, studies })
    }
}

/// Reads every row of `cfg.path` and saves them as one batch.
///
/// Rows whose `sample_id` already exists update that biosample; other rows
/// create one. `parent` may refer to a row of the same file. Columns outside
/// the fixed set become metadata.
pub fn run_import(tracker: &Tracker, user: &User, cfg: &ImportConfig) -> Result<ImportSummary, CliError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(cfg.delimiter)
        .trim(csv::Trim::All)
        .from_path(&cfg.path)?;
    let headers = reader.headers()?.clone();
    let columns = ColumnIndex::new(&headers)?;

    let tx = tracker.begin();
    let lookups = Lookups::load(&tx)?;
    let mut location_paths: HashMap<String, Location> = HashMap::new();
    let mut batch: Vec<Biosample> = Vec::new();
    let mut by_sample_id: HashMap<String, BiosampleId> = HashMap::new();
    let mut pending_parents: Vec<(usize, String, usize)> = Vec::new();

    for (row_idx, row) in reader.records().enumerate() {
        let row = row?;
        let row_no = row_idx + 1;
        let fail = |message: String| CliError::Row {
            row: row_no,
            message,
        };
        let sample_id = columns.get(&row, COL_SAMPLE_ID).to_string();
        let existing = if sample_id.is_empty() {
            None
        } else {
            tx.query_biosamples(&BiosampleQuery::SampleId(sample_id.clone()))?
                .into_iter()
                .next()
        };
        let biotype_name = columns.get(&row, COL_BIOTYPE);
        let mut sample = match existing {
            Some(sample) => sample,
            None => {
                let biotype = lookups
                    .biotypes
                    .get(&biotype_name.to_lowercase())
                    .ok_or_else(|| fail(format!("unknown biotype '{biotype_name}'")))?;
                Biosample::new(tracker.new_biosample_id()?, biotype.id)
                    .with_sample_id(sample_id.clone())
            }
        };
        if !biotype_name.is_empty() {
            let biotype = lookups
                .biotypes
                .get(&biotype_name.to_lowercase())
                .ok_or_else(|| fail(format!("unknown biotype '{biotype_name}'")))?;
            sample.biotype = biotype.id;
        }

        let name = columns.get(&row, COL_NAME);
        if !name.is_empty() {
            sample.name = Some(name.to_string());
        }

        let container_type = columns.get(&row, COL_CONTAINER_TYPE);
        if !container_type.is_empty() {
            let ty = ContainerType::from_name(container_type)
                .ok_or_else(|| fail(format!("unknown container type '{container_type}'")))?;
            let container_id = columns.get(&row, COL_CONTAINER_ID);
            sample.container = Some(if container_id.is_empty() {
                Container::new(ty)
            } else {
                Container::with_id(ty, container_id)
            });
        }

        let location_path = columns.get(&row, COL_LOCATION);
        if !location_path.is_empty() {
            if !location_paths.contains_key(location_path) {
                let location = resolve_path(&tx, location_path)?
                    .ok_or_else(|| fail(format!("unknown location '{location_path}'")))?;
                location_paths.insert(location_path.to_string(), location);
            }
            if let Some(location) = location_paths.get(location_path) {
                let label = columns.get(&row, COL_POSITION);
                let pos = if label.is_empty() || !location.has_grid() {
                    crate::model::NO_POSITION
                } else {
                    location.parse_position(label).ok_or_else(|| {
                        fail(format!("position '{label}' is not valid in '{location_path}'"))
                    })?
                };
                sample.location = Some(location.id);
                sample.pos = pos;
            }
        }

        let study = columns.get(&row, COL_STUDY);
        if !study.is_empty() {
            let id = lookups
                .studies
                .get(study)
                .ok_or_else(|| fail(format!("unknown study '{study}'")))?;
            sample.attached_study = Some(*id);
        }

        for (header, value) in headers.iter().zip(row.iter()) {
            if !FIXED_COLUMNS.contains(&header) && !value.is_empty() {
                sample.metadata.insert(header.to_string(), value.to_string());
            }
        }

        let parent = columns.get(&row, COL_PARENT);
        if !parent.is_empty() {
            pending_parents.push((batch.len(), parent.to_string(), row_no));
        }
        if !sample.sample_id.is_empty() {
            by_sample_id.insert(sample.sample_id.clone(), sample.id);
        }
        batch.push(sample);
    }

    for (idx, parent, row_no) in pending_parents {
        let parent_id = match by_sample_id.get(&parent) {
            Some(id) => *id,
            None => tx
                .query_biosamples(&BiosampleQuery::SampleId(parent.clone()))?
                .first()
                .map(|p| p.id)
                .ok_or_else(|| CliError::Row {
                    row: row_no,
                    message: format!("unknown parent '{parent}'"),
                })?,
        };
        batch[idx].parent = Some(parent_id);
    }
    drop(tx);

    debug!(rows = batch.len(), path = %cfg.path.display(), "cli.import.parsed");
    let report = tracker.save_biosamples(user, &mut batch)?;
    Ok(ImportSummary {
        inserted: report.inserted,
        updated: report.updated,
        propagated: report.propagated,
        allocated: report.allocated,
        warnings: report.warnings,
    })
}

/// Writes every biosample to `cfg.path`, one row each, ordered by sample id.
pub fn run_export(tracker: &Tracker, cfg: &ExportConfig) -> Result<ExportSummary, CliError> {
    let tx = tracker.begin();
    let mut samples: Vec<Biosample> = tx
        .scan(RecordKind::Biosample)?
        .into_iter()
        .filter_map(|r| match r {
            Record::Biosample(b) => Some(b),
            _ => None,
        })
        .collect();
    samples.sort_by(|a, b| a.sample_id.cmp(&b.sample_id));

    let mut biotypes: HashMap<BiotypeId, String> = HashMap::new();
    let mut studies: HashMap<StudyId, String> = HashMap::new();
    for record in tx.scan(RecordKind::Biotype)? {
        if let Record::Biotype(t) = record {
            biotypes.insert(t.id, t.name);
        }
    }
    for record in tx.scan(RecordKind::Study)? {
        if let Record::Study(Study { id, study_code, .. }) = record {
            studies.insert(id, study_code);
        }
    }
    let by_id: HashMap<BiosampleId, String> = samples
        .iter()
        .map(|s| (s.id, s.sample_id.clone()))
        .collect();
    let meta_columns: BTreeSet<String> = samples
        .iter()
        .flat_map(|s| s.metadata.keys().cloned())
        .filter(|k| !FIXED_COLUMNS.contains(&k.as_str()))
        .collect();

    let mut writer = WriterBuilder::new()
        .delimiter(cfg.delimiter)
        .from_path(&cfg.path)?;
    let mut header: Vec<&str> = FIXED_COLUMNS.to_vec();
    header.extend(meta_columns.iter().map(String::as_str));
    writer.write_record(&header)?;

    let mut locations: HashMap<LocationId, (String, Location)> = HashMap::new();
    for sample in &samples {
        let (location_path, position) = match sample.location {
            Some(id) => {
                if !locations.contains_key(&id) {
                    let path = tracker.grid().full_path(&tx, id)?;
                    let location = tx
                        .location(id)?
                        .ok_or_else(|| TrackError::not_found("location", id))?;
                    locations.insert(id, (path, location));
                }
                match locations.get(&id) {
                    Some((path, location)) => (path.clone(), location.format_position(sample.pos)),
                    None => (String::new(), String::new()),
                }
            }
            None => (String::new(), String::new()),
        };
        let container = sample.container.as_ref();
        let mut record: Vec<String> = vec![
            sample.sample_id.clone(),
            biotypes.get(&sample.biotype).cloned().unwrap_or_default(),
            sample.name.clone().unwrap_or_default(),
            sample
                .parent
                .and_then(|p| by_id.get(&p).cloned())
                .unwrap_or_default(),
            container
                .map(|c| c.container_type.name().to_string())
                .unwrap_or_default(),
            container
                .and_then(|c| c.container_id.clone())
                .unwrap_or_default(),
            location_path,
            position,
            sample
                .attached_study
                .and_then(|s| studies.get(&s).cloned())
                .unwrap_or_default(),
        ];
        for column in &meta_columns {
            record.push(sample.metadata.get(column).cloned().unwrap_or_default());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    debug!(rows = samples.len(), path = %cfg.path.display(), "cli.export.done");
    Ok(ExportSummary {
        exported: samples.len(),
    })
}

struct ColumnIndex {
    positions: HashMap<&'static str, usize>,
}

impl ColumnIndex {
    fn new(headers: &StringRecord) -> Result<Self, CliError> {
        let mut positions = HashMap::new();
        for column in FIXED_COLUMNS {
            if let Some(idx) = headers.iter().position(|h| h.eq_ignore_ascii_case(column)) {
                positions.insert(column, idx);
            }
        }
        if !positions.contains_key(COL_SAMPLE_ID) && !positions.contains_key(COL_BIOTYPE) {
            return Err(CliError::Message(format!(
                "input needs a '{COL_SAMPLE_ID}' or '{COL_BIOTYPE}' column"
            )));
        }
        Ok(Self { positions })
    }

    fn get<'r>(&self, row: &'r StringRecord, column: &str) -> &'r str {
        self.positions
            .get(column)
            .and_then(|&idx| row.get(idx))
            .unwrap_or("")
    }
}

/// Finds a location by its slash-separated path from the root.
fn resolve_path(tx: &Transaction, path: &str) -> Result<Option<Location>, CliError> {
    let mut parent: Option<LocationId> = None;
    let mut found: Option<Location> = None;
    for name in path.split('/').map(str::trim).filter(|n| !n.is_empty()) {
        let Some(location) = tx
            .query_locations(&LocationQuery::Named {
                parent,
                name: name.to_string(),
            })?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        parent = Some(location.id);
        found = Some(location);
    }
    Ok(found)
}
