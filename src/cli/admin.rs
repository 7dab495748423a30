use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::import_export::CliError;
use crate::config::EngineConfig;
use crate::engine::Tracker;
use crate::model::{
    Biosample, Biotype, Container, ContainerType, FieldKind, Labeling, Location, LocationType,
    MetadataField, Study,
};
use crate::store::SqliteBackend;
use crate::types::{GroupId, PhaseId, User};

/// Options for [`open_tracker`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Create the file (and its directory) when missing.
    pub create_if_missing: bool,
    /// Engine settings.
    pub config: EngineConfig,
}

/// Opens a tracker over the SQLite file at `path`. The background sweeper is
/// not started; CLI processes are short-lived.
pub fn open_tracker(path: &Path, opts: &OpenOptions) -> Result<Tracker, CliError> {
    if !path.exists() {
        if !opts.create_if_missing {
            return Err(CliError::Message(format!(
                "database {} does not exist (run `biotrack init` first)",
                path.display()
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
    }
    let backend = SqliteBackend::open(path)?;
    let tracker = Tracker::builder(Arc::new(backend))
        .config(opts.config.clone())
        .without_sweeper()
        .build()?;
    Ok(tracker)
}

/// What [`seed_demo`] created.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedSummary {
    /// Biotypes created.
    pub biotypes: usize,
    /// Locations created.
    pub locations: usize,
    /// Biosamples created.
    pub biosamples: usize,
    /// Sample ids of the created biosamples.
    pub sample_ids: Vec<String>,
}

/// Populates a study, two biotypes, a freezer with a 9x9 box, one animal and
/// two blood aliquots stored in the box.
pub fn seed_demo(tracker: &Tracker, user: &User) -> Result<SeedSummary, CliError> {
    let animal = Biotype {
        name_required: true,
        name_unique: true,
        container_type: Some(ContainerType::Cage),
        ..Biotype::new(tracker.new_biotype_id()?, "Animal", "AN")
    }
    .with_field(MetadataField::new(
        "sex",
        FieldKind::List(vec!["M".into(), "F".into()]),
    ))
    .with_field(MetadataField::new("weight", FieldKind::Number));
    let blood = Biotype {
        container_type: Some(ContainerType::Tube),
        ..Biotype::new(tracker.new_biotype_id()?, "Blood", "BL")
    }
    .with_field(MetadataField::new("volume", FieldKind::Number).required())
    .with_field(MetadataField::new(
        "dose",
        FieldKind::Formula("volume * 2".into()),
    ));
    tracker.save_biotype(user, &animal)?;
    tracker.save_biotype(user, &blood)?;

    let mut study = Study::new(tracker.new_study_id()?, "S-001")
        .with_group(GroupId(1))
        .with_phase(PhaseId(1));
    tracker.save_study(user, &mut study)?;

    let freezer = Location::new(tracker.new_location_id()?, "Freezer", LocationType::Freezer);
    let rack_box = Location::new(tracker.new_location_id()?, "Box 1", LocationType::Box)
        .within(freezer.id)
        .with_grid(Labeling::Alpha, 9, 9);
    let mut locations = vec![freezer, rack_box];
    let location_report = tracker.save_locations(user, &mut locations)?;

    let mut mouse = Biosample::new(tracker.new_biosample_id()?, animal.id)
        .with_name("Mouse 1")
        .with_meta("sex", "F")
        .with_meta("weight", "21.5")
        .attached_to(study.id)
        .in_container(Container::new(ContainerType::Cage));
    mouse.inherited_group = Some(GroupId(1));
    mouse.inherited_phase = Some(PhaseId(1));
    let plasma = Biosample::new(tracker.new_biosample_id()?, blood.id)
        .with_parent(mouse.id)
        .with_meta("volume", "0.5")
        .at(locations[1].id, 0);
    let serum = Biosample::new(tracker.new_biosample_id()?, blood.id)
        .with_parent(mouse.id)
        .with_meta("volume", "0.25")
        .at(locations[1].id, 1);
    let mut samples = vec![mouse, plasma, serum];
    let report = tracker.save_biosamples(user, &mut samples)?;
    info!(
        biosamples = report.inserted,
        locations = location_report.inserted,
        "cli.seed_demo"
    );
    Ok(SeedSummary {
        biotypes: 2,
        locations: location_report.inserted,
        biosamples: report.inserted,
        sample_ids: samples.into_iter().map(|s| s.sample_id).collect(),
    })
}
