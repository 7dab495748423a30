#![allow(missing_docs)]

use std::sync::Arc;

use biotrack::{
    model::{Biosample, Biotype, Container, ContainerType, FieldKind, MetadataField},
    rights::GroupRights,
    store::MemoryBackend,
    types::User,
    TrackError, Tracker, ValidationKind,
};

fn tracker() -> Tracker {
    Tracker::builder(Arc::new(MemoryBackend::new()))
        .without_sweeper()
        .build()
        .expect("tracker")
}

fn blood(tracker: &Tracker, user: &User) -> Biotype {
    let biotype = Biotype {
        container_type: Some(ContainerType::Tube),
        ..Biotype::new(tracker.new_biotype_id().unwrap(), "Blood", "BL")
    }
    .with_field(MetadataField::new("volume", FieldKind::Number).required())
    .with_field(MetadataField::new("drawn", FieldKind::Date))
    .with_field(MetadataField::new(
        "dose",
        FieldKind::Formula("volume * 2".into()),
    ))
    .with_field(MetadataField::new(
        "ratio",
        FieldKind::Formula("{dilution} / volume".into()),
    ));
    tracker.save_biotype(user, &biotype).unwrap();
    biotype
}

#[test]
fn formulas_are_evaluated_and_failures_degrade() {
    let tracker = tracker();
    let user = User::new("lab");
    let biotype = blood(&tracker, &user);
    let mut batch = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)
        .with_meta("volume", "1.25")];
    let report = tracker.save_biosamples(&user, &mut batch).unwrap();
    assert_eq!(batch[0].metadata["dose"], "2.5");
    assert_eq!(batch[0].metadata["ratio"], "");
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("ratio"), "{:?}", report.warnings);
    assert_eq!(tracker.formula_cache().len(), 2);
}

#[test]
fn metadata_is_validated_against_the_biotype() {
    let tracker = tracker();
    let user = User::new("lab");
    let biotype = blood(&tracker, &user);
    let make = |meta: &[(&str, &str)]| {
        let mut sample = Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id);
        for (k, v) in meta {
            sample = sample.with_meta(*k, *v);
        }
        vec![sample]
    };

    let err = tracker.save_biosamples(&user, &mut make(&[])).unwrap_err();
    assert_eq!(
        err.validation_kind(),
        Some(&ValidationKind::MissingField("volume".into()))
    );
    let err = tracker
        .save_biosamples(&user, &mut make(&[("volume", "lots")]))
        .unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::InvalidMetadata { field, .. }) if field == "volume"
    ));
    let err = tracker
        .save_biosamples(&user, &mut make(&[("volume", "1"), ("drawn", "2024-13-01")]))
        .unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::InvalidMetadata { field, .. }) if field == "drawn"
    ));
    tracker
        .save_biosamples(&user, &mut make(&[("volume", "1"), ("drawn", "2024-02-29")]))
        .unwrap();
}

#[test]
fn default_containers_get_allocated_ids() {
    let tracker = tracker();
    let user = User::new("lab");
    let biotype = blood(&tracker, &user);
    let mut batch: Vec<_> = (0..3)
        .map(|_| {
            Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)
                .with_meta("volume", "1")
        })
        .collect();
    tracker.save_biosamples(&user, &mut batch).unwrap();
    let ids: Vec<_> = batch.iter().map(|s| s.container_id().unwrap()).collect();
    assert_eq!(ids, vec!["TU000001", "TU000002", "TU000003"]);
    let samples: Vec<_> = batch.iter().map(|s| s.sample_id.as_str()).collect();
    assert_eq!(samples, vec!["BL000001", "BL000002", "BL000003"]);
}

#[test]
fn single_occupancy_containers_cannot_be_shared() {
    let tracker = tracker();
    let user = User::new("lab");
    let biotype = blood(&tracker, &user);
    let mut batch: Vec<_> = (0..2)
        .map(|_| {
            Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)
                .with_meta("volume", "1")
                .in_container(Container::with_id(ContainerType::Tube, "T-1"))
        })
        .collect();
    let err = tracker.save_biosamples(&user, &mut batch).unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::ContainerNotShared { .. })
    ));
}

#[test]
fn unique_names_are_enforced_case_insensitively() {
    let tracker = tracker();
    let user = User::new("lab");
    let animal = Biotype {
        name_required: true,
        name_unique: true,
        ..Biotype::new(tracker.new_biotype_id().unwrap(), "Animal", "AN")
    };
    tracker.save_biotype(&user, &animal).unwrap();
    let mut first = vec![Biosample::new(tracker.new_biosample_id().unwrap(), animal.id)
        .with_name("Rex")];
    tracker.save_biosamples(&user, &mut first).unwrap();

    let mut unnamed = vec![Biosample::new(tracker.new_biosample_id().unwrap(), animal.id)];
    assert_eq!(
        tracker
            .save_biosamples(&user, &mut unnamed)
            .unwrap_err()
            .validation_kind(),
        Some(&ValidationKind::MissingField("name".into()))
    );
    let mut clash = vec![Biosample::new(tracker.new_biosample_id().unwrap(), animal.id)
        .with_name("rex")];
    assert!(matches!(
        tracker
            .save_biosamples(&user, &mut clash)
            .unwrap_err()
            .validation_kind(),
        Some(ValidationKind::DuplicateName { .. })
    ));
    // Renaming the saved sample itself is not a clash.
    first[0].name = Some("REX".into());
    tracker.save_biosamples(&user, &mut first).unwrap();
}

#[test]
fn explicit_sample_ids_are_trimmed_and_checked() {
    let tracker = tracker();
    let user = User::new("lab");
    let biotype = Biotype::new(tracker.new_biotype_id().unwrap(), "Cells", "CE");
    tracker.save_biotype(&user, &biotype).unwrap();
    let mut batch = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)
        .with_sample_id("  CE-7 ")];
    tracker.save_biosamples(&user, &mut batch).unwrap();
    assert_eq!(batch[0].sample_id, "CE-7");

    let mut spaced = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)
        .with_sample_id("CE 8")];
    assert!(matches!(
        tracker
            .save_biosamples(&user, &mut spaced)
            .unwrap_err()
            .validation_kind(),
        Some(ValidationKind::WhitespaceInSampleId(_))
    ));
    let mut duplicate = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)
        .with_sample_id("CE-7")];
    assert!(matches!(
        tracker
            .save_biosamples(&user, &mut duplicate)
            .unwrap_err()
            .validation_kind(),
        Some(ValidationKind::DuplicateSampleId(_))
    ));
}

#[test]
fn curated_biotypes_need_the_curators_group() {
    let tracker = Tracker::builder(Arc::new(MemoryBackend::new()))
        .rights(Arc::new(GroupRights::new("curators")))
        .without_sweeper()
        .build()
        .unwrap();
    let biotype = Biotype::new(tracker.new_biotype_id().unwrap(), "Urine", "UR");
    let err = tracker
        .save_biotype(&User::new("guest"), &biotype)
        .unwrap_err();
    assert!(matches!(err, TrackError::Rights { .. }));
    tracker
        .save_biotype(&User::new("cura").with_group("curators"), &biotype)
        .unwrap();
}

#[test]
fn a_sample_listed_twice_is_rejected() {
    let tracker = tracker();
    let user = User::new("lab");
    let biotype = blood(&tracker, &user);
    let sample = Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)
        .with_meta("volume", "1");
    let id = sample.id;
    let mut batch = vec![sample.clone(), sample.with_meta("volume", "2")];
    let err = tracker.save_biosamples(&user, &mut batch).unwrap_err();
    assert_eq!(
        err.validation_kind(),
        Some(&ValidationKind::RepeatedInBatch(format!("biosample {id}")))
    );
    assert!(tracker.begin().biosample(id).unwrap().is_none());
}
