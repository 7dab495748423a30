#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use biotrack::{
    cache::Sweep,
    config::{CacheConfig, EngineConfig},
    model::{Biosample, Biotype, Labeling, Location, LocationType, Study},
    store::MemoryBackend,
    types::User,
    Cache, CacheSweeper, TrackError, Tracker, ValidationKind,
};

fn tracker() -> Tracker {
    Tracker::builder(Arc::new(MemoryBackend::new()))
        .without_sweeper()
        .build()
        .expect("tracker")
}

#[test]
fn stale_biosample_save_names_the_other_editor() {
    let tracker = tracker();
    let alice = User::new("alice");
    let bob = User::new("bob");
    let biotype = Biotype::new(tracker.new_biotype_id().unwrap(), "Serum", "SE");
    tracker.save_biotype(&alice, &biotype).unwrap();
    let mut batch = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)];
    tracker.save_biosamples(&alice, &mut batch).unwrap();
    let id = batch[0].id;

    let mut session_a = tracker.begin().biosample(id).unwrap().unwrap();
    let mut session_b = tracker.begin().biosample(id).unwrap().unwrap();

    session_a.name = Some("first".into());
    tracker
        .save_biosamples(&alice, std::slice::from_mut(&mut session_a))
        .unwrap();
    let committed_at = session_a.audit.as_ref().unwrap().updated_at;

    session_b.name = Some("second".into());
    let err = tracker
        .save_biosamples(&bob, std::slice::from_mut(&mut session_b))
        .unwrap_err();
    match err {
        TrackError::Conflict {
            entity,
            other_editor,
            committed_at: at,
            loaded_at,
            ..
        } => {
            assert_eq!(entity, "biosample");
            assert_eq!(other_editor, "alice");
            assert_eq!(at, committed_at);
            assert!(loaded_at < at);
        }
        other => panic!("expected conflict, got {other}"),
    }
    let stored = tracker.begin().biosample(id).unwrap().unwrap();
    assert_eq!(stored.name.as_deref(), Some("first"));
}

#[test]
fn reloaded_copy_saves_cleanly() {
    let tracker = tracker();
    let user = User::new("alice");
    let biotype = Biotype::new(tracker.new_biotype_id().unwrap(), "Serum", "SE");
    tracker.save_biotype(&user, &biotype).unwrap();
    let mut batch = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)];
    tracker.save_biosamples(&user, &mut batch).unwrap();
    for round in 0..3 {
        batch[0].name = Some(format!("round {round}"));
        tracker.save_biosamples(&user, &mut batch).unwrap();
    }
    let audit = batch[0].audit.as_ref().unwrap();
    assert_eq!(audit.created_by, "alice");
    assert!(audit.updated_at > audit.created_at);
}

#[test]
fn stale_location_and_study_are_detected() {
    let tracker = tracker();
    let user = User::new("alice");
    let mut locations = vec![Location::new(
        tracker.new_location_id().unwrap(),
        "Rack",
        LocationType::Rack,
    )];
    tracker.save_locations(&user, &mut locations).unwrap();
    let stale = locations[0].clone();
    locations[0] = locations[0].clone().with_grid(Labeling::Numeric, 1, 4);
    tracker.save_locations(&user, &mut locations).unwrap();
    let err = tracker
        .save_locations(&User::new("bob"), &mut [stale])
        .unwrap_err();
    assert!(err.is_conflict());

    let mut study = Study::new(tracker.new_study_id().unwrap(), "S-9");
    tracker.save_study(&user, &mut study).unwrap();
    let mut stale = study.clone();
    tracker.save_study(&user, &mut study).unwrap();
    assert!(tracker.save_study(&user, &mut stale).unwrap_err().is_conflict());
}

fn serum(tracker: &Tracker, user: &User) -> Biotype {
    let biotype = Biotype::new(tracker.new_biotype_id().unwrap(), "Serum", "SE");
    tracker.save_biotype(user, &biotype).unwrap();
    biotype
}

#[test]
fn overlapping_transactions_on_one_copy_conflict_at_commit() {
    let tracker = tracker();
    let alice = User::new("alice");
    let bob = User::new("bob");
    let biotype = serum(&tracker, &alice);
    let mut batch = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)];
    tracker.save_biosamples(&alice, &mut batch).unwrap();
    let loaded = batch[0].clone();

    let mut first = tracker.begin();
    let mut second = tracker.begin();
    let mut copy_a = vec![loaded.clone().with_name("first")];
    let mut copy_b = vec![loaded.with_name("second")];
    tracker.persist_batch(&mut first, &alice, &mut copy_a).unwrap();
    tracker.persist_batch(&mut second, &bob, &mut copy_b).unwrap();
    first.commit().unwrap();

    match second.commit().unwrap_err() {
        TrackError::Conflict { other_editor, .. } => assert_eq!(other_editor, "alice"),
        other => panic!("expected conflict, got {other}"),
    }
    let stored = tracker.begin().biosample(batch[0].id).unwrap().unwrap();
    assert_eq!(stored.name.as_deref(), Some("first"));
}

#[test]
fn one_slot_claimed_by_two_open_transactions() {
    let tracker = tracker();
    let user = User::new("alice");
    let biotype = serum(&tracker, &user);
    let mut boxes = vec![Location::new(
        tracker.new_location_id().unwrap(),
        "Box",
        LocationType::Box,
    )
    .with_grid(Labeling::Alpha, 2, 4)];
    tracker.save_locations(&user, &mut boxes).unwrap();
    let box_id = boxes[0].id;

    let mut first = tracker.begin();
    let mut second = tracker.begin();
    let mut a = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id).at(box_id, 5)];
    let mut b = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id).at(box_id, 5)];
    tracker.persist_batch(&mut first, &user, &mut a).unwrap();
    tracker.persist_batch(&mut second, &user, &mut b).unwrap();
    first.commit().unwrap();

    let err = second.commit().unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::PositionOccupied { label, occupant, .. })
            if label == "B2" && *occupant == a[0].sample_id
    ));
    assert!(tracker.begin().biosample(b[0].id).unwrap().is_none());
}

#[test]
fn one_sample_id_claimed_by_two_open_transactions() {
    let tracker = tracker();
    let user = User::new("alice");
    let biotype = serum(&tracker, &user);

    let mut first = tracker.begin();
    let mut second = tracker.begin();
    let mut a = vec![
        Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id).with_sample_id("SE-7"),
    ];
    let mut b = vec![
        Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id).with_sample_id("SE-7"),
    ];
    tracker.persist_batch(&mut first, &user, &mut a).unwrap();
    tracker.persist_batch(&mut second, &user, &mut b).unwrap();
    first.commit().unwrap();

    let err = second.commit().unwrap_err();
    assert_eq!(
        err.validation_kind(),
        Some(&ValidationKind::DuplicateSampleId("SE-7".into()))
    );
}

#[test]
fn unstamped_copy_of_a_saved_sample_is_refused() {
    let tracker = tracker();
    let alice = User::new("alice");
    let biotype = serum(&tracker, &alice);
    let mut batch = vec![Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)];
    tracker.save_biosamples(&alice, &mut batch).unwrap();
    let id = batch[0].id;
    let saved = batch[0].audit.clone();

    let mut blank = vec![Biosample::new(id, biotype.id).with_name("overwrite")];
    let err = tracker
        .save_biosamples(&User::new("bob"), &mut blank)
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(blank[0].audit.is_none());

    let stored = tracker.begin().biosample(id).unwrap().unwrap();
    assert_eq!(stored.audit, saved);
    assert_eq!(stored.audit.unwrap().created_by, "alice");
    assert_eq!(stored.name, None);
}

#[test]
fn sweeper_evicts_expired_entries() {
    let cache: Arc<Cache<String, u32>> = Arc::new(Cache::with_ttl(
        "test.sweep",
        2,
        16,
        Duration::from_millis(20),
    ));
    cache.put("a".into(), 1);
    cache.put("b".into(), 2);
    let sweeper = CacheSweeper::spawn(
        vec![Arc::clone(&cache) as Arc<dyn Sweep>],
        Duration::from_secs(60),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(40));
    let before = sweeper.passes();
    sweeper.trigger();
    let deadline = Instant::now() + Duration::from_secs(5);
    while sweeper.passes() == before && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(sweeper.passes() > before);
    assert!(cache.is_empty());
}

#[test]
fn engine_sweeper_runs_on_its_interval() {
    let config = EngineConfig {
        cache: CacheConfig {
            sweep_interval_ms: 10,
            ..CacheConfig::default()
        },
        ..EngineConfig::default()
    };
    let tracker = Tracker::builder(Arc::new(MemoryBackend::new()))
        .config(config)
        .build()
        .unwrap();
    let sweeper = tracker.sweeper().expect("sweeper running");
    let deadline = Instant::now() + Duration::from_secs(5);
    while sweeper.passes() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(sweeper.passes() >= 2);
}
