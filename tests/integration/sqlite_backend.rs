#![allow(missing_docs)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use biotrack::{
    allocator::PatternContext,
    model::{Biosample, Biotype, Labeling, Location, LocationType, SequenceCategory},
    types::User,
    SqliteBackend, Tracker, ValidationKind,
};
use tempfile::TempDir;

fn open(path: &Path) -> Tracker {
    Tracker::builder(Arc::new(SqliteBackend::open(path).expect("open sqlite")))
        .without_sweeper()
        .build()
        .expect("tracker")
}

#[test]
fn sequences_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("track.db");
    let ctx = PatternContext::today();
    {
        let tracker = open(&path);
        let first = tracker
            .allocator()
            .next_id(SequenceCategory::Sample, "AB", &ctx)
            .unwrap();
        assert_eq!(first, "AB000001");
    }
    let tracker = open(&path);
    let next = tracker
        .allocator()
        .next_id(SequenceCategory::Sample, "AB", &ctx)
        .unwrap();
    assert_eq!(next, "AB000021", "the unused part of the first batch is skipped");
}

#[test]
fn saved_graph_reads_back_after_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("track.db");
    let user = User::new("lab");
    let (root_id, child_id, box_id) = {
        let tracker = open(&path);
        let biotype = Biotype::new(tracker.new_biotype_id().unwrap(), "Organ", "OR");
        tracker.save_biotype(&user, &biotype).unwrap();
        let mut locations = vec![Location::new(
            tracker.new_location_id().unwrap(),
            "Box",
            LocationType::Box,
        )
        .with_grid(Labeling::Alpha, 2, 2)];
        tracker.save_locations(&user, &mut locations).unwrap();
        let root = Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id);
        let child = Biosample::new(tracker.new_biosample_id().unwrap(), biotype.id)
            .with_parent(root.id)
            .at(locations[0].id, 3);
        let mut batch = vec![root, child];
        tracker.save_biosamples(&user, &mut batch).unwrap();
        (batch[0].id, batch[1].id, locations[0].id)
    };

    let tracker = open(&path);
    let tx = tracker.begin();
    let child = tx.biosample(child_id).unwrap().expect("child");
    assert_eq!(child.parent, Some(root_id));
    assert_eq!(child.top_parent, Some(root_id));
    assert_eq!(child.placement(), Some((box_id, 3)));
    assert_eq!(child.sample_id, "OR000002");
    assert!(child.audit.is_some());
    assert_eq!(tracker.grid().free_positions(&tx, box_id).unwrap(), vec![0, 1, 2]);
    drop(tx);

    let fresh = tracker.new_biosample_id().unwrap();
    assert!(fresh.0 > child_id.0, "record ids keep increasing");

    let mut clash = vec![Biosample::new(fresh, child.biotype).at(box_id, 3)];
    let err = tracker.save_biosamples(&user, &mut clash).unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::PositionOccupied { label, .. }) if label == "B2"
    ));
}

#[test]
fn trackers_sharing_a_file_never_reissue_ids() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("track.db");
    drop(open(&path));

    let issued: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                scope.spawn(move || {
                    let tracker = open(&path);
                    let ctx = PatternContext::today();
                    let mut ids = Vec::new();
                    for _ in 0..20 {
                        ids.extend(
                            tracker
                                .allocator()
                                .next_ids(SequenceCategory::Sample, "AB", &ctx, 20)
                                .expect("allocate"),
                        );
                    }
                    ids
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().expect("worker"))
            .collect()
    });
    assert_eq!(issued.len(), 3200);
    let distinct: HashSet<&String> = issued.iter().collect();
    assert_eq!(distinct.len(), 3200);
}

#[test]
fn sequential_trackers_continue_the_sequence() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("track.db");
    let ctx = PatternContext::today();
    let firsts: Vec<String> = (0..5)
        .map(|_| {
            open(&path)
                .allocator()
                .next_id(SequenceCategory::Sample, "AB", &ctx)
                .unwrap()
        })
        .collect();
    assert_eq!(
        firsts,
        vec!["AB000001", "AB000021", "AB000041", "AB000061", "AB000081"]
    );
}

#[test]
fn trackers_sharing_a_file_cannot_double_book() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("track.db");
    let user = User::new("lab");
    let a = open(&path);
    let biotype = Biotype::new(a.new_biotype_id().unwrap(), "Organ", "OR");
    a.save_biotype(&user, &biotype).unwrap();
    let mut boxes = vec![Location::new(a.new_location_id().unwrap(), "Box", LocationType::Box)
        .with_grid(Labeling::Alpha, 2, 2)];
    a.save_locations(&user, &mut boxes).unwrap();
    let box_id = boxes[0].id;
    let b = open(&path);

    let mut tx_a = a.begin();
    let mut tx_b = b.begin();
    let mut slot_a = vec![Biosample::new(a.new_biosample_id().unwrap(), biotype.id).at(box_id, 0)];
    let mut slot_b = vec![Biosample::new(b.new_biosample_id().unwrap(), biotype.id).at(box_id, 0)];
    a.persist_batch(&mut tx_a, &user, &mut slot_a).unwrap();
    b.persist_batch(&mut tx_b, &user, &mut slot_b).unwrap();
    tx_a.commit().unwrap();
    let err = tx_b.commit().unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::PositionOccupied { label, .. }) if label == "A1"
    ));

    let mut tx_a = a.begin();
    let mut tx_b = b.begin();
    let mut named_a = vec![
        Biosample::new(a.new_biosample_id().unwrap(), biotype.id).with_sample_id("OR-SHARED"),
    ];
    let mut named_b = vec![
        Biosample::new(b.new_biosample_id().unwrap(), biotype.id).with_sample_id("OR-SHARED"),
    ];
    a.persist_batch(&mut tx_a, &user, &mut named_a).unwrap();
    b.persist_batch(&mut tx_b, &user, &mut named_b).unwrap();
    tx_a.commit().unwrap();
    let err = tx_b.commit().unwrap_err();
    assert_eq!(
        err.validation_kind(),
        Some(&ValidationKind::DuplicateSampleId("OR-SHARED".into()))
    );
    assert!(a.begin().biosample(named_b[0].id).unwrap().is_none());
}
