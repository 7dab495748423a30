#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;

use biotrack::{
    allocator::PatternContext,
    config::{AllocatorConfig, EngineConfig},
    model::{BarcodeSequence, Biosample, SequenceCategory},
    store::{Backend, MemoryBackend, Record, Write},
    types::{BiosampleId, BiotypeId},
    PoolKey, Tracker,
};

fn tracker_over(backend: Arc<dyn Backend>) -> Tracker {
    Tracker::builder(backend)
        .without_sweeper()
        .build()
        .expect("build tracker")
}

fn seed(backend: &dyn Backend, last_barcode: &str, existing: &[&str]) {
    let mut writes = vec![Write::Insert(Record::Sequence(BarcodeSequence {
        category: SequenceCategory::Sample,
        pattern: "AB######".into(),
        last_barcode: last_barcode.into(),
    }))];
    for (i, id) in existing.iter().enumerate() {
        writes.push(Write::Insert(Record::Biosample(
            Biosample::new(BiosampleId(1_000 + i as u64), BiotypeId(1)).with_sample_id(*id),
        )));
    }
    backend.apply(&writes).expect("seed backend");
}

#[test]
fn empty_sequence_starts_at_one() {
    let tracker = tracker_over(Arc::new(MemoryBackend::new()));
    let ids = tracker
        .allocator()
        .next_ids(
            SequenceCategory::Sample,
            "AB######",
            &PatternContext::today(),
            3,
        )
        .unwrap();
    assert_eq!(ids, vec!["AB000001", "AB000002", "AB000003"]);
}

#[test]
fn pattern_without_placeholder_gets_default_digits() {
    let tracker = tracker_over(Arc::new(MemoryBackend::new()));
    let ctx = PatternContext::today();
    let first = tracker
        .allocator()
        .next_id(SequenceCategory::Sample, "AB", &ctx)
        .unwrap();
    let second = tracker
        .allocator()
        .next_id(SequenceCategory::Sample, "AB######", &ctx)
        .unwrap();
    assert_eq!(first, "AB000001");
    assert_eq!(second, "AB000002", "both patterns format to the same key");
}

#[test]
fn study_code_separates_sequences() {
    let tracker = tracker_over(Arc::new(MemoryBackend::new()));
    let s1 = PatternContext::today().with_study("S1");
    let s2 = PatternContext::today().with_study("S2");
    let alloc = tracker.allocator();
    assert_eq!(
        alloc.next_id(SequenceCategory::Sample, "{StudyId}-BL###", &s1).unwrap(),
        "S1-BL001"
    );
    assert_eq!(
        alloc.next_id(SequenceCategory::Sample, "{StudyId}-BL###", &s2).unwrap(),
        "S2-BL001"
    );
    assert_eq!(
        alloc.next_id(SequenceCategory::Sample, "{StudyId}-BL###", &s1).unwrap(),
        "S1-BL002"
    );
}

#[test]
fn stale_counter_anchors_on_observed_maximum() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    seed(backend.as_ref(), "AB000010", &["AB000100", "AB000042"]);
    let tracker = tracker_over(backend);
    let id = tracker
        .allocator()
        .next_id(SequenceCategory::Sample, "AB", &PatternContext::today())
        .unwrap();
    assert_eq!(id, "AB000101");
}

#[test]
fn large_gap_is_corrected_to_observed_maximum() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    seed(backend.as_ref(), "AB000500", &["AB000010"]);
    let config = EngineConfig {
        allocator: AllocatorConfig {
            hole_threshold: 50,
            ..AllocatorConfig::default()
        },
        ..EngineConfig::default()
    };
    let tracker = Tracker::builder(backend)
        .config(config)
        .without_sweeper()
        .build()
        .unwrap();
    let id = tracker
        .allocator()
        .next_id(SequenceCategory::Sample, "AB", &PatternContext::today())
        .unwrap();
    assert_eq!(id, "AB000011");
}

#[test]
fn small_gap_keeps_stored_counter() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    seed(backend.as_ref(), "AB000030", &["AB000010"]);
    let tracker = tracker_over(backend);
    let id = tracker
        .allocator()
        .next_id(SequenceCategory::Sample, "AB", &PatternContext::today())
        .unwrap();
    assert_eq!(id, "AB000031");
}

#[test]
fn threshold_is_configurable() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    seed(backend.as_ref(), "AB000030", &["AB000010"]);
    let config = EngineConfig {
        allocator: AllocatorConfig {
            hole_threshold: 5,
            ..AllocatorConfig::default()
        },
        ..EngineConfig::default()
    };
    let tracker = Tracker::builder(backend)
        .config(config)
        .without_sweeper()
        .build()
        .unwrap();
    let id = tracker
        .allocator()
        .next_id(SequenceCategory::Sample, "AB", &PatternContext::today())
        .unwrap();
    assert_eq!(id, "AB000011");
}

#[test]
fn concurrent_callers_never_share_an_identifier() {
    let tracker = tracker_over(Arc::new(MemoryBackend::new()));
    let alloc = tracker.allocator();
    let ctx = PatternContext::today();
    let per_thread: Vec<Vec<String>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                scope.spawn(move || {
                    (0..50)
                        .map(|_| {
                            alloc
                                .next_id(SequenceCategory::Container, "TU", &ctx)
                                .expect("allocate")
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect()
    });
    let mut seen = HashSet::new();
    for ids in &per_thread {
        let mut previous = None;
        for id in ids {
            assert!(seen.insert(id.clone()), "{id} issued twice");
            if let Some(prev) = previous {
                assert!(id.as_str() > prev, "{id} not after {prev}");
            }
            previous = Some(id.as_str());
        }
    }
    assert_eq!(seen.len(), 400);
}

#[test]
fn reset_does_not_reissue_reserved_identifiers() {
    let tracker = tracker_over(Arc::new(MemoryBackend::new()));
    let ctx = PatternContext::today();
    let alloc = tracker.allocator();
    let first = alloc.next_id(SequenceCategory::Sample, "ZZ", &ctx).unwrap();
    tracker.invalidate();
    let second = alloc.next_id(SequenceCategory::Sample, "ZZ", &ctx).unwrap();
    assert_eq!(first, "ZZ000001");
    assert_eq!(second, "ZZ000021");
    assert_eq!(
        alloc.pooled(&PoolKey::new(SequenceCategory::Sample, "ZZ######")),
        19
    );
}

#[test]
fn sequences_lists_stored_rows() {
    let tracker = tracker_over(Arc::new(MemoryBackend::new()));
    let ctx = PatternContext::today();
    tracker
        .allocator()
        .next_id(SequenceCategory::Sample, "AB", &ctx)
        .unwrap();
    tracker.allocator().next_location_code().unwrap();
    let rows = tracker.sequences().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .any(|r| r.pattern == "AB######" && r.last_barcode == "AB000020"));
    assert!(rows
        .iter()
        .any(|r| r.category == SequenceCategory::Location && r.last_barcode == "L000001"));
}
