#![allow(missing_docs)]

use std::sync::Arc;

use biotrack::{
    model::{Biosample, Biotype, Container, ContainerType, Labeling, Location, LocationType},
    store::MemoryBackend,
    types::User,
    Tracker, ValidationKind,
};

struct Fixture {
    tracker: Tracker,
    user: User,
    biotype: Biotype,
    shelf: Location,
}

impl Fixture {
    /// A 2x3 numeric shelf and a biotype without a default container.
    fn new() -> Self {
        let tracker = Tracker::builder(Arc::new(MemoryBackend::new()))
            .without_sweeper()
            .build()
            .expect("tracker");
        let user = User::new("lab");
        let biotype = Biotype::new(tracker.new_biotype_id().unwrap(), "Tissue", "TI");
        tracker.save_biotype(&user, &biotype).unwrap();
        let mut locations = vec![Location::new(
            tracker.new_location_id().unwrap(),
            "L",
            LocationType::Shelf,
        )
        .with_grid(Labeling::Numeric, 2, 3)];
        tracker.save_locations(&user, &mut locations).unwrap();
        let shelf = locations.remove(0);
        Self {
            tracker,
            user,
            biotype,
            shelf,
        }
    }

    fn sample(&self, pos: i32) -> Biosample {
        Biosample::new(self.tracker.new_biosample_id().unwrap(), self.biotype.id)
            .at(self.shelf.id, pos)
    }

    fn save(&self, batch: &mut [Biosample]) -> biotrack::Result<()> {
        self.tracker.save_biosamples(&self.user, batch).map(|_| ())
    }

    fn stored_shelf(&self) -> Location {
        self.tracker
            .begin()
            .location(self.shelf.id)
            .unwrap()
            .expect("shelf")
    }
}

#[test]
fn occupied_position_is_rejected() {
    let fx = Fixture::new();
    let mut first = vec![fx
        .sample(5)
        .in_container(Container::with_id(ContainerType::Tube, "TU-1"))];
    fx.save(&mut first).unwrap();

    let mut second = vec![fx.sample(5)];
    let err = fx.save(&mut second).unwrap_err();
    match err.validation_kind() {
        Some(ValidationKind::PositionOccupied {
            label, occupant, ..
        }) => {
            assert_eq!(label, "6");
            assert!(occupant.contains("TU-1"), "{occupant}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(fx.tracker.begin().biosample(second[0].id).unwrap().is_none());
    assert!(second[0].sample_id.is_empty(), "batch left untouched");
}

#[test]
fn shared_container_may_share_a_slot() {
    let fx = Fixture::new();
    let mut first = vec![fx
        .sample(2)
        .in_container(Container::with_id(ContainerType::Bag, "BAG-1"))];
    fx.save(&mut first).unwrap();
    let mut second = vec![fx
        .sample(2)
        .in_container(Container::with_id(ContainerType::Bag, "BAG-1"))];
    fx.save(&mut second).unwrap();

    let mut other_bag = vec![fx
        .sample(2)
        .in_container(Container::with_id(ContainerType::Bag, "BAG-2"))];
    assert!(fx.save(&mut other_bag).is_err());
}

#[test]
fn position_must_fit_the_grid() {
    let fx = Fixture::new();
    let mut batch = vec![fx.sample(6)];
    let err = fx.save(&mut batch).unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::PositionOutOfRange { capacity: 6, .. })
    ));
}

#[test]
fn two_samples_of_one_batch_collide() {
    let fx = Fixture::new();
    let mut batch = vec![fx.sample(0), fx.sample(0)];
    let err = fx.save(&mut batch).unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::PositionOccupied { .. })
    ));
}

#[test]
fn moving_within_the_batch_frees_the_old_slot() {
    let fx = Fixture::new();
    let mut batch = vec![fx.sample(0), fx.sample(1)];
    fx.save(&mut batch).unwrap();
    batch[0].pos = 1;
    batch[1].pos = 0;
    fx.save(&mut batch).unwrap();
    let tx = fx.tracker.begin();
    assert_eq!(tx.biosample(batch[0].id).unwrap().unwrap().pos, 1);
    assert_eq!(tx.biosample(batch[1].id).unwrap().unwrap().pos, 0);
}

#[test]
fn shrinking_below_occupied_row_fails() {
    let fx = Fixture::new();
    let mut batch = vec![fx.sample(4)];
    fx.save(&mut batch).unwrap();

    let mut shelf = fx.stored_shelf();
    shelf.rows = 1;
    let mut locations = vec![shelf];
    let err = fx
        .tracker
        .save_locations(&fx.user, &mut locations)
        .unwrap_err();
    match err.validation_kind() {
        Some(ValidationKind::GridTooSmall {
            min_rows, min_cols, ..
        }) => {
            assert_eq!(*min_rows, 2);
            assert_eq!(*min_cols, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(fx.stored_shelf().rows, 2);
}

#[test]
fn widening_keeps_row_and_column() {
    let fx = Fixture::new();
    let mut batch = vec![fx.sample(4)];
    fx.save(&mut batch).unwrap();

    let mut shelf = fx.stored_shelf();
    shelf.cols = 5;
    let mut locations = vec![shelf];
    let report = fx.tracker.save_locations(&fx.user, &mut locations).unwrap();
    assert_eq!(report.relocated, 1);
    let moved = fx.tracker.begin().biosample(batch[0].id).unwrap().unwrap();
    assert_eq!(moved.pos, 6, "row 1, col 1 of a 5-wide grid");
}

#[test]
fn positions_without_grid_are_cleared() {
    let fx = Fixture::new();
    let mut rooms = vec![Location::new(
        fx.tracker.new_location_id().unwrap(),
        "Cold room",
        LocationType::Room,
    )];
    fx.tracker.save_locations(&fx.user, &mut rooms).unwrap();
    let mut batch = vec![Biosample::new(fx.tracker.new_biosample_id().unwrap(), fx.biotype.id)
        .at(rooms[0].id, 3)];
    fx.save(&mut batch).unwrap();
    assert_eq!(batch[0].pos, -1);
}

#[test]
fn unknown_location_is_rejected() {
    let fx = Fixture::new();
    let mut batch = vec![Biosample::new(fx.tracker.new_biosample_id().unwrap(), fx.biotype.id)
        .at(biotrack::types::LocationId(9_999), 0)];
    let err = fx.save(&mut batch).unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::MissingLocation(9_999))
    ));
}

#[test]
fn locations_receive_codes_and_paths() {
    let fx = Fixture::new();
    let shelf = fx.stored_shelf();
    assert_eq!(shelf.code.as_deref(), Some("L000001"));
    let mut boxes = vec![Location::new(
        fx.tracker.new_location_id().unwrap(),
        "Box A",
        LocationType::Box,
    )
    .within(shelf.id)
    .with_grid(Labeling::Alpha, 2, 2)];
    fx.tracker.save_locations(&fx.user, &mut boxes).unwrap();
    let tx = fx.tracker.begin();
    assert_eq!(fx.tracker.grid().full_path(&tx, boxes[0].id).unwrap(), "L/Box A");
    assert_eq!(boxes[0].code.as_deref(), Some("L000002"));
    assert_eq!(boxes[0].format_position(3), "B2");
}
