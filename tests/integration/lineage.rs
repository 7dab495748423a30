#![allow(missing_docs)]

use std::sync::Arc;

use biotrack::{
    model::{Biosample, Biotype, Study},
    store::MemoryBackend,
    types::{BiosampleId, GroupId, PhaseId, StudyId, User},
    Tracker, ValidationKind,
};

struct Lab {
    tracker: Tracker,
    user: User,
    animal: Biotype,
}

impl Lab {
    fn new() -> Self {
        let tracker = Tracker::builder(Arc::new(MemoryBackend::new()))
            .without_sweeper()
            .build()
            .expect("tracker");
        let user = User::new("lab");
        let animal = Biotype::new(tracker.new_biotype_id().unwrap(), "Animal", "AN");
        tracker.save_biotype(&user, &animal).unwrap();
        Self {
            tracker,
            user,
            animal,
        }
    }

    fn study(&self, code: &str, groups: &[u64]) -> StudyId {
        let mut study = Study::new(self.tracker.new_study_id().unwrap(), code).with_phase(PhaseId(1));
        for g in groups {
            study = study.with_group(GroupId(*g));
        }
        self.tracker.save_study(&self.user, &mut study).unwrap();
        study.id
    }

    fn sample(&self) -> Biosample {
        Biosample::new(self.tracker.new_biosample_id().unwrap(), self.animal.id)
    }

    fn load(&self, id: BiosampleId) -> Biosample {
        self.tracker
            .begin()
            .biosample(id)
            .unwrap()
            .expect("biosample")
    }
}

#[test]
fn closing_a_parent_loop_is_rejected() {
    let lab = Lab::new();
    let b = lab.sample();
    let c = lab.sample().with_parent(b.id);
    let mut batch = vec![b, c];
    lab.tracker.save_biosamples(&lab.user, &mut batch).unwrap();

    let mut b = lab.load(batch[0].id);
    b.parent = Some(batch[1].id);
    let mut update = vec![b];
    let err = lab
        .tracker
        .save_biosamples(&lab.user, &mut update)
        .unwrap_err();
    assert!(matches!(err.validation_kind(), Some(ValidationKind::Cycle(_))));
    assert_eq!(lab.load(batch[0].id).parent, None);
}

#[test]
fn self_parent_is_a_cycle() {
    let lab = Lab::new();
    let mut a = lab.sample();
    a.parent = Some(a.id);
    let err = lab
        .tracker
        .save_biosamples(&lab.user, &mut [a])
        .unwrap_err();
    assert!(matches!(err.validation_kind(), Some(ValidationKind::Cycle(_))));
}

#[test]
fn unknown_parent_is_rejected() {
    let lab = Lab::new();
    let a = lab.sample().with_parent(BiosampleId(77_777));
    let err = lab
        .tracker
        .save_biosamples(&lab.user, &mut [a])
        .unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::MissingParent(77_777))
    ));
}

#[test]
fn children_inherit_and_follow_study_changes() {
    let lab = Lab::new();
    let s1 = lab.study("S1", &[1]);
    let s2 = lab.study("S2", &[5]);
    let s3 = lab.study("S3", &[1]);

    let mut a = lab.sample().attached_to(s1);
    a.inherited_group = Some(GroupId(1));
    let b = lab.sample().with_parent(a.id);
    let c = lab.sample().with_parent(b.id);
    let d = lab.sample().with_parent(b.id).attached_to(s2);
    let e = lab.sample().with_parent(d.id);
    // Children listed before their parents on purpose.
    let mut batch = vec![e, c, d, b, a];
    lab.tracker.save_biosamples(&lab.user, &mut batch).unwrap();
    let [e, c, d, b, a] = [0, 1, 2, 3, 4].map(|i| lab.load(batch[i].id));

    assert_eq!(b.inherited_study, Some(s1));
    assert_eq!(c.inherited_study, Some(s1));
    assert_eq!(c.inherited_group, Some(GroupId(1)));
    assert_eq!(d.inherited_study, Some(s2));
    assert_eq!(d.inherited_group, None);
    assert_eq!(e.inherited_study, Some(s2));
    for sample in [&a, &b, &c, &d, &e] {
        assert_eq!(sample.top_parent, Some(a.id));
    }

    let mut root = a.clone();
    root.attached_study = Some(s3);
    let mut update = vec![root];
    let report = lab.tracker.save_biosamples(&lab.user, &mut update).unwrap();
    assert_eq!(report.propagated, 2);

    assert_eq!(lab.load(b.id).inherited_study, Some(s3));
    assert_eq!(lab.load(c.id).inherited_study, Some(s3));
    assert_eq!(lab.load(d.id), d, "attachment boundary untouched");
    assert_eq!(lab.load(e.id), e);
}

#[test]
fn local_group_override_survives_parent_change() {
    let lab = Lab::new();
    let s1 = lab.study("S1", &[1, 2, 3]);
    let mut a = lab.sample().attached_to(s1);
    a.inherited_group = Some(GroupId(1));
    let b = lab.sample().with_parent(a.id);
    let mut c = lab.sample().with_parent(a.id);
    c.inherited_group = Some(GroupId(2));
    let mut batch = vec![a, b, c];
    lab.tracker.save_biosamples(&lab.user, &mut batch).unwrap();
    assert_eq!(batch[1].inherited_group, Some(GroupId(1)));
    assert_eq!(batch[2].inherited_group, Some(GroupId(2)));

    let mut root = lab.load(batch[0].id);
    root.inherited_group = Some(GroupId(3));
    lab.tracker
        .save_biosamples(&lab.user, &mut [root])
        .unwrap();
    assert_eq!(lab.load(batch[1].id).inherited_group, Some(GroupId(3)));
    assert_eq!(lab.load(batch[2].id).inherited_group, Some(GroupId(2)));
}

#[test]
fn override_outside_new_study_aborts_the_move() {
    let lab = Lab::new();
    let s1 = lab.study("S1", &[1, 2]);
    let s2 = lab.study("S2", &[9]);
    let mut a = lab.sample().attached_to(s1);
    a.inherited_group = Some(GroupId(1));
    let mut c = lab.sample().with_parent(a.id);
    c.inherited_group = Some(GroupId(2));
    let mut batch = vec![a, c];
    lab.tracker.save_biosamples(&lab.user, &mut batch).unwrap();

    let mut root = lab.load(batch[0].id);
    root.attached_study = Some(s2);
    root.inherited_group = Some(GroupId(9));
    let err = lab
        .tracker
        .save_biosamples(&lab.user, &mut [root])
        .unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::StudyMismatch(_))
    ));
    assert_eq!(lab.load(batch[0].id).inherited_study, Some(s1));
}

#[test]
fn sample_ids_use_the_inherited_study_code() {
    let lab = Lab::new();
    let s1 = lab.study("S1", &[]);
    let blood = Biotype::new(lab.tracker.new_biotype_id().unwrap(), "Blood", "{StudyId}-BL###");
    lab.tracker.save_biotype(&lab.user, &blood).unwrap();
    let mouse = lab.sample().attached_to(s1).with_sample_id("M-1");
    let plasma = Biosample::new(lab.tracker.new_biosample_id().unwrap(), blood.id)
        .with_parent(mouse.id);
    let mut batch = vec![mouse, plasma];
    let report = lab.tracker.save_biosamples(&lab.user, &mut batch).unwrap();
    assert_eq!(batch[1].sample_id, "S1-BL001");
    assert_eq!(report.allocated, vec!["S1-BL001".to_string()]);
}

#[test]
fn deleting_a_parent_requires_deleting_its_children() {
    let lab = Lab::new();
    let a = lab.sample();
    let b = lab.sample().with_parent(a.id);
    let mut batch = vec![a, b];
    lab.tracker.save_biosamples(&lab.user, &mut batch).unwrap();

    let mut tx = lab.tracker.begin();
    let err = lab
        .tracker
        .graph()
        .delete_biosamples(&mut tx, &lab.user, &[batch[0].id])
        .unwrap_err();
    assert!(matches!(
        err.validation_kind(),
        Some(ValidationKind::NotEmpty(_))
    ));
    lab.tracker
        .graph()
        .delete_biosamples(&mut tx, &lab.user, &[batch[0].id, batch[1].id])
        .unwrap();
    tx.commit().unwrap();
    assert!(lab.tracker.begin().biosample(batch[0].id).unwrap().is_none());
}

#[test]
fn ancestors_and_descendants_walk_the_tree() {
    let lab = Lab::new();
    let a = lab.sample();
    let b = lab.sample().with_parent(a.id);
    let c = lab.sample().with_parent(b.id);
    let mut batch = vec![a, b, c];
    lab.tracker.save_biosamples(&lab.user, &mut batch).unwrap();
    let tx = lab.tracker.begin();
    let up: Vec<_> = lab
        .tracker
        .graph()
        .ancestors(&tx, batch[2].id)
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(up, vec![batch[1].id, batch[0].id]);
    let down = lab.tracker.graph().descendants(&tx, batch[0].id).unwrap();
    assert_eq!(down.len(), 2);
}
