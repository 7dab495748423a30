use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Container, NO_POSITION};
use crate::types::{Audit, BiosampleId, BiotypeId, GroupId, LocationId, PhaseId, StudyId};

/// A tracked specimen.
///
/// `top_parent` and the `inherited_*` fields are derived by the sample graph
/// on every save; callers set `parent`, `attached_study` and, where they want
/// a local override, `inherited_group`/`inherited_phase`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Biosample {
    /// Internal row id.
    pub id: BiosampleId,
    /// Human-facing identifier; empty until allocated.
    #[serde(default)]
    pub sample_id: String,
    /// Optional sample name, constrained by the biotype.
    #[serde(default)]
    pub name: Option<String>,
    /// Schema of this sample.
    pub biotype: BiotypeId,
    /// Sample this one was derived from.
    #[serde(default)]
    pub parent: Option<BiosampleId>,
    /// Root ancestor of the derivation chain (derived).
    #[serde(default)]
    pub top_parent: Option<BiosampleId>,
    /// Physical vessel holding the sample.
    #[serde(default)]
    pub container: Option<Container>,
    /// Storage location.
    #[serde(default)]
    pub location: Option<LocationId>,
    /// Zero-based grid slot within `location`, or [`NO_POSITION`].
    #[serde(default = "no_position")]
    pub pos: i32,
    /// Study context (derived from the nearest attachment boundary).
    #[serde(default)]
    pub inherited_study: Option<StudyId>,
    /// Study group, inherited unless locally overridden.
    #[serde(default)]
    pub inherited_group: Option<GroupId>,
    /// Treatment phase, inherited unless locally overridden.
    #[serde(default)]
    pub inherited_phase: Option<PhaseId>,
    /// Attachment boundary: when set this node owns its study context.
    #[serde(default)]
    pub attached_study: Option<StudyId>,
    /// Metadata values keyed by biotype field name.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Audit stamps; `None` until the first save.
    #[serde(default)]
    pub audit: Option<Audit>,
}

fn no_position() -> i32 {
    NO_POSITION
}

impl Biosample {
    /// Creates an unsaved sample of `biotype`.
    pub fn new(id: BiosampleId, biotype: BiotypeId) -> Self {
        Self {
            id,
            sample_id: String::new(),
            name: None,
            biotype,
            parent: None,
            top_parent: None,
            container: None,
            location: None,
            pos: NO_POSITION,
            inherited_study: None,
            inherited_group: None,
            inherited_phase: None,
            attached_study: None,
            metadata: BTreeMap::new(),
            audit: None,
        }
    }

    /// Sets the sample id.
    pub fn with_sample_id(mut self, sample_id: impl Into<String>) -> Self {
        self.sample_id = sample_id.into();
        self
    }

    /// Sets the sample name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Derives this sample from `parent`.
    pub fn with_parent(mut self, parent: BiosampleId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Places the sample at `pos` within `location`.
    pub fn at(mut self, location: LocationId, pos: i32) -> Self {
        self.location = Some(location);
        self.pos = pos;
        self
    }

    /// Puts the sample into `container`.
    pub fn in_container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    /// Makes this sample an attachment boundary for `study`.
    pub fn attached_to(mut self, study: StudyId) -> Self {
        self.attached_study = Some(study);
        self
    }

    /// Sets a metadata value.
    pub fn with_meta(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(field.into(), value.into());
        self
    }

    /// Returns true once the sample has been saved.
    pub fn is_persisted(&self) -> bool {
        self.audit.is_some()
    }

    /// Grid slot, when the sample occupies one.
    pub fn placement(&self) -> Option<(LocationId, i32)> {
        match self.location {
            Some(location) if self.pos >= 0 => Some((location, self.pos)),
            _ => None,
        }
    }

    /// Container id, when the sample sits in an identified container.
    pub fn container_id(&self) -> Option<&str> {
        self.container
            .as_ref()
            .and_then(|c| c.container_id.as_deref())
    }

    /// Whether `other` may occupy the same grid slot: both sit in the same
    /// multi-occupancy container.
    pub fn shares_slot_with(&self, other: &Biosample) -> bool {
        fn shared(s: &Biosample) -> Option<&str> {
            s.container
                .as_ref()
                .filter(|c| c.container_type.is_multiple())
                .and_then(|c| c.container_id.as_deref())
        }
        matches!((shared(self), shared(other)), (Some(a), Some(b)) if a == b)
    }

    /// Label used in error messages and logs.
    pub fn label(&self) -> String {
        if self.sample_id.is_empty() {
            format!("biosample #{}", self.id)
        } else {
            self.sample_id.clone()
        }
    }
}
