use serde::{Deserialize, Serialize};

use crate::types::{Audit, GroupId, PhaseId, StudyId};

/// The slice of a study the engine needs: its code (used by `{StudyId}`
/// patterns) and the groups and phases that belong to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Study {
    /// Row id.
    pub id: StudyId,
    /// Short code such as `S-00042`.
    pub study_code: String,
    /// Groups defined by the study.
    #[serde(default)]
    pub groups: Vec<GroupId>,
    /// Treatment phases defined by the study.
    #[serde(default)]
    pub phases: Vec<PhaseId>,
    /// Audit stamps.
    #[serde(default)]
    pub audit: Option<Audit>,
}

impl Study {
    /// Creates a study without groups or phases.
    pub fn new(id: StudyId, study_code: impl Into<String>) -> Self {
        Self {
            id,
            study_code: study_code.into(),
            groups: Vec::new(),
            phases: Vec::new(),
            audit: None,
        }
    }

    /// Declares `group` as part of the study.
    pub fn with_group(mut self, group: GroupId) -> Self {
        self.groups.push(group);
        self
    }

    /// Declares `phase` as part of the study.
    pub fn with_phase(mut self, phase: PhaseId) -> Self {
        self.phases.push(phase);
        self
    }
}
