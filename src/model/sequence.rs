use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier family served by the sequence allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceCategory {
    /// Biosample sample ids.
    Sample,
    /// Container barcodes.
    Container,
    /// Location scan codes.
    Location,
}

impl SequenceCategory {
    /// Stable lowercase name, also the persisted column value.
    pub fn name(self) -> &'static str {
        match self {
            SequenceCategory::Sample => "sample",
            SequenceCategory::Container => "container",
            SequenceCategory::Location => "location",
        }
    }

    /// Inverse of [`SequenceCategory::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sample" => Some(SequenceCategory::Sample),
            "container" => Some(SequenceCategory::Container),
            "location" => Some(SequenceCategory::Location),
            _ => None,
        }
    }
}

impl fmt::Display for SequenceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Last identifier issued for a (category, formatted pattern) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarcodeSequence {
    /// Identifier family.
    pub category: SequenceCategory,
    /// Formatted pattern, e.g. `AB######`.
    pub pattern: String,
    /// Last identifier reserved for this key.
    pub last_barcode: String,
}
