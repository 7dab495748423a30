use serde::{Deserialize, Serialize};

use super::ContainerType;
use crate::types::BiotypeId;

/// Value type of a metadata field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "arg")]
pub enum FieldKind {
    /// Free text.
    Alpha,
    /// Decimal number.
    Number,
    /// Calendar date, `YYYY-MM-DD`.
    Date,
    /// One of the listed choices.
    List(Vec<String>),
    /// Reference to another biosample by sample id (aggregation).
    Biosample,
    /// Numeric value computed at save time from the given formula.
    Formula(String),
}

/// One metadata field of a biotype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    /// Field name, also the metadata key on biosamples.
    pub name: String,
    /// Value type.
    pub kind: FieldKind,
    /// Whether a value must be present.
    #[serde(default)]
    pub required: bool,
}

impl MetadataField {
    /// Optional field of `kind`.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }

    /// Marks the field as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Schema for a class of biosamples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Biotype {
    /// Row id.
    pub id: BiotypeId,
    /// Display name, unique across biotypes.
    pub name: String,
    /// Sample id pattern (`AB`, `AB######`, `{StudyId}-BL####`).
    pub prefix: String,
    /// Whether samples must carry a name.
    #[serde(default)]
    pub name_required: bool,
    /// Whether names must be unique within this biotype.
    #[serde(default)]
    pub name_unique: bool,
    /// Default vessel for samples of this type.
    #[serde(default)]
    pub container_type: Option<ContainerType>,
    /// Metadata field definitions.
    #[serde(default)]
    pub fields: Vec<MetadataField>,
}

impl Biotype {
    /// Creates a biotype with no naming rules and no fields.
    pub fn new(id: BiotypeId, name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            prefix: prefix.into(),
            name_required: false,
            name_unique: false,
            container_type: None,
            fields: Vec::new(),
        }
    }

    /// Adds a metadata field.
    pub fn with_field(mut self, field: MetadataField) -> Self {
        self.fields.push(field);
        self
    }

    /// Looks a field up by name.
    pub fn field(&self, name: &str) -> Option<&MetadataField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Formula-typed fields, in declaration order.
    pub fn formulas(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().filter_map(|f| match &f.kind {
            FieldKind::Formula(text) => Some((f.name.as_str(), text.as_str())),
            _ => None,
        })
    }
}
