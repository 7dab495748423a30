use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of physical vessel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    /// A single-sample tube.
    Tube,
    /// A single-sample cryovial.
    Cryotube,
    /// A microscope slide.
    Slide,
    /// A single-sample bottle.
    Bottle,
    /// An animal cage shared by its occupants.
    Cage,
    /// A bag shared by its occupants.
    Bag,
    /// A box shared by its occupants.
    Box,
}

impl ContainerType {
    /// Every container type.
    pub const ALL: [ContainerType; 7] = [
        ContainerType::Tube,
        ContainerType::Cryotube,
        ContainerType::Slide,
        ContainerType::Bottle,
        ContainerType::Cage,
        ContainerType::Bag,
        ContainerType::Box,
    ];

    /// Whether several biosamples may share one container id.
    pub fn is_multiple(self) -> bool {
        matches!(
            self,
            ContainerType::Cage | ContainerType::Bag | ContainerType::Box
        )
    }

    /// Prefix used when allocating container ids of this type.
    pub fn prefix(self) -> &'static str {
        match self {
            ContainerType::Tube => "TU",
            ContainerType::Cryotube => "CRY",
            ContainerType::Slide => "SL",
            ContainerType::Bottle => "BO",
            ContainerType::Cage => "CA",
            ContainerType::Bag => "BAG",
            ContainerType::Box => "BX",
        }
    }

    /// Stable lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            ContainerType::Tube => "tube",
            ContainerType::Cryotube => "cryotube",
            ContainerType::Slide => "slide",
            ContainerType::Bottle => "bottle",
            ContainerType::Cage => "cage",
            ContainerType::Bag => "bag",
            ContainerType::Box => "box",
        }
    }

    /// Looks a type up by its name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The vessel a biosample sits in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Vessel kind.
    pub container_type: ContainerType,
    /// Barcode of the vessel; allocated on save when missing.
    #[serde(default)]
    pub container_id: Option<String>,
}

impl Container {
    /// A container without an id yet.
    pub fn new(container_type: ContainerType) -> Self {
        Self {
            container_type,
            container_id: None,
        }
    }

    /// A container with a known id.
    pub fn with_id(container_type: ContainerType, container_id: impl Into<String>) -> Self {
        Self {
            container_type,
            container_id: Some(container_id.into()),
        }
    }
}
