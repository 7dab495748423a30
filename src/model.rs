//! Persisted record types: biosamples, biotypes, containers, locations,
//! studies and barcode sequences.

mod biosample;
mod biotype;
mod container;
mod location;
mod sequence;
mod study;

pub use biosample::Biosample;
pub use biotype::{Biotype, FieldKind, MetadataField};
pub use container::{Container, ContainerType};
pub use location::{Labeling, Location, LocationType, Privacy};
pub use sequence::{BarcodeSequence, SequenceCategory};
pub use study::Study;

/// Position value meaning "no grid slot".
pub const NO_POSITION: i32 = -1;
