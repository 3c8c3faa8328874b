//! Declarative master-data conversion.
//!
//! A [`MappingSpec`] describes, per target object, how the legacy export's
//! columns become ingest fields; the transformer applies it mechanically.
//! There is no per-object code — adding a master is a new mapping file.

pub mod mapping;
pub mod transformer;

pub use mapping::{ExtraField, MappingEntry, MappingSpec};
pub use transformer::{convert_bytes, convert_file, ConvertSummary};
