//! Top-level command flows driven by the CLI.

pub mod convert;
pub mod export;
pub mod ingest;

pub use convert::{run_convert, ConvertReport};
pub use export::{run_export, ExportOptions, ExportReport};
pub use ingest::{run_ingest, IngestOptions, IngestReport};
