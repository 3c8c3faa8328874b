//! Result streaming and assembly.
//!
//! `export_merger` turns paginated (and optionally partitioned) query
//! results into one merged CSV; `outcome` handles the success/failure
//! record streams an ingest job leaves behind.

pub mod export_merger;
pub mod outcome;

pub use export_merger::{export_query_job, ExportSummary};
pub use outcome::{IngestOutcome, OutcomeCounts, OutcomeFiles};
