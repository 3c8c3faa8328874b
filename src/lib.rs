//! Master-data to Salesforce bridge.
//!
//! Converts legacy "ALL" master exports into ingest-ready CSV via
//! declarative mappings, loads them through the Bulk API 2.0 ingest
//! endpoint, and exports SOQL results through the bulk query endpoint with
//! locator pagination and optional primary-key partitioning.

pub mod config;
pub mod convert;
pub mod error;
pub mod flows;
pub mod salesforce;
pub mod streaming;

pub use config::Settings;
pub use error::AppError;
