//! ETL - wide regional panels into long observations, merged and loaded
//!
//! Responsibilities:
//! - Parse wide panels (one row per region, one column per period)
//! - Reshape rows into observations with trailing yoy/mom ratios
//! - Merge single-metric streams into per-region-per-period records
//! - Upsert records in batches, tolerating per-batch failures
//! - Report run statistics

pub mod config;
pub mod error;
pub mod load;
pub mod merge;
pub mod panel;
pub mod pipeline;
pub mod report;
pub mod reshape;
pub mod store;

pub use config::PipelineOptions;
pub use error::{LoadError, MalformedTableError, ParseValueError, PipelineError, StoreError};
pub use load::{BatchLoader, Row, RowLayout};
pub use merge::{merge_streams, DimensionTable, MergeConflict, MergeOutcome, MergedRecord, MetricStream};
pub use pipeline::{Pipeline, RunOutcome};
pub use report::{RunReport, RunStats};
pub use reshape::{DerivationMode, Observation, ReshapeSpec, Value};
pub use store::{MemoryStore, PgStore, TargetStore};
