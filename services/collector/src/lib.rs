//! Collector - source catalog and panel retrieval
//!
//! Responsibilities:
//! - Load and validate the static source catalog
//! - Fetch raw panels over HTTP with rate limiting and a same-day cache
//! - Replay previously downloaded panels from disk

pub mod fetch;
pub mod sources;
pub mod telemetry;

pub use fetch::{FetchedArtifact, Fetcher, HttpConfig, HttpFetcher, LocalFetcher, RetrievalError};
pub use sources::{
    CatalogError, DimensionTarget, NumericDomain, PanelLayout, SourceKind, SourceSpec,
    SourcesConfig,
};
pub use telemetry::init_tracing;
