//! Batch Loader - partitions records and upserts them batch by batch
//!
//! A failed batch is logged and counted, then loading moves on to the next
//! one. Batches already applied stay applied.

use serde_json::Map;
use tracing::{debug, error, info};

use collector::PanelLayout;

use crate::error::LoadError;
use crate::report::{RunStats, TableLoadReport};
use crate::store::TargetStore;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// One record as handed to the store: column name -> JSON value
pub type Row = Map<String, serde_json::Value>;

/// Column names used for the composite key in emitted rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    pub region_field: String,
    pub period_field: String,
}

impl From<&PanelLayout> for RowLayout {
    fn from(layout: &PanelLayout) -> Self {
        Self {
            region_field: layout.region_field.clone(),
            period_field: layout.period_field.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLoader {
    batch_size: usize,
}

impl Default for BatchLoader {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl BatchLoader {
    /// Returns `None` for a zero batch size
    pub fn new(batch_size: usize) -> Option<Self> {
        (batch_size > 0).then_some(Self { batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `ceil(records / batch_size)`
    pub fn batch_count(&self, records: usize) -> usize {
        records.div_ceil(self.batch_size)
    }

    /// Upsert `rows` into `table` in order, one call per batch
    pub async fn load(
        &self,
        store: &dyn TargetStore,
        table: &str,
        rows: &[Row],
        conflict_keys: &[String],
        stats: &mut RunStats,
    ) -> TableLoadReport {
        let mut report = TableLoadReport {
            table: table.to_string(),
            records: rows.len(),
            batches: self.batch_count(rows.len()),
            ..Default::default()
        };

        if rows.is_empty() {
            debug!(table, "No records to load");
            return report;
        }

        info!(
            table,
            records = rows.len(),
            batches = report.batches,
            batch_size = self.batch_size,
            "Loading table"
        );

        for (index, batch) in rows.chunks(self.batch_size).enumerate() {
            match store.upsert(table, batch, conflict_keys).await {
                Ok(()) => {
                    report.loaded += batch.len();
                    stats.records_loaded += batch.len();
                    debug!(table, batch = index + 1, rows = batch.len(), "Batch loaded");
                }
                Err(source) => {
                    let err = LoadError {
                        table: table.to_string(),
                        batch: index + 1,
                        rows: batch.len(),
                        source,
                    };
                    error!(error = %err, "Batch failed, continuing");
                    report.failed_batches += 1;
                    stats.load_errors += 1;
                }
            }

            if (index + 1) % 10 == 0 {
                info!(
                    table,
                    "Progress: {}/{} batches ({} records loaded)",
                    index + 1,
                    report.batches,
                    report.loaded
                );
            }
        }

        info!(
            table,
            loaded = report.loaded,
            failed_batches = report.failed_batches,
            "Table load complete"
        );
        report
    }
}

// =============================================================================
// TESTS
// =============================================================================
