//! Run Reporter - counters, per-phase outcomes and the JSON run report

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::merge::MergeConflict;
use crate::reshape::DerivationMode;

/// Conflicts listed individually in the report; the count is always complete
pub const MAX_REPORTED_CONFLICTS: usize = 100;

/// Counters threaded explicitly through every phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub downloads_attempted: usize,
    pub downloads_succeeded: usize,
    pub rows_parsed: usize,
    pub parse_errors: usize,
    pub records_transformed: usize,
    pub records_loaded: usize,
    /// Failed batches
    pub load_errors: usize,
    pub merge_conflicts: usize,
}

impl RunStats {
    /// Fold counters produced by a worker into the run totals
    pub fn absorb(&mut self, other: &RunStats) {
        self.downloads_attempted += other.downloads_attempted;
        self.downloads_succeeded += other.downloads_succeeded;
        self.rows_parsed += other.rows_parsed;
        self.parse_errors += other.parse_errors;
        self.records_transformed += other.records_transformed;
        self.records_loaded += other.records_loaded;
        self.load_errors += other.load_errors;
        self.merge_conflicts += other.merge_conflicts;
    }

    /// `loaded / transformed * 100`, 0 when nothing was transformed
    pub fn success_rate(&self) -> f64 {
        success_rate(self.records_loaded, self.records_transformed)
    }
}

pub fn success_rate(loaded: usize, transformed: usize) -> f64 {
    if transformed == 0 {
        return 0.0;
    }
    ((loaded as f64 / transformed as f64) * 100.0 * 100.0).round() / 100.0
}

// =============================================================================
// Report sections
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Ok,
    Failed,
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub phase: String,
    pub status: PhaseStatus,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseReport {
    pub fn ok(phase: &str, elapsed: Duration) -> Self {
        Self::new(phase, PhaseStatus::Ok, elapsed, None)
    }

    pub fn failed(phase: &str, elapsed: Duration, error: impl ToString) -> Self {
        Self::new(phase, PhaseStatus::Failed, elapsed, Some(error.to_string()))
    }

    pub fn timed_out(phase: &str, limit: Duration) -> Self {
        Self::new(
            phase,
            PhaseStatus::TimedOut,
            limit,
            Some(format!("phase exceeded its {:?} limit", limit)),
        )
    }

    pub fn skipped(phase: &str, reason: &str) -> Self {
        Self::new(phase, PhaseStatus::Skipped, Duration::ZERO, Some(reason.to_string()))
    }

    fn new(phase: &str, status: PhaseStatus, elapsed: Duration, error: Option<String>) -> Self {
        Self {
            phase: phase.to_string(),
            status,
            duration_ms: elapsed.as_millis(),
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Retrieved,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub status: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub rows: usize,
    pub parse_errors: usize,
    pub observations: usize,
}

impl SourceReport {
    pub fn retrieved(source_id: &str, content_hash: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: SourceStatus::Retrieved,
            error: None,
            content_hash: Some(content_hash.to_string()),
            rows: 0,
            parse_errors: 0,
            observations: 0,
        }
    }

    pub fn skipped(source_id: &str, error: impl ToString) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: SourceStatus::Skipped,
            error: Some(error.to_string()),
            content_hash: None,
            rows: 0,
            parse_errors: 0,
            observations: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableLoadReport {
    pub table: String,
    pub records: usize,
    pub batches: usize,
    pub loaded: usize,
    pub failed_batches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub success_rate_pct: f64,
    pub success_rate: String,
}

impl Summary {
    pub fn from_stats(stats: &RunStats) -> Self {
        let pct = stats.success_rate();
        Self {
            success_rate_pct: pct,
            success_rate: format!("{:.2}%", pct),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub runtime_seconds: f64,
    pub dry_run: bool,
    pub derivation: DerivationMode,
    pub stats: RunStats,
    pub phases: Vec<PhaseReport>,
    pub sources: Vec<SourceReport>,
    pub tables: Vec<TableLoadReport>,
    pub conflicts: Vec<MergeConflict>,
    pub summary: Summary,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        dry_run: bool,
        derivation: DerivationMode,
        stats: RunStats,
    ) -> Self {
        let runtime = (finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let summary = Summary::from_stats(&stats);
        Self {
            run_id,
            started_at,
            finished_at,
            runtime_seconds: runtime,
            dry_run,
            derivation,
            stats,
            phases: Vec::new(),
            sources: Vec::new(),
            tables: Vec::new(),
            conflicts: Vec::new(),
            summary,
        }
    }

    /// Keep the first conflicts only; `stats.merge_conflicts` holds the total
    pub fn with_conflicts(mut self, conflicts: &[MergeConflict]) -> Self {
        self.conflicts = conflicts.iter().take(MAX_REPORTED_CONFLICTS).cloned().collect();
        self
    }

    pub fn file_name(&self) -> String {
        format!("data_load_{}.json", self.started_at.format("%Y-%m-%d"))
    }

    /// Emit the human-readable run summary
    pub fn log_summary(&self) {
        let s = &self.stats;
        info!("========================================");
        info!("RUN SUMMARY ({})", self.run_id);
        info!("========================================");
        info!("Runtime: {:.1}s", self.runtime_seconds);
        info!("Downloads: {}/{}", s.downloads_succeeded, s.downloads_attempted);
        info!("Rows parsed: {} ({} parse errors)", s.rows_parsed, s.parse_errors);
        info!("Records transformed: {}", s.records_transformed);
        info!("Records loaded: {} ({} failed batches)", s.records_loaded, s.load_errors);
        info!("Merge conflicts: {}", s.merge_conflicts);
        info!("Success rate: {}", self.summary.success_rate);

        for phase in &self.phases {
            if phase.status != PhaseStatus::Ok {
                warn!(
                    phase = %phase.phase,
                    status = ?phase.status,
                    error = phase.error.as_deref().unwrap_or(""),
                    "Phase did not complete"
                );
            }
        }
    }
}

/// Write the report as pretty JSON under `dir`, creating it if needed
pub fn write_report(dir: &Path, report: &RunReport) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(report.file_name());
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json)?;
    info!(path = %path.display(), "Report written");
    Ok(path)
}

// =============================================================================
// TESTS
// =============================================================================
