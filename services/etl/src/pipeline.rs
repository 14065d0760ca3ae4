//! Pipeline - Retrieve → Transform → Merge → Load → Report
//!
//! Each phase has a typed output consumed by the next one and is bounded by
//! the phase timeout. Sources are handled one at a time; every stream is
//! materialized before the merge runs. `RunStats` is owned by the run and
//! handed to whichever phase is executing.
//!
//! Only "no source retrieved" ends a run early. Every other failure is
//! counted, logged and surfaced in the run report.

use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use collector::{FetchedArtifact, Fetcher, PanelLayout, SourceKind, SourceSpec, SourcesConfig};

use crate::config::PipelineOptions;
use crate::error::{MalformedTableError, PipelineError};
use crate::load::{Row, RowLayout};
use crate::merge::{
    merge_streams, region_attributes, DimensionTable, MergeConflict, MetricStream, RegionAttributes,
};
use crate::panel::{parse_panel, PanelFormat};
use crate::reshape::{reshape_row, DerivationMode, Observation, ReshapeSpec};
use crate::report::{
    write_report, PhaseReport, RunReport, RunStats, SourceReport, TableLoadReport,
};
use crate::store::{conflict_key, TargetStore};

pub const PHASE_RETRIEVE: &str = "retrieve";
pub const PHASE_TRANSFORM: &str = "transform";
pub const PHASE_MERGE: &str = "merge";
pub const PHASE_LOAD: &str = "load";
pub const PHASE_REPORT: &str = "report";

// =============================================================================
// Phase outputs
// =============================================================================

/// Output of Retrieve: raw content per source, catalog order
#[derive(Debug, Default)]
pub struct Retrieved {
    pub artifacts: Vec<(SourceSpec, FetchedArtifact)>,
}

/// Homogeneous rows bound for one table
#[derive(Debug, Clone, PartialEq)]
pub struct TableRows {
    pub table: String,
    pub conflict_keys: Vec<String>,
    pub rows: Vec<Row>,
}

impl TableRows {
    fn new(table: &str, conflict_keys: &[String]) -> Self {
        Self {
            table: table.to_string(),
            conflict_keys: conflict_keys.to_vec(),
            rows: Vec::new(),
        }
    }

    /// Give every row the union of all columns, null where absent
    fn normalize(&mut self) {
        let columns: Vec<String> = {
            let mut seen: Vec<String> = Vec::new();
            for row in &self.rows {
                for key in row.keys() {
                    if !seen.contains(key) {
                        seen.push(key.clone());
                    }
                }
            }
            seen
        };
        for row in &mut self.rows {
            for column in &columns {
                row.entry(column.clone()).or_insert(serde_json::Value::Null);
            }
        }
    }
}

/// Observation behind one series row
#[derive(Debug, Clone)]
struct RowOrigin {
    source_id: String,
    region_key: String,
    period: NaiveDate,
    metric: String,
}

/// Series rows bound for one table, each tagged with its origin
#[derive(Debug, Clone)]
pub struct SeriesTable {
    pub table: String,
    pub conflict_keys: Vec<String>,
    pub rows: Vec<Row>,
    origins: Vec<RowOrigin>,
}

impl SeriesTable {
    fn new(table: &str, conflict_keys: &[String]) -> Self {
        Self {
            table: table.to_string(),
            conflict_keys: conflict_keys.to_vec(),
            rows: Vec::new(),
            origins: Vec::new(),
        }
    }

    fn push(&mut self, source_id: &str, layout: &RowLayout, obs: Observation, attrs: &RegionAttributes) {
        self.origins.push(RowOrigin {
            source_id: source_id.to_string(),
            region_key: obs.region_key.clone(),
            period: obs.period,
            metric: obs.metric.clone(),
        });
        self.rows.push(series_row(layout, obs, attrs));
    }

    /// Loadable rows plus one conflict per repeated conflict key
    ///
    /// Every row sharing a repeated key is withheld, so the outcome does not
    /// depend on which source or row came first.
    fn into_table_rows(self) -> (TableRows, Vec<MergeConflict>) {
        let keys: Vec<String> = self
            .rows
            .iter()
            .map(|row| conflict_key(row, &self.conflict_keys))
            .collect();
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, key) in keys.iter().enumerate() {
            groups.entry(key.as_str()).or_default().push(index);
        }

        let mut withheld = vec![false; self.rows.len()];
        let mut conflicts = Vec::new();
        for indices in groups.values().filter(|indices| indices.len() > 1) {
            let first = &self.origins[indices[0]];
            let mut sources: Vec<String> = indices
                .iter()
                .map(|&i| self.origins[i].source_id.clone())
                .collect();
            sources.sort();
            conflicts.push(MergeConflict {
                region_key: first.region_key.clone(),
                period: first.period,
                metric: first.metric.clone(),
                sources,
            });
            for &i in indices {
                withheld[i] = true;
            }
        }
        conflicts.sort_by(|a, b| {
            (&a.region_key, a.period, &a.metric, &a.sources).cmp(&(&b.region_key, b.period, &b.metric, &b.sources))
        });

        let mut table = TableRows::new(&self.table, &self.conflict_keys);
        table.rows = self
            .rows
            .into_iter()
            .zip(withheld)
            .filter_map(|(row, skip)| (!skip).then_some(row))
            .collect();
        table.normalize();
        (table, conflicts)
    }
}

/// Metric streams sharing a table, waiting to be merged
#[derive(Debug, Clone)]
pub struct MetricTable {
    pub table: String,
    pub conflict_keys: Vec<String>,
    pub streams: Vec<MetricStream>,
}

/// Output of Transform
#[derive(Debug, Default)]
pub struct Transformed {
    /// Series tables in order of first appearance in the catalog
    pub series: Vec<SeriesTable>,
    pub metrics: Vec<MetricTable>,
    pub dimensions: DimensionTable,
    /// Per-source outcome for every retrieved source
    pub sources: Vec<SourceReport>,
    pub stats: RunStats,
}

/// Output of Merge: tables in load order
#[derive(Debug, Default)]
pub struct LoadPlan {
    pub tables: Vec<TableRows>,
    pub conflicts: Vec<MergeConflict>,
}

impl LoadPlan {
    pub fn record_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}

// =============================================================================
// Transform (pure)
// =============================================================================

/// Parse and reshape every retrieved panel
pub fn transform(
    catalog: &SourcesConfig,
    retrieved: Retrieved,
    mode: DerivationMode,
    region: Option<&str>,
) -> Transformed {
    let layout = &catalog.layout;
    let row_layout = RowLayout::from(layout);
    let mut out = Transformed::default();
    let mut series_index: BTreeMap<String, usize> = BTreeMap::new();
    let mut metric_index: BTreeMap<String, usize> = BTreeMap::new();

    for (spec, artifact) in retrieved.artifacts {
        let mut report = SourceReport::retrieved(&spec.id, &artifact.content_hash);
        info!(source = %spec.id, bytes = artifact.size_bytes(), "Transforming panel");

        let result = match spec.kind {
            SourceKind::Series => {
                let idx = *series_index.entry(spec.table.clone()).or_insert_with(|| {
                    out.series.push(SeriesTable::new(&spec.table, &spec.conflict_keys));
                    out.series.len() - 1
                });
                let target = &mut out.series[idx];
                let source_id = spec.id.as_str();
                let emit = |obs: Observation, attrs: &RegionAttributes| {
                    target.push(source_id, &row_layout, obs, attrs);
                };
                transform_source(&spec, &artifact, layout, mode, region, &mut out.dimensions, &mut report, emit)
            }
            SourceKind::Metric => {
                let idx = *metric_index.entry(spec.table.clone()).or_insert_with(|| {
                    out.metrics.push(MetricTable {
                        table: spec.table.clone(),
                        conflict_keys: spec.conflict_keys.clone(),
                        streams: Vec::new(),
                    });
                    out.metrics.len() - 1
                });
                let mut stream = MetricStream {
                    source_id: spec.id.clone(),
                    metric: spec.metric.clone(),
                    observations: Vec::new(),
                };
                let emit = |obs: Observation, _: &RegionAttributes| stream.observations.push(obs);
                let result =
                    transform_source(&spec, &artifact, layout, mode, region, &mut out.dimensions, &mut report, emit);
                if result.is_ok() {
                    out.metrics[idx].streams.push(stream);
                }
                result
            }
        };

        match result {
            Ok(()) => info!(
                source = %spec.id,
                rows = report.rows,
                observations = report.observations,
                parse_errors = report.parse_errors,
                "Panel transformed"
            ),
            Err(e) => {
                warn!(source = %spec.id, error = %e, "Skipping malformed panel");
                report.error = Some(e.to_string());
            }
        }

        out.stats.rows_parsed += report.rows;
        out.stats.parse_errors += report.parse_errors;
        out.sources.push(report);
    }
    out
}

/// Long-format series row: key, value, derived ratios, declared attributes
fn series_row(layout: &RowLayout, obs: Observation, attrs: &RegionAttributes) -> Row {
    let mut row = Row::new();
    row.insert(layout.region_field.clone(), json!(obs.region_key));
    row.insert(layout.period_field.clone(), json!(obs.period));
    row.insert(obs.metric.clone(), json!(obs.value));
    row.insert("yoy_pct".to_string(), json!(obs.yoy_pct));
    row.insert("mom_pct".to_string(), json!(obs.mom_pct));
    for (field, value) in attrs {
        row.insert(field.clone(), json!(value));
    }
    row
}

/// Stream one panel's observations into `emit`
///
/// Row-level failures are counted on `report`; only a bad header fails.
#[allow(clippy::too_many_arguments)]
fn transform_source<F>(
    spec: &SourceSpec,
    artifact: &FetchedArtifact,
    layout: &PanelLayout,
    mode: DerivationMode,
    region: Option<&str>,
    dimensions: &mut DimensionTable,
    report: &mut SourceReport,
    mut emit: F,
) -> Result<(), MalformedTableError>
where
    F: FnMut(Observation, &RegionAttributes),
{
    let format = PanelFormat::for_source(spec, layout)?;
    let reader = parse_panel(&artifact.bytes, &format)?;
    let reshape = match spec.kind {
        SourceKind::Series => ReshapeSpec::series(&spec.metric, spec.numeric, mode),
        SourceKind::Metric => ReshapeSpec::metric(&spec.metric, spec.numeric),
    };

    for item in reader {
        let row = match item {
            Ok(row) => row,
            Err(e) => {
                debug!(source = %spec.id, error = %e, "Unreadable row");
                report.parse_errors += 1;
                continue;
            }
        };
        if let Some(only) = region {
            if !row.region_key.is_empty() && row.region_key != only {
                continue;
            }
        }
        report.rows += 1;

        let observations = match reshape_row(&row, &reshape) {
            Ok(observations) => observations,
            Err(e) => {
                debug!(source = %spec.id, error = %e, "Dropping row");
                report.parse_errors += 1;
                continue;
            }
        };

        let attributes = region_attributes(&row, layout);
        if spec.dimension_source {
            dimensions.offer(&row.region_key, attributes.clone());
        }
        report.observations += observations.len();
        for obs in observations {
            emit(obs, &attributes);
        }
    }
    Ok(())
}

// =============================================================================
// Merge (pure)
// =============================================================================

/// Merge metric tables and lay out every table in load order:
/// dimension table, series tables, merged metric tables
///
/// Series rows that repeat a conflict key are withheld and reported
/// alongside the metric conflicts.
pub fn merge(catalog: &SourcesConfig, transformed: Transformed) -> LoadPlan {
    let row_layout = RowLayout::from(&catalog.layout);
    let mut plan = LoadPlan::default();

    if !transformed.dimensions.is_empty() {
        plan.tables.push(TableRows {
            table: catalog.dimensions.table.clone(),
            conflict_keys: catalog.dimensions.conflict_keys.clone(),
            rows: transformed.dimensions.rows(&row_layout),
        });
    }

    for series in transformed.series {
        let (table, duplicates) = series.into_table_rows();
        if !duplicates.is_empty() {
            warn!(
                table = %table.table,
                duplicates = duplicates.len(),
                "Rows sharing a conflict key withheld"
            );
        }
        plan.conflicts.extend(duplicates);
        if !table.rows.is_empty() {
            plan.tables.push(table);
        }
    }

    for metric_table in transformed.metrics {
        let outcome = merge_streams(&metric_table.streams);
        if !outcome.conflicts.is_empty() {
            warn!(
                table = %metric_table.table,
                conflicts = outcome.conflicts.len(),
                "Conflicting metric values withheld"
            );
        }
        info!(
            table = %metric_table.table,
            streams = metric_table.streams.len(),
            records = outcome.records.len(),
            "Streams merged"
        );
        let rows = outcome.rows(&row_layout);
        plan.conflicts.extend(outcome.conflicts);
        if !rows.is_empty() {
            plan.tables.push(TableRows {
                table: metric_table.table,
                conflict_keys: metric_table.conflict_keys,
                rows,
            });
        }
    }

    plan
}

// =============================================================================
// Orchestration
// =============================================================================

pub struct Pipeline {
    catalog: Arc<SourcesConfig>,
    options: PipelineOptions,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn TargetStore>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub report_path: PathBuf,
}

impl Pipeline {
    pub fn new(
        catalog: SourcesConfig,
        options: PipelineOptions,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn TargetStore>,
    ) -> Self {
        Self {
            catalog: Arc::new(catalog),
            options,
            fetcher,
            store,
        }
    }

    /// Run every phase and write the report
    ///
    /// The report is written even when the run fails for lack of sources.
    pub async fn run(&self) -> Result<RunOutcome, PipelineError> {
        self.options.validate()?;
        let loader = self.options.loader()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut stats = RunStats::default();
        let mut phases: Vec<PhaseReport> = Vec::new();
        let mut sources: Vec<SourceReport> = Vec::new();
        let mut tables: Vec<TableLoadReport> = Vec::new();
        let mut conflicts: Vec<MergeConflict> = Vec::new();

        info!(
            run_id = %run_id,
            dry_run = self.options.dry_run,
            derivation = %self.options.derivation,
            batch_size = loader.batch_size(),
            "Starting run"
        );

        let selected: Vec<SourceSpec> = self
            .catalog
            .select(&self.options.sources)
            .into_iter()
            .cloned()
            .collect();

        // ---- Retrieve ----
        let mut retrieved = Retrieved::default();
        self.timed(
            PHASE_RETRIEVE,
            async {
                self.retrieve(&selected, &mut stats, &mut sources, &mut retrieved).await;
                Ok::<(), String>(())
            },
            &mut phases,
        )
        .await;

        if retrieved.artifacts.is_empty() {
            error!(attempted = selected.len(), "No sources retrieved");
            for phase in [PHASE_TRANSFORM, PHASE_MERGE, PHASE_LOAD] {
                phases.push(PhaseReport::skipped(phase, "no sources retrieved"));
            }
            let mut report = RunReport::new(
                run_id,
                started_at,
                Utc::now(),
                self.options.dry_run,
                self.options.derivation,
                stats,
            );
            report.phases = phases;
            report.sources = sources;
            report.log_summary();
            write_report(&self.options.report_dir, &report)?;
            return Err(PipelineError::NoSourcesRetrieved {
                attempted: selected.len(),
            });
        }

        // ---- Transform ----
        let catalog = Arc::clone(&self.catalog);
        let mode = self.options.derivation;
        let region = self.options.region.clone();
        let handle = tokio::task::spawn_blocking(move || transform(&catalog, retrieved, mode, region.as_deref()));
        let transformed = self
            .timed(PHASE_TRANSFORM, async { handle.await.map_err(|e| e.to_string()) }, &mut phases)
            .await;

        // ---- Merge ----
        let plan = match transformed {
            Some(transformed) => {
                stats.absorb(&transformed.stats);
                apply_source_reports(&mut sources, &transformed.sources);

                let catalog = Arc::clone(&self.catalog);
                let handle = tokio::task::spawn_blocking(move || merge(&catalog, transformed));
                self.timed(PHASE_MERGE, async { handle.await.map_err(|e| e.to_string()) }, &mut phases)
                    .await
            }
            None => {
                phases.push(PhaseReport::skipped(PHASE_MERGE, "transform did not complete"));
                None
            }
        };

        // ---- Load ----
        match plan {
            Some(mut plan) => {
                stats.records_transformed += plan.record_count();
                stats.merge_conflicts += plan.conflicts.len();
                conflicts = std::mem::take(&mut plan.conflicts);

                if self.options.dry_run {
                    info!("Dry run: loading into the in-process store only");
                }
                self.timed(
                    PHASE_LOAD,
                    async {
                        for target in &plan.tables {
                            let table_report = loader
                                .load(
                                    self.store.as_ref(),
                                    &target.table,
                                    &target.rows,
                                    &target.conflict_keys,
                                    &mut stats,
                                )
                                .await;
                            tables.push(table_report);
                        }
                        Ok::<(), String>(())
                    },
                    &mut phases,
                )
                .await;
            }
            None => {
                phases.push(PhaseReport::skipped(PHASE_LOAD, "merge did not complete"));
            }
        }

        // ---- Report ----
        let report_started = Instant::now();
        let mut report = RunReport::new(
            run_id,
            started_at,
            Utc::now(),
            self.options.dry_run,
            self.options.derivation,
            stats,
        )
        .with_conflicts(&conflicts);
        phases.push(PhaseReport::ok(PHASE_REPORT, report_started.elapsed()));
        report.phases = phases;
        report.sources = sources;
        report.tables = tables;
        report.log_summary();

        let report_path = write_report(&self.options.report_dir, &report)?;
        Ok(RunOutcome { report, report_path })
    }

    /// Fetch each source in turn; failures skip the source
    async fn retrieve(
        &self,
        selected: &[SourceSpec],
        stats: &mut RunStats,
        reports: &mut Vec<SourceReport>,
        retrieved: &mut Retrieved,
    ) {
        for spec in selected {
            stats.downloads_attempted += 1;
            match self.fetcher.fetch(spec).await {
                Ok(artifact) => {
                    stats.downloads_succeeded += 1;
                    info!(
                        source = %spec.id,
                        bytes = artifact.size_bytes(),
                        hash = %artifact.content_hash,
                        "Retrieved"
                    );
                    reports.push(SourceReport::retrieved(&spec.id, &artifact.content_hash));
                    retrieved.artifacts.push((spec.clone(), artifact));
                }
                Err(e) => {
                    warn!(source = %spec.id, error = %e, "Skipping source");
                    reports.push(SourceReport::skipped(&spec.id, &e));
                }
            }
        }
    }

    /// Run one phase under the phase timeout and record its outcome
    async fn timed<T, F>(&self, phase: &str, fut: F, phases: &mut Vec<PhaseReport>) -> Option<T>
    where
        F: Future<Output = Result<T, String>>,
    {
        let started = Instant::now();
        info!(phase, "Phase started");
        match timeout(self.options.phase_timeout, fut).await {
            Ok(Ok(value)) => {
                let elapsed = started.elapsed();
                info!(phase, elapsed_ms = elapsed.as_millis() as u64, "Phase complete");
                phases.push(PhaseReport::ok(phase, elapsed));
                Some(value)
            }
            Ok(Err(e)) => {
                error!(phase, error = %e, "Phase failed");
                phases.push(PhaseReport::failed(phase, started.elapsed(), e));
                None
            }
            Err(_) => {
                error!(phase, timeout_secs = self.options.phase_timeout.as_secs(), "Phase timed out");
                phases.push(PhaseReport::timed_out(phase, self.options.phase_timeout));
                None
            }
        }
    }
}

fn apply_source_reports(reports: &mut [SourceReport], updates: &[SourceReport]) {
    for update in updates {
        if let Some(existing) = reports.iter_mut().find(|r| r.source_id == update.source_id) {
            *existing = update.clone();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
