//! Stream Merger - folds single-metric streams into per-key records
//!
//! Metric values are keyed by `(region_key, period)`. A metric name may be
//! written only once per key across all contributing streams: a second
//! write is a data-quality defect. Both values are withheld from the record
//! and reported as a `MergeConflict`, so the merged output does not depend
//! on stream order.
//!
//! Dimensions are the exception: `DimensionTable` keeps the first
//! non-empty attribute set offered for a region and ignores later ones, so
//! its content depends on the order sources are processed in.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Map};
use std::collections::BTreeMap;

use collector::PanelLayout;

use crate::load::{Row, RowLayout};
use crate::panel::RawPanelRow;
use crate::reshape::{Observation, Value};

/// Observations contributed by one source for one metric
#[derive(Debug, Clone)]
pub struct MetricStream {
    pub source_id: String,
    pub metric: String,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeConflict {
    pub region_key: String,
    pub period: NaiveDate,
    pub metric: String,
    /// Contributing source ids, sorted; repeats mean duplicate rows in one source
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord {
    pub region_key: String,
    pub period: NaiveDate,
    pub metrics: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Every metric name seen across the streams, sorted
    pub metric_names: Vec<String>,
    /// One record per key, ordered by (region_key, period)
    pub records: Vec<MergedRecord>,
    pub conflicts: Vec<MergeConflict>,
}

type MergeKey = (String, NaiveDate);

/// Merge streams sharing a key space
pub fn merge_streams(streams: &[MetricStream]) -> MergeOutcome {
    let mut candidates: BTreeMap<MergeKey, BTreeMap<String, Vec<(String, Value)>>> = BTreeMap::new();
    let mut metric_names: Vec<String> = Vec::new();

    for stream in streams {
        if !metric_names.contains(&stream.metric) {
            metric_names.push(stream.metric.clone());
        }
        for obs in &stream.observations {
            if !metric_names.contains(&obs.metric) {
                metric_names.push(obs.metric.clone());
            }
            candidates
                .entry((obs.region_key.clone(), obs.period))
                .or_default()
                .entry(obs.metric.clone())
                .or_default()
                .push((stream.source_id.clone(), obs.value));
        }
    }
    metric_names.sort();

    let mut records = Vec::with_capacity(candidates.len());
    let mut conflicts = Vec::new();

    for ((region_key, period), by_metric) in candidates {
        let mut metrics = BTreeMap::new();
        for (metric, mut writers) in by_metric {
            if writers.len() == 1 {
                let (_, value) = writers.remove(0);
                metrics.insert(metric, value);
            } else {
                let mut sources: Vec<String> = writers.into_iter().map(|(s, _)| s).collect();
                sources.sort();
                conflicts.push(MergeConflict {
                    region_key: region_key.clone(),
                    period,
                    metric,
                    sources,
                });
            }
        }
        if !metrics.is_empty() {
            records.push(MergedRecord {
                region_key,
                period,
                metrics,
            });
        }
    }

    MergeOutcome {
        metric_names,
        records,
        conflicts,
    }
}

impl MergeOutcome {
    /// Rows with every metric column present, null where a key lacks it
    pub fn rows(&self, layout: &RowLayout) -> Vec<Row> {
        self.records
            .iter()
            .map(|record| {
                let mut row = Map::new();
                row.insert(layout.region_field.clone(), json!(record.region_key));
                row.insert(layout.period_field.clone(), json!(record.period));
                for metric in &self.metric_names {
                    row.insert(metric.clone(), json!(record.metrics.get(metric)));
                }
                row
            })
            .collect()
    }
}

// =============================================================================
// Dimensions
// =============================================================================

/// Declared attribute field -> value, every declared field present
pub type RegionAttributes = BTreeMap<String, Option<String>>;

/// Read the declared attribute columns from a row
pub fn region_attributes(row: &RawPanelRow, layout: &PanelLayout) -> RegionAttributes {
    layout
        .attributes
        .iter()
        .map(|(field, column)| (field.clone(), row.attribute(column).map(str::to_string)))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionRecord {
    pub region_key: String,
    pub attributes: RegionAttributes,
}

#[derive(Debug, Clone, Default)]
pub struct DimensionTable {
    records: BTreeMap<String, DimensionRecord>,
}

impl DimensionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a region's attributes unless already set
    ///
    /// Attribute sets with no values are ignored. Returns true when the
    /// offer was taken.
    pub fn offer(&mut self, region_key: &str, attributes: RegionAttributes) -> bool {
        if region_key.is_empty() || attributes.values().all(Option::is_none) {
            return false;
        }
        if self.records.contains_key(region_key) {
            return false;
        }
        self.records.insert(
            region_key.to_string(),
            DimensionRecord {
                region_key: region_key.to_string(),
                attributes,
            },
        );
        true
    }

    pub fn get(&self, region_key: &str) -> Option<&DimensionRecord> {
        self.records.get(region_key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &DimensionRecord> {
        self.records.values()
    }

    pub fn rows(&self, layout: &RowLayout) -> Vec<Row> {
        self.records
            .values()
            .map(|record| {
                let mut row = Map::new();
                row.insert(layout.region_field.clone(), json!(record.region_key));
                for (field, value) in &record.attributes {
                    row.insert(field.clone(), json!(value));
                }
                row
            })
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn obs(region: &str, period: &str, metric: &str, value: Value) -> Observation {
        Observation {
            region_key: region.to_string(),
            period: date(period),
            metric: metric.to_string(),
            value,
            yoy_pct: None,
            mom_pct: None,
        }
    }

    fn stream(source_id: &str, metric: &str, points: &[(&str, &str, Value)]) -> MetricStream {
        MetricStream {
            source_id: source_id.to_string(),
            metric: metric.to_string(),
            observations: points
                .iter()
                .map(|(r, p, v)| obs(r, p, metric, *v))
                .collect(),
        }
    }

    fn layout() -> RowLayout {
        RowLayout {
            region_field: "zip".to_string(),
            period_field: "date".to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // MERGE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_disjoint_metrics_share_record() {
        let inventory = stream("inventory_zip", "inventory", &[("32937", "2024-01-01", Value::Int(120))]);
        let dom = stream("dom_zip", "dom", &[("32937", "2024-01-01", Value::Int(45))]);

        let outcome = merge_streams(&[inventory, dom]);

        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        assert_eq!(record.metrics.get("inventory"), Some(&Value::Int(120)));
        assert_eq!(record.metrics.get("dom"), Some(&Value::Int(45)));
        assert_eq!(outcome.metric_names, vec!["dom", "inventory"]);
    }

    #[test]
    fn test_same_metric_same_key_is_conflict() {
        let a = stream("sales_a", "sales", &[("32937", "2024-01-01", Value::Int(10))]);
        let b = stream("sales_b", "sales", &[("32937", "2024-01-01", Value::Int(11))]);
        let dom = stream("dom_zip", "dom", &[("32937", "2024-01-01", Value::Int(45))]);

        let outcome = merge_streams(&[a, b, dom]);

        assert_eq!(
            outcome.conflicts,
            vec![MergeConflict {
                region_key: "32937".to_string(),
                period: date("2024-01-01"),
                metric: "sales".to_string(),
                sources: vec!["sales_a".to_string(), "sales_b".to_string()],
            }]
        );
        // Neither value survives
        assert_eq!(outcome.records.len(), 1);
        assert!(!outcome.records[0].metrics.contains_key("sales"));
        assert_eq!(outcome.records[0].metrics.get("dom"), Some(&Value::Int(45)));
    }

    #[test]
    fn test_same_metric_disjoint_keys_is_not_conflict() {
        let a = stream("sales_a", "sales", &[("32937", "2024-01-01", Value::Int(10))]);
        let b = stream("sales_b", "sales", &[("32940", "2024-01-01", Value::Int(11))]);

        let outcome = merge_streams(&[a, b]);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.records.len(), 2);
    }

    #[test]
    fn test_duplicate_rows_within_stream_conflict() {
        let a = stream(
            "sales_zip",
            "sales",
            &[("32937", "2024-01-01", Value::Int(10)), ("32937", "2024-01-01", Value::Int(12))],
        );
        let outcome = merge_streams(&[a]);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].sources, vec!["sales_zip", "sales_zip"]);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let inventory = stream(
            "inventory_zip",
            "inventory",
            &[("32937", "2024-01-01", Value::Int(120)), ("32940", "2024-02-01", Value::Int(80))],
        );
        let cuts = stream(
            "price_cuts_zip",
            "price_cuts_pct",
            &[("32940", "2024-02-01", Value::Float(0.125)), ("32937", "2024-01-01", Value::Float(0.2))],
        );
        let dup = stream("cuts_dup", "price_cuts_pct", &[("32937", "2024-01-01", Value::Float(0.3))]);

        let forward = merge_streams(&[inventory.clone(), cuts.clone(), dup.clone()]);
        let backward = merge_streams(&[dup, cuts, inventory]);

        assert_eq!(forward.records, backward.records);
        assert_eq!(forward.conflicts, backward.conflicts);
        assert_eq!(forward.metric_names, backward.metric_names);
    }

    #[test]
    fn test_merged_rows_are_homogeneous() {
        let inventory = stream("inventory_zip", "inventory", &[("32937", "2024-01-01", Value::Int(120))]);
        let ratio = stream(
            "sale_to_list_zip",
            "sale_to_list_ratio",
            &[("32940", "2024-01-01", Value::Float(0.99))],
        );
        let rows = merge_streams(&[inventory, ratio]).rows(&layout());

        assert_eq!(rows.len(), 2);
        assert_eq!(
            serde_json::Value::Object(rows[0].clone()),
            json!({"zip": "32937", "date": "2024-01-01", "inventory": 120, "sale_to_list_ratio": null})
        );
        assert_eq!(
            serde_json::Value::Object(rows[1].clone()),
            json!({"zip": "32940", "date": "2024-01-01", "inventory": null, "sale_to_list_ratio": 0.99})
        );
    }

    #[test]
    fn test_merge_no_streams() {
        let outcome = merge_streams(&[]);
        assert!(outcome.records.is_empty());
        assert!(outcome.conflicts.is_empty());
    }

    // -------------------------------------------------------------------------
    // DIMENSION TESTS (order-sensitive by construction)
    // -------------------------------------------------------------------------

    fn attrs(city: Option<&str>, state: Option<&str>) -> RegionAttributes {
        let mut a = RegionAttributes::new();
        a.insert("city".to_string(), city.map(str::to_string));
        a.insert("state".to_string(), state.map(str::to_string));
        a
    }

    #[test]
    fn test_dimension_first_writer_wins() {
        let mut table = DimensionTable::new();
        assert!(table.offer("32937", attrs(Some("Melbourne"), Some("FL"))));
        assert!(!table.offer("32937", attrs(Some("Satellite Beach"), Some("FL"))));

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get("32937").unwrap().attributes["city"],
            Some("Melbourne".to_string())
        );
    }

    #[test]
    fn test_dimension_ignores_empty_attributes() {
        let mut table = DimensionTable::new();
        assert!(!table.offer("32937", attrs(None, None)));
        assert!(table.offer("32937", attrs(None, Some("FL"))));
        assert!(!table.offer("", attrs(Some("X"), None)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_dimension_rows() {
        let mut table = DimensionTable::new();
        table.offer("32940", attrs(Some("Melbourne"), None));
        table.offer("32937", attrs(Some("Satellite Beach"), Some("FL")));

        let rows = table.rows(&layout());
        assert_eq!(
            serde_json::Value::Object(rows[0].clone()),
            json!({"zip": "32937", "city": "Satellite Beach", "state": "FL"})
        );
        assert_eq!(
            serde_json::Value::Object(rows[1].clone()),
            json!({"zip": "32940", "city": "Melbourne", "state": null})
        );
    }

    #[test]
    fn test_region_attributes_from_row() {
        let mut attributes = BTreeMap::new();
        attributes.insert("City".to_string(), "Melbourne".to_string());
        attributes.insert("State".to_string(), "".to_string());
        let row = RawPanelRow {
            line: 2,
            region_key: "32937".to_string(),
            periods: Vec::new(),
            attributes,
        };
        let a = region_attributes(&row, &PanelLayout::default());
        assert_eq!(a["city"], Some("Melbourne".to_string()));
        assert_eq!(a["state"], None);
        assert_eq!(a["metro"], None);
        assert_eq!(a.len(), 4);
    }
}
