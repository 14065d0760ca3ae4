//! Reshaper/Derivation Engine - wide rows into long observations
//!
//! Each row becomes one observation per usable period cell. Series
//! metrics also carry trailing ratios:
//! - `yoy_pct` against the cell 12 positions earlier,
//! - `mom_pct` against the cell 1 position earlier.
//!
//! In `Ordinal` mode "earlier" means ordinal distance within the row's own
//! sorted period cells, not calendar distance: a row with gaps compares
//! against the n-th prior available column. `Calendar` mode instead looks
//! up the column for the same month 12 months / 1 month earlier, whatever
//! day of the month the panel names its columns by.

use chrono::{Datelike, Months, NaiveDate};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use collector::NumericDomain;

use crate::error::ParseValueError;
use crate::panel::{PeriodCell, RawPanelRow};

pub const YOY_OFFSET: usize = 12;
pub const MOM_OFFSET: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationMode {
    #[default]
    Ordinal,
    Calendar,
}

impl FromStr for DerivationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ordinal" => Ok(Self::Ordinal),
            "calendar" => Ok(Self::Calendar),
            other => Err(format!(
                "unknown derivation mode '{}' (expected ordinal or calendar)",
                other
            )),
        }
    }
}

impl fmt::Display for DerivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ordinal => write!(f, "ordinal"),
            Self::Calendar => write!(f, "calendar"),
        }
    }
}

/// Numeric cell value in its declared domain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
        }
    }
}

/// One (region, period, metric) point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub region_key: String,
    pub period: NaiveDate,
    pub metric: String,
    pub value: Value,
    pub yoy_pct: Option<f64>,
    pub mom_pct: Option<f64>,
}

/// How one source's cells are read and whether ratios are derived
#[derive(Debug, Clone)]
pub struct ReshapeSpec {
    pub metric: String,
    pub domain: NumericDomain,
    pub derive: bool,
    pub mode: DerivationMode,
}

impl ReshapeSpec {
    pub fn series(metric: &str, domain: NumericDomain, mode: DerivationMode) -> Self {
        Self {
            metric: metric.to_string(),
            domain,
            derive: true,
            mode,
        }
    }

    pub fn metric(metric: &str, domain: NumericDomain) -> Self {
        Self {
            metric: metric.to_string(),
            domain,
            derive: false,
            mode: DerivationMode::Ordinal,
        }
    }
}

/// Parse a cell in its numeric domain
///
/// Empty, non-numeric, non-finite and zero cells yield `None`. Integer
/// cells with a fractional part are truncated toward zero.
pub fn parse_value(raw: &str, domain: NumericDomain) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let value = match domain {
        NumericDomain::Integer => match raw.parse::<i64>() {
            Ok(v) => Value::Int(v),
            Err(_) => {
                let f = raw.parse::<f64>().ok().filter(|f| f.is_finite())?.trunc();
                if f < i64::MIN as f64 || f > i64::MAX as f64 {
                    return None;
                }
                Value::Int(f as i64)
            }
        },
        NumericDomain::Decimal => Value::Float(raw.parse::<f64>().ok().filter(|f| f.is_finite())?),
    };
    if value.as_f64() == 0.0 {
        None
    } else {
        Some(value)
    }
}

/// `((current - previous) / previous) * 100`, rounded to 2 decimals
pub fn percent_change(current: f64, previous: Option<f64>) -> Option<f64> {
    let previous = previous.filter(|p| *p != 0.0 && p.is_finite())?;
    let pct = ((current - previous) / previous) * 100.0;
    pct.is_finite().then(|| round2(pct))
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Reshape one row into observations
///
/// Rows with an empty identity are rejected; unusable cells are skipped
/// silently.
pub fn reshape_row(row: &RawPanelRow, spec: &ReshapeSpec) -> Result<Vec<Observation>, ParseValueError> {
    if row.region_key.is_empty() {
        return Err(ParseValueError::MissingIdentity { line: row.line });
    }

    let cells: Vec<ParsedCell> = row.periods.iter().map(|c| ParsedCell::new(c, spec.domain)).collect();
    let by_month: HashMap<(i32, u32), Option<f64>> = match spec.mode {
        DerivationMode::Calendar if spec.derive => cells
            .iter()
            .filter_map(|c| c.date.map(|d| ((d.year(), d.month()), c.value.map(Value::as_f64))))
            .collect(),
        _ => HashMap::new(),
    };

    let mut observations = Vec::new();
    for (i, cell) in cells.iter().enumerate() {
        let (Some(period), Some(value)) = (cell.date, cell.value) else {
            continue;
        };

        let (yoy_pct, mom_pct) = if spec.derive {
            let current = value.as_f64();
            match spec.mode {
                DerivationMode::Ordinal => (
                    percent_change(current, ordinal_previous(&cells, i, YOY_OFFSET)),
                    percent_change(current, ordinal_previous(&cells, i, MOM_OFFSET)),
                ),
                DerivationMode::Calendar => (
                    percent_change(current, calendar_previous(&by_month, period, 12)),
                    percent_change(current, calendar_previous(&by_month, period, 1)),
                ),
            }
        } else {
            (None, None)
        };

        observations.push(Observation {
            region_key: row.region_key.clone(),
            period,
            metric: spec.metric.clone(),
            value,
            yoy_pct,
            mom_pct,
        });
    }

    Ok(observations)
}

struct ParsedCell {
    date: Option<NaiveDate>,
    value: Option<Value>,
}

impl ParsedCell {
    fn new(cell: &PeriodCell, domain: NumericDomain) -> Self {
        Self {
            // Column names only match the pattern; 2024-13-01 is not a date
            date: NaiveDate::parse_from_str(&cell.period, "%Y-%m-%d").ok(),
            value: parse_value(&cell.raw, domain),
        }
    }
}

/// Only a cell that produced an observation can serve as a base
fn ordinal_previous(cells: &[ParsedCell], index: usize, offset: usize) -> Option<f64> {
    let prior = cells.get(index.checked_sub(offset)?)?;
    prior.date?;
    prior.value.map(Value::as_f64)
}

/// Panels name columns by month end, so the lookup is by (year, month)
fn calendar_previous(
    by_month: &HashMap<(i32, u32), Option<f64>>,
    period: NaiveDate,
    months: u32,
) -> Option<f64> {
    let prior = period.checked_sub_months(Months::new(months))?;
    by_month.get(&(prior.year(), prior.month())).copied().flatten()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn row(region_key: &str, cells: &[(&str, &str)]) -> RawPanelRow {
        let mut periods: Vec<PeriodCell> = cells
            .iter()
            .map(|(p, v)| PeriodCell {
                period: p.to_string(),
                raw: v.to_string(),
            })
            .collect();
        periods.sort_by(|a, b| a.period.cmp(&b.period));
        RawPanelRow {
            line: 2,
            region_key: region_key.to_string(),
            periods,
            attributes: BTreeMap::new(),
        }
    }

    fn monthly(start_year: i32, values: &[&str]) -> Vec<(String, String)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let year = start_year + (i / 12) as i32;
                let month = (i % 12) as u32 + 1;
                (format!("{:04}-{:02}-01", year, month), v.to_string())
            })
            .collect()
    }

    fn series() -> ReshapeSpec {
        ReshapeSpec::series("value", NumericDomain::Integer, DerivationMode::Ordinal)
    }

    fn as_refs(cells: &[(String, String)]) -> Vec<(&str, &str)> {
        cells.iter().map(|(p, v)| (p.as_str(), v.as_str())).collect()
    }

    // -------------------------------------------------------------------------
    // VALUE PARSING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_value_integer() {
        assert_eq!(parse_value("300000", NumericDomain::Integer), Some(Value::Int(300000)));
        assert_eq!(parse_value(" 42 ", NumericDomain::Integer), Some(Value::Int(42)));
        assert_eq!(parse_value("303000.75", NumericDomain::Integer), Some(Value::Int(303000)));
        assert_eq!(parse_value("-7", NumericDomain::Integer), Some(Value::Int(-7)));
    }

    #[test]
    fn test_parse_value_decimal() {
        assert_eq!(parse_value("0.985", NumericDomain::Decimal), Some(Value::Float(0.985)));
        assert_eq!(parse_value("12.5", NumericDomain::Decimal), Some(Value::Float(12.5)));
    }

    #[test]
    fn test_parse_value_rejects_unusable() {
        for domain in [NumericDomain::Integer, NumericDomain::Decimal] {
            assert_eq!(parse_value("", domain), None);
            assert_eq!(parse_value("   ", domain), None);
            assert_eq!(parse_value("n/a", domain), None);
            assert_eq!(parse_value("0", domain), None);
            assert_eq!(parse_value("0.0", domain), None);
            assert_eq!(parse_value("NaN", domain), None);
            assert_eq!(parse_value("inf", domain), None);
        }
        // Truncates to zero
        assert_eq!(parse_value("0.4", NumericDomain::Integer), None);
    }

    #[test]
    fn test_value_serializes_in_domain() {
        assert_eq!(serde_json::to_string(&Value::Int(5)).unwrap(), "5");
        assert_eq!(serde_json::to_string(&Value::Float(0.5)).unwrap(), "0.5");
    }

    // -------------------------------------------------------------------------
    // PERCENT CHANGE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_percent_change_rounding() {
        assert_eq!(percent_change(315000.0, Some(303000.0)), Some(3.96));
        assert_eq!(percent_change(303000.0, Some(300000.0)), Some(1.0));
        assert_eq!(percent_change(90.0, Some(100.0)), Some(-10.0));
    }

    #[test]
    fn test_percent_change_guards() {
        assert_eq!(percent_change(1.0, None), None);
        assert_eq!(percent_change(1.0, Some(0.0)), None);
        assert_eq!(percent_change(1.0, Some(f64::NAN)), None);
    }

    // -------------------------------------------------------------------------
    // ORDINAL DERIVATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_end_to_end_sparse_row() {
        let r = row(
            "32937",
            &[("2023-01-01", "300000"), ("2023-02-01", "303000"), ("2024-01-01", "315000")],
        );
        let obs = reshape_row(&r, &series()).unwrap();

        assert_eq!(obs.len(), 3);
        assert_eq!(obs[0].mom_pct, None);
        assert_eq!(obs[1].mom_pct, Some(1.0));

        let last = &obs[2];
        assert_eq!(last.period, date("2024-01-01"));
        assert_eq!(last.value, Value::Int(315000));
        assert_eq!(last.mom_pct, Some(3.96));
        assert_eq!(last.yoy_pct, None);
    }

    #[test]
    fn test_thirteenth_period_has_yoy() {
        let values = [
            "100000", "101000", "102000", "103000", "104000", "105000", "106000", "107000",
            "108000", "109000", "110000", "111000", "112500",
        ];
        let cells = monthly(2022, &values);
        let obs = reshape_row(&row("32937", &as_refs(&cells)), &series()).unwrap();

        assert_eq!(obs.len(), 13);
        let v1 = 100000.0_f64;
        let v13 = 112500.0_f64;
        let expected = (((v13 - v1) / v1) * 100.0 * 100.0).round() / 100.0;
        assert_eq!(obs[12].yoy_pct, Some(expected));
        assert_eq!(obs[12].yoy_pct, Some(12.5));
        assert!(obs[..12].iter().all(|o| o.yoy_pct.is_none()));
    }

    #[test]
    fn test_yoy_null_when_base_zero() {
        let mut values = vec!["0"];
        values.extend(std::iter::repeat("100").take(12));
        let cells = monthly(2022, &values);
        let obs = reshape_row(&row("1", &as_refs(&cells)), &series()).unwrap();

        // The zero cell is dropped; the 13th period has no usable base
        assert_eq!(obs.len(), 12);
        assert_eq!(obs.last().unwrap().period, date("2023-01-01"));
        assert_eq!(obs.last().unwrap().yoy_pct, None);
    }

    #[test]
    fn test_mom_null_when_previous_missing_or_zero() {
        let r = row(
            "1",
            &[
                ("2024-01-01", "100"),
                ("2024-02-01", ""),
                ("2024-03-01", "110"),
                ("2024-04-01", "0"),
                ("2024-05-01", "120"),
                ("2024-06-01", "abc"),
                ("2024-07-01", "130"),
                ("2024-08-01", "143"),
            ],
        );
        let obs = reshape_row(&r, &series()).unwrap();
        let mom: Vec<(NaiveDate, Option<f64>)> = obs.iter().map(|o| (o.period, o.mom_pct)).collect();
        assert_eq!(
            mom,
            vec![
                (date("2024-01-01"), None),
                (date("2024-03-01"), None),
                (date("2024-05-01"), None),
                (date("2024-07-01"), None),
                (date("2024-08-01"), Some(10.0)),
            ]
        );
    }

    #[test]
    fn test_ordinal_distance_ignores_calendar_gaps() {
        // 13 columns spanning more than a year: yoy compares against column 0
        let mut cells = monthly(2020, &["100"; 12]);
        cells.push(("2022-06-01".to_string(), "150".to_string()));
        let obs = reshape_row(&row("1", &as_refs(&cells)), &series()).unwrap();
        assert_eq!(obs[12].yoy_pct, Some(50.0));
    }

    #[test]
    fn test_single_period_row() {
        let obs = reshape_row(&row("1", &[("2024-01-01", "5")]), &series()).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].yoy_pct, None);
        assert_eq!(obs[0].mom_pct, None);
    }

    #[test]
    fn test_no_period_row() {
        let obs = reshape_row(&row("1", &[]), &series()).unwrap();
        assert!(obs.is_empty());
    }

    #[test]
    fn test_invalid_period_date_skipped_but_keeps_position() {
        let r = row(
            "1",
            &[("2024-01-01", "100"), ("2024-13-01", "105"), ("2024-14-01", "110")],
        );
        let obs = reshape_row(&r, &series()).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].period, date("2024-01-01"));
    }

    #[test]
    fn test_invalid_period_date_is_not_a_base() {
        // 2024-00-01 sorts between the two real months but is not a date
        let r = row(
            "1",
            &[("2023-12-01", "100"), ("2024-00-01", "105"), ("2024-01-01", "110")],
        );
        let obs = reshape_row(&r, &series()).unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[1].period, date("2024-01-01"));
        assert_eq!(obs[1].mom_pct, None);
    }

    // -------------------------------------------------------------------------
    // CALENDAR DERIVATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_calendar_mode_uses_exact_offsets() {
        let spec = ReshapeSpec::series("value", NumericDomain::Integer, DerivationMode::Calendar);
        let r = row(
            "32937",
            &[("2023-01-01", "300000"), ("2023-02-01", "303000"), ("2024-01-01", "315000")],
        );
        let obs = reshape_row(&r, &spec).unwrap();

        assert_eq!(obs[1].mom_pct, Some(1.0));
        // 2023-02 is eleven months before 2024-01, not one
        assert_eq!(obs[2].mom_pct, None);
        assert_eq!(obs[2].yoy_pct, Some(5.0));
    }

    #[test]
    fn test_calendar_mode_gap_row() {
        let spec = ReshapeSpec::series("value", NumericDomain::Integer, DerivationMode::Calendar);
        let mut cells = monthly(2020, &["100"; 12]);
        cells.push(("2022-06-01".to_string(), "150".to_string()));
        let obs = reshape_row(&row("1", &as_refs(&cells)), &spec).unwrap();
        assert_eq!(obs[12].yoy_pct, None);
    }

    #[test]
    fn test_calendar_mode_month_end_columns() {
        let spec = ReshapeSpec::series("value", NumericDomain::Integer, DerivationMode::Calendar);
        let r = row(
            "32937",
            &[
                ("2023-02-28", "100"),
                ("2024-01-31", "200"),
                ("2024-02-29", "110"),
                ("2024-03-31", "100"),
                ("2024-04-30", "110"),
            ],
        );
        let obs = reshape_row(&r, &spec).unwrap();

        assert_eq!(obs[2].period, date("2024-02-29"));
        assert_eq!(obs[2].mom_pct, Some(-45.0));
        // Leap February against the previous year's 28th
        assert_eq!(obs[2].yoy_pct, Some(10.0));
        // 2024-02-29 precedes 2024-03-31 by one month
        assert_eq!(obs[3].mom_pct, Some(-9.09));
        assert_eq!(obs[4].mom_pct, Some(10.0));
        assert_eq!(obs[4].yoy_pct, None);
    }

    #[test]
    fn test_derivation_mode_from_str() {
        assert_eq!("ordinal".parse::<DerivationMode>().unwrap(), DerivationMode::Ordinal);
        assert_eq!(" Calendar ".parse::<DerivationMode>().unwrap(), DerivationMode::Calendar);
        assert!("weekly".parse::<DerivationMode>().is_err());
    }

    // -------------------------------------------------------------------------
    // METRIC SOURCE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_metric_spec_has_no_ratios() {
        let spec = ReshapeSpec::metric("sale_to_list_ratio", NumericDomain::Decimal);
        let r = row("1", &[("2024-01-01", "0.98"), ("2024-02-01", "1.01")]);
        let obs = reshape_row(&r, &spec).unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[1].value, Value::Float(1.01));
        assert!(obs.iter().all(|o| o.yoy_pct.is_none() && o.mom_pct.is_none()));
        assert!(obs.iter().all(|o| o.metric == "sale_to_list_ratio"));
    }

    #[test]
    fn test_integer_domain_truncates_ratio_source() {
        let spec = ReshapeSpec::metric("inventory", NumericDomain::Integer);
        let obs = reshape_row(&row("1", &[("2024-01-01", "57.9")]), &spec).unwrap();
        assert_eq!(obs[0].value, Value::Int(57));
    }

    // -------------------------------------------------------------------------
    // IDENTITY TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_missing_identity_rejected() {
        let err = reshape_row(&row("", &[("2024-01-01", "5")]), &series()).unwrap_err();
        assert!(matches!(err, ParseValueError::MissingIdentity { line: 2 }));
    }
}
