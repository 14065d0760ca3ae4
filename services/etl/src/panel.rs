//! Panel Parser - wide-format regional tables into validated rows
//!
//! A panel has one row per region and one column per period. Columns are
//! classified from the header alone:
//! - the identity column (region key),
//! - period columns, named exactly `YYYY-MM-DD`,
//! - everything else, kept as an attribute bag.
//!
//! Cell values are not interpreted here.

use encoding_rs::Encoding;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;

use collector::{PanelLayout, SourceSpec};

use crate::error::{MalformedTableError, ParseValueError};

static PERIOD_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("period column regex"));

/// True when a header name denotes a period column
pub fn is_period_column(name: &str) -> bool {
    PERIOD_COLUMN.is_match(name)
}

/// Declared delimiter, encoding and identity column for one panel
#[derive(Debug, Clone)]
pub struct PanelFormat {
    pub delimiter: u8,
    pub encoding: &'static Encoding,
    pub identity_column: String,
}

impl PanelFormat {
    pub fn new(
        delimiter: u8,
        encoding_label: &str,
        identity_column: &str,
    ) -> Result<Self, MalformedTableError> {
        let encoding = Encoding::for_label(encoding_label.as_bytes())
            .ok_or_else(|| MalformedTableError::UnknownEncoding(encoding_label.to_string()))?;
        Ok(Self {
            delimiter,
            encoding,
            identity_column: identity_column.to_string(),
        })
    }

    pub fn for_source(source: &SourceSpec, layout: &PanelLayout) -> Result<Self, MalformedTableError> {
        Self::new(source.delimiter_byte(), &source.encoding, &layout.identity_column)
    }

    /// Comma-separated UTF-8 with the given identity column
    pub fn csv(identity_column: &str) -> Self {
        Self {
            delimiter: b',',
            encoding: encoding_rs::UTF_8,
            identity_column: identity_column.to_string(),
        }
    }
}

/// Column classification shared by every row of one panel
#[derive(Debug, Clone)]
pub struct PanelHeader {
    pub columns: Vec<String>,
    pub identity_index: usize,
    /// (column index, period name), sorted ascending by name
    pub period_columns: Vec<(usize, String)>,
    /// (column index, name) for non-period, non-identity columns
    pub attribute_columns: Vec<(usize, String)>,
}

impl PanelHeader {
    fn from_names(names: Vec<String>, identity_column: &str) -> Result<Self, MalformedTableError> {
        if names.iter().all(|n| n.is_empty()) {
            return Err(MalformedTableError::MissingHeader);
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (idx, name) in names.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            if let Some(first) = seen.insert(name.as_str(), idx) {
                return Err(MalformedTableError::DuplicateColumn {
                    column: name.clone(),
                    first,
                    second: idx,
                });
            }
        }

        let identity_index = *seen
            .get(identity_column)
            .ok_or_else(|| MalformedTableError::MissingIdentityColumn(identity_column.to_string()))?;

        let mut period_columns = Vec::new();
        let mut attribute_columns = Vec::new();
        for (idx, name) in names.iter().enumerate() {
            if idx == identity_index || name.is_empty() {
                continue;
            }
            if is_period_column(name) {
                period_columns.push((idx, name.clone()));
            } else {
                attribute_columns.push((idx, name.clone()));
            }
        }
        // Fixed-width YYYY-MM-DD: lexicographic order is chronological
        period_columns.sort_by(|a, b| a.1.cmp(&b.1));

        Ok(Self {
            columns: names,
            identity_index,
            period_columns,
            attribute_columns,
        })
    }

    pub fn period_names(&self) -> impl Iterator<Item = &str> {
        self.period_columns.iter().map(|(_, name)| name.as_str())
    }
}

/// One period cell as found in the source, uninterpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodCell {
    pub period: String,
    pub raw: String,
}

/// One source row: identity, period cells and the remaining attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPanelRow {
    /// 1-based line in the source file
    pub line: usize,
    /// Trimmed identity value; may be empty, the reshaper rejects those
    pub region_key: String,
    /// Period cells present on this row, ascending by period
    pub periods: Vec<PeriodCell>,
    /// Non-period columns other than the identity, by column name
    pub attributes: BTreeMap<String, String>,
}

impl RawPanelRow {
    /// Raw value of a named column, identity and period columns included
    pub fn get(&self, column: &str, header: &PanelHeader) -> Option<&str> {
        if header.columns.get(header.identity_index).map(String::as_str) == Some(column) {
            return Some(&self.region_key);
        }
        if is_period_column(column) {
            return self
                .periods
                .iter()
                .find(|c| c.period == column)
                .map(|c| c.raw.as_str());
        }
        self.attributes.get(column).map(String::as_str)
    }

    /// Non-empty attribute value
    pub fn attribute(&self, column: &str) -> Option<&str> {
        self.attributes
            .get(column)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Lazy row sequence over one decoded panel
pub struct PanelReader {
    header: Arc<PanelHeader>,
    records: csv::StringRecordsIntoIter<Cursor<Vec<u8>>>,
    rows_read: usize,
}

impl std::fmt::Debug for PanelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelReader")
            .field("header", &self.header)
            .field("rows_read", &self.rows_read)
            .finish()
    }
}

impl PanelReader {
    pub fn header(&self) -> &Arc<PanelHeader> {
        &self.header
    }

    fn build_row(&self, record: &csv::StringRecord, line: usize) -> RawPanelRow {
        let header = &self.header;
        let region_key = record
            .get(header.identity_index)
            .unwrap_or("")
            .to_string();

        // Columns beyond a short row's last field are not present on it
        let periods = header
            .period_columns
            .iter()
            .filter_map(|(idx, name)| {
                record.get(*idx).map(|raw| PeriodCell {
                    period: name.clone(),
                    raw: raw.to_string(),
                })
            })
            .collect();

        let attributes = header
            .attribute_columns
            .iter()
            .filter_map(|(idx, name)| record.get(*idx).map(|v| (name.clone(), v.to_string())))
            .collect();

        RawPanelRow {
            line,
            region_key,
            periods,
            attributes,
        }
    }
}

impl Iterator for PanelReader {
    type Item = Result<RawPanelRow, ParseValueError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let result = self.records.next()?;
            self.rows_read += 1;
            // +1 for the header line when the reader has no position
            let fallback_line = self.rows_read + 1;

            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    let line = e
                        .position()
                        .map(|p| p.line() as usize)
                        .unwrap_or(fallback_line);
                    return Some(Err(ParseValueError::Record {
                        line,
                        message: e.to_string(),
                    }));
                }
            };

            if record.iter().all(|field| field.is_empty()) {
                continue;
            }

            let line = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(fallback_line);
            return Some(Ok(self.build_row(&record, line)));
        }
    }
}

/// Decode `content` with the declared encoding and read its header
///
/// BOMs are honoured and stripped. Fails when the header is absent,
/// contains duplicate names, or lacks the identity column.
pub fn parse_panel(content: &[u8], format: &PanelFormat) -> Result<PanelReader, MalformedTableError> {
    let (decoded, _, _) = format.encoding.decode(content);
    let bytes = decoded.into_owned().into_bytes();

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(format.delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(Cursor::new(bytes));

    let names: Vec<String> = reader
        .headers()
        .map_err(|e| MalformedTableError::Header(e.to_string()))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let header = PanelHeader::from_names(names, &format.identity_column)?;

    Ok(PanelReader {
        header: Arc::new(header),
        records: reader.into_records(),
        rows_read: 0,
    })
}

// =============================================================================
// TESTS
// =============================================================================
