//! Source catalog - static per-source configuration
//!
//! Each source declares where its panel lives, which table it lands in,
//! the field it contributes and how its cells are read. This is
//! configuration, not ETL logic: the catalog is loaded once per run and
//! shared read-only by every phase.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read sources config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse sources config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate source id '{0}'")]
    DuplicateSource(String),

    #[error("source '{source_id}': {message}")]
    InvalidSource { source_id: String, message: String },

    #[error("invalid identifier '{0}' (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidIdentifier(String),
}

// =============================================================================
// Catalog Types
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    pub version: String,
    #[serde(default)]
    pub layout: PanelLayout,
    #[serde(default)]
    pub dimensions: DimensionTarget,
    pub sources: Vec<SourceSpec>,
}

/// Column layout shared by every panel in the catalog
#[derive(Debug, Clone, Deserialize)]
pub struct PanelLayout {
    #[serde(default = "default_identity_column")]
    pub identity_column: String,
    #[serde(default = "default_region_field")]
    pub region_field: String,
    #[serde(default = "default_period_field")]
    pub period_field: String,
    /// Target attribute field -> source column
    #[serde(default = "default_attributes")]
    pub attributes: BTreeMap<String, String>,
}

impl Default for PanelLayout {
    fn default() -> Self {
        Self {
            identity_column: default_identity_column(),
            region_field: default_region_field(),
            period_field: default_period_field(),
            attributes: default_attributes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimensionTarget {
    #[serde(default = "default_dimension_table")]
    pub table: String,
    #[serde(default)]
    pub conflict_keys: Vec<String>,
}

impl Default for DimensionTarget {
    fn default() -> Self {
        Self {
            table: default_dimension_table(),
            conflict_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Lands in its own table with trailing derived ratios
    Series,
    /// Merged with the other metric sources sharing its table
    Metric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericDomain {
    /// Counts and prices; fractional parts are truncated
    Integer,
    /// Percentages and ratios
    Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub id: String,
    pub name: String,
    pub url: String,
    pub table: String,
    pub kind: SourceKind,
    pub metric: String,
    #[serde(default = "default_numeric")]
    pub numeric: NumericDomain,
    #[serde(default)]
    pub conflict_keys: Vec<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub dimension_source: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_identity_column() -> String {
    "RegionName".to_string()
}

fn default_region_field() -> String {
    "zip".to_string()
}

fn default_period_field() -> String {
    "date".to_string()
}

fn default_attributes() -> BTreeMap<String, String> {
    [
        ("city", "City"),
        ("county", "CountyName"),
        ("metro", "Metro"),
        ("state", "State"),
    ]
    .into_iter()
    .map(|(field, column)| (field.to_string(), column.to_string()))
    .collect()
}

fn default_dimension_table() -> String {
    "zip_codes".to_string()
}

fn default_numeric() -> NumericDomain {
    NumericDomain::Integer
}

fn default_delimiter() -> char {
    ','
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

// =============================================================================
// Loading & Validation
// =============================================================================

impl SourcesConfig {
    /// Load and validate the catalog from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate the catalog, filling conflict-key defaults
    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let mut config: SourcesConfig = serde_json::from_str(content)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.dimensions.conflict_keys.is_empty() {
            self.dimensions.conflict_keys = vec![self.layout.region_field.clone()];
        }
        let default_keys = vec![
            self.layout.region_field.clone(),
            self.layout.period_field.clone(),
        ];
        for source in &mut self.sources {
            if source.conflict_keys.is_empty() {
                source.conflict_keys = default_keys.clone();
            }
        }
    }

    fn validate(&self) -> Result<(), CatalogError> {
        validate_identifier(&self.layout.region_field)?;
        validate_identifier(&self.layout.period_field)?;
        for field in self.layout.attributes.keys() {
            validate_identifier(field)?;
        }
        validate_identifier(&self.dimensions.table)?;
        for key in &self.dimensions.conflict_keys {
            validate_identifier(key)?;
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                return Err(CatalogError::DuplicateSource(source.id.clone()));
            }
            source.validate()?;
        }
        Ok(())
    }

    /// Enabled sources, optionally restricted to the given ids (catalog order)
    pub fn select<'a>(&'a self, only: &[String]) -> Vec<&'a SourceSpec> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| only.is_empty() || only.iter().any(|id| id == &s.id))
            .collect()
    }
}

impl SourceSpec {
    fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |message: &str| CatalogError::InvalidSource {
            source_id: self.id.clone(),
            message: message.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id is empty"));
        }
        if self.url.trim().is_empty() {
            return Err(invalid("url is empty"));
        }
        validate_identifier(&self.table)?;
        validate_identifier(&self.metric)?;
        for key in &self.conflict_keys {
            validate_identifier(key)?;
        }
        if !self.delimiter.is_ascii() {
            return Err(invalid("delimiter must be a single ASCII character"));
        }
        if encoding_rs::Encoding::for_label(self.encoding.as_bytes()).is_none() {
            return Err(invalid(&format!("unknown encoding '{}'", self.encoding)));
        }
        Ok(())
    }

    /// Delimiter as the byte the CSV reader expects
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter as u8
    }
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<(), CatalogError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CatalogError::InvalidIdentifier(name.to_string()))
    }
}

// =============================================================================
// TESTS
// =============================================================================
