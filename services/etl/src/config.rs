//! Run options: environment defaults, overridden by CLI flags in `main`

use std::path::PathBuf;
use std::time::Duration;

use crate::error::PipelineError;
use crate::load::{BatchLoader, DEFAULT_BATCH_SIZE};
use crate::reshape::DerivationMode;

pub const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_REPORTS_DIR: &str = "./data/reports";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub derivation: DerivationMode,
    pub phase_timeout: Duration,
    pub report_dir: PathBuf,
    /// Every phase runs, store writes go to an in-process store
    pub dry_run: bool,
    /// Keep only rows whose region key equals this value
    pub region: Option<String>,
    /// Restrict to these source ids; empty means every enabled source
    pub sources: Vec<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            derivation: DerivationMode::default(),
            phase_timeout: Duration::from_secs(DEFAULT_PHASE_TIMEOUT_SECS),
            report_dir: PathBuf::from(DEFAULT_REPORTS_DIR),
            dry_run: false,
            region: None,
            sources: Vec::new(),
        }
    }
}

impl PipelineOptions {
    /// Read BATCH_SIZE, DERIVATION_MODE, PHASE_TIMEOUT_SECS and REPORTS_DIR
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let mut options = Self::default();

        if let Some(raw) = lookup("BATCH_SIZE") {
            options.batch_size = parse_number("BATCH_SIZE", &raw)? as usize;
        }
        if let Some(raw) = lookup("DERIVATION_MODE") {
            options.derivation = raw.parse().map_err(PipelineError::Config)?;
        }
        if let Some(raw) = lookup("PHASE_TIMEOUT_SECS") {
            options.phase_timeout = Duration::from_secs(parse_number("PHASE_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("REPORTS_DIR").filter(|v| !v.trim().is_empty()) {
            options.report_dir = PathBuf::from(raw);
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch size must be at least 1".to_string()));
        }
        if self.phase_timeout.is_zero() {
            return Err(PipelineError::Config("phase timeout must be at least 1 second".to_string()));
        }
        Ok(())
    }

    pub fn loader(&self) -> Result<BatchLoader, PipelineError> {
        BatchLoader::new(self.batch_size)
            .ok_or_else(|| PipelineError::Config("batch size must be at least 1".to_string()))
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64, PipelineError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| PipelineError::Config(format!("{key} must be a positive integer, got '{raw}'")))
}

// =============================================================================
// TESTS
// =============================================================================
