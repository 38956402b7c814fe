//! Service configuration
//!
//! Passed explicitly to the service at construction; nothing here reads
//! process environment.

use serde::{Deserialize, Serialize};
use std::path::Path;

use sift_core::ComparisonConfig;

use crate::StoreError;

/// Top-level configuration, loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    pub query: QueryConfig,
    pub exclusion: ExclusionConfig,
    pub comparison: ComparisonConfig,
}

/// Paging limits for indicator queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Page size when a query gives none
    pub default_limit: usize,
    /// Upper bound on any requested page size
    pub max_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 1000,
        }
    }
}

/// Exclusion rule management settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionConfig {
    /// Stored indicators scanned when previewing a pattern
    pub test_pattern_limit: usize,
    /// Refuse to store rules whose pattern does not compile
    pub reject_invalid_patterns: bool,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            test_pattern_limit: 1000,
            reject_invalid_patterns: false,
        }
    }
}

impl SiftConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, StoreError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Effective page size for a requested limit
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.query.default_limit)
            .clamp(1, self.query.max_limit.max(1))
    }
}
