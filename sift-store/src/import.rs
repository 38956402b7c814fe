//! File loaders for rules and indicators
//!
//! Rule files are JSON arrays or CSV with a header row. Missing fields take
//! the import defaults: scope `all`, kind `exact`, reason
//! "Imported from file", author "system".

use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use sift_core::{DuplicateLink, ExclusionRule, Indicator, NewIndicator, PatternKind, RuleScope};

use crate::{RuleDraft, StoreError};

pub const IMPORT_REASON: &str = "Imported from file";
pub const IMPORT_AUTHOR: &str = "system";

/// One row of a rule file; every column but the pattern is optional
#[derive(Debug, Deserialize)]
struct RuleRecord {
    #[serde(default)]
    indicator_type: Option<String>,
    #[serde(alias = "pattern")]
    value: String,
    #[serde(default, alias = "pattern_kind")]
    pattern_type: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    excluded_by: Option<String>,
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.trim().is_empty())
}

impl RuleRecord {
    fn into_draft(self) -> Result<RuleDraft, StoreError> {
        let scope = non_empty(self.indicator_type)
            .map(RuleScope::from)
            .unwrap_or(RuleScope::All);
        let kind = match non_empty(self.pattern_type) {
            Some(kind) => kind.parse::<PatternKind>()?,
            None => PatternKind::Exact,
        };
        if self.value.trim().is_empty() {
            return Err(StoreError::InvalidRule("empty pattern".to_string()));
        }

        let reason = non_empty(self.reason).unwrap_or_else(|| IMPORT_REASON.to_string());
        let author = non_empty(self.excluded_by).unwrap_or_else(|| IMPORT_AUTHOR.to_string());
        Ok(RuleDraft::new(scope, self.value.trim(), kind)
            .with_reason(&reason)
            .with_author(&author))
    }
}

/// Parse rule drafts from JSON, falling back to CSV when the content is
/// not JSON at all.
///
/// Well-formed JSON with bad fields is an error, never retried as CSV.
pub fn parse_rule_drafts(content: &str) -> Result<Vec<RuleDraft>, StoreError> {
    match serde_json::from_str::<Vec<RuleRecord>>(content) {
        Ok(records) => {
            debug!("Parsed {} rules as JSON", records.len());
            records.into_iter().map(RuleRecord::into_draft).collect()
        }
        Err(e) if e.is_syntax() || e.is_eof() => parse_rule_csv(content),
        Err(e) => Err(e.into()),
    }
}

fn parse_rule_csv(content: &str) -> Result<Vec<RuleDraft>, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut drafts = Vec::new();
    for row in reader.records() {
        let row = row?;
        // Columns are positional: indicator_type, value, pattern_type, reason, excluded_by
        if row.len() < 2 {
            continue;
        }
        let column = |i: usize| row.get(i).map(str::to_string);
        let record = RuleRecord {
            indicator_type: column(0),
            value: column(1).unwrap_or_default(),
            pattern_type: column(2),
            reason: column(3),
            excluded_by: column(4),
        };
        drafts.push(record.into_draft()?);
    }

    debug!("Parsed {} rules as CSV", drafts.len());
    Ok(drafts)
}

pub fn load_rule_file<P: AsRef<Path>>(path: P) -> Result<Vec<RuleDraft>, StoreError> {
    let path = path.as_ref();
    let drafts = parse_rule_drafts(&std::fs::read_to_string(path)?)?;
    info!("Loaded {} exclusion rules from {}", drafts.len(), path.display());
    Ok(drafts)
}

/// Feed reports as a JSON array of new indicators
pub fn parse_indicator_reports(content: &str) -> Result<Vec<NewIndicator>, StoreError> {
    Ok(serde_json::from_str(content)?)
}

/// Persisted store contents
#[derive(Debug, Clone, Default, serde::Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub indicators: Vec<Indicator>,
    #[serde(default)]
    pub links: Vec<DuplicateLink>,
    #[serde(default)]
    pub rules: Vec<ExclusionRule>,
}

impl Snapshot {
    /// Accepts a full snapshot object or a bare array of indicators
    pub fn from_json(content: &str) -> Result<Self, StoreError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Full(Snapshot),
            Indicators(Vec<Indicator>),
        }

        Ok(match serde_json::from_str::<Shape>(content)? {
            Shape::Full(snapshot) => snapshot,
            Shape::Indicators(indicators) => Snapshot {
                indicators,
                ..Default::default()
            },
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
