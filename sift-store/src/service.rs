//! Serving facade over the indicator store and rule registry
//!
//! Everything a feed or API client reaches goes through here, so exclusion
//! rules are applied in exactly one place.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sift_core::{
    analyze, AnalysisSummary, DedupReport, Indicator, IndicatorId, IndicatorType, NewIndicator,
    PatternKind, PatternTestResult, ThreatLevel, UpsertOutcome,
};

use crate::{IndicatorStore, IndicatorSummary, RuleRegistry, SiftConfig};

/// Indicator listing request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorQuery {
    pub indicator_type: Option<IndicatorType>,
    pub threat_level: Option<ThreatLevel>,
    pub source_id: Option<u64>,
    /// Every listed tag must be present
    pub tags: Vec<String>,
    /// Case-insensitive substring of the raw or canonical value
    pub search: Option<String>,
    /// Return excluded indicators too
    pub include_excluded: bool,
    /// Return deactivated duplicates too
    pub include_inactive: bool,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl IndicatorQuery {
    fn matches(&self, indicator: &Indicator) -> bool {
        if !self.include_inactive && !indicator.active {
            return false;
        }
        if self.indicator_type.as_ref().is_some_and(|t| *t != indicator.indicator_type) {
            return false;
        }
        if self.threat_level.is_some_and(|l| l != indicator.threat_level) {
            return false;
        }
        if self.source_id.is_some_and(|s| Some(s) != indicator.source_id) {
            return false;
        }
        if !self.tags.iter().all(|t| indicator.tags.contains(t)) {
            return false;
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !indicator.raw_value.to_lowercase().contains(&needle)
                && !indicator.canonical_value.contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

/// Outcome of ingesting a batch of reports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub received: usize,
    pub inserted: usize,
    pub merged: usize,
    pub ids: Vec<IndicatorId>,
}

/// A stored indicator a previewed pattern would suppress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternHit {
    pub id: IndicatorId,
    pub value: String,
    pub indicator_type: IndicatorType,
    pub threat_level: ThreatLevel,
    pub source_id: Option<u64>,
}

/// Pattern dry run against stored indicators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternPreview {
    pub result: PatternTestResult,
    pub hits: Vec<PatternHit>,
    /// Number of stored indicators examined
    pub scanned: usize,
}

#[derive(Debug)]
pub struct ThreatIntelService {
    config: SiftConfig,
    store: IndicatorStore,
    rules: RuleRegistry,
}

impl ThreatIntelService {
    pub fn new(config: SiftConfig) -> Self {
        let rules = RuleRegistry::new(config.exclusion.reject_invalid_patterns);
        Self {
            config,
            store: IndicatorStore::new(),
            rules,
        }
    }

    pub fn config(&self) -> &SiftConfig {
        &self.config
    }

    pub fn store(&self) -> &IndicatorStore {
        &self.store
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn ingest(&self, report: NewIndicator) -> UpsertOutcome {
        self.store.upsert(report)
    }

    pub fn ingest_batch(&self, reports: Vec<NewIndicator>) -> IngestReport {
        let mut summary = IngestReport {
            received: reports.len(),
            ..Default::default()
        };
        for report in reports {
            let outcome = self.store.upsert(report);
            match outcome {
                UpsertOutcome::Inserted(_) => summary.inserted += 1,
                UpsertOutcome::Merged(_) => summary.merged += 1,
            }
            summary.ids.push(outcome.id());
        }
        info!(
            "Ingested {} reports: {} new, {} merged",
            summary.received, summary.inserted, summary.merged
        );
        summary
    }

    /// Whether a value would be suppressed from served results
    pub fn is_excluded(&self, indicator_type: &IndicatorType, value: &str) -> bool {
        self.rules.rule_set().is_excluded(indicator_type, value)
    }

    /// List indicators, ordered by id.
    ///
    /// Exclusions are applied before paging, so a page is never short
    /// because some of its rows were suppressed.
    pub fn query(&self, query: &IndicatorQuery) -> Vec<Indicator> {
        let limit = self.config.page_size(query.limit);
        let rules = self.rules.rule_set();

        let page: Vec<Indicator> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|i| query.matches(i))
            .filter(|i| query.include_excluded || !rules.is_excluded(&i.indicator_type, &i.raw_value))
            .skip(query.skip)
            .take(limit)
            .collect();

        debug!("Query returned {} indicators (limit {})", page.len(), limit);
        page
    }

    /// Preview which stored indicators a pattern would suppress
    pub fn test_rule_pattern(
        &self,
        pattern: &str,
        kind: PatternKind,
        indicator_type: Option<&IndicatorType>,
    ) -> PatternPreview {
        let candidates: Vec<Indicator> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|i| indicator_type.map_or(true, |t| *t == i.indicator_type))
            .take(self.config.exclusion.test_pattern_limit)
            .collect();

        let result = sift_core::test_pattern(
            pattern,
            kind,
            candidates.iter().map(|i| i.raw_value.as_str()),
        );
        let hits = candidates
            .iter()
            .filter(|i| result.matches.contains(&i.raw_value))
            .map(|i| PatternHit {
                id: i.id,
                value: i.raw_value.clone(),
                indicator_type: i.indicator_type.clone(),
                threat_level: i.threat_level,
                source_id: i.source_id,
            })
            .collect();

        PatternPreview {
            result,
            hits,
            scanned: candidates.len(),
        }
    }

    pub fn deduplicate(&self) -> DedupReport {
        self.store.deduplicate()
    }

    /// Match an observed value against active, non-excluded indicators
    pub fn compare(&self, value: &str) -> AnalysisSummary {
        let rules = self.rules.rule_set();
        let indicators: Vec<Indicator> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|i| i.active && !rules.is_excluded(&i.indicator_type, &i.raw_value))
            .collect();
        analyze(value, &indicators, &self.config.comparison)
    }

    pub fn summary(&self) -> IndicatorSummary {
        self.store.summary()
    }
}
