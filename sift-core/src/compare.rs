//! Comparison of observed values against known indicators
//!
//! Given a value seen elsewhere (an endpoint alert, a log line), find the
//! stored indicators it corresponds to and recommend a response. Strategies,
//! in priority order:
//! - exact raw value
//! - canonical form under the indicator's own type
//! - character-set similarity (opt-in, disabled by default)
//! - domain extracted from a URL or email address

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::{normalize, Indicator, IndicatorId, IndicatorType, ThreatLevel};

const EXACT_CONFIDENCE: f64 = 1.0;
const CANONICAL_CONFIDENCE: f64 = 0.95;
const EXACT_DOMAIN_CONFIDENCE: f64 = 1.0;
const DOMAIN_BASED_CONFIDENCE: f64 = 0.8;

/// Thresholds for comparison and response recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Highest match confidence at or above which to block
    pub block_threshold: f64,
    /// Highest match confidence at or above which to investigate
    pub investigate_threshold: f64,
    /// Minimum similarity for fuzzy matches; `None` disables them
    pub fuzzy_threshold: Option<f64>,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            block_threshold: 0.9,
            investigate_threshold: 0.7,
            fuzzy_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Canonical,
    Fuzzy,
    ExactDomain,
    DomainBased,
}

/// A stored indicator the observed value corresponds to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelMatch {
    pub indicator_id: IndicatorId,
    pub indicator_type: IndicatorType,
    pub value: String,
    pub match_type: MatchType,
    pub match_confidence: f64,
    pub indicator_confidence: f64,
    pub threat_level: ThreatLevel,
    pub tags: Vec<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_domain: Option<String>,
}

impl IntelMatch {
    fn new(indicator: &Indicator, match_type: MatchType, match_confidence: f64) -> Self {
        Self {
            indicator_id: indicator.id,
            indicator_type: indicator.indicator_type.clone(),
            value: indicator.raw_value.clone(),
            match_type,
            match_confidence,
            indicator_confidence: indicator.confidence,
            threat_level: indicator.threat_level,
            tags: indicator.tags.iter().cloned().collect(),
            source: source_label(indicator),
            similarity: None,
            extracted_domain: None,
        }
    }
}

fn source_label(indicator: &Indicator) -> String {
    if let Some(feed) = indicator.metadata.feed() {
        return feed.to_string();
    }
    match indicator.source_id {
        Some(id) => format!("source:{}", id),
        None => "unknown".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    BlockImmediately,
    InvestigateFurther,
    Monitor,
    /// Nothing known; hand off to deeper analysis
    AnalyzeFurther,
}

/// Verdict on an observed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub value: String,
    pub is_known_threat: bool,
    pub matches: Vec<IntelMatch>,
    pub highest_confidence: f64,
    pub threat_sources: Vec<String>,
    pub recommended_action: RecommendedAction,
}

/// Find active indicators matching an observed value, best first
pub fn find_matches(
    value: &str,
    indicators: &[Indicator],
    config: &ComparisonConfig,
) -> Vec<IntelMatch> {
    let active: Vec<&Indicator> = indicators.iter().filter(|i| i.active).collect();
    let mut matches = Vec::new();

    for indicator in &active {
        if indicator.raw_value == value {
            matches.push(IntelMatch::new(indicator, MatchType::Exact, EXACT_CONFIDENCE));
        } else if normalize(&indicator.indicator_type, value) == indicator.canonical_value {
            matches.push(IntelMatch::new(indicator, MatchType::Canonical, CANONICAL_CONFIDENCE));
        }
    }

    if let (Some(threshold), Some(loose)) = (config.fuzzy_threshold, loose_normalize(value)) {
        for indicator in &active {
            let candidate = indicator.raw_value.to_lowercase();
            if !candidate.contains(&loose) {
                continue;
            }
            let similarity = jaccard_similarity(&loose, &candidate);
            if similarity >= threshold {
                let mut m = IntelMatch::new(indicator, MatchType::Fuzzy, similarity);
                m.similarity = Some(similarity);
                matches.push(m);
            }
        }
    }

    if let Some(domain) = extract_domain(value) {
        for indicator in &active {
            let candidate = indicator.raw_value.to_lowercase();
            let (match_type, confidence) = if candidate == domain {
                (MatchType::ExactDomain, EXACT_DOMAIN_CONFIDENCE)
            } else if candidate.contains(&domain) {
                (MatchType::DomainBased, DOMAIN_BASED_CONFIDENCE)
            } else {
                continue;
            };
            let mut m = IntelMatch::new(indicator, match_type, confidence);
            m.extracted_domain = Some(domain.clone());
            matches.push(m);
        }
    }

    let mut seen = HashSet::new();
    matches.retain(|m| seen.insert(m.indicator_id));
    matches.sort_by(|a, b| b.match_confidence.total_cmp(&a.match_confidence));
    matches
}

/// Summarize matches for an observed value into a recommended action
pub fn analyze(value: &str, indicators: &[Indicator], config: &ComparisonConfig) -> AnalysisSummary {
    let matches = find_matches(value, indicators, config);

    if matches.is_empty() {
        return AnalysisSummary {
            value: value.to_string(),
            is_known_threat: false,
            matches,
            highest_confidence: 0.0,
            threat_sources: Vec::new(),
            recommended_action: RecommendedAction::AnalyzeFurther,
        };
    }

    let highest_confidence = matches
        .iter()
        .map(|m| m.match_confidence)
        .fold(0.0, f64::max);
    let threat_sources: BTreeSet<String> = matches.iter().map(|m| m.source.clone()).collect();

    let recommended_action = if highest_confidence >= config.block_threshold {
        RecommendedAction::BlockImmediately
    } else if highest_confidence >= config.investigate_threshold {
        RecommendedAction::InvestigateFurther
    } else {
        RecommendedAction::Monitor
    };

    AnalysisSummary {
        value: value.to_string(),
        is_known_threat: true,
        matches,
        highest_confidence,
        threat_sources: threat_sources.into_iter().collect(),
        recommended_action,
    }
}

/// Lowercase, drop scheme, `www.` and trailing slashes
fn loose_normalize(value: &str) -> Option<String> {
    let lowered = value.trim().to_lowercase();
    let mut rest = lowered.as_str();
    for scheme in ["http://", "https://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
            break;
        }
    }
    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Host of a URL, domain of an email, or the value itself if it looks like a domain
pub fn extract_domain(value: &str) -> Option<String> {
    let value = value.trim();

    if value.contains("://") || value.starts_with("www.") {
        let after_scheme = value.split_once("://").map_or(value, |(_, rest)| rest);
        let authority = after_scheme.split(['/', '?', '#']).next().unwrap_or_default();
        let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
        let host = host.split(':').next().unwrap_or_default();
        return (!host.is_empty()).then(|| host.to_lowercase());
    }

    if let Some((_, domain)) = value.split_once('@') {
        return (!domain.is_empty()).then(|| domain.to_lowercase());
    }

    if value.contains('.') {
        return Some(value.to_lowercase());
    }

    None
}

/// Jaccard similarity of the character sets of two strings
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: HashSet<char> = a.to_lowercase().chars().collect();
    let set_b: HashSet<char> = b.to_lowercase().chars().collect();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    set_a.intersection(&set_b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metadata_keys, Metadata};

    fn sample() -> Vec<Indicator> {
        let mut feed = Metadata::new();
        feed.insert(metadata_keys::FEED, "urlhaus");
        vec![
            Indicator::new(IndicatorType::Domain, "evil.example.com")
                .with_id(1)
                .with_confidence(0.8)
                .with_metadata(feed.clone()),
            Indicator::new(IndicatorType::Url, "http://evil.example.com/payload.bin")
                .with_id(2)
                .with_source(4),
            Indicator::new(IndicatorType::Ip, "10.0.0.1").with_id(3),
        ]
    }

    #[test]
    fn test_exact_match_ranks_first() {
        let matches = find_matches("evil.example.com", &sample(), &ComparisonConfig::default());
        assert_eq!(matches[0].indicator_id, 1);
        assert_eq!(matches[0].match_type, MatchType::Exact);
        // the URL contains the domain
        assert!(matches
            .iter()
            .any(|m| m.indicator_id == 2 && m.match_type == MatchType::DomainBased));
        // each indicator reported once
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_canonical_match() {
        let matches = find_matches("010.000.000.001", &sample(), &ComparisonConfig::default());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].indicator_id, 3);
        assert_eq!(matches[0].match_type, MatchType::Canonical);
        assert_eq!(matches[0].match_confidence, 0.95);
    }

    #[test]
    fn test_domain_from_url_and_email() {
        assert_eq!(
            extract_domain("https://user@Evil.Example.com:8080/x"),
            Some("evil.example.com".to_string())
        );
        assert_eq!(extract_domain("ops@Corp.Example"), Some("corp.example".to_string()));
        assert_eq!(extract_domain("www.test.example/a"), Some("www.test.example".to_string()));
        assert_eq!(extract_domain("localhost"), None);
    }

    #[test]
    fn test_fuzzy_disabled_by_default() {
        let config = ComparisonConfig::default();
        let matches = find_matches("https://www.evil.example.com/", &sample(), &config);
        assert!(matches.iter().all(|m| m.match_type != MatchType::Fuzzy));

        let config = ComparisonConfig {
            fuzzy_threshold: Some(0.8),
            ..Default::default()
        };
        let matches = find_matches("https://www.evil.example.com/", &sample(), &config);
        assert!(matches
            .iter()
            .any(|m| m.indicator_id == 1 && m.match_type == MatchType::Fuzzy));
    }

    #[test]
    fn test_analysis_recommendation() {
        let config = ComparisonConfig::default();
        let summary = analyze("evil.example.com", &sample(), &config);
        assert!(summary.is_known_threat);
        assert_eq!(summary.highest_confidence, 1.0);
        assert_eq!(summary.recommended_action, RecommendedAction::BlockImmediately);
        assert_eq!(summary.threat_sources, vec!["source:4", "urlhaus"]);

        let summary = analyze("unrelated", &sample(), &config);
        assert!(!summary.is_known_threat);
        assert_eq!(summary.recommended_action, RecommendedAction::AnalyzeFurther);
    }

    #[test]
    fn test_domain_based_only_investigates() {
        let indicators = vec![Indicator::new(IndicatorType::Url, "http://cdn.bad.example/x").with_id(1)];
        let summary = analyze("bad.example", &indicators, &ComparisonConfig::default());
        assert_eq!(summary.highest_confidence, 0.8);
        assert_eq!(summary.recommended_action, RecommendedAction::InvestigateFurther);
    }

    #[test]
    fn test_inactive_indicators_ignored() {
        let mut indicators = sample();
        indicators[0].active = false;
        let matches = find_matches("evil.example.com", &indicators, &ComparisonConfig::default());
        assert!(matches.iter().all(|m| m.indicator_id != 1));
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard_similarity("abc", "abc"), 1.0);
        assert_eq!(jaccard_similarity("ab", "cd"), 0.0);
        assert_eq!(jaccard_similarity("", "cd"), 0.0);
        assert!((jaccard_similarity("abc", "abcd") - 0.75).abs() < 1e-9);
    }
}
