//! Threat indicators reported by intelligence feeds
//!
//! Supports the observable types feeds publish:
//! - Network: IPs, domains, URLs
//! - File: hashes
//! - Identity: email addresses
//! - Vulnerability: CVE identifiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::{normalize, MAX_CONFIDENCE, MIN_CONFIDENCE};

/// Storage identifier of an indicator
pub type IndicatorId = u64;

/// Errors from parsing core enums
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Empty indicator type")]
    EmptyIndicatorType,

    #[error("Unknown threat level: {0}")]
    UnknownThreatLevel(String),

    #[error("Unknown pattern kind: {0}")]
    UnknownPatternKind(String),
}

/// Categories of indicators
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IndicatorType {
    /// IPv4 or IPv6 address
    Ip,
    /// Domain name
    Domain,
    /// URL
    Url,
    /// File hash (MD5, SHA1, SHA256, ...)
    Hash,
    /// Email address
    Email,
    /// CVE identifier
    Cve,
    /// Type not known to this crate
    Other(String),
}

impl IndicatorType {
    /// All known types, in declaration order
    pub const KNOWN: [IndicatorType; 6] = [
        IndicatorType::Ip,
        IndicatorType::Domain,
        IndicatorType::Url,
        IndicatorType::Hash,
        IndicatorType::Email,
        IndicatorType::Cve,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            IndicatorType::Ip => "ip",
            IndicatorType::Domain => "domain",
            IndicatorType::Url => "url",
            IndicatorType::Hash => "hash",
            IndicatorType::Email => "email",
            IndicatorType::Cve => "cve",
            IndicatorType::Other(name) => name,
        }
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for IndicatorType {
    fn from(value: &str) -> Self {
        let lowered = value.trim().to_lowercase();
        match lowered.as_str() {
            "ip" => IndicatorType::Ip,
            "domain" => IndicatorType::Domain,
            "url" => IndicatorType::Url,
            "hash" => IndicatorType::Hash,
            "email" => IndicatorType::Email,
            "cve" => IndicatorType::Cve,
            _ => IndicatorType::Other(lowered),
        }
    }
}

impl From<String> for IndicatorType {
    fn from(value: String) -> Self {
        IndicatorType::from(value.as_str())
    }
}

impl From<IndicatorType> for String {
    fn from(value: IndicatorType) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for IndicatorType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(CoreError::EmptyIndicatorType);
        }
        Ok(IndicatorType::from(s))
    }
}

/// Severity assigned to an indicator
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreatLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(ThreatLevel::Low),
            "medium" => Ok(ThreatLevel::Medium),
            "high" => Ok(ThreatLevel::High),
            "critical" => Ok(ThreatLevel::Critical),
            other => Err(CoreError::UnknownThreatLevel(other.to_string())),
        }
    }
}

/// Feed-supplied metadata attached to an indicator.
///
/// Keys listed in [`metadata_keys`] have a documented meaning; anything else
/// is carried through untouched as vendor payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, serde_json::Value>);

/// Known metadata keys
pub mod metadata_keys {
    /// Name of the feed that reported the indicator
    pub const FEED: &str = "feed";
    /// Timestamp the feed itself claims for the first report
    pub const FIRST_REPORTED: &str = "first_reported";
    /// Reference URL for the report
    pub const REFERENCE: &str = "reference";
    /// Version of the metadata layout
    pub const SCHEMA_VERSION: &str = "schema_version";
}

/// Current version written under `schema_version`
pub const METADATA_SCHEMA_VERSION: u64 = 1;

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn insert(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Feed name, if the feed recorded one
    pub fn feed(&self) -> Option<&str> {
        self.get_str(metadata_keys::FEED)
    }

    /// Key-wise merge; values from `other` win
    pub fn merge(&mut self, other: &Metadata) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Identity of a real-world entity: type plus canonical value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndicatorKey {
    pub indicator_type: IndicatorType,
    pub canonical_value: String,
}

impl IndicatorKey {
    pub fn new(indicator_type: &IndicatorType, raw_value: &str) -> Self {
        Self {
            indicator_type: indicator_type.clone(),
            canonical_value: normalize(indicator_type, raw_value),
        }
    }

    /// Stable content hash of the key
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.indicator_type.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(self.canonical_value.as_bytes());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

impl fmt::Display for IndicatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.indicator_type, self.canonical_value)
    }
}

/// A stored threat indicator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub id: IndicatorId,
    pub indicator_type: IndicatorType,
    /// Value as reported by the feed
    pub raw_value: String,
    /// `normalize(indicator_type, raw_value)`
    pub canonical_value: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,
    #[serde(default)]
    pub threat_level: ThreatLevel,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_id: Option<u64>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Indicator {
    /// Create an active indicator first seen now
    pub fn new(indicator_type: IndicatorType, raw_value: &str) -> Self {
        let now = Utc::now();
        let canonical_value = normalize(&indicator_type, raw_value);
        Self {
            id: 0,
            indicator_type,
            raw_value: raw_value.to_string(),
            canonical_value,
            confidence: MIN_CONFIDENCE,
            threat_level: ThreatLevel::Low,
            tags: BTreeSet::new(),
            description: None,
            source_id: None,
            external_id: None,
            metadata: Metadata::new(),
            first_seen: now,
            last_seen: now,
            active: true,
        }
    }

    pub fn with_id(mut self, id: IndicatorId) -> Self {
        self.id = id;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    pub fn with_threat_level(mut self, level: ThreatLevel) -> Self {
        self.threat_level = level;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_source(mut self, source_id: u64) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn seen(mut self, first_seen: DateTime<Utc>, last_seen: DateTime<Utc>) -> Self {
        self.first_seen = first_seen;
        self.last_seen = last_seen.max(first_seen);
        self
    }

    pub fn key(&self) -> IndicatorKey {
        IndicatorKey {
            indicator_type: self.indicator_type.clone(),
            canonical_value: self.canonical_value.clone(),
        }
    }

    /// Recompute `canonical_value` from the raw value and clamp confidence.
    ///
    /// Rows loaded from outside the builder may carry a stale or missing
    /// canonical form.
    pub fn recanonicalize(&mut self) {
        self.canonical_value = normalize(&self.indicator_type, &self.raw_value);
        self.confidence = clamp_confidence(self.confidence);
    }
}

/// An indicator as supplied by the ingestion pipeline, before storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIndicator {
    pub indicator_type: IndicatorType,
    pub value: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub threat_level: ThreatLevel,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_id: Option<u64>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// When the feed observed the value; defaults to ingestion time
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl NewIndicator {
    pub fn new(indicator_type: IndicatorType, value: &str) -> Self {
        Self {
            indicator_type,
            value: value.to_string(),
            confidence: MIN_CONFIDENCE,
            threat_level: ThreatLevel::Low,
            tags: Vec::new(),
            description: None,
            source_id: None,
            external_id: None,
            metadata: Metadata::new(),
            observed_at: None,
        }
    }

    pub fn key(&self) -> IndicatorKey {
        IndicatorKey::new(&self.indicator_type, &self.value)
    }

    /// Materialize as a stored indicator with the given id
    pub fn into_indicator(self, id: IndicatorId, now: DateTime<Utc>) -> Indicator {
        let seen = self.observed_at.unwrap_or(now);
        let canonical_value = normalize(&self.indicator_type, &self.value);
        let mut metadata = self.metadata;
        if !metadata.is_empty() && metadata.get(metadata_keys::SCHEMA_VERSION).is_none() {
            metadata.insert(metadata_keys::SCHEMA_VERSION, METADATA_SCHEMA_VERSION);
        }
        Indicator {
            id,
            indicator_type: self.indicator_type,
            raw_value: self.value,
            canonical_value,
            confidence: clamp_confidence(self.confidence),
            threat_level: self.threat_level,
            tags: self.tags.into_iter().collect(),
            description: self.description,
            source_id: self.source_id,
            external_id: self.external_id,
            metadata,
            first_seen: seen,
            last_seen: seen,
            active: true,
        }
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        MIN_CONFIDENCE
    } else {
        confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indicator_type_parse() {
        assert_eq!("IP".parse::<IndicatorType>().unwrap(), IndicatorType::Ip);
        assert_eq!(
            " Domain ".parse::<IndicatorType>().unwrap(),
            IndicatorType::Domain
        );
        assert_eq!(
            "ja3".parse::<IndicatorType>().unwrap(),
            IndicatorType::Other("ja3".to_string())
        );
        assert!("  ".parse::<IndicatorType>().is_err());
    }

    #[test]
    fn test_indicator_type_serde_as_string() {
        let json = serde_json::to_string(&IndicatorType::Cve).unwrap();
        assert_eq!(json, "\"cve\"");
        let parsed: IndicatorType = serde_json::from_str("\"mutex\"").unwrap();
        assert_eq!(parsed, IndicatorType::Other("mutex".to_string()));
    }

    #[test]
    fn test_threat_level_ordering() {
        assert!(ThreatLevel::Low < ThreatLevel::Medium);
        assert!(ThreatLevel::High < ThreatLevel::Critical);
        assert_eq!("CRITICAL".parse::<ThreatLevel>().unwrap(), ThreatLevel::Critical);
        assert!("severe".parse::<ThreatLevel>().is_err());
    }

    #[test]
    fn test_indicator_canonical_value() {
        let indicator = Indicator::new(IndicatorType::Ip, " 010.000.000.001 ");
        assert_eq!(indicator.canonical_value, "10.0.0.1");
        assert_eq!(indicator.raw_value, " 010.000.000.001 ");
        assert!(indicator.active);
    }

    #[test]
    fn test_confidence_clamped() {
        let indicator = Indicator::new(IndicatorType::Hash, "abc").with_confidence(1.7);
        assert_eq!(indicator.confidence, 1.0);
        let indicator = Indicator::new(IndicatorType::Hash, "abc").with_confidence(f64::NAN);
        assert_eq!(indicator.confidence, 0.0);
    }

    #[test]
    fn test_fingerprint_stable_across_formatting() {
        let a = IndicatorKey::new(&IndicatorType::Domain, "https://Evil.example.com/path");
        let b = IndicatorKey::new(&IndicatorType::Domain, "evil.example.com:443");
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);

        let c = IndicatorKey::new(&IndicatorType::Url, "evil.example.com");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_new_indicator_materialize() {
        let mut metadata = Metadata::new();
        metadata.insert(metadata_keys::FEED, "threatfox");
        let mut new = NewIndicator::new(IndicatorType::Url, "HTTP://Bad.example/x?id=1");
        new.confidence = 0.8;
        new.tags = vec!["phishing".to_string(), "phishing".to_string()];
        new.metadata = metadata;

        let indicator = new.into_indicator(7, Utc::now());
        assert_eq!(indicator.id, 7);
        assert_eq!(indicator.canonical_value, "bad.example/x");
        assert_eq!(indicator.tags.len(), 1);
        assert_eq!(indicator.metadata.feed(), Some("threatfox"));
        assert_eq!(
            indicator.metadata.get(metadata_keys::SCHEMA_VERSION),
            Some(&serde_json::json!(METADATA_SCHEMA_VERSION))
        );
    }

    #[test]
    fn test_metadata_merge_incoming_wins() {
        let mut base = Metadata::new();
        base.insert("feed", "otx");
        base.insert("pulse", "abc");
        let mut other = Metadata::new();
        other.insert("feed", "threatfox");

        base.merge(&other);
        assert_eq!(base.feed(), Some("threatfox"));
        assert_eq!(base.get_str("pulse"), Some("abc"));
        assert_eq!(base.len(), 2);
    }
}
