//! Deduplication of indicators sharing a canonical key
//!
//! Two paths collapse duplicates:
//! - Batch: `deduplicate` groups active indicators by `(type, canonical)`,
//!   keeps one survivor per group and marks the rest inactive with a
//!   `DuplicateLink` audit record
//! - Incremental: `merge` folds a newly reported indicator into the active
//!   one with the same key

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::{Indicator, IndicatorId, IndicatorKey, ThreatLevel, EXACT_SIMILARITY};

/// Audit record tying a deactivated duplicate to its survivor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateLink {
    pub primary_id: IndicatorId,
    pub duplicate_id: IndicatorId,
    pub similarity: f64,
    pub created_at: DateTime<Utc>,
}

impl DuplicateLink {
    /// Link produced by exact-key collapsing
    pub fn exact(primary_id: IndicatorId, duplicate_id: IndicatorId) -> Self {
        Self::with_similarity(primary_id, duplicate_id, EXACT_SIMILARITY)
    }

    pub fn with_similarity(
        primary_id: IndicatorId,
        duplicate_id: IndicatorId,
        similarity: f64,
    ) -> Self {
        Self {
            primary_id,
            duplicate_id,
            similarity,
            created_at: Utc::now(),
        }
    }
}

/// Recorded duplicate links; each `(primary, duplicate)` pair appears once
#[derive(Debug, Clone, Default)]
pub struct LinkLedger {
    links: Vec<DuplicateLink>,
    pairs: HashSet<(IndicatorId, IndicatorId)>,
}

impl LinkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted links, dropping repeated pairs
    pub fn from_links<I>(links: I) -> Self
    where
        I: IntoIterator<Item = DuplicateLink>,
    {
        let mut ledger = Self::new();
        for link in links {
            ledger.record(link);
        }
        ledger
    }

    /// Record a link. Returns false if the pair was already recorded.
    pub fn record(&mut self, link: DuplicateLink) -> bool {
        if !self.pairs.insert((link.primary_id, link.duplicate_id)) {
            return false;
        }
        self.links.push(link);
        true
    }

    pub fn contains(&self, primary_id: IndicatorId, duplicate_id: IndicatorId) -> bool {
        self.pairs.contains(&(primary_id, duplicate_id))
    }

    pub fn links(&self) -> &[DuplicateLink] {
        &self.links
    }

    /// Duplicates collapsed into a given survivor
    pub fn duplicates_of(&self, primary_id: IndicatorId) -> Vec<IndicatorId> {
        self.links
            .iter()
            .filter(|l| l.primary_id == primary_id)
            .map(|l| l.duplicate_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// One group of active indicators sharing a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: IndicatorKey,
    pub survivor: IndicatorId,
    /// Non-survivors, in survivor-preference order
    pub duplicates: Vec<IndicatorId>,
}

/// What a deduplication pass would do, without doing it
#[derive(Debug, Clone, Default)]
pub struct DedupPlan {
    pub original_count: usize,
    pub active_count: usize,
    /// Groups of size > 1, ordered by key
    pub groups: Vec<DuplicateGroup>,
}

impl DedupPlan {
    pub fn planned_duplicates(&self) -> usize {
        self.groups.iter().map(|g| g.duplicates.len()).sum()
    }
}

/// Result of a deduplication pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupReport {
    /// Indicators considered, active or not
    pub original_count: usize,
    /// Active indicators after the pass
    pub active_count: usize,
    pub duplicates_marked: usize,
    pub groups_collapsed: usize,
    pub survivors: Vec<IndicatorId>,
    /// Planned duplicates that could not be applied
    pub failed: usize,
}

impl DedupReport {
    /// True when every planned duplicate was applied
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Survivor preference: highest confidence, then earliest first_seen, then lowest id
pub fn survivor_order(a: &Indicator, b: &Indicator) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.first_seen.cmp(&b.first_seen))
        .then_with(|| a.id.cmp(&b.id))
}

/// (key, survivor position, duplicate positions) for every collapsible group
fn group_positions(indicators: &[Indicator]) -> Vec<(IndicatorKey, usize, Vec<usize>)> {
    let mut groups: BTreeMap<IndicatorKey, Vec<usize>> = BTreeMap::new();
    for (pos, indicator) in indicators.iter().enumerate() {
        if indicator.active {
            groups.entry(indicator.key()).or_default().push(pos);
        }
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(key, mut members)| {
            members.sort_by(|&a, &b| survivor_order(&indicators[a], &indicators[b]));
            let survivor = members.remove(0);
            (key, survivor, members)
        })
        .collect()
}

/// Plan a deduplication pass over a snapshot of indicators
pub fn plan_deduplication(indicators: &[Indicator]) -> DedupPlan {
    let groups = group_positions(indicators)
        .into_iter()
        .map(|(key, survivor, duplicates)| DuplicateGroup {
            key,
            survivor: indicators[survivor].id,
            duplicates: duplicates.into_iter().map(|pos| indicators[pos].id).collect(),
        })
        .collect();

    DedupPlan {
        original_count: indicators.len(),
        active_count: indicators.iter().filter(|i| i.active).count(),
        groups,
    }
}

/// Collapse duplicates in place, recording links in `ledger`.
///
/// Re-running on the output marks nothing: only active indicators are
/// grouped, and the ledger never records a pair twice.
pub fn deduplicate(indicators: &mut [Indicator], ledger: &mut LinkLedger) -> DedupReport {
    let original_count = indicators.len();
    let active_before = indicators.iter().filter(|i| i.active).count();
    let groups = group_positions(indicators);

    let mut report = DedupReport {
        original_count,
        ..Default::default()
    };

    for (key, survivor, duplicates) in groups {
        let primary_id = indicators[survivor].id;
        debug!(
            "Collapsing {} duplicates of {} into indicator {}",
            duplicates.len(),
            key,
            primary_id
        );

        for pos in duplicates {
            let duplicate = &mut indicators[pos];
            ledger.record(DuplicateLink::exact(primary_id, duplicate.id));
            duplicate.active = false;
            report.duplicates_marked += 1;
        }

        report.groups_collapsed += 1;
        report.survivors.push(primary_id);
    }

    report.active_count = active_before - report.duplicates_marked;
    report
}

/// How an incoming indicator was stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// No active indicator shared the key; stored as new
    Inserted(IndicatorId),
    /// Folded into the existing active indicator
    Merged(IndicatorId),
}

impl UpsertOutcome {
    pub fn id(&self) -> IndicatorId {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Merged(id) => *id,
        }
    }
}

/// Fold `incoming` into `existing`, which share a key.
///
/// Confidence takes the maximum, the threat level only escalates and only
/// for non-low reports, tags and metadata are unioned and the sighting
/// window widens to cover both.
pub fn merge(existing: &mut Indicator, incoming: &Indicator) {
    debug_assert_eq!(existing.key(), incoming.key());

    existing.confidence = existing.confidence.max(incoming.confidence);

    if incoming.threat_level != ThreatLevel::Low {
        existing.threat_level = existing.threat_level.max(incoming.threat_level);
    }

    existing.tags.extend(incoming.tags.iter().cloned());
    existing.metadata.merge(&incoming.metadata);

    if existing.description.is_none() {
        existing.description = incoming.description.clone();
    }
    if existing.external_id.is_none() {
        existing.external_id = incoming.external_id.clone();
    }

    existing.first_seen = existing.first_seen.min(incoming.first_seen);
    existing.last_seen = existing.last_seen.max(incoming.last_seen);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IndicatorType;
    use chrono::Duration;

    fn ip(id: IndicatorId, raw: &str, confidence: f64) -> Indicator {
        Indicator::new(IndicatorType::Ip, raw)
            .with_id(id)
            .with_confidence(confidence)
    }

    #[test]
    fn test_highest_confidence_survives() {
        let mut indicators = vec![
            ip(1, "10.0.0.1", 0.4),
            ip(2, "010.000.000.001", 0.9),
            ip(3, " 10.0.0.01", 0.6),
            ip(4, "192.168.0.1", 0.2),
        ];
        let mut ledger = LinkLedger::new();

        let report = deduplicate(&mut indicators, &mut ledger);

        assert_eq!(report.original_count, 4);
        assert_eq!(report.duplicates_marked, 2);
        assert_eq!(report.groups_collapsed, 1);
        assert_eq!(report.active_count, 2);
        assert_eq!(report.survivors, vec![2]);
        assert!(indicators[1].active);
        assert!(!indicators[0].active);
        assert!(!indicators[2].active);
        assert!(indicators[3].active);
        assert!(ledger.contains(2, 1));
        assert!(ledger.contains(2, 3));
        assert!(ledger.links().iter().all(|l| l.similarity == 1.0));
    }

    #[test]
    fn test_confidence_tie_prefers_earliest_first_seen() {
        let now = Utc::now();
        let early = now - Duration::days(3);
        let mut indicators = vec![
            ip(1, "10.0.0.1", 0.5).seen(now, now),
            ip(2, "10.0.0.001", 0.5).seen(early, now),
        ];
        let mut ledger = LinkLedger::new();

        let report = deduplicate(&mut indicators, &mut ledger);
        assert_eq!(report.survivors, vec![2]);
        assert!(!indicators[0].active);
    }

    #[test]
    fn test_full_tie_prefers_lowest_id() {
        let now = Utc::now();
        let mut indicators = vec![
            ip(9, "10.0.0.1", 0.5).seen(now, now),
            ip(3, "10.0.0.1", 0.5).seen(now, now),
            ip(5, "10.0.0.1", 0.5).seen(now, now),
        ];

        let plan = plan_deduplication(&indicators);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].survivor, 3);
        assert_eq!(plan.groups[0].duplicates, vec![5, 9]);

        let mut ledger = LinkLedger::new();
        let report = deduplicate(&mut indicators, &mut ledger);
        assert_eq!(report.survivors, vec![3]);
    }

    #[test]
    fn test_rerun_marks_nothing() {
        let mut indicators = vec![
            ip(1, "10.0.0.1", 0.4),
            ip(2, "10.0.0.1", 0.9),
        ];
        let mut ledger = LinkLedger::new();

        let first = deduplicate(&mut indicators, &mut ledger);
        assert_eq!(first.duplicates_marked, 1);

        let second = deduplicate(&mut indicators, &mut ledger);
        assert_eq!(second.duplicates_marked, 0);
        assert_eq!(second.groups_collapsed, 0);
        assert_eq!(second.active_count, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_ledger_rejects_repeated_pair() {
        let mut ledger = LinkLedger::new();
        assert!(ledger.record(DuplicateLink::exact(1, 2)));
        assert!(!ledger.record(DuplicateLink::exact(1, 2)));
        assert!(ledger.record(DuplicateLink::exact(1, 3)));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.duplicates_of(1), vec![2, 3]);

        let rebuilt = LinkLedger::from_links(vec![
            DuplicateLink::exact(4, 5),
            DuplicateLink::exact(4, 5),
        ]);
        assert_eq!(rebuilt.len(), 1);
    }

    #[test]
    fn test_types_do_not_collide() {
        let mut indicators = vec![
            Indicator::new(IndicatorType::Domain, "evil.example").with_id(1),
            Indicator::new(IndicatorType::Url, "evil.example").with_id(2),
        ];
        let mut ledger = LinkLedger::new();
        let report = deduplicate(&mut indicators, &mut ledger);
        assert_eq!(report.duplicates_marked, 0);
    }

    #[test]
    fn test_merge_raises_confidence_and_unions_tags() {
        let mut existing = Indicator::new(IndicatorType::Domain, "evil.example")
            .with_id(1)
            .with_confidence(0.5)
            .with_tags(["botnet"]);
        let incoming = Indicator::new(IndicatorType::Domain, "HTTPS://EVIL.example/x")
            .with_confidence(0.9)
            .with_tags(["c2", "botnet"]);

        merge(&mut existing, &incoming);

        assert_eq!(existing.id, 1);
        assert_eq!(existing.confidence, 0.9);
        assert_eq!(existing.raw_value, "evil.example");
        let tags: Vec<_> = existing.tags.iter().map(String::as_str).collect();
        assert_eq!(tags, vec!["botnet", "c2"]);
    }

    #[test]
    fn test_merge_threat_level_escalates_only() {
        let mut existing = Indicator::new(IndicatorType::Hash, "abc")
            .with_threat_level(ThreatLevel::High);

        merge(
            &mut existing,
            &Indicator::new(IndicatorType::Hash, "ABC").with_threat_level(ThreatLevel::Low),
        );
        assert_eq!(existing.threat_level, ThreatLevel::High);

        merge(
            &mut existing,
            &Indicator::new(IndicatorType::Hash, "ABC").with_threat_level(ThreatLevel::Medium),
        );
        assert_eq!(existing.threat_level, ThreatLevel::High);

        merge(
            &mut existing,
            &Indicator::new(IndicatorType::Hash, "ABC").with_threat_level(ThreatLevel::Critical),
        );
        assert_eq!(existing.threat_level, ThreatLevel::Critical);
    }

    #[test]
    fn test_merge_widens_sighting_window() {
        let now = Utc::now();
        let mut existing = Indicator::new(IndicatorType::Email, "a@b.example")
            .seen(now - Duration::hours(1), now - Duration::hours(1));
        let incoming = Indicator::new(IndicatorType::Email, "A@B.example").seen(now, now);

        merge(&mut existing, &incoming);
        assert_eq!(existing.last_seen, now);
        assert_eq!(existing.first_seen, now - Duration::hours(1));
    }
}
