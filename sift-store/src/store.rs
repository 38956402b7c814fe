//! In-memory indicator store
//!
//! Rows live in a sharded map keyed by id. A second map indexes, by key
//! fingerprint, the ids of every active row sharing a `(type, canonical)`
//! key; imports may leave more than one there until the next dedup pass.
//! The incremental merge runs inside that index's entry guard, so
//! concurrent writers reporting the same entity serialize instead of both
//! inserting, and a report always lands on the preferred live member.
//!
//! Lock order is index entry, then row. Duplicate marking takes the link
//! ledger, then the row, and touches the index only after releasing both.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use sift_core::{
    merge, plan_deduplication, survivor_order, DedupPlan, DedupReport, DuplicateLink, Indicator,
    IndicatorId, IndicatorKey, IndicatorType, LinkLedger, Metadata, NewIndicator, ThreatLevel,
    UpsertOutcome,
};

/// Partial update of an indicator; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorUpdate {
    pub confidence: Option<f64>,
    pub threat_level: Option<ThreatLevel>,
    pub tags: Option<Vec<String>>,
    pub description: Option<String>,
    pub active: Option<bool>,
    pub metadata: Option<Metadata>,
}

/// Counts over the stored indicators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSummary {
    pub total_indicators: usize,
    pub active_indicators: usize,
    pub indicators_by_type: BTreeMap<String, usize>,
    pub indicators_by_level: BTreeMap<String, usize>,
    pub duplicate_links: usize,
}

/// Concurrency-safe indicator storage
#[derive(Debug)]
pub struct IndicatorStore {
    rows: DashMap<IndicatorId, Indicator>,
    /// Key fingerprint -> ids of active rows with that key
    members: DashMap<String, BTreeSet<IndicatorId>>,
    ledger: Mutex<LinkLedger>,
    next_id: AtomicU64,
}

impl Default for IndicatorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatorStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            members: DashMap::new(),
            ledger: Mutex::new(LinkLedger::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> IndicatorId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn reserve_id(&self, id: IndicatorId) {
        self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    fn remember(&self, fingerprint: String, id: IndicatorId) {
        self.members.entry(fingerprint).or_default().insert(id);
    }

    fn forget(&self, fingerprint: &str, id: IndicatorId) {
        if let Some(mut members) = self.members.get_mut(fingerprint) {
            members.remove(&id);
        }
        self.members.remove_if(fingerprint, |_, members| members.is_empty());
    }

    /// Live member a report should merge into; stale ids are dropped
    fn preferred_member(&self, members: &mut BTreeSet<IndicatorId>) -> Option<IndicatorId> {
        let mut live = Vec::with_capacity(members.len());
        members.retain(|id| match self.get(*id) {
            Some(row) if row.active => {
                live.push(row);
                true
            }
            _ => false,
        });
        live.sort_by(survivor_order);
        live.first().map(|row| row.id)
    }

    /// Store a newly reported indicator, merging into the active indicator
    /// with the same key if there is one
    pub fn upsert(&self, incoming: NewIndicator) -> UpsertOutcome {
        let now = Utc::now();
        let key = incoming.key();
        let mut members = self.members.entry(key.fingerprint()).or_default();

        while let Some(target) = self.preferred_member(&mut members) {
            if let Some(mut row) = self.rows.get_mut(&target) {
                if row.active {
                    merge(row.value_mut(), &incoming.into_indicator(target, now));
                    debug!("Merged report of {} into indicator {}", key, target);
                    return UpsertOutcome::Merged(target);
                }
            }
            // Deactivated or deleted since it was checked
            members.remove(&target);
        }

        let id = self.allocate_id();
        self.rows.insert(id, incoming.into_indicator(id, now));
        members.insert(id);
        UpsertOutcome::Inserted(id)
    }

    /// Load persisted rows as they are, duplicates included.
    ///
    /// Canonical values are recomputed. Rows without a usable id (0 or
    /// `u64::MAX`), or whose id is taken, get a fresh one. Returns the ids
    /// assigned, in input order.
    pub fn import(&self, rows: Vec<Indicator>) -> Vec<IndicatorId> {
        let mut assigned = Vec::with_capacity(rows.len());
        for mut row in rows {
            row.recanonicalize();
            if row.id == 0 || row.id == IndicatorId::MAX || self.rows.contains_key(&row.id) {
                row.id = self.allocate_id();
            } else {
                self.reserve_id(row.id);
            }

            let id = row.id;
            let active = row.active;
            let fingerprint = row.key().fingerprint();
            self.rows.insert(id, row);
            if active {
                self.remember(fingerprint, id);
            }
            assigned.push(id);
        }
        assigned
    }

    /// Restore persisted duplicate links
    pub fn import_links(&self, links: Vec<DuplicateLink>) -> usize {
        let mut ledger = self.ledger.lock();
        links.into_iter().filter(|link| ledger.record(link.clone())).count()
    }

    pub fn get(&self, id: IndicatorId) -> Option<Indicator> {
        self.rows.get(&id).map(|row| row.value().clone())
    }

    /// Active indicator for a typed raw value, if any
    pub fn find_active(&self, indicator_type: &IndicatorType, raw_value: &str) -> Option<Indicator> {
        let fingerprint = IndicatorKey::new(indicator_type, raw_value).fingerprint();
        let id = {
            let mut members = self.members.get_mut(&fingerprint)?;
            self.preferred_member(&mut members)?
        };
        self.get(id).filter(|row| row.active)
    }

    /// Apply a partial update; `None` if the id is unknown
    pub fn update(&self, id: IndicatorId, update: IndicatorUpdate) -> Option<Indicator> {
        let (updated, fingerprint) = {
            let mut row = self.rows.get_mut(&id)?;
            let indicator = row.value_mut();
            if let Some(confidence) = update.confidence {
                indicator.confidence = confidence;
            }
            if let Some(level) = update.threat_level {
                indicator.threat_level = level;
            }
            if let Some(tags) = update.tags {
                indicator.tags = tags.into_iter().collect();
            }
            if let Some(description) = update.description {
                indicator.description = Some(description);
            }
            if let Some(metadata) = update.metadata {
                indicator.metadata = metadata;
            }
            if let Some(active) = update.active {
                indicator.active = active;
            }
            indicator.recanonicalize();
            (indicator.clone(), indicator.key().fingerprint())
        };

        if updated.active {
            // A reactivated row may sit beside a survivor until the next dedup pass
            self.remember(fingerprint, id);
        } else {
            self.forget(&fingerprint, id);
        }

        Some(updated)
    }

    pub fn delete(&self, id: IndicatorId) -> bool {
        let Some((_, row)) = self.rows.remove(&id) else {
            return false;
        };
        self.forget(&row.key().fingerprint(), id);
        true
    }

    /// All rows ordered by id
    pub fn snapshot(&self) -> Vec<Indicator> {
        let mut rows: Vec<Indicator> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn links(&self) -> Vec<DuplicateLink> {
        self.ledger.lock().links().to_vec()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.rows.iter().filter(|r| r.active).count()
    }

    /// Collapse active duplicates across the whole store.
    ///
    /// Each duplicate is deactivated and linked in one step. Duplicates that
    /// disappear or change between planning and applying are counted in
    /// `failed` rather than dropped.
    pub fn deduplicate(&self) -> DedupReport {
        let plan = plan_deduplication(&self.snapshot());
        self.apply_plan(&plan)
    }

    pub(crate) fn apply_plan(&self, plan: &DedupPlan) -> DedupReport {
        let started = Instant::now();
        debug!(
            "Applying dedup plan: {} duplicates in {} groups",
            plan.planned_duplicates(),
            plan.groups.len()
        );

        let mut report = DedupReport {
            original_count: plan.original_count,
            ..Default::default()
        };

        for group in &plan.groups {
            if !self.is_active(group.survivor) {
                warn!(
                    "Survivor {} of {} is gone, skipping {} duplicates",
                    group.survivor,
                    group.key,
                    group.duplicates.len()
                );
                report.failed += group.duplicates.len();
                continue;
            }

            let fingerprint = group.key.fingerprint();
            let mut marked = 0;
            for &duplicate in &group.duplicates {
                if self.mark_duplicate(group.survivor, duplicate) {
                    self.forget(&fingerprint, duplicate);
                    marked += 1;
                } else {
                    warn!(
                        "Could not mark indicator {} as duplicate of {}",
                        duplicate, group.survivor
                    );
                    report.failed += 1;
                }
            }

            if marked > 0 {
                report.duplicates_marked += marked;
                report.groups_collapsed += 1;
                report.survivors.push(group.survivor);
            }
        }

        report.active_count = self.active_count();

        info!(
            "Deduplicated {} indicators: {} duplicates in {} groups, {} failed ({:?})",
            report.original_count,
            report.duplicates_marked,
            report.groups_collapsed,
            report.failed,
            started.elapsed()
        );
        report
    }

    fn is_active(&self, id: IndicatorId) -> bool {
        self.rows.get(&id).is_some_and(|row| row.active)
    }

    /// Deactivate one duplicate and record its link atomically
    fn mark_duplicate(&self, primary_id: IndicatorId, duplicate_id: IndicatorId) -> bool {
        let mut ledger = self.ledger.lock();
        let Some(mut row) = self.rows.get_mut(&duplicate_id) else {
            return false;
        };
        if !row.active {
            return false;
        }
        ledger.record(DuplicateLink::exact(primary_id, duplicate_id));
        row.active = false;
        true
    }

    pub fn summary(&self) -> IndicatorSummary {
        let mut summary = IndicatorSummary {
            duplicate_links: self.ledger.lock().len(),
            ..Default::default()
        };

        for row in self.rows.iter() {
            summary.total_indicators += 1;
            if row.active {
                summary.active_indicators += 1;
            }
            *summary
                .indicators_by_type
                .entry(row.indicator_type.to_string())
                .or_default() += 1;
            *summary
                .indicators_by_level
                .entry(row.threat_level.to_string())
                .or_default() += 1;
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn report(t: IndicatorType, value: &str, confidence: f64) -> NewIndicator {
        let mut new = NewIndicator::new(t, value);
        new.confidence = confidence;
        new
    }

    #[test]
    fn test_upsert_merges_same_key() {
        let store = IndicatorStore::new();

        let mut a = report(IndicatorType::Ip, "10.0.0.1", 0.5);
        a.tags = vec!["scanner".to_string()];
        let mut b = report(IndicatorType::Ip, "010.000.000.001", 0.9);
        b.tags = vec!["botnet".to_string()];

        let first = store.upsert(a);
        let second = store.upsert(b);

        assert!(matches!(first, UpsertOutcome::Inserted(_)));
        assert_eq!(second, UpsertOutcome::Merged(first.id()));
        assert_eq!(store.len(), 1);

        let row = store.get(first.id()).unwrap();
        assert_eq!(row.confidence, 0.9);
        assert!(row.tags.contains("scanner"));
        assert!(row.tags.contains("botnet"));
    }

    #[test]
    fn test_upsert_after_delete_inserts_fresh() {
        let store = IndicatorStore::new();
        let first = store.upsert(report(IndicatorType::Domain, "evil.example", 0.5));
        assert!(store.delete(first.id()));

        let second = store.upsert(report(IndicatorType::Domain, "EVIL.example", 0.5));
        assert!(matches!(second, UpsertOutcome::Inserted(_)));
        assert_ne!(second.id(), first.id());
        assert!(store.find_active(&IndicatorType::Domain, "evil.example").is_some());
    }

    #[test]
    fn test_concurrent_upserts_create_one_row() {
        let store = Arc::new(IndicatorStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for j in 0..50 {
                        let raw = if (i + j) % 2 == 0 { "Evil.Example" } else { "https://evil.example/x" };
                        store.upsert(report(IndicatorType::Domain, raw, f64::from(j) / 50.0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 1);
        let row = store.find_active(&IndicatorType::Domain, "evil.example").unwrap();
        assert_eq!(row.confidence, 49.0 / 50.0);
    }

    #[test]
    fn test_import_then_deduplicate() {
        let store = IndicatorStore::new();
        store.import(vec![
            Indicator::new(IndicatorType::Hash, "ABC").with_id(10).with_confidence(0.3),
            Indicator::new(IndicatorType::Hash, "abc").with_id(11).with_confidence(0.7),
            Indicator::new(IndicatorType::Hash, "def").with_id(12),
        ]);

        let report = store.deduplicate();
        assert_eq!(report.original_count, 3);
        assert_eq!(report.duplicates_marked, 1);
        assert_eq!(report.groups_collapsed, 1);
        assert_eq!(report.active_count, 2);
        assert_eq!(report.survivors, vec![11]);
        assert!(report.is_complete());

        assert!(!store.get(10).unwrap().active);
        assert_eq!(store.find_active(&IndicatorType::Hash, "ABC").unwrap().id, 11);

        let links = store.links();
        assert_eq!(links.len(), 1);
        assert_eq!((links[0].primary_id, links[0].duplicate_id), (11, 10));

        // fresh ids continue after imported ones
        let next = store.upsert(report_hash("0123"));
        assert_eq!(next.id(), 13);
    }

    fn report_hash(value: &str) -> NewIndicator {
        NewIndicator::new(IndicatorType::Hash, value)
    }

    #[test]
    fn test_deduplicate_twice_adds_no_links() {
        let store = IndicatorStore::new();
        store.import(vec![
            Indicator::new(IndicatorType::Ip, "1.1.1.1").with_id(1),
            Indicator::new(IndicatorType::Ip, "01.1.1.1").with_id(2),
        ]);

        assert_eq!(store.deduplicate().duplicates_marked, 1);
        let second = store.deduplicate();
        assert_eq!(second.duplicates_marked, 0);
        assert_eq!(second.groups_collapsed, 0);
        assert_eq!(store.links().len(), 1);
    }

    #[test]
    fn test_import_reassigns_taken_ids() {
        let store = IndicatorStore::new();
        let ids = store.import(vec![
            Indicator::new(IndicatorType::Cve, "CVE-2024-1").with_id(5),
            Indicator::new(IndicatorType::Cve, "CVE-2024-2").with_id(5),
            Indicator::new(IndicatorType::Cve, "CVE-2024-3"),
        ]);
        assert_eq!(ids[0], 5);
        assert_ne!(ids[1], 5);
        assert_ne!(ids[2], 0);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_update_deactivation_releases_key() {
        let store = IndicatorStore::new();
        let id = store.upsert(report(IndicatorType::Email, "a@b.example", 0.5)).id();

        let updated = store
            .update(id, IndicatorUpdate { active: Some(false), ..Default::default() })
            .unwrap();
        assert!(!updated.active);
        assert!(store.find_active(&IndicatorType::Email, "a@b.example").is_none());

        let again = store.upsert(report(IndicatorType::Email, "A@B.example", 0.5));
        assert!(matches!(again, UpsertOutcome::Inserted(_)));
        assert!(store.update(999, IndicatorUpdate::default()).is_none());
    }

    #[test]
    fn test_import_links_skips_known_pairs() {
        let store = IndicatorStore::new();
        let restored = store.import_links(vec![
            DuplicateLink::exact(1, 2),
            DuplicateLink::exact(1, 2),
            DuplicateLink::exact(1, 3),
        ]);
        assert_eq!(restored, 2);
    }

    #[test]
    fn test_summary_counts() {
        let store = IndicatorStore::new();
        let mut high = report(IndicatorType::Domain, "a.example", 0.9);
        high.threat_level = ThreatLevel::High;
        store.upsert(high);
        store.upsert(report(IndicatorType::Ip, "1.2.3.4", 0.1));
        store.upsert(report(IndicatorType::Ip, "5.6.7.8", 0.1));

        let summary = store.summary();
        assert_eq!(summary.total_indicators, 3);
        assert_eq!(summary.active_indicators, 3);
        assert_eq!(summary.indicators_by_type["ip"], 2);
        assert_eq!(summary.indicators_by_level["high"], 1);
        assert_eq!(summary.indicators_by_level["low"], 2);
    }

    fn active_ids(store: &IndicatorStore) -> Vec<IndicatorId> {
        store.snapshot().into_iter().filter(|r| r.active).map(|r| r.id).collect()
    }

    fn imported_pair(store: &IndicatorStore) {
        store.import(vec![
            Indicator::new(IndicatorType::Domain, "evil.example").with_id(1).with_confidence(0.2),
            Indicator::new(IndicatorType::Domain, "EVIL.example").with_id(2).with_confidence(0.8),
        ]);
    }

    #[test]
    fn test_upsert_merges_into_remaining_duplicate_after_deactivation() {
        let store = IndicatorStore::new();
        imported_pair(&store);

        store.update(2, IndicatorUpdate { active: Some(false), ..Default::default() });
        let outcome = store.upsert(report(IndicatorType::Domain, "evil.example", 0.5));

        assert_eq!(outcome, UpsertOutcome::Merged(1));
        assert_eq!(active_ids(&store), vec![1]);
        assert_eq!(store.get(1).unwrap().confidence, 0.5);
    }

    #[test]
    fn test_upsert_merges_into_remaining_duplicate_after_delete() {
        let store = IndicatorStore::new();
        imported_pair(&store);

        assert!(store.delete(2));
        let outcome = store.upsert(report(IndicatorType::Domain, "https://Evil.Example/", 0.1));

        assert_eq!(outcome, UpsertOutcome::Merged(1));
        assert_eq!(store.len(), 1);
        assert_eq!(store.find_active(&IndicatorType::Domain, "evil.example").unwrap().id, 1);
    }

    #[test]
    fn test_upsert_over_imported_duplicates_picks_preferred_row() {
        let store = IndicatorStore::new();
        imported_pair(&store);

        let outcome = store.upsert(report(IndicatorType::Domain, "evil.example", 0.3));

        // highest confidence wins, as in batch dedup
        assert_eq!(outcome, UpsertOutcome::Merged(2));
        assert_eq!(store.len(), 2);
        assert_eq!(store.find_active(&IndicatorType::Domain, "evil.example").unwrap().id, 2);
    }

    #[test]
    fn test_reactivated_row_rejoins_index() {
        let store = IndicatorStore::new();
        imported_pair(&store);
        store.deduplicate();
        assert_eq!(active_ids(&store), vec![2]);

        store.delete(2);
        store.update(1, IndicatorUpdate { active: Some(true), ..Default::default() });
        let outcome = store.upsert(report(IndicatorType::Domain, "evil.example", 0.9));
        assert_eq!(outcome, UpsertOutcome::Merged(1));
    }

    #[test]
    fn test_dedup_counts_vanished_rows_as_failed() {
        let store = IndicatorStore::new();
        store.import(vec![
            Indicator::new(IndicatorType::Ip, "10.0.0.1").with_id(1).with_confidence(0.9),
            Indicator::new(IndicatorType::Ip, "010.0.0.1").with_id(2).with_confidence(0.5),
            Indicator::new(IndicatorType::Ip, "10.0.0.01").with_id(3).with_confidence(0.1),
            Indicator::new(IndicatorType::Hash, "AA").with_id(4).with_confidence(0.9),
            Indicator::new(IndicatorType::Hash, "aa").with_id(5).with_confidence(0.1),
        ]);
        let plan = plan_deduplication(&store.snapshot());
        assert_eq!(plan.planned_duplicates(), 3);

        // one duplicate vanishes, one survivor vanishes
        store.delete(3);
        store.delete(4);

        let report = store.apply_plan(&plan);
        assert_eq!(report.duplicates_marked, 1);
        assert_eq!(report.failed, 2);
        assert!(!report.is_complete());
        assert_eq!(report.survivors, vec![1]);
        assert_eq!(report.original_count, 5);
        assert_eq!(report.active_count, 2);

        // the untouched duplicate of the vanished survivor stays active
        assert!(store.get(5).unwrap().active);
        assert_eq!(store.links().len(), 1);
    }

    #[test]
    fn test_dedup_counts_already_inactive_duplicate_as_failed() {
        let store = IndicatorStore::new();
        imported_pair(&store);
        let plan = plan_deduplication(&store.snapshot());

        store.update(1, IndicatorUpdate { active: Some(false), ..Default::default() });

        let report = store.apply_plan(&plan);
        assert_eq!(report.failed, 1);
        assert_eq!(report.duplicates_marked, 0);
        assert_eq!(report.groups_collapsed, 0);
        assert!(store.links().is_empty());
    }

    #[test]
    fn test_import_handles_max_id() {
        let store = IndicatorStore::new();
        let ids = store.import(vec![
            Indicator::new(IndicatorType::Ip, "1.1.1.1").with_id(IndicatorId::MAX),
            Indicator::new(IndicatorType::Ip, "2.2.2.2").with_id(IndicatorId::MAX - 1),
        ]);
        assert_eq!(ids[0], 1);
        assert_eq!(ids[1], IndicatorId::MAX - 1);
        assert_eq!(store.len(), 2);
    }
}
