//! Exclusion rule registry
//!
//! Holds operator-defined rules and a compiled [`RuleSet`] that is rebuilt
//! lazily after any mutation. Readers share the compiled set through an
//! `Arc`, so a rule edit never blocks an in-flight query.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use sift_core::{ExclusionRule, PatternKind, RuleId, RuleScope, RuleSet};

use crate::StoreError;

/// A rule as submitted, before it gets an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    #[serde(rename = "indicator_type", default = "default_scope")]
    pub scope: RuleScope,
    #[serde(alias = "value")]
    pub pattern: String,
    #[serde(default, alias = "pattern_type")]
    pub pattern_kind: PatternKind,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub excluded_by: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_scope() -> RuleScope {
    RuleScope::All
}

fn default_active() -> bool {
    true
}

impl RuleDraft {
    pub fn new(scope: impl Into<RuleScope>, pattern: &str, kind: PatternKind) -> Self {
        Self {
            scope: scope.into(),
            pattern: pattern.to_string(),
            pattern_kind: kind,
            reason: None,
            excluded_by: None,
            active: true,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_author(mut self, excluded_by: &str) -> Self {
        self.excluded_by = Some(excluded_by.to_string());
        self
    }

    fn into_rule(self, id: RuleId) -> ExclusionRule {
        let mut rule = ExclusionRule::new(id, self.scope, &self.pattern, self.pattern_kind);
        rule.reason = self.reason;
        rule.excluded_by = self.excluded_by;
        rule.active = self.active;
        rule
    }
}

/// Partial update of a rule; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleUpdate {
    #[serde(rename = "indicator_type")]
    pub scope: Option<RuleScope>,
    pub pattern: Option<String>,
    pub pattern_kind: Option<PatternKind>,
    pub reason: Option<String>,
    pub excluded_by: Option<String>,
    pub active: Option<bool>,
}

/// Listing filter with offset paging
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub scope: Option<RuleScope>,
    pub pattern_kind: Option<PatternKind>,
    pub active: Option<bool>,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Counts over the registered rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleStats {
    pub total_exclusions: usize,
    pub active_exclusions: usize,
    pub exclusions_by_type: BTreeMap<String, usize>,
    pub exclusions_by_pattern: BTreeMap<String, usize>,
    /// Active rules whose pattern does not compile
    pub invalid_rules: Vec<RuleId>,
}

#[derive(Debug)]
pub struct RuleRegistry {
    rules: RwLock<BTreeMap<RuleId, ExclusionRule>>,
    next_id: AtomicU64,
    reject_invalid: bool,
    compiled: RwLock<Option<Arc<RuleSet>>>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}

impl RuleRegistry {
    /// `reject_invalid` refuses rules whose pattern does not compile
    pub fn new(reject_invalid: bool) -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            reject_invalid,
            compiled: RwLock::new(None),
        }
    }

    fn check(&self, pattern: &str, kind: PatternKind) -> Result<(), StoreError> {
        if !self.reject_invalid {
            return Ok(());
        }
        let candidate = ExclusionRule::new(0, RuleScope::All, pattern, kind);
        candidate
            .validate()
            .map_err(|reason| StoreError::InvalidRule(format!("{} pattern {:?}: {}", kind, pattern, reason)))
    }

    fn invalidate(&self) {
        *self.compiled.write() = None;
    }

    pub fn create(&self, draft: RuleDraft) -> Result<ExclusionRule, StoreError> {
        self.check(&draft.pattern, draft.pattern_kind)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rule = draft.into_rule(id);
        self.rules.write().insert(id, rule.clone());
        self.invalidate();
        info!("Created exclusion rule {} ({} {:?})", id, rule.pattern_kind, rule.pattern);
        Ok(rule)
    }

    /// Create several rules; nothing is stored unless every draft is accepted
    pub fn bulk_create(&self, drafts: Vec<RuleDraft>) -> Result<Vec<ExclusionRule>, StoreError> {
        for draft in &drafts {
            self.check(&draft.pattern, draft.pattern_kind)?;
        }

        let created: Vec<ExclusionRule> = {
            let mut rules = self.rules.write();
            drafts
                .into_iter()
                .map(|draft| {
                    let rule = draft.into_rule(self.next_id.fetch_add(1, Ordering::SeqCst));
                    rules.insert(rule.id, rule.clone());
                    rule
                })
                .collect()
        };
        self.invalidate();
        info!("Created {} exclusion rules", created.len());
        Ok(created)
    }

    /// Load persisted rules keeping their ids; ids 0 and `u64::MAX` are reassigned
    pub fn restore(&self, restored: Vec<ExclusionRule>) -> usize {
        let count = restored.len();
        {
            let mut rules = self.rules.write();
            for mut rule in restored {
                if rule.id == 0 || rule.id == RuleId::MAX {
                    rule.id = self.next_id.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.next_id.fetch_max(rule.id.saturating_add(1), Ordering::SeqCst);
                }
                rules.insert(rule.id, rule);
            }
        }
        self.invalidate();
        count
    }

    pub fn get(&self, id: RuleId) -> Option<ExclusionRule> {
        self.rules.read().get(&id).cloned()
    }

    /// Rules matching the filter, in id order
    pub fn list(&self, filter: &RuleFilter) -> Vec<ExclusionRule> {
        let rules = self.rules.read();
        let matching = rules
            .values()
            .filter(|r| filter.scope.as_ref().map_or(true, |s| &r.scope == s))
            .filter(|r| filter.pattern_kind.map_or(true, |k| r.pattern_kind == k))
            .filter(|r| filter.active.map_or(true, |a| r.active == a))
            .skip(filter.skip);

        match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    /// Apply a partial update; `Ok(None)` if the id is unknown
    pub fn update(&self, id: RuleId, update: RuleUpdate) -> Result<Option<ExclusionRule>, StoreError> {
        let updated = {
            let mut rules = self.rules.write();
            let Some(rule) = rules.get_mut(&id) else {
                return Ok(None);
            };

            if update.pattern.is_some() || update.pattern_kind.is_some() {
                let pattern = update.pattern.as_deref().unwrap_or(&rule.pattern);
                let kind = update.pattern_kind.unwrap_or(rule.pattern_kind);
                self.check(pattern, kind)?;
            }

            if let Some(scope) = update.scope {
                rule.scope = scope;
            }
            if let Some(pattern) = update.pattern {
                rule.pattern = pattern;
            }
            if let Some(kind) = update.pattern_kind {
                rule.pattern_kind = kind;
            }
            if let Some(reason) = update.reason {
                rule.reason = Some(reason);
            }
            if let Some(excluded_by) = update.excluded_by {
                rule.excluded_by = Some(excluded_by);
            }
            if let Some(active) = update.active {
                rule.active = active;
            }
            rule.updated_at = Utc::now();
            rule.clone()
        };

        self.invalidate();
        debug!("Updated exclusion rule {}", id);
        Ok(Some(updated))
    }

    pub fn set_active(&self, id: RuleId, active: bool) -> Option<ExclusionRule> {
        let update = RuleUpdate {
            active: Some(active),
            ..Default::default()
        };
        // Pattern untouched, so no validation error is possible
        self.update(id, update).ok().flatten()
    }

    pub fn delete(&self, id: RuleId) -> bool {
        let removed = self.rules.write().remove(&id).is_some();
        if removed {
            self.invalidate();
            info!("Deleted exclusion rule {}", id);
        }
        removed
    }

    /// Compiled active rules, rebuilt only after a change
    pub fn rule_set(&self) -> Arc<RuleSet> {
        if let Some(set) = self.compiled.read().as_ref() {
            return Arc::clone(set);
        }

        let mut compiled = self.compiled.write();
        if let Some(set) = compiled.as_ref() {
            return Arc::clone(set);
        }
        let set = Arc::new(RuleSet::new(self.rules.read().values()));
        debug!("Compiled {} active exclusion rules", set.len());
        *compiled = Some(Arc::clone(&set));
        set
    }

    pub fn stats(&self) -> RuleStats {
        let invalid_rules = self.rule_set().invalid_rules();
        let rules = self.rules.read();

        let mut stats = RuleStats {
            total_exclusions: rules.len(),
            invalid_rules,
            ..Default::default()
        };
        for rule in rules.values() {
            if rule.active {
                stats.active_exclusions += 1;
            }
            *stats
                .exclusions_by_type
                .entry(rule.scope.to_string())
                .or_default() += 1;
            *stats
                .exclusions_by_pattern
                .entry(rule.pattern_kind.to_string())
                .or_default() += 1;
        }
        stats
    }

    pub fn snapshot(&self) -> Vec<ExclusionRule> {
        self.rules.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}
