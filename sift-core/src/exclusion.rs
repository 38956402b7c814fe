//! Exclusion rules that suppress indicators from served results
//!
//! A rule pairs a scope (one indicator type, or all) with a pattern:
//! - `exact`: case-insensitive equality
//! - `regex`: case-insensitive search
//! - `wildcard`: `*` and `?` globbing, case-insensitive search
//!
//! Malformed patterns never match and never raise; they are logged once
//! when compiled.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::{CoreError, IndicatorType};

/// Storage identifier of an exclusion rule
pub type RuleId = u64;

/// How a rule's pattern is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    #[default]
    Exact,
    Regex,
    Wildcard,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Exact => "exact",
            PatternKind::Regex => "regex",
            PatternKind::Wildcard => "wildcard",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(PatternKind::Exact),
            "regex" => Ok(PatternKind::Regex),
            "wildcard" => Ok(PatternKind::Wildcard),
            other => Err(CoreError::UnknownPatternKind(other.to_string())),
        }
    }
}

/// Indicator types a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleScope {
    All,
    Type(IndicatorType),
}

impl RuleScope {
    pub fn applies_to(&self, indicator_type: &IndicatorType) -> bool {
        match self {
            RuleScope::All => true,
            RuleScope::Type(t) => t == indicator_type,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RuleScope::All => "all",
            RuleScope::Type(t) => t.as_str(),
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RuleScope {
    fn from(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("all") {
            RuleScope::All
        } else {
            RuleScope::Type(IndicatorType::from(value))
        }
    }
}

impl From<String> for RuleScope {
    fn from(value: String) -> Self {
        RuleScope::from(value.as_str())
    }
}

impl From<RuleScope> for String {
    fn from(value: RuleScope) -> Self {
        value.as_str().to_string()
    }
}

impl From<IndicatorType> for RuleScope {
    fn from(value: IndicatorType) -> Self {
        RuleScope::Type(value)
    }
}

/// An operator-defined exclusion rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub id: RuleId,
    #[serde(rename = "indicator_type")]
    pub scope: RuleScope,
    #[serde(alias = "value")]
    pub pattern: String,
    #[serde(default, alias = "pattern_type")]
    pub pattern_kind: PatternKind,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub excluded_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl ExclusionRule {
    pub fn new(id: RuleId, scope: impl Into<RuleScope>, pattern: &str, kind: PatternKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            scope: scope.into(),
            pattern: pattern.to_string(),
            pattern_kind: kind,
            active: true,
            reason: None,
            excluded_by: None,
            created_at: now,
            updated_at: now,
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

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Whether the rule takes part in matching for this type
    pub fn applies_to(&self, indicator_type: &IndicatorType) -> bool {
        self.active && self.scope.applies_to(indicator_type)
    }

    /// Check the pattern compiles, without matching anything
    pub fn validate(&self) -> Result<(), String> {
        match Matcher::compile(&self.pattern, self.pattern_kind) {
            Matcher::Invalid(reason) => Err(reason),
            _ => Ok(()),
        }
    }
}

/// Outcome of evaluating one pattern against one value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternMatch {
    Matched,
    NoMatch,
    InvalidPattern(String),
}

impl PatternMatch {
    pub fn is_match(&self) -> bool {
        matches!(self, PatternMatch::Matched)
    }
}

/// A pattern compiled for repeated evaluation
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Lowercased literal
    Exact(String),
    /// Case-insensitive search regex
    Search(Regex),
    /// Pattern that failed to compile
    Invalid(String),
}

impl Matcher {
    pub fn compile(pattern: &str, kind: PatternKind) -> Self {
        let source = match kind {
            PatternKind::Exact => return Matcher::Exact(pattern.to_lowercase()),
            PatternKind::Regex => pattern.to_string(),
            PatternKind::Wildcard => wildcard_to_regex(pattern),
        };

        match RegexBuilder::new(&source).case_insensitive(true).build() {
            Ok(regex) => Matcher::Search(regex),
            Err(e) => Matcher::Invalid(e.to_string()),
        }
    }

    pub fn evaluate(&self, value: &str) -> PatternMatch {
        let matched = match self {
            Matcher::Exact(literal) => value.to_lowercase() == *literal,
            Matcher::Search(regex) => regex.is_match(value),
            Matcher::Invalid(reason) => return PatternMatch::InvalidPattern(reason.clone()),
        };
        if matched {
            PatternMatch::Matched
        } else {
            PatternMatch::NoMatch
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Matcher::Invalid(_))
    }
}

/// Translate a glob into a search regex: `*` any run, `?` any one char
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2);
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    regex
}

/// Evaluate a single pattern against a single value
pub fn match_pattern(pattern: &str, kind: PatternKind, value: &str) -> PatternMatch {
    Matcher::compile(pattern, kind).evaluate(value)
}

/// Decide whether `value` is suppressed by any active, applicable rule.
///
/// Rules are evaluated in ascending id order and the first match wins.
pub fn is_excluded(indicator_type: &IndicatorType, value: &str, rules: &[ExclusionRule]) -> bool {
    let mut applicable: Vec<&ExclusionRule> =
        rules.iter().filter(|r| r.applies_to(indicator_type)).collect();
    applicable.sort_by_key(|r| r.id);

    for rule in applicable {
        match match_pattern(&rule.pattern, rule.pattern_kind, value) {
            PatternMatch::Matched => {
                log_exclusion(value, rule);
                return true;
            }
            PatternMatch::NoMatch => {}
            PatternMatch::InvalidPattern(reason) => {
                warn!(
                    "Invalid {} pattern in exclusion rule {}: {} ({})",
                    rule.pattern_kind, rule.id, rule.pattern, reason
                );
            }
        }
    }

    false
}

fn log_exclusion(value: &str, rule: &ExclusionRule) {
    info!(
        "Indicator {} excluded by rule {}: {}",
        value,
        rule.id,
        rule.reason.as_deref().unwrap_or("no reason given")
    );
}

/// Result of dry-running a pattern against candidate values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternTestResult {
    pub pattern: String,
    pub pattern_kind: PatternKind,
    pub matches: Vec<String>,
    pub total_matches: usize,
    /// Compile error, when the pattern is malformed
    pub invalid: Option<String>,
}

/// Preview which candidates a pattern would match before activating it
pub fn test_pattern<'a, I>(pattern: &str, kind: PatternKind, candidates: I) -> PatternTestResult
where
    I: IntoIterator<Item = &'a str>,
{
    let matcher = Matcher::compile(pattern, kind);
    let invalid = match &matcher {
        Matcher::Invalid(reason) => Some(reason.clone()),
        _ => None,
    };

    let matches: Vec<String> = candidates
        .into_iter()
        .filter(|candidate| matcher.evaluate(candidate).is_match())
        .map(str::to_string)
        .collect();

    PatternTestResult {
        pattern: pattern.to_string(),
        pattern_kind: kind,
        total_matches: matches.len(),
        matches,
        invalid,
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: ExclusionRule,
    matcher: Matcher,
}

/// Active rules compiled once and indexed by scope.
///
/// Serving M values against R rules pays the regex compilation R times
/// instead of M·R, and only evaluates rules applicable to each type.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    /// Positions of `all`-scoped rules
    all: Vec<usize>,
    /// Positions of rules applicable to each type, `all` rules included
    by_type: HashMap<IndicatorType, Vec<usize>>,
}

impl RuleSet {
    pub fn new<'a, I>(rules: I) -> Self
    where
        I: IntoIterator<Item = &'a ExclusionRule>,
    {
        let mut active: Vec<ExclusionRule> = rules.into_iter().filter(|r| r.active).cloned().collect();
        active.sort_by_key(|r| r.id);

        let compiled: Vec<CompiledRule> = active
            .into_iter()
            .map(|rule| {
                let matcher = Matcher::compile(&rule.pattern, rule.pattern_kind);
                if let Matcher::Invalid(reason) = &matcher {
                    warn!(
                        "Exclusion rule {} has invalid {} pattern {:?}, it will never match: {}",
                        rule.id, rule.pattern_kind, rule.pattern, reason
                    );
                }
                CompiledRule { rule, matcher }
            })
            .collect();

        let mut all = Vec::new();
        let mut by_type: HashMap<IndicatorType, Vec<usize>> = HashMap::new();
        for (pos, compiled) in compiled.iter().enumerate() {
            match &compiled.rule.scope {
                RuleScope::All => all.push(pos),
                RuleScope::Type(t) => by_type.entry(t.clone()).or_default().push(pos),
            }
        }
        for positions in by_type.values_mut() {
            positions.extend_from_slice(&all);
            positions.sort_unstable();
        }

        Self {
            rules: compiled,
            all,
            by_type,
        }
    }

    fn candidates(&self, indicator_type: &IndicatorType) -> &[usize] {
        self.by_type
            .get(indicator_type)
            .map(Vec::as_slice)
            .unwrap_or(&self.all)
    }

    /// First applicable rule matching the value, in id order
    pub fn first_match(&self, indicator_type: &IndicatorType, value: &str) -> Option<&ExclusionRule> {
        self.candidates(indicator_type)
            .iter()
            .map(|&pos| &self.rules[pos])
            .find(|compiled| compiled.matcher.evaluate(value).is_match())
            .map(|compiled| &compiled.rule)
    }

    pub fn is_excluded(&self, indicator_type: &IndicatorType, value: &str) -> bool {
        match self.first_match(indicator_type, value) {
            Some(rule) => {
                log_exclusion(value, rule);
                true
            }
            None => false,
        }
    }

    /// Ids of active rules whose pattern failed to compile
    pub fn invalid_rules(&self) -> Vec<RuleId> {
        self.rules
            .iter()
            .filter(|c| !c.matcher.is_valid())
            .map(|c| c.rule.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
