//! sift Core - Indicator model and hygiene primitives for threat intelligence
//!
//! This crate provides the foundational primitives:
//! - Typed indicators (IP, domain, URL, hash, email, CVE) with canonical keys
//! - Normalization of raw feed values into canonical form
//! - Batch deduplication and incremental merge of indicators
//! - Exclusion rule matching (exact, regex, wildcard)
//! - Comparison of observed values against known indicators

pub mod indicator;
pub mod normalize;
pub mod dedup;
pub mod exclusion;
pub mod compare;

pub use indicator::*;
pub use normalize::*;
pub use dedup::*;
pub use exclusion::*;
pub use compare::*;

/// Similarity recorded on links produced by exact-key collapsing
pub const EXACT_SIMILARITY: f64 = 1.0;

/// Minimum confidence score
pub const MIN_CONFIDENCE: f64 = 0.0;

/// Maximum confidence score
pub const MAX_CONFIDENCE: f64 = 1.0;
