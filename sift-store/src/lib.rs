//! sift Store - Storage collaborator and serving layer for indicator hygiene
//!
//! Provides the pieces that sit between feeds and API clients:
//! - Concurrency-safe in-memory indicator store with incremental merge
//! - Exclusion rule registry with compiled rule caching
//! - Rule import from JSON and CSV files
//! - Query/serving facade that applies exclusions
//! - Explicit configuration loaded from TOML

pub mod error;
pub mod config;
pub mod store;
pub mod rules;
pub mod import;
pub mod service;

pub use error::*;
pub use config::*;
pub use store::*;
pub use rules::*;
pub use import::*;
pub use service::*;
