//! Analysis modules.
//!
//! Corpus-level statistics computed from stored evaluations.

pub mod aggregator;

pub use aggregator::*;
