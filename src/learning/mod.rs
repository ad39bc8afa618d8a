//! Preference learning from human edits.
//!
//! Resolved drafts flow through:
//! 1. `EditDiffAnalyzer::analyze()`: draft vs. final text into signals
//! 2. `PreferenceAggregator::record()`: append to the feedback log, then merge
//! 3. `MemoryView::build_bias()`: active preferences back into drafting

pub mod aggregator;
pub mod analyzer;
pub mod lexicon;
pub mod memory_view;
pub mod preference;

pub use aggregator::PreferenceAggregator;
pub use analyzer::EditDiffAnalyzer;
pub use memory_view::{BiasPayload, MemoryView, TriageHint};
