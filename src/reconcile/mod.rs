//! Reconciliation of witness texts into one working text per verse.
//!
//! - `split`: divide region OCR text over its verse range
//! - `confidence`: per-witness confidence scoring
//! - `cascade`: tiered selection of the working text
//! - `remap`: re-anchor mis-tagged regions and backfill

pub mod cascade;
pub mod confidence;
pub mod remap;
pub mod split;

pub use cascade::{run_cascade, select, Candidate, CascadeDecision, CascadeThresholds};
pub use confidence::recompute_witness;
pub use remap::{decide, score_windows, RemapDecision, RemapOutcome, RemapPolicy, RemapReport, Remapper};
pub use split::{split_region, split_witness, RegionSplit, SplitOutcome, SplitPolicy, SplitSummary};
