//! Domain types for the reconciliation pipeline.
//!
//! This module contains the core data structures:
//! - Verse ids with canonical book ordering
//! - Witnesses, pages and tagged regions
//! - OCR jobs and per-witness run state
//! - Witness-verse observations and the working text
//! - Taam alignments and consensus

pub mod job;
pub mod run;
pub mod taam;
pub mod text;
pub mod verse;
pub mod witness;

// Re-export commonly used types
pub use job::{JobCounts, JobStatus, OcrJob};
pub use run::{Blocker, RunState, Stage, StageState, StageStatus};
pub use taam::{
    AlignmentMetrics, AlignmentStatus, ConsensusMark, ConsensusMetrics, MarkPlacement,
    TaamAlignment, TaamConsensus,
};
pub use text::{
    ConfidenceInputs, SelectedSource, SplitInfo, WitnessVerse, WitnessVerseArtifacts,
    WorkingVerseText,
};
pub use verse::{Verse, VerseId, VerseIdError, VerseRange};
pub use witness::{
    BBox, BBoxUnits, CascadeGroup, Page, Region, RegionStatus, RemapCandidate, RemapState,
    Witness, WitnessType,
};
