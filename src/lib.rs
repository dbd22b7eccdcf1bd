//! mesorah - witness reconciliation pipeline
//!
//! Reconciles many textual witnesses of the Hebrew Bible (manuscripts,
//! transcriptions, digital baselines) into one scored working text per
//! verse, plus a weighted consensus of cantillation marks.
//!
//! # Architecture
//!
//! Every witness moves through the same stages (ingest, ocr, split,
//! confidence). A strict priority gate keeps lower-authority witnesses from
//! starting a stage before every higher-authority witness finished it:
//! - OCR jobs are claimed atomically from SQLite by a throttled worker pool
//! - Region text is split per verse and scored against the baseline
//! - The cascade commits one working text per verse to an append-only patch log
//!
//! # Modules
//!
//! - `adapters`: OCR engine, image cropper and baseline source
//! - `alignment`: Hebrew normalization and token/char diff
//! - `core`: Priority gate, worker pool, stop rule, orchestrator
//! - `domain`: Verses, witnesses, regions, jobs, run state, taam
//! - `ingest`: YAML manifests
//! - `reconcile`: Split, confidence, cascade and remap
//! - `store`: SQLite persistence
//! - `taam`: Cantillation alignment and consensus
//! - `telemetry`: Resource sampling and throttling
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Load witnesses, pages and regions
//! mesorah ingest manifest.yaml
//!
//! # Run every witness through every stage
//! mesorah batch
//!
//! # Inspect progress
//! mesorah status
//! ```

pub mod adapters;
pub mod alignment;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod reconcile;
pub mod store;
pub mod taam;
pub mod telemetry;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, PipelineError, PipelinePolicies, PriorityGate};
pub use domain::{Region, Stage, Verse, VerseId, VerseRange, Witness, WitnessVerse, WorkingVerseText};
pub use ingest::{ingest_manifest, Manifest};
pub use store::{Store, StoreConfig, StoreError};
