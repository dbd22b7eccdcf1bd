//! Command-line interface for mesorah.
//!
//! Every command is a thin wrapper over the library: it resolves the
//! configuration, opens the store and hands off to the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::adapters::{BaselineSource, HttpBaselineSource, MagickCropper, TesseractExecutor};
use crate::config::{self, ResolvedConfig};
use crate::core::{JsonlPatchLog, Orchestrator, PipelineError, StageReport};
use crate::domain::{JobStatus, Stage, VerseId};
use crate::ingest::{ingest_manifest, Manifest};
use crate::reconcile::split_witness;
use crate::store::Store;
use crate::telemetry::{classify, ThrottleController};

/// mesorah - witness reconciliation pipeline
#[derive(Parser, Debug)]
#[command(name = "mesorah")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (skips .mesorah/config.yaml discovery)
    #[arg(long, global = true, env = "MESORAH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a manifest and run the ingest stage for its witnesses
    Ingest {
        /// Manifest file (YAML)
        manifest: PathBuf,

        /// Proceed past priority blockers (recorded on the run state)
        #[arg(long = "override")]
        admin_override: bool,
    },

    /// Evaluate the priority gate without running the stage
    Gate {
        witness_id: String,
        stage: Stage,

        #[arg(long = "override")]
        admin_override: bool,
    },

    /// Run one stage for one witness
    Stage {
        witness_id: String,
        stage: Stage,

        #[arg(long = "override")]
        admin_override: bool,
    },

    /// Run every witness through every stage in priority order
    Batch {
        #[arg(long = "override")]
        admin_override: bool,
    },

    /// Manage the OCR job queue
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },

    /// Drain queued OCR jobs through the worker pool
    Work {
        /// Maximum number of jobs to process
        #[arg(short, long, default_value = "50")]
        budget: usize,
    },

    /// Re-split a witness's OCR'd regions into verse rows
    Split { witness_id: String },

    /// Recompute the working text of verses
    Cascade {
        /// Verse ids (e.g. "Genesis 1:1")
        verses: Vec<VerseId>,

        /// Every loaded verse
        #[arg(long, conflicts_with = "verses")]
        all: bool,
    },

    /// Re-evaluate verse tagging of OCR'd regions
    Remap {
        /// Witness whose regions are remapped
        #[arg(required_unless_present = "region")]
        witness_id: Option<String>,

        /// A single region instead of a whole witness
        #[arg(long)]
        region: Option<String>,
    },

    /// Taam alignment and consensus
    Taam {
        #[command(subcommand)]
        command: TaamCommands,
    },

    /// Show run states and queue counts
    Status {
        /// Limit to one witness
        witness_id: Option<String>,
    },

    /// Sample resources and show the throttle state
    Telemetry,

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// Queue OCR for every region of a witness
    Enqueue { witness_id: String },

    /// List OCR jobs
    List {
        #[arg(short, long)]
        status: Option<JobStatus>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Return stale running jobs to the queue
    RequeueStale {
        /// Staleness threshold (defaults to workers.stale_after_seconds)
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaamCommands {
    /// Project each witness's taam onto the target text
    Align {
        /// Verse ids (all verses with a working text when omitted)
        verses: Vec<VerseId>,
    },

    /// Vote taam consensus across witnesses
    Consensus { verses: Vec<VerseId> },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = match &self.config {
            Some(path) => config::load_config_from(Some(path))?,
            None => config::config()?.clone(),
        };
        let json = self.json;

        match self.command {
            Commands::Ingest {
                manifest,
                admin_override,
            } => ingest(&cfg, &manifest, admin_override, json).await,
            Commands::Gate {
                witness_id,
                stage,
                admin_override,
            } => {
                let orchestrator = open_orchestrator(&cfg)?;
                let decision = orchestrator
                    .gate()
                    .evaluate(&witness_id, stage, admin_override)
                    .await?;
                if json {
                    return print_json(&decision);
                }
                println!(
                    "{} {}: {}",
                    witness_id,
                    stage,
                    if decision.allowed { "allowed" } else { "blocked" }
                );
                if decision.override_used {
                    println!("  (admin override)");
                }
                for blocker in &decision.blockers {
                    println!("  blocker: {}", blocker);
                }
                if !decision.allowed {
                    return Err(PipelineError::Blocked {
                        witness_id,
                        stage,
                        blockers: decision.blockers,
                    }
                    .into());
                }
                Ok(())
            }
            Commands::Stage {
                witness_id,
                stage,
                admin_override,
            } => {
                let orchestrator = open_orchestrator(&cfg)?;
                let report = orchestrator
                    .run_stage(&witness_id, stage, admin_override)
                    .await?;
                if json {
                    print_json(&report)?;
                } else {
                    print_stage(&report);
                }
                if let Some(stop) = report.stop.as_ref().filter(|s| s.stop) {
                    anyhow::bail!("stop rule halted {}: {}", stage, stop.reasons.join("; "));
                }
                Ok(())
            }
            Commands::Batch { admin_override } => {
                let orchestrator = open_orchestrator(&cfg)?;
                let report = orchestrator.run_batch(admin_override).await?;
                if json {
                    print_json(&report)?;
                } else {
                    for stage in &report.stages {
                        print_stage(stage);
                    }
                    for skip in &report.skipped {
                        println!("skipped {} at {}: {}", skip.witness_id, skip.stage, skip.reason);
                        for blocker in &skip.blockers {
                            println!("  blocker: {}", blocker);
                        }
                    }
                }
                if let Some(stop) = report.stop.as_ref().filter(|s| s.stop) {
                    anyhow::bail!("batch halted by stop rule: {}", stop.reasons.join("; "));
                }
                Ok(())
            }
            Commands::Jobs { command } => jobs(&cfg, command, json).await,
            Commands::Work { budget } => {
                let orchestrator = open_orchestrator(&cfg)?;
                let report = orchestrator.work_ocr(budget).await?;
                if json {
                    return print_json(&report);
                }
                println!(
                    "{} workers ({}), {} recovered, {} processed",
                    report.workers,
                    report.throttle,
                    report.recovered,
                    report.processed()
                );
                for outcome in &report.outputs {
                    match &outcome.error {
                        Some(error) => println!("  {} failed: {}", outcome.job_id, error),
                        None => println!("  {} {}", outcome.job_id, outcome.status),
                    }
                }
                for error in &report.errors {
                    println!("  error: {}", error);
                }
                Ok(())
            }
            Commands::Split { witness_id } => {
                let store = open_store(&cfg)?;
                let summary = split_witness(&store, &witness_id, &cfg.settings.split)?;
                if json {
                    return print_json(&summary);
                }
                println!(
                    "{}: {} success, {} partial, {} skipped, {} verses",
                    witness_id,
                    summary.success,
                    summary.partial,
                    summary.skipped,
                    summary.touched.len()
                );
                Ok(())
            }
            Commands::Cascade { verses, all } => {
                let orchestrator = open_orchestrator(&cfg)?;
                let verses = if all {
                    orchestrator
                        .store()
                        .list_verses()?
                        .into_iter()
                        .map(|v| v.id)
                        .collect()
                } else {
                    verses
                };
                let mut results = Vec::with_capacity(verses.len());
                for verse in &verses {
                    results.push(orchestrator.cascade_verse(verse)?);
                }
                if json {
                    return print_json(&results);
                }
                println!("{:<24} {:<16} {:>6}  FLAGS", "VERSE", "SOURCE", "CONF");
                println!("{}", "-".repeat(70));
                for text in &results {
                    println!(
                        "{:<24} {:<16} {:>6.3}  {}",
                        text.verse_id.to_string(),
                        text.selected_source.to_string(),
                        text.ensemble_confidence,
                        text.flags.join(",")
                    );
                }
                Ok(())
            }
            Commands::Remap { witness_id, region } => {
                let orchestrator = open_orchestrator(&cfg)?;
                let reports = match (region, witness_id) {
                    (Some(region), _) => vec![orchestrator.remapper().remap_region(&region)?],
                    (None, Some(witness_id)) => orchestrator.remap_witness(&witness_id).await?,
                    (None, None) => anyhow::bail!("either a witness or --region is required"),
                };
                if json {
                    return print_json(&reports);
                }
                for report in &reports {
                    let range = |r: &Option<crate::domain::VerseRange>| {
                        r.as_ref().map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
                    };
                    println!(
                        "{}: {:?} {} -> {} (score {}, margin {})",
                        report.region_id,
                        report.outcome,
                        range(&report.previous_range),
                        range(&report.new_range),
                        fmt_opt(report.best_score),
                        fmt_opt(report.margin)
                    );
                }
                Ok(())
            }
            Commands::Taam { command } => {
                let orchestrator = open_orchestrator(&cfg)?;
                match command {
                    TaamCommands::Align { verses } => {
                        let report = orchestrator.taam_align(verses).await?;
                        if json {
                            return print_json(&report);
                        }
                        let alignments: usize = report.outputs.iter().map(Vec::len).sum();
                        println!(
                            "{} verses, {} witness alignments, {} errors",
                            report.outputs.len(),
                            alignments,
                            report.errors.len()
                        );
                    }
                    TaamCommands::Consensus { verses } => {
                        let report = orchestrator.taam_consensus(verses).await?;
                        if json {
                            return print_json(&report);
                        }
                        for consensus in &report.outputs {
                            println!(
                                "{:<24} {:>4} marks  {:.3}  {}",
                                consensus.verse_id.to_string(),
                                consensus.consensus_count(),
                                consensus.ensemble_confidence,
                                consensus.flags.join(",")
                            );
                        }
                    }
                }
                Ok(())
            }
            Commands::Status { witness_id } => status(&cfg, witness_id, json),
            Commands::Telemetry => {
                let throttle = ThrottleController::host(cfg.settings.telemetry.clone());
                let (state, sample) = throttle.refresh();
                if json {
                    return print_json(&serde_json::json!({ "state": state, "sample": sample }));
                }
                match sample {
                    Some(sample) => {
                        println!("RSS:    {} MiB", sample.rss_bytes / (1024 * 1024));
                        println!("Budget: {} MiB", sample.memory_budget_bytes / (1024 * 1024));
                        println!("Memory: {:.1}%", sample.memory_fraction() * 100.0);
                        println!("CPU:    {:.1}%", sample.cpu_percent);
                        println!("State:  {}", classify(&sample, throttle.config()));
                    }
                    None => println!("State:  {} (no sample)", state),
                }
                Ok(())
            }
            Commands::Config => show_config(&cfg, json),
        }
    }
}

/// Exit status for a failed command
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|e| e.downcast_ref::<PipelineError>())
        .map(PipelineError::exit_code)
        .unwrap_or(1)
}

fn open_store(cfg: &ResolvedConfig) -> Result<Store> {
    Store::open(&cfg.store_config())
        .with_context(|| format!("Failed to open store: {}", cfg.database.display()))
}

fn open_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let settings = &cfg.settings;
    let store = open_store(cfg)?;
    let patch_log = Arc::new(JsonlPatchLog::open(&cfg.patch_log)?);
    let cropper = Arc::new(MagickCropper::new(
        settings.cropper.binary.clone(),
        settings.cropper.timeout(),
    ));
    let ocr = Arc::new(TesseractExecutor::new(
        settings.ocr.binary.clone(),
        settings.ocr.language.clone(),
        settings.ocr.timeout(),
    ));
    let throttle = Arc::new(ThrottleController::host(settings.telemetry.clone()));

    Ok(Orchestrator::new(
        store,
        patch_log,
        cropper,
        ocr,
        throttle,
        cfg.policies(),
    ))
}

async fn ingest(cfg: &ResolvedConfig, path: &PathBuf, admin_override: bool, json: bool) -> Result<()> {
    let manifest = Manifest::from_path(path)?;
    let orchestrator = open_orchestrator(cfg)?;

    let baseline = match &cfg.settings.baseline.url_template {
        Some(template) => Some(HttpBaselineSource::new(
            template.clone(),
            cfg.settings.baseline.text_field.clone(),
            cfg.settings.baseline.timeout(),
            cfg.settings.baseline.retry.clone(),
        )?),
        None => None,
    };
    let source = baseline.as_ref().map(|s| s as &dyn BaselineSource);

    let report = ingest_manifest(&orchestrator, &manifest, source, admin_override).await?;
    if json {
        return print_json(&report);
    }

    println!(
        "Ingested {} verses, {} witnesses, {} pages, {} regions, {} texts",
        report.verses, report.witnesses, report.pages, report.regions, report.texts
    );
    if report.baselines_fetched > 0 {
        println!("Fetched {} baseline texts", report.baselines_fetched);
    }
    for stage in &report.stages {
        print_stage(stage);
    }
    for skip in &report.skipped {
        println!("  {} not ingested: {}", skip.witness_id, skip.reason);
    }
    Ok(())
}

async fn jobs(cfg: &ResolvedConfig, command: JobsCommands, json: bool) -> Result<()> {
    match command {
        JobsCommands::Enqueue { witness_id } => {
            let orchestrator = open_orchestrator(cfg)?;
            let results = orchestrator.enqueue_witness(&witness_id)?;
            let created = results.iter().filter(|r| r.is_created()).count();
            if json {
                return print_json(&serde_json::json!({
                    "jobs": results.iter().map(|r| r.job_id()).collect::<Vec<_>>(),
                    "created": created,
                }));
            }
            println!(
                "{}: {} jobs queued ({} new)",
                witness_id,
                results.len(),
                created
            );
        }
        JobsCommands::List { status, limit } => {
            let store = open_store(cfg)?;
            let jobs: Vec<_> = store.list_jobs(status)?.into_iter().take(limit).collect();
            if json {
                return print_json(&jobs);
            }
            if jobs.is_empty() {
                println!("No jobs found");
                return Ok(());
            }
            println!("{:<38} {:<24} {:<10} {:>3}  ERROR", "JOB ID", "REGION", "STATUS", "TRY");
            println!("{}", "-".repeat(90));
            for job in jobs {
                println!(
                    "{:<38} {:<24} {:<10} {:>3}  {}",
                    job.id,
                    job.region_id,
                    job.status.to_string(),
                    job.attempts,
                    job.error.unwrap_or_default()
                );
            }
        }
        JobsCommands::RequeueStale { seconds } => {
            let store = open_store(cfg)?;
            let stale_after = match seconds {
                Some(seconds) => std::time::Duration::from_secs(seconds),
                None => cfg.settings.workers.stale_after(),
            };
            let requeued = store.requeue_stale_jobs(stale_after)?;
            if json {
                return print_json(&requeued);
            }
            println!("Requeued {} stale jobs", requeued.len());
            for id in requeued {
                println!("  {}", id);
            }
        }
    }
    Ok(())
}

fn status(cfg: &ResolvedConfig, witness_id: Option<String>, json: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let mut runs = store.list_run_states()?;
    if let Some(id) = &witness_id {
        store.require_witness(id)?;
        runs.retain(|k, _| k == id);
    }
    let counts = store.job_counts()?;

    if json {
        return print_json(&serde_json::json!({ "runs": runs, "jobs": counts }));
    }

    let header: Vec<String> = Stage::ALL.iter().map(|s| format!("{:<12}", s.to_string())).collect();
    println!("{:<20} {}", "WITNESS", header.join(" "));
    println!("{}", "-".repeat(20 + 13 * Stage::ALL.len()));
    for (id, run) in &runs {
        let cells: Vec<String> = Stage::ALL
            .iter()
            .map(|s| {
                let mut cell = run.status(*s).to_string();
                if run.stages.get(s).is_some_and(|st| st.override_used) {
                    cell.push('*');
                }
                format!("{:<12}", cell)
            })
            .collect();
        println!("{:<20} {}", id, cells.join(" "));
    }
    println!();
    println!(
        "OCR jobs: {} queued, {} running, {} completed, {} failed",
        counts.queued, counts.running, counts.completed, counts.failed
    );
    Ok(())
}

fn show_config(cfg: &ResolvedConfig, json: bool) -> Result<()> {
    if json {
        return print_json(&cfg.settings);
    }
    let s = &cfg.settings;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Database:  {}", cfg.database.display());
    println!("  Patch log: {}", cfg.patch_log.display());
    println!("  Crops:     {}", cfg.crop_dir.display());
    println!();
    println!("OCR: {} ({}), timeout {}s, {} attempts", s.ocr.binary, s.ocr.language, s.ocr.timeout_seconds, s.ocr.retry.max_attempts);
    println!("Cropper: {}, timeout {}s", s.cropper.binary, s.cropper.timeout_seconds);
    println!("Baseline: {}", s.baseline.url_template.as_deref().unwrap_or("(manifest only)"));
    println!();
    println!("Cascade:");
    println!("  Tier A threshold:   {}", s.cascade.tier_a_threshold);
    println!("  Tier B threshold:   {}", s.cascade.tier_b_threshold);
    println!("  Disagreement match: {}", s.cascade.disagreement_match);
    println!("Remap: min score {}, min margin {}, window {}", s.remap.min_score, s.remap.min_margin, s.remap.max_window);
    println!("Stop rule: OCR failures > {}, split partials > {}", s.stop_rule.max_ocr_failure_rate, s.stop_rule.max_split_partial_rate);
    println!("Workers: batch {}, stale after {}s", s.workers.batch_size, s.workers.stale_after_seconds);

    Ok(())
}

fn print_stage(report: &StageReport) {
    let mut line = format!(
        "{} {}: {} verses",
        report.witness_id, report.stage, report.verses_touched
    );
    if report.gate.override_used {
        line.push_str(&format!(" (override, {} blockers)", report.gate.blockers.len()));
    }
    if let Some(stop) = report.stop.as_ref().filter(|s| s.stop) {
        line.push_str(&format!(" STOPPED: {}", stop.reasons.join("; ")));
    }
    println!("{}", line);
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fmt_opt(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.3}", v))
        .unwrap_or_else(|| "-".to_string())
}
