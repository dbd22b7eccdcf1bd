//! Pipeline Integration Tests
//!
//! Manifest ingest through the OCR worker pool, split, confidence and
//! cascade, driven by a scripted OCR engine.

mod common;

use std::path::Path;

use mesorah::core::{BatchCounters, StopRule};
use mesorah::domain::{JobStatus, RegionStatus, SelectedSource, Stage, StageStatus};
use mesorah::ingest::{ingest_manifest, Manifest};
use mesorah::reconcile::cascade::{TIER_A_B_AGREE, TIER_B_UNAVAILABLE};

use common::{add_region, genesis_text, harness, seeded_store, v, witness, ScriptedOcr};

fn manifest_yaml() -> String {
    format!(
        r#"
verses:
  - id: "Genesis 1:1"
    text: "בראשית ברא אלהים את השמים ואת הארץ"
  - id: "Genesis 1:2"
    text: "והארץ היתה תהו ובהו וחשך על פני תהום"
  - id: "Genesis 1:3"
    text: "ויאמר אלהים יהי אור ויהי אור"
witnesses:
  - id: aleppo
    name: Aleppo Codex
    type: manuscript
    priority_tier: 1
    authority_weight: 0.95
    cascade_group: A
    pages:
      - id: aleppo-1
        path: scans/aleppo.png
        width: 1000
        height: 1000
    regions:
      - id: aleppo-r1
        page: aleppo-1
        bbox: {{ x: 0.1, y: 0.1, width: 0.8, height: 0.5, units: normalized }}
        start: "Genesis 1:1"
        end: "Genesis 1:3"
  - id: leningrad
    type: manuscript
    priority_tier: 2
    authority_weight: 0.9
    cascade_group: B
    pages:
      - id: leningrad-1
        path: scans/leningrad.png
    regions:
      - id: leningrad-r1
        page: leningrad-1
        bbox: {{ x: 10, y: 10, width: 400, height: 300 }}
        start: "Genesis 1:1"
        end: "Genesis 1:3"
"#
    )
}

fn scripted_for(base: &Path) -> ScriptedOcr {
    ScriptedOcr::new([
        (base.join("scans/aleppo.png"), genesis_text()),
        (base.join("scans/leningrad.png"), genesis_text()),
    ])
}

#[tokio::test]
async fn test_manifest_to_working_text() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = mesorah::store::Store::open_in_memory().unwrap();
    let h = harness(store, scripted_for(temp.path()));
    let orchestrator = &h.orchestrator;

    let manifest = Manifest::from_yaml(&manifest_yaml(), temp.path()).unwrap();
    let ingested = ingest_manifest(orchestrator, &manifest, None, false)
        .await
        .unwrap();
    assert_eq!(ingested.verses, 3);
    assert_eq!(ingested.regions, 2);
    assert_eq!(ingested.stages.len(), 2);
    assert!(ingested.skipped.is_empty());

    let batch = orchestrator.run_batch(false).await.unwrap();
    assert!(!batch.stopped(), "unexpected stop: {:?}", batch.stop);
    assert!(batch.skipped.is_empty(), "skipped: {:?}", batch.skipped);
    assert_eq!(batch.stages.len(), 6);
    assert_eq!(batch.counters.ocr_completed, 2);
    assert_eq!(batch.counters.split_success, 2);
    assert_eq!(h.ocr.calls(), 2);

    let store = orchestrator.store();
    for verse in ["Genesis 1:1", "Genesis 1:2", "Genesis 1:3"] {
        let row = store
            .get_witness_verse(&v(verse), "aleppo")
            .unwrap()
            .unwrap();
        assert_eq!(row.match_score, 1.0, "{verse}");
        assert_eq!(row.status, RegionStatus::Ok);
        assert_eq!(row.artifacts.source_region_id.as_deref(), Some("aleppo-r1"));

        let working = store.get_working_text(&v(verse)).unwrap().unwrap();
        assert_eq!(working.selected_source, SelectedSource::Witness("aleppo".into()));
        assert!(working.reason_codes.iter().any(|r| r == TIER_A_B_AGREE));
        assert!(working.flags.is_empty());
    }

    // One commit when aleppo finished, one when leningrad joined
    let history = h.patch_log.history(&v("Genesis 1:2")).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0]
        .payload
        .reason_codes
        .iter()
        .any(|r| r == TIER_B_UNAVAILABLE));

    for witness_id in ["aleppo", "leningrad"] {
        let run = store.get_run_state(witness_id).unwrap();
        for stage in Stage::ALL {
            assert_eq!(run.status(stage), StageStatus::Completed, "{witness_id} {stage}");
        }
    }

    // Everything done: a second batch has nothing to run
    let again = orchestrator.run_batch(false).await.unwrap();
    assert!(again.stages.is_empty());
    assert_eq!(h.ocr.calls(), 2);
}

#[tokio::test]
async fn test_invalid_manifest_writes_nothing() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = mesorah::store::Store::open_in_memory().unwrap();
    let h = harness(store, scripted_for(temp.path()));

    let yaml = manifest_yaml().replace("page: leningrad-1", "page: leningrad-9");
    let manifest = Manifest::from_yaml(&yaml, temp.path()).unwrap();
    let err = ingest_manifest(&h.orchestrator, &manifest, None, false)
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 2);

    let store = h.orchestrator.store();
    assert!(store.list_verses().unwrap().is_empty());
    assert!(store.list_witnesses().unwrap().is_empty());
}

#[tokio::test]
async fn test_ocr_failures_trip_stop_rule() {
    let store = seeded_store();
    store
        .upsert_witness(&witness("cairo", Some(1), Some(mesorah::domain::CascadeGroup::A), 0.8))
        .unwrap();
    for i in 1..=5 {
        add_region(&store, "cairo", &format!("cairo-r{}", i), "Genesis 1:3", "Genesis 1:3");
    }

    // Only three of five crops produce text
    let ocr = ScriptedOcr::new((1..=3).map(|i| {
        (
            format!("/scans/cairo-r{}.png", i).into(),
            "ויאמר אלהים יהי אור ויהי אור".to_string(),
        )
    }));
    let h = harness(store, ocr);
    let orchestrator = &h.orchestrator;

    orchestrator
        .run_stage("cairo", Stage::Ingest, false)
        .await
        .unwrap();
    let report = orchestrator
        .run_stage("cairo", Stage::Ocr, false)
        .await
        .unwrap();

    assert!(report.stopped());
    assert_eq!(report.counters.ocr_completed, 3);
    assert_eq!(report.counters.ocr_failed, 2);
    let stop = report.stop.as_ref().unwrap();
    assert!(stop.reasons[0].contains("OCR failure rate 0.40"));

    let store = orchestrator.store();
    let run = store.get_run_state("cairo").unwrap();
    assert_eq!(run.status(Stage::Ocr), StageStatus::Failed);
    assert!(run.stages[&Stage::Ocr]
        .error
        .as_deref()
        .unwrap()
        .starts_with("stop rule"));

    let failed = store.list_jobs(Some(JobStatus::Failed)).unwrap();
    assert_eq!(failed.len(), 2);
    for job in failed {
        assert_eq!(job.attempts, 1);
        assert!(job.error.unwrap().contains("no text for"));
    }

    // A halted stage never completes, so split stays sequenced behind it
    assert!(orchestrator
        .run_stage("cairo", Stage::Split, false)
        .await
        .unwrap_err()
        .is_blocked());
}

#[tokio::test]
async fn test_batch_halts_with_explained_stop() {
    let store = seeded_store();
    store
        .upsert_witness(&witness("cairo", Some(1), Some(mesorah::domain::CascadeGroup::A), 0.8))
        .unwrap();
    store
        .upsert_witness(&witness("sassoon", Some(2), Some(mesorah::domain::CascadeGroup::B), 0.7))
        .unwrap();
    add_region(&store, "cairo", "cairo-r1", "Genesis 1:1", "Genesis 1:1");
    add_region(&store, "sassoon", "sassoon-r1", "Genesis 1:1", "Genesis 1:1");

    let h = harness(store, ScriptedOcr::new([]));
    let batch = h.orchestrator.run_batch(false).await.unwrap();

    assert!(batch.stopped());
    let stop = batch.stop.unwrap();
    assert_eq!(stop.ocr_failure_rate, 1.0);
    // cairo halted at OCR; sassoon never got past ingest
    let sassoon = h.orchestrator.store().get_run_state("sassoon").unwrap();
    assert_ne!(sassoon.status(Stage::Ocr), StageStatus::Completed);
}

#[test]
fn test_stop_rule_eighty_twenty() {
    let counters = BatchCounters {
        ocr_completed: 80,
        ocr_failed: 20,
        ..BatchCounters::default()
    };
    let decision = StopRule::default().evaluate(&counters);
    assert!(decision.stop);
    assert!((decision.ocr_failure_rate - 0.20).abs() < 1e-9);
    assert!(decision.reasons[0].contains("0.20"));
}
