//! Reconciliation Integration Tests
//!
//! Cascade selection, confidence recomputation, remap and taam consensus
//! against a real (in-memory) store.

mod common;

use serde_json::json;

use mesorah::core::JsonlPatchLog;
use mesorah::domain::{CascadeGroup, RegionStatus, SelectedSource, Verse, WorkingVerseText};
use mesorah::reconcile::cascade::{DISAGREEMENT_FLAG, HIGH_CONFIDENCE_DISAGREEMENT};
use mesorah::reconcile::split::observe;
use mesorah::reconcile::{recompute_witness, run_cascade, split_witness, CascadeThresholds, RemapOutcome, SplitPolicy};
use mesorah::taam::MISSING_TAAM_SIGNAL;

use common::{add_region, harness, seeded_store, v, witness, ScriptedOcr};

#[test]
fn test_confident_disagreement_caps_ensemble() {
    let temp = tempfile::TempDir::new().unwrap();
    let patch_log = JsonlPatchLog::open(temp.path().join("patches.jsonl")).unwrap();
    let store = seeded_store();

    let a = witness("aleppo", Some(1), Some(CascadeGroup::A), 0.95);
    let b = witness("leningrad", Some(2), Some(CascadeGroup::B), 0.9);
    store.upsert_witness(&a).unwrap();
    store.upsert_witness(&b).unwrap();

    let verse = store.get_verse(&v("Genesis 1:1")).unwrap().unwrap();
    let mut row_a = observe(&a, &verse, &verse.baseline_text, 0.9, RegionStatus::Ok);
    row_a.confidence = 0.91;
    let mut row_b = observe(&b, &verse, "ויאמר משה אל העם לאמר", 0.9, RegionStatus::Ok);
    row_b.confidence = 0.88;
    store.upsert_witness_verse(&row_a).unwrap();
    store.upsert_witness_verse(&row_b).unwrap();

    let working = run_cascade(&store, &patch_log, &verse.id, &CascadeThresholds::default()).unwrap();

    assert_eq!(working.selected_source, SelectedSource::Witness("aleppo".into()));
    assert!(working.flags.iter().any(|f| f == DISAGREEMENT_FLAG));
    assert!(working
        .reason_codes
        .iter()
        .any(|r| r == HIGH_CONFIDENCE_DISAGREEMENT));
    assert!(working.ensemble_confidence <= 0.7);

    // Full overwrite of the single working row, append to the log
    let stored = store.get_working_text(&verse.id).unwrap().unwrap();
    assert_eq!(stored.selected_source, working.selected_source);
    assert_eq!(stored.text_hash, working.text_hash);
    run_cascade(&store, &patch_log, &verse.id, &CascadeThresholds::default()).unwrap();
    assert_eq!(store.list_working_texts().unwrap().len(), 1);
    assert_eq!(patch_log.history(&verse.id).unwrap().len(), 2);
}

#[test]
fn test_recompute_keeps_foreign_artifact_keys() {
    let store = seeded_store();
    let cairo = witness("cairo", Some(1), Some(CascadeGroup::A), 0.8);
    store.upsert_witness(&cairo).unwrap();

    let verse = store.get_verse(&v("Genesis 1:2")).unwrap().unwrap();
    let mut row = observe(&cairo, &verse, &verse.baseline_text, 0.7, RegionStatus::Ok);
    row.artifacts.confidence_inputs = None;
    row.artifacts
        .extra
        .insert("reviewer_note".into(), json!({"by": "editor", "ok": true}));
    store.upsert_witness_verse(&row).unwrap();

    // Authority changes, so the stored confidence must move
    let cairo = witness("cairo", Some(1), Some(CascadeGroup::A), 0.2);
    store.upsert_witness(&cairo).unwrap();
    let touched = recompute_witness(&store, "cairo", None).unwrap();
    assert_eq!(touched, vec![v("Genesis 1:2")]);

    let after = store
        .get_witness_verse(&v("Genesis 1:2"), "cairo")
        .unwrap()
        .unwrap();
    assert!(after.confidence < row.confidence);
    assert_eq!(
        after.artifacts.extra.get("reviewer_note"),
        Some(&json!({"by": "editor", "ok": true}))
    );
    assert_eq!(after.artifacts.confidence_inputs.unwrap().authority, 0.2);
    assert_eq!(after.artifacts.diff_ops, row.artifacts.diff_ops);
}

#[tokio::test]
async fn test_remap_reassigns_and_backfills() {
    let store = seeded_store();
    store
        .upsert_witness(&witness("cairo", Some(1), Some(CascadeGroup::A), 0.8))
        .unwrap();
    // Tagged to 1:1 but the page actually holds 1:3
    add_region(&store, "cairo", "cairo-r1", "Genesis 1:1", "Genesis 1:1");
    store
        .set_region_ocr("cairo-r1", "ויאמר אלהים יהי אור ויהי אור", 0.9, RegionStatus::Ok)
        .unwrap();
    split_witness(&store, "cairo", &SplitPolicy::default()).unwrap();

    let h = harness(store, ScriptedOcr::new([]));
    let report = h.orchestrator.remapper().remap_region("cairo-r1").unwrap();

    assert_eq!(report.outcome, RemapOutcome::Reassigned);
    assert_eq!(report.new_range.as_ref().unwrap().start, v("Genesis 1:3"));
    assert!(report.margin.unwrap() >= 0.08);
    assert_eq!(report.backfilled, vec![v("Genesis 1:1"), v("Genesis 1:3")]);

    let store = h.orchestrator.store();
    let region = store.require_region("cairo-r1").unwrap();
    assert_eq!(region.start_verse, Some(v("Genesis 1:3")));
    assert!(!region.remap.review_required);
    assert_eq!(
        region.remap.previous_range.unwrap().start,
        v("Genesis 1:1")
    );

    let old_row = store.get_witness_verse(&v("Genesis 1:1"), "cairo").unwrap().unwrap();
    assert_eq!(old_row.status, RegionStatus::Unavailable);
    let new_row = store.get_witness_verse(&v("Genesis 1:3"), "cairo").unwrap().unwrap();
    assert_eq!(new_row.match_score, 1.0);

    let moved_to = store.get_working_text(&v("Genesis 1:3")).unwrap().unwrap();
    assert_eq!(moved_to.selected_source, SelectedSource::Witness("cairo".into()));
    let moved_from = store.get_working_text(&v("Genesis 1:1")).unwrap().unwrap();
    assert_eq!(moved_from.selected_source, SelectedSource::Baseline);
}

#[tokio::test]
async fn test_ambiguous_remap_requires_review() {
    let store = seeded_store();
    for id in ["Exodus 1:1", "Exodus 1:2"] {
        store
            .upsert_verse(&Verse {
                id: v(id),
                baseline_text: "ויהי ערב ויהי בקר יום אחד".into(),
            })
            .unwrap();
    }
    store
        .upsert_witness(&witness("cairo", Some(1), Some(CascadeGroup::A), 0.8))
        .unwrap();
    add_region(&store, "cairo", "cairo-r1", "Exodus 1:2", "Exodus 1:2");
    store
        .set_region_ocr("cairo-r1", "ויהי ערב ויהי בקר יום אחד", 0.9, RegionStatus::Ok)
        .unwrap();

    let h = harness(store, ScriptedOcr::new([]));
    let report = h.orchestrator.remap_witness("cairo").await.unwrap();

    assert_eq!(report.len(), 1);
    assert_eq!(report[0].outcome, RemapOutcome::ReviewRequired);
    assert_eq!(report[0].margin, Some(0.0));

    let region = h.orchestrator.store().require_region("cairo-r1").unwrap();
    assert!(region.remap.review_required);
    assert_eq!(region.start_verse, Some(v("Exodus 1:2")));
    assert!(!region.remap.candidates.is_empty());
    assert!(region.remap.candidates.len() <= 3);
    assert_eq!(region.remap.candidates[0].score, 1.0);
}

#[tokio::test]
async fn test_taam_consensus_ignores_stale_alignments() {
    let store = seeded_store();
    let verse_id = v("Genesis 1:3");
    for (id, tier) in [("aleppo", 1), ("leningrad", 2)] {
        let w = witness(id, Some(tier), Some(CascadeGroup::A), 0.9);
        store.upsert_witness(&w).unwrap();
        let verse = store.get_verse(&verse_id).unwrap().unwrap();
        // Pointed text with two cantillation marks
        let row = observe(&w, &verse, "וַיֹּ֥אמֶר אֱלֹהִ֖ים יְהִ֣י א֑וֹר", 0.9, RegionStatus::Ok);
        store.upsert_witness_verse(&row).unwrap();
    }

    let h = harness(store, ScriptedOcr::new([]));
    h.orchestrator.cascade_verse(&verse_id).unwrap();

    let aligned = h.orchestrator.taam_align(vec![verse_id.clone()]).await.unwrap();
    assert_eq!(aligned.outputs[0].len(), 2);

    let fresh = h
        .orchestrator
        .taam_consensus(vec![verse_id.clone()])
        .await
        .unwrap();
    assert!(fresh.outputs[0].consensus_count() > 0);
    assert!(!fresh.outputs[0].flags.iter().any(|f| f == MISSING_TAAM_SIGNAL));

    // The working text moves on; stored alignments now point at an old hash
    let store = h.orchestrator.store();
    let mut working: WorkingVerseText = store.get_working_text(&verse_id).unwrap().unwrap();
    working.surface_text = "ויאמר אלהים יהי אור".into();
    working.normalized_text = working.surface_text.clone();
    working.text_hash = mesorah::alignment::text_hash(&working.normalized_text);
    store.upsert_working_text(&working).unwrap();

    let stale = h
        .orchestrator
        .taam_consensus(vec![verse_id.clone()])
        .await
        .unwrap();
    let consensus = &stale.outputs[0];
    assert_eq!(consensus.consensus_count(), 0);
    assert!(consensus.flags.iter().any(|f| f == MISSING_TAAM_SIGNAL));
    assert_eq!(consensus.metrics.stale_alignments, 2);
    assert_eq!(consensus.target_text_hash, working.text_hash);
}
