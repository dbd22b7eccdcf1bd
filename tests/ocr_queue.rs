//! OCR Queue Integration Tests
//!
//! Concurrent workers draining the sqlite job table.

mod common;

use std::collections::HashSet;
use std::path::PathBuf;

use mesorah::domain::{CascadeGroup, JobStatus};

use common::{add_region, genesis_verses, harness, seeded_store, witness, ScriptedOcr};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_workers_never_share_a_job() {
    let store = seeded_store();
    store
        .upsert_witness(&witness("aleppo", Some(1), Some(CascadeGroup::A), 0.95))
        .unwrap();

    let text = genesis_verses()[0].baseline_text.clone();
    let mut pages = Vec::new();
    for n in 0..12 {
        let region_id = format!("aleppo-r{}", n);
        add_region(&store, "aleppo", &region_id, "Genesis 1:1", "Genesis 1:1");
        pages.push((PathBuf::from(format!("/scans/{}.png", region_id)), text.clone()));
    }

    let h = harness(store, ScriptedOcr::new(pages));
    let queued = h.orchestrator.enqueue_witness("aleppo").unwrap();
    assert_eq!(queued.len(), 12);

    let report = h.orchestrator.work_ocr(50).await.unwrap();
    assert_eq!(report.workers, 2);
    assert!(report.errors.is_empty());
    assert_eq!(report.outputs.len(), 12);
    assert_eq!(h.ocr.calls(), 12);

    let executed: HashSet<&str> = report.outputs.iter().map(|o| o.job_id.as_str()).collect();
    assert_eq!(executed.len(), 12);

    for job in h.orchestrator.store().list_jobs(None).unwrap() {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1, "job {} claimed more than once", job.id);
    }
}
