//! Shared fixtures for integration tests: in-memory store, fake OCR engine
//! and cropper, and an orchestrator wired to them.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use mesorah::adapters::{CropError, CropOutput, ImageCropper, OcrError, OcrExecutor, OcrOutput};
use mesorah::core::{JsonlPatchLog, Orchestrator, PipelinePolicies, RetryPolicy};
use mesorah::domain::{
    BBox, BBoxUnits, CascadeGroup, Page, Region, RegionStatus, RemapState, Verse, VerseId, Witness,
    WitnessType,
};
use mesorah::store::Store;
use mesorah::telemetry::{ResourceSample, ResourceSampler, TelemetryConfig, ThrottleController};

pub fn v(id: &str) -> VerseId {
    id.parse().unwrap()
}

/// Genesis 1:1-3 with their baseline texts
pub fn genesis_verses() -> Vec<Verse> {
    [
        ("Genesis 1:1", "בראשית ברא אלהים את השמים ואת הארץ"),
        ("Genesis 1:2", "והארץ היתה תהו ובהו וחשך על פני תהום"),
        ("Genesis 1:3", "ויאמר אלהים יהי אור ויהי אור"),
    ]
    .into_iter()
    .map(|(id, text)| Verse {
        id: v(id),
        baseline_text: text.to_string(),
    })
    .collect()
}

pub fn genesis_text() -> String {
    genesis_verses()
        .iter()
        .map(|v| v.baseline_text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn witness(id: &str, tier: Option<u32>, group: Option<CascadeGroup>, authority: f64) -> Witness {
    Witness {
        id: id.to_string(),
        name: id.to_string(),
        witness_type: WitnessType::Manuscript,
        priority_tier: tier,
        authority_weight: authority,
        cascade_group: group,
    }
}

pub fn seeded_store() -> Store {
    let store = Store::open_in_memory().unwrap();
    for verse in genesis_verses() {
        store.upsert_verse(&verse).unwrap();
    }
    store
}

/// One page with one region tagged `start..=end`
pub fn add_region(store: &Store, witness_id: &str, region_id: &str, start: &str, end: &str) -> Region {
    let page = Page {
        id: format!("{}-page", region_id),
        witness_id: witness_id.to_string(),
        path: PathBuf::from(format!("/scans/{}.png", region_id)),
        width: Some(1000),
        height: Some(1000),
    };
    store.upsert_page(&page).unwrap();

    let region = Region {
        id: region_id.to_string(),
        page_id: page.id,
        witness_id: witness_id.to_string(),
        bbox: BBox {
            x: 0.1,
            y: 0.1,
            width: 0.5,
            height: 0.5,
            units: BBoxUnits::Normalized,
        },
        start_verse: Some(v(start)),
        end_verse: Some(v(end)),
        status: RegionStatus::Ok,
        ocr_text: None,
        ocr_confidence: None,
        remap: RemapState::default(),
    };
    store.upsert_region(&region).unwrap();
    region
}

/// Cropper that hands back the page path untouched
pub struct PassthroughCropper;

#[async_trait]
impl ImageCropper for PassthroughCropper {
    async fn crop(&self, page_path: &Path, _bbox: &BBox, _out_dir: &Path) -> Result<CropOutput, CropError> {
        Ok(CropOutput {
            crop_path: page_path.to_path_buf(),
            width: 500,
            height: 500,
            content_hash: "fake".to_string(),
            metadata: BTreeMap::new(),
        })
    }
}

/// OCR engine answering from a table keyed by image path; unknown paths fail
pub struct ScriptedOcr {
    texts: HashMap<PathBuf, String>,
    pub calls: AtomicUsize,
}

impl ScriptedOcr {
    pub fn new(texts: impl IntoIterator<Item = (PathBuf, String)>) -> Self {
        Self {
            texts: texts.into_iter().collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrExecutor for ScriptedOcr {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, image_path: &Path) -> Result<OcrOutput, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.texts.get(image_path) {
            Some(text) => Ok(OcrOutput {
                text_raw: text.clone(),
                mean_confidence: 0.95,
                coverage_estimate: 1.0,
                char_count: text.chars().count(),
                engine: "scripted".to_string(),
            }),
            None => Err(OcrError::UnparsableOutput(format!(
                "no text for {}",
                image_path.display()
            ))),
        }
    }
}

/// Sampler reporting an idle process
pub struct IdleSampler;

impl ResourceSampler for IdleSampler {
    fn sample(&mut self) -> Option<ResourceSample> {
        Some(ResourceSample {
            rss_bytes: 64 * 1024 * 1024,
            memory_budget_bytes: 8 * 1024 * 1024 * 1024,
            cpu_percent: 5.0,
        })
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub patch_log: Arc<JsonlPatchLog>,
    pub ocr: Arc<ScriptedOcr>,
    pub temp: TempDir,
}

pub fn harness(store: Store, ocr: ScriptedOcr) -> Harness {
    let temp = TempDir::new().unwrap();
    let patch_log = Arc::new(JsonlPatchLog::open(temp.path().join("patches.jsonl")).unwrap());
    let ocr = Arc::new(ocr);
    let throttle = Arc::new(ThrottleController::new(
        TelemetryConfig::default(),
        Box::new(IdleSampler),
    ));

    let policies = PipelinePolicies {
        ocr_retry: RetryPolicy {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
        },
        crop_dir: temp.path().join("crops"),
        ..PipelinePolicies::default()
    };

    let orchestrator = Orchestrator::new(
        store,
        patch_log.clone(),
        Arc::new(PassthroughCropper),
        ocr.clone(),
        throttle,
        policies,
    );

    Harness {
        orchestrator,
        patch_log,
        ocr,
        temp,
    }
}
