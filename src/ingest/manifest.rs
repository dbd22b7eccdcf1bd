//! YAML ingest manifests.
//!
//! A manifest declares verses (with their baseline texts), witnesses, the
//! scanned pages of each witness, tagged regions on those pages and optional
//! direct witness texts. Everything is validated into an [`IngestPlan`]
//! before the first write, so a bad manifest leaves the store untouched.
//!
//! ```yaml
//! verses:
//!   - id: "Genesis 1:1"
//!     text: "בראשית ברא אלהים"
//! witnesses:
//!   - id: aleppo
//!     name: Aleppo Codex
//!     type: manuscript
//!     priority_tier: 1
//!     authority_weight: 0.95
//!     cascade_group: A
//!     pages:
//!       - id: aleppo-1
//!         path: scans/aleppo-001.jpg
//!       - glob: "scans/extra-*.jpg"
//!     regions:
//!       - page: aleppo-1
//!         bbox: { x: 0.1, y: 0.1, width: 0.4, height: 0.2, units: normalized }
//!         start: "Genesis 1:1"
//!         end: "Genesis 1:3"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::adapters::normalize_bbox;
use crate::core::PipelineError;
use crate::domain::{
    BBox, BBoxUnits, CascadeGroup, Page, Region, RegionStatus, RemapState, Verse, VerseId,
    Witness, WitnessType, WitnessVerse,
};
use crate::reconcile::split::observe;
use crate::store::Store;

/// Parsed manifest file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub verses: Vec<VerseEntry>,

    #[serde(default)]
    pub witnesses: Vec<WitnessEntry>,

    /// Directory relative page paths and globs resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerseEntry {
    pub id: VerseId,

    /// Baseline text; fetched from the baseline source when omitted
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WitnessEntry {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "type")]
    pub witness_type: WitnessType,

    #[serde(default)]
    pub priority_tier: Option<u32>,

    pub authority_weight: f64,

    #[serde(default)]
    pub cascade_group: Option<CascadeGroup>,

    #[serde(default)]
    pub pages: Vec<PageEntry>,

    #[serde(default)]
    pub regions: Vec<RegionEntry>,

    #[serde(default)]
    pub texts: Vec<TextEntry>,
}

/// A single page file or a glob pattern expanding to many
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PageEntry {
    Glob {
        glob: String,
    },
    File {
        #[serde(default)]
        id: Option<String>,
        path: PathBuf,
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub page: String,
    pub bbox: BBox,
    #[serde(default)]
    pub start: Option<VerseId>,
    #[serde(default)]
    pub end: Option<VerseId>,
}

/// Direct text for one verse (transcriptions, digital witnesses)
#[derive(Debug, Clone, Deserialize)]
pub struct TextEntry {
    pub verse: VerseId,
    pub text: String,
    #[serde(default = "default_clarity")]
    pub clarity: f64,
}

fn default_clarity() -> f64 {
    1.0
}

impl Manifest {
    /// Read and parse a manifest. Relative paths resolve against its directory.
    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Execution(format!("failed to read manifest {}: {}", path.display(), e))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&content, base_dir)
    }

    pub fn from_yaml(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let mut manifest: Manifest = serde_yaml::from_str(content)
            .map_err(|e| PipelineError::Validation(format!("invalid manifest: {}", e)))?;
        manifest.base_dir = base_dir.into();
        Ok(manifest)
    }

    /// Verses declared without a baseline text
    pub fn missing_baselines(&self) -> Vec<VerseId> {
        self.verses
            .iter()
            .filter(|v| v.text.is_none())
            .map(|v| v.id.clone())
            .collect()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Validate the manifest against the store and build the write plan.
    ///
    /// `fetched` supplies baseline texts for verses the manifest leaves blank.
    pub fn plan(
        &self,
        store: &Store,
        fetched: &HashMap<VerseId, String>,
    ) -> Result<IngestPlan, PipelineError> {
        let verses = self.plan_verses(fetched)?;
        let known: HashMap<&VerseId, &Verse> = verses.iter().map(|v| (&v.id, v)).collect();

        let mut plan = IngestPlan {
            verses: verses.clone(),
            ..IngestPlan::default()
        };

        self.check_tiers(store)?;

        let mut page_ids = HashSet::new();
        let mut region_ids = HashSet::new();
        let mut witness_ids = HashSet::new();

        for entry in &self.witnesses {
            if entry.id.trim().is_empty() {
                return Err(invalid("witness id must not be empty"));
            }
            if !witness_ids.insert(entry.id.as_str()) {
                return Err(invalid(format!("duplicate witness '{}'", entry.id)));
            }
            if !(0.0..=1.0).contains(&entry.authority_weight) {
                return Err(invalid(format!(
                    "witness '{}' authority weight {} is outside [0, 1]",
                    entry.id, entry.authority_weight
                )));
            }

            let witness = Witness {
                id: entry.id.clone(),
                name: entry.name.clone().unwrap_or_else(|| entry.id.clone()),
                witness_type: entry.witness_type,
                priority_tier: entry.priority_tier,
                authority_weight: entry.authority_weight,
                cascade_group: entry.cascade_group,
            };

            let pages = self.expand_pages(entry)?;
            for page in &pages {
                if !page_ids.insert(page.id.clone()) {
                    return Err(invalid(format!("duplicate page '{}'", page.id)));
                }
                if let Some(existing) = store.get_page(&page.id)? {
                    if existing.witness_id != entry.id {
                        return Err(invalid(format!(
                            "page '{}' already belongs to witness '{}'",
                            page.id, existing.witness_id
                        )));
                    }
                }
            }

            for (index, region_entry) in entry.regions.iter().enumerate() {
                let page = match pages.iter().find(|p| p.id == region_entry.page) {
                    Some(page) => page.clone(),
                    None => match store.get_page(&region_entry.page)? {
                        Some(page) if page.witness_id == entry.id => page,
                        _ => {
                            return Err(invalid(format!(
                                "region {} of witness '{}' references unknown page '{}'",
                                index + 1,
                                entry.id,
                                region_entry.page
                            )))
                        }
                    },
                };

                let region = plan_region(store, &known, entry, &page, index, region_entry)?;
                if !region_ids.insert(region.id.clone()) {
                    return Err(invalid(format!("duplicate region '{}'", region.id)));
                }
                plan.regions.push(region);
            }

            for text in &entry.texts {
                let verse = lookup_verse(store, &known, &text.verse)?;
                if !(0.0..=1.0).contains(&text.clarity) {
                    return Err(invalid(format!(
                        "text clarity {} for {} is outside [0, 1]",
                        text.clarity, text.verse
                    )));
                }
                plan.texts
                    .push(observe(&witness, &verse, &text.text, text.clarity, RegionStatus::Ok));
            }

            plan.pages.extend(pages);
            plan.witnesses.push(witness);
        }

        Ok(plan)
    }

    fn plan_verses(&self, fetched: &HashMap<VerseId, String>) -> Result<Vec<Verse>, PipelineError> {
        let mut seen = HashSet::new();
        let mut verses = Vec::with_capacity(self.verses.len());
        for entry in &self.verses {
            if !seen.insert(&entry.id) {
                return Err(invalid(format!("duplicate verse '{}'", entry.id)));
            }
            let text = match (&entry.text, fetched.get(&entry.id)) {
                (Some(text), _) | (None, Some(text)) => text.clone(),
                (None, None) => {
                    return Err(invalid(format!("verse '{}' has no baseline text", entry.id)))
                }
            };
            verses.push(Verse {
                id: entry.id.clone(),
                baseline_text: text,
            });
        }
        Ok(verses)
    }

    /// Priority tiers must stay unique across the manifest and the store
    fn check_tiers(&self, store: &Store) -> Result<(), PipelineError> {
        let ours: HashSet<&str> = self.witnesses.iter().map(|w| w.id.as_str()).collect();
        let mut holders: HashMap<u32, String> = store
            .list_witnesses()?
            .into_iter()
            .filter(|w| !ours.contains(w.id.as_str()))
            .filter_map(|w| w.priority_tier.map(|tier| (tier, w.id)))
            .collect();

        for entry in &self.witnesses {
            let Some(tier) = entry.priority_tier else {
                continue;
            };
            if let Some(holder) = holders.insert(tier, entry.id.clone()) {
                return Err(invalid(format!(
                    "priority tier {} is claimed by both '{}' and '{}'",
                    tier, holder, entry.id
                )));
            }
        }
        Ok(())
    }

    fn expand_pages(&self, entry: &WitnessEntry) -> Result<Vec<Page>, PipelineError> {
        let mut pages = Vec::new();
        for page in &entry.pages {
            match page {
                PageEntry::File {
                    id,
                    path,
                    width,
                    height,
                } => {
                    let id = match id {
                        Some(id) => id.clone(),
                        None => derived_page_id(&entry.id, path)?,
                    };
                    pages.push(Page {
                        id,
                        witness_id: entry.id.clone(),
                        path: self.resolve(path),
                        width: *width,
                        height: *height,
                    });
                }
                PageEntry::Glob { glob: pattern } => {
                    let full = self.resolve(Path::new(pattern));
                    let full = full.to_string_lossy();
                    let entries = glob::glob(&full).map_err(|e| {
                        invalid(format!("invalid page pattern '{}': {}", pattern, e))
                    })?;

                    let mut matched = Vec::new();
                    for path in entries {
                        let path = path.map_err(|e| {
                            PipelineError::Execution(format!("failed to expand '{}': {}", pattern, e))
                        })?;
                        if path.is_file() {
                            matched.push(path);
                        }
                    }
                    if matched.is_empty() {
                        return Err(invalid(format!(
                            "page pattern '{}' for witness '{}' matched no files",
                            pattern, entry.id
                        )));
                    }
                    matched.sort();

                    for path in matched {
                        pages.push(Page {
                            id: derived_page_id(&entry.id, &path)?,
                            witness_id: entry.id.clone(),
                            path,
                            width: None,
                            height: None,
                        });
                    }
                }
            }
        }
        Ok(pages)
    }
}

/// Everything a manifest writes, already validated
#[derive(Debug, Clone, Default)]
pub struct IngestPlan {
    pub verses: Vec<Verse>,
    pub witnesses: Vec<Witness>,
    pub pages: Vec<Page>,
    pub regions: Vec<Region>,
    pub texts: Vec<WitnessVerse>,
}

impl IngestPlan {
    /// Write the plan: verses, witnesses, pages, regions, then texts
    pub fn apply(&self, store: &Store) -> Result<(), PipelineError> {
        for verse in &self.verses {
            store.upsert_verse(verse)?;
        }
        for witness in &self.witnesses {
            store.upsert_witness(witness)?;
        }
        for page in &self.pages {
            store.upsert_page(page)?;
        }
        for region in &self.regions {
            store.upsert_region(region)?;
        }
        for row in &self.texts {
            store.upsert_witness_verse(row)?;
        }
        Ok(())
    }

    /// Witness ids in gate order: tiered ascending, then untiered by id
    pub fn witness_order(&self) -> Vec<String> {
        let mut witnesses: Vec<&Witness> = self.witnesses.iter().collect();
        witnesses.sort_by(|a, b| {
            let key = |w: &Witness| (w.priority_tier.is_none(), w.priority_tier, w.id.clone());
            key(a).cmp(&key(b))
        });
        witnesses.into_iter().map(|w| w.id.clone()).collect()
    }
}

fn plan_region(
    store: &Store,
    known: &HashMap<&VerseId, &Verse>,
    entry: &WitnessEntry,
    page: &Page,
    index: usize,
    region: &RegionEntry,
) -> Result<Region, PipelineError> {
    let id = region
        .id
        .clone()
        .unwrap_or_else(|| format!("{}-r{}", page.id, index + 1));

    validate_bbox(&region.bbox, page).map_err(|reason| {
        invalid(format!("region '{}' has a malformed bbox: {}", id, reason))
    })?;

    let (start, end) = match (&region.start, &region.end) {
        (Some(start), Some(end)) => (start.clone(), end.clone()),
        _ => {
            return Err(invalid(format!(
                "region '{}' needs both start and end verses",
                id
            )))
        }
    };
    if start > end {
        return Err(invalid(format!(
            "region '{}' starts at {} after its end {}",
            id, start, end
        )));
    }
    if start.book != end.book {
        return Err(invalid(format!("region '{}' spans more than one book", id)));
    }
    lookup_verse(store, known, &start)?;
    lookup_verse(store, known, &end)?;

    Ok(Region {
        id,
        page_id: page.id.clone(),
        witness_id: entry.id.clone(),
        bbox: region.bbox,
        start_verse: Some(start),
        end_verse: Some(end),
        status: RegionStatus::Ok,
        ocr_text: None,
        ocr_confidence: None,
        remap: RemapState::default(),
    })
}

fn lookup_verse(
    store: &Store,
    known: &HashMap<&VerseId, &Verse>,
    id: &VerseId,
) -> Result<Verse, PipelineError> {
    if let Some(verse) = known.get(id) {
        return Ok((*verse).clone());
    }
    store
        .get_verse(id)?
        .ok_or_else(|| invalid(format!("unknown verse '{}'", id)))
}

/// Shape checks; against the page size when it is known
fn validate_bbox(bbox: &BBox, page: &Page) -> Result<(), String> {
    if let (Some(width), Some(height)) = (page.width, page.height) {
        return normalize_bbox(bbox, width, height)
            .map(|_| ())
            .map_err(|e| e.to_string());
    }

    let coords = [bbox.x, bbox.y, bbox.width, bbox.height];
    if coords.iter().any(|v| !v.is_finite()) {
        return Err("non-finite coordinates".into());
    }
    if bbox.width <= 0.0 || bbox.height <= 0.0 {
        return Err("zero or negative size".into());
    }
    if bbox.x < 0.0 || bbox.y < 0.0 {
        return Err("negative origin".into());
    }
    if bbox.units == BBoxUnits::Normalized && (bbox.x + bbox.width > 1.0 || bbox.y + bbox.height > 1.0)
    {
        return Err("normalized box extends past the page".into());
    }
    Ok(())
}

fn derived_page_id(witness_id: &str, path: &Path) -> Result<String, PipelineError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| invalid(format!("cannot derive a page id from {}", path.display())))?;
    Ok(format!("{}-{}", witness_id, stem))
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Validation(message.into())
}
