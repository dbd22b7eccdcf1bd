//! Witnesses, scanned pages and tagged regions.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::verse::{VerseId, VerseRange};

/// A text source with fixed authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Witness {
    pub id: String,

    pub name: String,

    pub witness_type: WitnessType,

    /// Rank in the authority ordering (1 = highest). `None` is unconstrained.
    pub priority_tier: Option<u32>,

    /// Authority weight in [0, 1]
    pub authority_weight: f64,

    /// Cascade family this witness competes in
    pub cascade_group: Option<CascadeGroup>,
}

impl Witness {
    pub fn is_baseline(&self) -> bool {
        self.witness_type == WitnessType::DigitalBaseline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WitnessType {
    /// Scanned manuscript pages, text produced by OCR
    Manuscript,

    /// Existing OCR or human transcription
    Transcript,

    /// Digital baseline edition
    DigitalBaseline,
}

impl WitnessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manuscript => "manuscript",
            Self::Transcript => "transcript",
            Self::DigitalBaseline => "digital_baseline",
        }
    }
}

impl FromStr for WitnessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manuscript" => Ok(Self::Manuscript),
            "transcript" => Ok(Self::Transcript),
            "digital_baseline" | "baseline" => Ok(Self::DigitalBaseline),
            other => Err(format!("unknown witness type '{}'", other)),
        }
    }
}

/// Authority family used by the cascade selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CascadeGroup {
    A,
    B,
}

impl CascadeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

impl FromStr for CascadeGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(Self::A),
            "B" | "b" => Ok(Self::B),
            other => Err(format!("unknown cascade group '{}'", other)),
        }
    }
}

/// Region / witness-verse availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegionStatus {
    #[default]
    Ok,
    Partial,
    Unavailable,
    Failed,
}

impl RegionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Unavailable => "unavailable",
            Self::Failed => "failed",
        }
    }

    /// Whether text in this state may be used by the cascade
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Ok | Self::Partial)
    }
}

impl FromStr for RegionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "partial" => Ok(Self::Partial),
            "unavailable" => Ok(Self::Unavailable),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown region status '{}'", other)),
        }
    }
}

impl fmt::Display for RegionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scanned page image belonging to a witness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub witness_id: String,
    pub path: PathBuf,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Units a bounding box is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BBoxUnits {
    #[default]
    Pixel,
    /// Fractions of page width/height in [0, 1]
    Normalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub units: BBoxUnits,
}

/// A tagged rectangular area of a page mapped to a verse range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub page_id: String,
    pub witness_id: String,
    pub bbox: BBox,
    pub start_verse: Option<VerseId>,
    pub end_verse: Option<VerseId>,
    pub status: RegionStatus,

    /// Latest OCR output for this region
    pub ocr_text: Option<String>,
    pub ocr_confidence: Option<f64>,

    #[serde(default)]
    pub remap: RemapState,
}

impl Region {
    /// Tagged verse range (both ends required)
    pub fn verse_range(&self) -> Option<VerseRange> {
        match (&self.start_verse, &self.end_verse) {
            (Some(start), Some(end)) => Some(VerseRange::new(start.clone(), end.clone())),
            _ => None,
        }
    }
}

/// Remap bookkeeping carried on a region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RemapState {
    pub review_required: bool,

    /// Top window candidates retained for human review
    #[serde(default)]
    pub candidates: Vec<RemapCandidate>,

    /// Range the region was tagged with before the last reassignment
    pub previous_range: Option<VerseRange>,

    pub score: Option<f64>,
    pub margin: Option<f64>,
    pub remapped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemapCandidate {
    pub range: VerseRange,
    pub score: f64,
}
