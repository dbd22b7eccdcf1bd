//! Image cropper interface and the ImageMagick subprocess implementation.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::domain::{BBox, BBoxUnits};

/// Result of cropping one region
#[derive(Debug, Clone, PartialEq)]
pub struct CropOutput {
    pub crop_path: PathBuf,
    pub width: u32,
    pub height: u32,

    /// SHA-256 of the crop file (hex)
    pub content_hash: String,

    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum CropError {
    #[error("Bounding box has non-finite coordinates")]
    NonFinite,

    #[error("Bounding box has zero or negative size")]
    Degenerate,

    #[error("Bounding box {0} lies outside the page")]
    OutOfBounds(String),

    #[error("Page dimensions unavailable: {0}")]
    UnknownDimensions(String),

    #[error("Image tool not found: {0}")]
    ToolNotFound(String),

    #[error("Image tool failed with code {code}: {stderr}")]
    ToolFailed { code: i32, stderr: String },

    #[error("Image tool timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CropError {
    /// Whether the failure is a rejected input box rather than a tool problem
    pub fn is_invalid_box(&self) -> bool {
        matches!(self, Self::NonFinite | Self::Degenerate | Self::OutOfBounds(_))
    }
}

/// Integer pixel rectangle inside a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Tolerance for normalized boxes that touch the page edge
const EDGE_EPSILON: f64 = 1e-6;

/// Convert a pixel or normalized bbox to a pixel rectangle on a
/// `page_width` x `page_height` page, rejecting anything that does not fit.
pub fn normalize_bbox(bbox: &BBox, page_width: u32, page_height: u32) -> Result<PixelRect, CropError> {
    let coords = [bbox.x, bbox.y, bbox.width, bbox.height];
    if coords.iter().any(|v| !v.is_finite()) {
        return Err(CropError::NonFinite);
    }
    if bbox.width <= 0.0 || bbox.height <= 0.0 {
        return Err(CropError::Degenerate);
    }
    if page_width == 0 || page_height == 0 {
        return Err(CropError::UnknownDimensions("page has zero size".into()));
    }

    let (pw, ph) = (page_width as f64, page_height as f64);
    let (x, y, w, h) = match bbox.units {
        BBoxUnits::Pixel => (bbox.x, bbox.y, bbox.width, bbox.height),
        BBoxUnits::Normalized => {
            let fits = bbox.x >= 0.0
                && bbox.y >= 0.0
                && bbox.x + bbox.width <= 1.0 + EDGE_EPSILON
                && bbox.y + bbox.height <= 1.0 + EDGE_EPSILON;
            if !fits {
                return Err(CropError::OutOfBounds(describe(bbox)));
            }
            (bbox.x * pw, bbox.y * ph, bbox.width * pw, bbox.height * ph)
        }
    };

    if x < 0.0 || y < 0.0 || x + w > pw + EDGE_EPSILON || y + h > ph + EDGE_EPSILON {
        return Err(CropError::OutOfBounds(describe(bbox)));
    }

    let left = x.floor();
    let top = y.floor();
    let right = (x + w).ceil().min(pw);
    let bottom = (y + h).ceil().min(ph);
    if right - left < 1.0 || bottom - top < 1.0 {
        return Err(CropError::Degenerate);
    }

    Ok(PixelRect {
        x: left as u32,
        y: top as u32,
        width: (right - left) as u32,
        height: (bottom - top) as u32,
    })
}

fn describe(bbox: &BBox) -> String {
    format!(
        "({}, {}, {}x{} {:?})",
        bbox.x, bbox.y, bbox.width, bbox.height, bbox.units
    )
}

/// Trait for region croppers
#[async_trait]
pub trait ImageCropper: Send + Sync {
    async fn crop(&self, page_path: &Path, bbox: &BBox, out_dir: &Path) -> Result<CropOutput, CropError>;
}

/// ImageMagick via subprocess
pub struct MagickCropper {
    binary_path: String,
    timeout: Duration,
}

impl Default for MagickCropper {
    fn default() -> Self {
        Self::new("magick", Duration::from_secs(60))
    }
}

impl MagickCropper {
    pub fn new(binary_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout,
        }
    }

    async fn exec(&self, args: &[String]) -> Result<Vec<u8>, CropError> {
        let child = Command::new(&self.binary_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => CropError::ToolNotFound(self.binary_path.clone()),
                _ => CropError::Io(e),
            })?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CropError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            return Err(CropError::ToolFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Page dimensions as reported by `identify`
    pub async fn dimensions(&self, page_path: &Path) -> Result<(u32, u32), CropError> {
        let out = self
            .exec(&[
                "identify".to_string(),
                "-format".to_string(),
                "%w %h".to_string(),
                page_path.to_string_lossy().to_string(),
            ])
            .await?;
        let text = String::from_utf8_lossy(&out);
        let mut parts = text.split_whitespace().map(str::parse::<u32>);
        match (parts.next(), parts.next()) {
            (Some(Ok(w)), Some(Ok(h))) => Ok((w, h)),
            _ => Err(CropError::UnknownDimensions(format!(
                "cannot read size of {}",
                page_path.display()
            ))),
        }
    }
}

#[async_trait]
impl ImageCropper for MagickCropper {
    async fn crop(&self, page_path: &Path, bbox: &BBox, out_dir: &Path) -> Result<CropOutput, CropError> {
        let (page_width, page_height) = self.dimensions(page_path).await?;
        let rect = normalize_bbox(bbox, page_width, page_height)?;

        tokio::fs::create_dir_all(out_dir).await?;
        let stem = page_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "page".to_string());
        let crop_path = out_dir.join(format!(
            "{}_{}_{}_{}x{}.png",
            stem, rect.x, rect.y, rect.width, rect.height
        ));

        self.exec(&[
            page_path.to_string_lossy().to_string(),
            "-crop".to_string(),
            format!("{}x{}+{}+{}", rect.width, rect.height, rect.x, rect.y),
            "+repage".to_string(),
            crop_path.to_string_lossy().to_string(),
        ])
        .await?;

        let bytes = tokio::fs::read(&crop_path).await?;
        let content_hash = hex::encode(Sha256::digest(&bytes));

        let mut metadata = BTreeMap::new();
        metadata.insert("page_width".to_string(), page_width.to_string());
        metadata.insert("page_height".to_string(), page_height.to_string());
        metadata.insert("tool".to_string(), self.binary_path.clone());

        Ok(CropOutput {
            crop_path,
            width: rect.width,
            height: rect.height,
            content_hash,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f64, y: f64, width: f64, height: f64, units: BBoxUnits) -> BBox {
        BBox {
            x,
            y,
            width,
            height,
            units,
        }
    }

    #[test]
    fn test_normalized_box_scaled_to_page() {
        let rect = normalize_bbox(&bbox(0.1, 0.25, 0.5, 0.5, BBoxUnits::Normalized), 1000, 2000).unwrap();
        assert_eq!(
            rect,
            PixelRect {
                x: 100,
                y: 500,
                width: 500,
                height: 1000
            }
        );
    }

    #[test]
    fn test_pixel_box_passes_through() {
        let rect = normalize_bbox(&bbox(10.4, 20.0, 100.2, 50.0, BBoxUnits::Pixel), 400, 400).unwrap();
        assert_eq!(rect.x, 10);
        assert_eq!(rect.width, 101);
        assert_eq!(rect.height, 50);
    }

    #[test]
    fn test_rejects_bad_boxes() {
        assert!(matches!(
            normalize_bbox(&bbox(f64::NAN, 0.0, 1.0, 1.0, BBoxUnits::Pixel), 10, 10),
            Err(CropError::NonFinite)
        ));
        assert!(matches!(
            normalize_bbox(&bbox(0.0, 0.0, 0.0, 1.0, BBoxUnits::Pixel), 10, 10),
            Err(CropError::Degenerate)
        ));
        assert!(matches!(
            normalize_bbox(&bbox(0.8, 0.0, 0.5, 0.5, BBoxUnits::Normalized), 10, 10),
            Err(CropError::OutOfBounds(_))
        ));
        assert!(matches!(
            normalize_bbox(&bbox(5.0, 5.0, 10.0, 1.0, BBoxUnits::Pixel), 10, 10),
            Err(CropError::OutOfBounds(_))
        ));
        assert!(matches!(
            normalize_bbox(&bbox(-1.0, 0.0, 2.0, 2.0, BBoxUnits::Pixel), 10, 10),
            Err(CropError::OutOfBounds(_))
        ));
        assert!(CropError::NonFinite.is_invalid_box());
        assert!(!CropError::Timeout(1).is_invalid_box());
    }
}
