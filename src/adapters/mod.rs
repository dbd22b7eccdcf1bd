//! Adapter interfaces for external systems.
//!
//! Adapters wrap the collaborators the pipeline consumes but does not own:
//! the OCR engine, the image cropper and the digital baseline service. Each
//! is a trait with one subprocess or HTTP implementation.

pub mod baseline;
pub mod cropper;
pub mod ocr;

pub use baseline::{BaselineError, BaselineSource, HttpBaselineSource, StaticBaselineSource};
pub use cropper::{normalize_bbox, CropError, CropOutput, ImageCropper, MagickCropper, PixelRect};
pub use ocr::{parse_tsv, OcrError, OcrExecutor, OcrOutput, TesseractExecutor};
