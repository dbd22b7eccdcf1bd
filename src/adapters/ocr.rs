//! OCR executor interface and the Tesseract subprocess implementation.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Output of one OCR run
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub text_raw: String,

    /// Mean word confidence in [0, 1]
    pub mean_confidence: f64,

    /// Fraction of detected word boxes that produced text, in [0, 1]
    pub coverage_estimate: f64,

    pub char_count: usize,
    pub engine: String,
}

/// Distinct OCR failure kinds
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine not found: {binary}")]
    EngineNotFound { binary: String },

    #[error("OCR timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("OCR exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Unparsable OCR output: {0}")]
    UnparsableOutput(String),

    #[error("Failed to run OCR engine: {0}")]
    Spawn(String),
}

impl OcrError {
    /// Failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NonZeroExit { .. })
    }
}

/// Trait for OCR engines
#[async_trait]
pub trait OcrExecutor: Send + Sync {
    /// Engine name recorded with each result
    fn name(&self) -> &str;

    /// Recognize text in an image
    async fn run(&self, image_path: &Path) -> Result<OcrOutput, OcrError>;
}

/// Tesseract via subprocess with TSV output
pub struct TesseractExecutor {
    binary_path: String,
    language: String,
    timeout: Duration,
}

impl Default for TesseractExecutor {
    fn default() -> Self {
        Self::new("tesseract", "heb", Duration::from_secs(120))
    }
}

impl TesseractExecutor {
    pub fn new(binary_path: impl Into<String>, language: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            language: language.into(),
            timeout,
        }
    }
}

#[async_trait]
impl OcrExecutor for TesseractExecutor {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn run(&self, image_path: &Path) -> Result<OcrOutput, OcrError> {
        let child = Command::new(&self.binary_path)
            .arg(image_path)
            .arg("stdout")
            .args(["-l", &self.language, "tsv"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => OcrError::EngineNotFound {
                    binary: self.binary_path.clone(),
                },
                _ => OcrError::Spawn(e.to_string()),
            })?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OcrError::Timeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| OcrError::Spawn(e.to_string()))?;

        if !output.status.success() {
            return Err(OcrError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| OcrError::UnparsableOutput("output is not valid UTF-8".into()))?;
        let parsed = parse_tsv(&stdout, self.name())?;
        debug!(
            image = %image_path.display(),
            chars = parsed.char_count,
            confidence = parsed.mean_confidence,
            "OCR finished"
        );
        Ok(parsed)
    }
}

const TSV_HEADER: [&str; 12] = [
    "level", "page_num", "block_num", "par_num", "line_num", "word_num", "left", "top", "width",
    "height", "conf", "text",
];

/// Parse Tesseract TSV into text plus quality estimates
pub fn parse_tsv(tsv: &str, engine: &str) -> Result<OcrOutput, OcrError> {
    let mut lines = tsv.lines();
    let header: Vec<&str> = lines
        .next()
        .map(|h| h.trim_end_matches('\r').split('\t').collect())
        .unwrap_or_default();
    if header != TSV_HEADER {
        return Err(OcrError::UnparsableOutput("missing TSV header".into()));
    }

    let mut text_lines: Vec<Vec<String>> = Vec::new();
    let mut current_line: Option<(u32, u32, u32, u32)> = None;
    let mut word_boxes = 0usize;
    let mut recognized = 0usize;
    let mut confidence_sum = 0.0;

    for (n, line) in lines.enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.splitn(12, '\t').collect();
        if cols.len() < 11 {
            return Err(OcrError::UnparsableOutput(format!(
                "row {} has {} columns",
                n + 2,
                cols.len()
            )));
        }

        let num = |i: usize| -> Result<u32, OcrError> {
            cols[i].parse().map_err(|_| {
                OcrError::UnparsableOutput(format!("row {} column {} is not a number", n + 2, i))
            })
        };
        if num(0)? != 5 {
            continue;
        }
        word_boxes += 1;

        let conf: f64 = cols[10].parse().map_err(|_| {
            OcrError::UnparsableOutput(format!("row {} has a non-numeric confidence", n + 2))
        })?;
        let word = cols.get(11).map(|w| w.trim()).unwrap_or("");
        if word.is_empty() || conf < 0.0 {
            continue;
        }

        recognized += 1;
        confidence_sum += conf.min(100.0);

        let key = (num(1)?, num(2)?, num(3)?, num(4)?);
        if current_line != Some(key) {
            text_lines.push(Vec::new());
            current_line = Some(key);
        }
        if let Some(words) = text_lines.last_mut() {
            words.push(word.to_string());
        }
    }

    let text_raw = text_lines
        .iter()
        .map(|words| words.join(" "))
        .collect::<Vec<_>>()
        .join("\n");

    let mean_confidence = if recognized == 0 {
        0.0
    } else {
        confidence_sum / recognized as f64 / 100.0
    };
    let coverage_estimate = if word_boxes == 0 {
        0.0
    } else {
        recognized as f64 / word_boxes as f64
    };

    Ok(OcrOutput {
        char_count: text_raw.chars().filter(|c| !c.is_whitespace()).count(),
        text_raw,
        mean_confidence,
        coverage_estimate,
        engine: engine.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_parse_tsv_words_and_lines() {
        let tsv = format!(
            "{}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n\
             5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t90\tבראשית\n\
             5\t1\t1\t1\t1\t2\t0\t0\t10\t10\t70\tברא\n\
             5\t1\t1\t1\t2\t1\t0\t0\t10\t10\t80\tאלהים\n\
             5\t1\t1\t1\t2\t2\t0\t0\t10\t10\t-1\t\n",
            HEADER
        );
        let out = parse_tsv(&tsv, "tesseract").unwrap();
        assert_eq!(out.text_raw, "בראשית ברא\nאלהים");
        assert!((out.mean_confidence - 0.8).abs() < 1e-9);
        assert!((out.coverage_estimate - 0.75).abs() < 1e-9);
        assert_eq!(out.char_count, 14);
    }

    #[test]
    fn test_parse_tsv_rejects_garbage() {
        assert!(matches!(
            parse_tsv("not tsv at all", "tesseract"),
            Err(OcrError::UnparsableOutput(_))
        ));
        let bad_row = format!("{}\n5\t1\tx\n", HEADER);
        assert!(matches!(
            parse_tsv(&bad_row, "tesseract"),
            Err(OcrError::UnparsableOutput(_))
        ));
    }

    #[test]
    fn test_empty_page_is_not_an_error() {
        let out = parse_tsv(&format!("{}\n", HEADER), "tesseract").unwrap();
        assert_eq!(out.text_raw, "");
        assert_eq!(out.mean_confidence, 0.0);
    }

    #[tokio::test]
    async fn test_missing_binary_is_engine_not_found() {
        let executor = TesseractExecutor::new(
            "/nonexistent/tesseract-binary",
            "heb",
            Duration::from_secs(5),
        );
        let result = executor.run(Path::new("page.png")).await;
        assert!(matches!(result, Err(OcrError::EngineNotFound { .. })));
    }

    #[test]
    fn test_transient_kinds() {
        assert!(OcrError::Timeout { seconds: 1 }.is_transient());
        assert!(!OcrError::EngineNotFound { binary: "x".into() }.is_transient());
        assert!(!OcrError::UnparsableOutput("x".into()).is_transient());
    }
}
