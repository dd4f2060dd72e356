//! `tesseract` OCR backend. Reads the image on stdin and parses TSV word
//! boxes.

use async_trait::async_trait;

use super::{unsupported, Backend, BackendError, Operation, Output, ProbeFailure, ProcessRunner};
use crate::types::{BackendId, OperationClass, Rect, TextElement};

const PROGRAM: &str = "tesseract";

/// Words at or below this confidence are dropped.
pub const MIN_CONFIDENCE: u32 = 30;

pub struct TesseractBackend {
    runner: ProcessRunner,
}

impl TesseractBackend {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

/// Parse `tesseract ... tsv` output into word elements. The TSV columns are
/// `level page_num block_num par_num line_num word_num left top width height
/// conf text`.
pub fn parse_tsv(tsv: &str) -> Vec<TextElement> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 {
                return None;
            }
            let text = cols[11].trim();
            if text.is_empty() {
                return None;
            }
            let conf = cols[10].trim().parse::<f64>().ok()?;
            if conf <= MIN_CONFIDENCE as f64 {
                return None;
            }
            Some(TextElement {
                text: text.to_string(),
                bbox: Rect::new(
                    cols[6].parse().ok()?,
                    cols[7].parse().ok()?,
                    cols[8].parse().ok()?,
                    cols[9].parse().ok()?,
                ),
                confidence: conf.round() as u32,
            })
        })
        .collect()
}

#[async_trait]
impl Backend for TesseractBackend {
    fn id(&self) -> BackendId {
        BackendId::Tesseract
    }

    fn supports(&self, class: OperationClass) -> bool {
        class == OperationClass::Ocr
    }

    async fn probe(&self, _class: OperationClass) -> Result<(), ProbeFailure> {
        let output = self.runner.probe(PROGRAM, &["--version"]).await?;
        // Older releases print the version banner on stderr.
        let banner = format!("{}{}", output.stdout_str(), output.stderr);
        if !banner.to_lowercase().contains("tesseract") {
            return Err(ProbeFailure::invalid_result("unrecognised --version output"));
        }
        Ok(())
    }

    async fn execute(&self, op: Operation) -> Result<Output, BackendError> {
        let image = match op {
            Operation::Ocr { image } => image,
            other => return Err(unsupported(self.id(), &other)),
        };

        let output = self
            .runner
            .run_with_input(
                PROGRAM,
                &["stdin", "stdout", "-l", "eng", "tsv"],
                Some(image.bytes.as_slice()),
            )
            .await?;
        if !output.success() {
            return Err(BackendError(format!(
                "Tesseract failed: {}",
                output.stderr.trim()
            )));
        }

        let elements = parse_tsv(&output.stdout_str());
        tracing::debug!(words = elements.len(), "OCR finished");
        Ok(Output::Text(elements))
    }
}
