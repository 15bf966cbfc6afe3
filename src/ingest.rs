//! Ingestion orchestrator.
//!
//! Drives each image through normalize → extract → validate → persist,
//! records the terminal outcome, and aggregates a batch report. A failed
//! image never aborts its siblings; the only batch-fatal condition is an
//! empty folder. Folder mode archives successfully processed images so the
//! next run does not see them again; in-memory mode has no durable source to
//! move. Images run strictly one at a time; the storage handle is a single
//! logical writer.

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::extractor::ReceiptExtractor;
use crate::{source, validate};

/// Pipeline stage an image was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Normalizing,
    Extracting,
    Validating,
    Persisting,
}

/// Terminal outcome for one image.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Succeeded { receipt_id: i64 },
    Failed { stage: Stage, reason: String },
}

/// One image's line in the batch report.
#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub image: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Aggregated result of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<ImageReport>,
}

impl BatchReport {
    fn new() -> Self {
        Self {
            batch_id: format!("batch_{}", Uuid::new_v4().simple()),
            succeeded: 0,
            failed: 0,
            results: Vec::new(),
        }
    }

    fn record(&mut self, image: String, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded { .. } => self.succeeded += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
        self.results.push(ImageReport { image, outcome });
    }

    /// Pretty-printed UTF-8 JSON, non-ASCII preserved.
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Split report text for a front end with a message-size limit (chat
/// delivery). Boundaries are counted in characters, never splitting one.
pub fn chunk_for_delivery(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;

    for ch in text.chars() {
        if count == limit {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// The pipeline core: owns the storage handle and the per-run report.
pub struct Ingestor {
    db: Database,
    archive_subdir: String,
}

impl Ingestor {
    pub fn new(db: Database, archive_subdir: impl Into<String>) -> Self {
        Self {
            db,
            archive_subdir: archive_subdir.into(),
        }
    }

    /// Folder-mode batch: every supported image under `dir`, one at a time.
    ///
    /// Succeeded images move to the archive subfolder; failed images stay in
    /// place for inspection and retry on the next run.
    pub async fn run_folder(
        &self,
        extractor: &dyn ReceiptExtractor,
        dir: &Path,
    ) -> PipelineResult<BatchReport> {
        let paths = source::scan_folder(dir)?;
        let archive_dir = dir.join(&self.archive_subdir);
        let mut report = BatchReport::new();

        info!(
            "batch {}: {} image(s) in {}",
            report.batch_id,
            paths.len(),
            dir.display()
        );

        for path in paths {
            let image_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());

            let outcome = match self.process_file(extractor, &path).await {
                Ok(receipt_id) => {
                    if let Err(e) = source::archive(&path, &archive_dir) {
                        // The receipt is committed; a stuck source file only
                        // risks reprocessing on the next run.
                        warn!("could not archive {}: {e}", path.display());
                    }
                    Outcome::Succeeded { receipt_id }
                }
                Err((stage, e)) => {
                    warn!("{image_name} failed while {stage:?}: {e}");
                    Outcome::Failed {
                        stage,
                        reason: e.to_string(),
                    }
                }
            };
            report.record(image_name, outcome);
        }

        info!(
            "batch {} done: {} succeeded, {} failed",
            report.batch_id, report.succeeded, report.failed
        );
        Ok(report)
    }

    /// Single-image mode for an ephemeral buffer (chat attachment). No
    /// archive move; there is no durable source file.
    pub async fn run_bytes(
        &self,
        extractor: &dyn ReceiptExtractor,
        image_name: &str,
        bytes: &[u8],
    ) -> BatchReport {
        let mut report = BatchReport::new();

        let outcome = match self.process_bytes(extractor, bytes).await {
            Ok(receipt_id) => Outcome::Succeeded { receipt_id },
            Err((stage, e)) => {
                warn!("{image_name} failed while {stage:?}: {e}");
                Outcome::Failed {
                    stage,
                    reason: e.to_string(),
                }
            }
        };
        report.record(image_name.to_string(), outcome);
        report
    }

    async fn process_file(
        &self,
        extractor: &dyn ReceiptExtractor,
        path: &Path,
    ) -> Result<i64, (Stage, PipelineError)> {
        let bytes = source::load_normalized(path).map_err(|e| (Stage::Normalizing, e))?;
        self.pipeline(extractor, &bytes).await
    }

    async fn process_bytes(
        &self,
        extractor: &dyn ReceiptExtractor,
        bytes: &[u8],
    ) -> Result<i64, (Stage, PipelineError)> {
        let normalized = source::normalize_bytes(bytes).map_err(|e| (Stage::Normalizing, e))?;
        self.pipeline(extractor, &normalized).await
    }

    async fn pipeline(
        &self,
        extractor: &dyn ReceiptExtractor,
        bytes: &[u8],
    ) -> Result<i64, (Stage, PipelineError)> {
        let candidate = extractor
            .extract(bytes)
            .await
            .map_err(|e| (Stage::Extracting, e))?;
        let (receipt, items) = validate::validate(candidate).map_err(|e| (Stage::Validating, e))?;
        let receipt_id = self
            .db
            .insert_receipt(&receipt, &items)
            .map_err(|e| (Stage::Persisting, e))?;
        Ok(receipt_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ExtractionResult;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::path::PathBuf;

    /// Stub that replays a canned model response, or a canned error.
    struct StubExtractor {
        response: &'static str,
    }

    #[async_trait]
    impl ReceiptExtractor for StubExtractor {
        async fn extract(&self, _image_bytes: &[u8]) -> PipelineResult<ExtractionResult> {
            crate::extractor::parse_response(self.response)
        }
    }

    const GOOD_RESPONSE: &str = r#"{"store": "ローソン", "genre": "コンビニ", "datetime": "2024-05-01T12:30:00", "total": 640, "items": [{"name": "おにぎり", "price": 140}]}"#;

    fn tiny_png() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            10,
            10,
            image::Rgb([255, 255, 255]),
        ));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("receipt-kanri-{tag}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();
        db
    }

    #[tokio::test]
    async fn corrupt_image_fails_alone_and_is_not_archived() {
        let dir = temp_dir("batch");
        for name in ["01.png", "02.png", "04.png", "05.png"] {
            std::fs::write(dir.join(name), tiny_png()).unwrap();
        }
        std::fs::write(dir.join("03.png"), b"definitely not a png").unwrap();

        let db = test_db();
        let ingestor = Ingestor::new(db.clone(), "archive");
        let extractor = StubExtractor {
            response: GOOD_RESPONSE,
        };

        let report = ingestor.run_folder(&extractor, &dir).await.unwrap();
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 1);

        let failed: Vec<_> = report
            .results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].image, "03.png");

        // The corrupt image stays for inspection; the others are archived.
        assert!(dir.join("03.png").exists());
        for name in ["01.png", "02.png", "04.png", "05.png"] {
            assert!(!dir.join(name).exists());
            assert!(dir.join("archive").join(name).exists());
        }

        let rows = db
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM receipts", [], |r| r.get::<_, i64>(0)))
            .unwrap();
        assert_eq!(rows, 4);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn empty_folder_aborts_the_batch() {
        let dir = temp_dir("empty");
        let ingestor = Ingestor::new(test_db(), "archive");
        let extractor = StubExtractor {
            response: GOOD_RESPONSE,
        };

        let err = ingestor.run_folder(&extractor, &dir).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoImagesFound(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn buffer_mode_succeeds_without_touching_any_file() {
        let db = test_db();
        let ingestor = Ingestor::new(db.clone(), "archive");
        let extractor = StubExtractor {
            response: GOOD_RESPONSE,
        };

        let report = ingestor
            .run_bytes(&extractor, "attachment.png", &tiny_png())
            .await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 0);
        assert!(matches!(
            report.results[0].outcome,
            Outcome::Succeeded { receipt_id: 1 }
        ));
    }

    #[tokio::test]
    async fn no_receipt_outcome_is_reported_distinctly() {
        let ingestor = Ingestor::new(test_db(), "archive");
        let extractor = StubExtractor {
            response: "レシートが含まれていません",
        };

        let report = ingestor
            .run_bytes(&extractor, "cat.png", &tiny_png())
            .await;
        assert_eq!(report.failed, 1);
        match &report.results[0].outcome {
            Outcome::Failed { stage, reason } => {
                assert_eq!(*stage, Stage::Extracting);
                assert!(reason.contains("does not contain a receipt"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_failure_is_per_item() {
        let ingestor = Ingestor::new(test_db(), "archive");
        // Valid JSON object, but no store field.
        let extractor = StubExtractor {
            response: r#"{"genre": "コンビニ", "datetime": "2024-05-01T12:30", "total": 100, "items": []}"#,
        };

        let report = ingestor
            .run_bytes(&extractor, "blur.png", &tiny_png())
            .await;
        match &report.results[0].outcome {
            Outcome::Failed { stage, reason } => {
                assert_eq!(*stage, Stage::Validating);
                assert!(reason.contains("store"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn report_json_preserves_non_ascii() {
        let mut report = BatchReport::new();
        report.record(
            "レシート.jpg".to_string(),
            Outcome::Succeeded { receipt_id: 7 },
        );
        let json = report.to_pretty_json();
        assert!(json.contains("レシート.jpg"));
        assert!(json.contains("\"succeeded\": 1"));
    }

    #[test]
    fn chunking_respects_the_character_limit() {
        let text = "a".repeat(4500);
        let chunks = chunk_for_delivery(&text, 2000);
        assert_eq!(
            chunks.iter().map(String::len).collect::<Vec<_>>(),
            vec![2000, 2000, 500]
        );
    }

    #[test]
    fn chunking_never_splits_a_character() {
        let text = "あ".repeat(2500);
        let chunks = chunk_for_delivery(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 2000);
        assert_eq!(chunks[1].chars().count(), 500);
    }
}
