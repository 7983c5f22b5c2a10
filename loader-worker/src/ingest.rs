//! The sequential half of the pipeline: read lines, map them to records and group the records
//! into batches for the submitter.
use std::path::{Path, PathBuf};

use loader_common::batch::{Batch, BatchAccumulator};
use loader_common::mapping::RecordMapper;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::LoaderError;
use crate::output::{AppendLog, MALFORMED_FILE_NAME};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub lines_read: u64,
    pub malformed: u64,
    pub batches: u64,
}

/// Reads an input file line by line, diverting malformed lines to the malformed log and handing
/// full batches to the submitter.
pub struct Ingestor {
    mapper: RecordMapper,
    accumulator: BatchAccumulator,
    malformed: AppendLog,
    /// Log every line read at info level instead of debug.
    trace_lines: bool,
}

impl Ingestor {
    pub async fn open(
        output_dir: &Path,
        mapper: RecordMapper,
        accumulator: BatchAccumulator,
        trace_lines: bool,
    ) -> Result<Self, LoaderError> {
        let malformed = AppendLog::open(output_dir.join(MALFORMED_FILE_NAME)).await?;

        Ok(Self {
            mapper,
            accumulator,
            malformed,
            trace_lines,
        })
    }

    /// Consume `input` to the end. Every batch is sent on `batches`, which blocks while the
    /// submitter is not ready to accept it.
    pub async fn run(
        mut self,
        input: File,
        input_path: &Path,
        batches: mpsc::Sender<Batch>,
    ) -> Result<IngestSummary, LoaderError> {
        let read_error = |source| LoaderError::Read {
            path: PathBuf::from(input_path),
            source,
        };
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();
        let mut summary = IngestSummary::default();

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await.map_err(read_error)? == 0 {
                break;
            }
            summary.lines_read += 1;
            metrics::counter!("loader_lines_read_total").increment(1);

            let line = strip_line_ending(&buf);

            match std::str::from_utf8(line) {
                Ok(line) => {
                    if self.trace_lines {
                        info!("Reading line: {}", line);
                    } else {
                        debug!("Reading line: {}", line);
                    }

                    match self.mapper.parse(line) {
                        Ok(record) => {
                            if let Some(batch) = self.accumulator.push(record) {
                                self.hand_off(batch, &batches).await?;
                            }
                        }
                        Err(error) => {
                            debug!(line = summary.lines_read, %error, "malformed record");
                            self.record_malformed(line.as_bytes(), &mut summary).await?;
                        }
                    }
                }
                Err(error) => {
                    debug!(line = summary.lines_read, %error, "input line is not valid UTF-8");
                    self.record_malformed(line, &mut summary).await?;
                }
            }
        }

        if let Some(batch) = self.accumulator.flush() {
            self.hand_off(batch, &batches).await?;
        }
        self.malformed.flush().await?;

        summary.batches = self.accumulator.emitted_batches();
        info!(
            lines = summary.lines_read,
            malformed = summary.malformed,
            batches = summary.batches,
            "finished reading input"
        );

        Ok(summary)
    }

    async fn record_malformed(
        &mut self,
        line: &[u8],
        summary: &mut IngestSummary,
    ) -> Result<(), LoaderError> {
        summary.malformed += 1;
        metrics::counter!("loader_records_malformed_total").increment(1);
        self.malformed.append_raw(line).await
    }

    async fn hand_off(
        &mut self,
        batch: Batch,
        batches: &mpsc::Sender<Batch>,
    ) -> Result<(), LoaderError> {
        // The send below may wait on the write budget for a long time.
        self.malformed.flush().await?;

        let range = batch.record_range();
        info!("Batching lines {} through {}.", range.start(), range.end());

        batches
            .send(batch)
            .await
            .map_err(|_| LoaderError::SubmitterClosed)
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use loader_common::mapping::{Delimiter, Record};
    use tempfile::TempDir;

    use super::*;

    fn mapper() -> RecordMapper {
        RecordMapper::new(
            "SKU,VendorID,VendorProductNumber".parse().unwrap(),
            Delimiter::new('|').unwrap(),
        )
    }

    async fn ingest(
        contents: &[u8],
        batch_size: usize,
    ) -> (TempDir, IngestSummary, Vec<Batch>) {
        let dir = TempDir::new().unwrap();
        let input_path = dir.path().join("input.data");
        std::fs::write(&input_path, contents).unwrap();

        let ingestor = Ingestor::open(
            dir.path(),
            mapper(),
            BatchAccumulator::new(NonZeroUsize::new(batch_size).unwrap()),
            false,
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let collector = tokio::spawn(async move {
            let mut batches = Vec::new();
            while let Some(batch) = rx.recv().await {
                batches.push(batch);
            }
            batches
        });

        let input = File::open(&input_path).await.unwrap();
        let summary = ingestor.run(input, &input_path, tx).await.unwrap();
        let batches = collector.await.unwrap();

        (dir, summary, batches)
    }

    fn sku(record: &Record) -> &str {
        record.get("SKU").unwrap()
    }

    #[tokio::test]
    async fn test_batches_valid_lines_and_diverts_malformed() {
        let input = b"1|a|x\n2|b\n3|c|z\n4|d|w\n5|e|v\n";

        let (dir, summary, batches) = ingest(input, 2).await;

        assert_eq!(
            summary,
            IngestSummary {
                lines_read: 5,
                malformed: 1,
                batches: 2
            }
        );
        let skus: Vec<Vec<&str>> = batches
            .iter()
            .map(|batch| batch.records().iter().map(sku).collect())
            .collect();
        assert_eq!(skus, vec![vec!["1", "3"], vec!["4", "5"]]);

        let malformed = std::fs::read_to_string(dir.path().join(MALFORMED_FILE_NAME)).unwrap();
        assert_eq!(malformed, "2|b\n");
    }

    #[tokio::test]
    async fn test_final_line_without_newline_and_crlf() {
        let input = b"1|a|x\r\n2|b|y";

        let (_dir, summary, batches) = ingest(input, 25).await;

        assert_eq!(summary.lines_read, 2);
        assert_eq!(summary.malformed, 0);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records()[0].get("VendorProductNumber"), Some("x"));
        assert_eq!(batches[0].records()[1].get("VendorProductNumber"), Some("y"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_malformed_verbatim() {
        let input = b"1|a|x\n2|\xff|y\n";

        let (dir, summary, batches) = ingest(input, 25).await;

        assert_eq!(summary.malformed, 1);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);

        let malformed = std::fs::read(dir.path().join(MALFORMED_FILE_NAME)).unwrap();
        assert_eq!(malformed, b"2|\xff|y\n");
    }

    #[tokio::test]
    async fn test_empty_input() {
        let (_dir, summary, batches) = ingest(b"", 25).await;

        assert_eq!(summary, IngestSummary::default());
        assert!(batches.is_empty());
    }
}
