use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::LoaderError;

pub const MALFORMED_FILE_NAME: &str = "malformed.data";
pub const ATTEMPTED_FILE_NAME: &str = "attempted.data";
pub const FAILED_FILE_NAME: &str = "fail.data";

/// A newline-delimited output file, opened for appending so reruns never overwrite it.
pub struct AppendLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl AppendLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| LoaderError::Open {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append_line(&mut self, line: &str) -> Result<(), LoaderError> {
        self.append_raw(line.as_bytes()).await
    }

    /// Append bytes that may not be valid UTF-8, followed by a newline.
    pub async fn append_raw(&mut self, line: &[u8]) -> Result<(), LoaderError> {
        self.writer.write_all(line).await.map_err(|e| self.write_error(e))?;
        self.writer.write_all(b"\n").await.map_err(|e| self.write_error(e))
    }

    pub async fn flush(&mut self) -> Result<(), LoaderError> {
        self.writer.flush().await.map_err(|e| self.write_error(e))
    }

    fn write_error(&self, source: std::io::Error) -> LoaderError {
        LoaderError::Write {
            path: self.path.clone(),
            source,
        }
    }
}
