//! Incremental JSONL output that rolls over to a new numbered file every `chunk_size` records.
//!
//! Files are named `{prefix}_{index:03}.{ext}` with indices starting at 1. Every line is one
//! complete JSON object and is flushed before `write` returns.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};

use crate::config::validate_prefix;
use crate::{Error, Result, DEFAULT_EXTENSION};

pub struct ChunkedWriter {
    output_dir: PathBuf,
    prefix: String,
    extension: String,
    chunk_size: usize,
    current_chunk: usize,
    lines_in_chunk: usize,
    total_lines: usize,
    file: Option<File>,
    closed: bool,
}

/// Totals reported when a writer is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSummary {
    pub total_records: usize,
    pub files_created: usize,
}

/// Chunk files of one prefix currently on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub total_files: usize,
    pub total_records: usize,
    pub files: Vec<String>,
}

impl ChunkedWriter {
    /// Creates `output_dir` (with parents) and truncates/opens chunk file #1.
    pub async fn open(
        output_dir: impl AsRef<Path>,
        prefix: &str,
        chunk_size: usize,
    ) -> Result<Self> {
        Self::open_with_extension(output_dir, prefix, DEFAULT_EXTENSION, chunk_size).await
    }

    pub async fn open_with_extension(
        output_dir: impl AsRef<Path>,
        prefix: &str,
        extension: &str,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be at least 1".into()));
        }
        validate_prefix(prefix)?;

        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir).await?;

        let mut writer = Self {
            output_dir,
            prefix: prefix.to_string(),
            extension: extension.to_string(),
            chunk_size,
            current_chunk: 0,
            lines_in_chunk: 0,
            total_lines: 0,
            file: None,
            closed: false,
        };
        writer.start_chunk(1).await?;
        Ok(writer)
    }

    /// Appends one record as a single JSON line.
    ///
    /// Returns `Ok(false)` when the record was dropped because it is not a JSON object or does
    /// not survive a serialize/parse round trip. I/O failures are returned as errors.
    pub async fn write<T: Serialize + ?Sized>(&mut self, record: &T) -> Result<bool> {
        if self.closed {
            return Err(Error::Io(std::io::Error::other(format!(
                "write to closed writer {}",
                self.prefix
            ))));
        }

        let line = match to_jsonl_line(record) {
            Ok(line) => line,
            Err(reason) => {
                warn!(prefix = %self.prefix, "Invalid JSONL record, skipping: {reason}");
                return Ok(false);
            }
        };

        if self.lines_in_chunk >= self.chunk_size {
            info!(
                "File limit reached ({} records), starting new file",
                self.chunk_size
            );
            self.start_chunk(self.current_chunk + 1).await?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("chunk file is not open"))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        self.lines_in_chunk += 1;
        self.total_lines += 1;
        Ok(true)
    }

    /// Flushes and closes the current file. Calling it again only returns the summary.
    pub async fn close(&mut self) -> Result<WriterSummary> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        if !self.closed {
            self.closed = true;
            info!(
                "Saved {} total records across {} files",
                self.total_lines, self.current_chunk
            );
        }
        Ok(self.summary())
    }

    pub fn summary(&self) -> WriterSummary {
        WriterSummary {
            total_records: self.total_lines,
            files_created: self.current_chunk,
        }
    }

    pub fn total_records(&self) -> usize {
        self.total_lines
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Lists the chunk files of this prefix present in the output directory.
    pub async fn file_info(&self) -> Result<FileInfo> {
        let files = list_chunk_files(&self.output_dir, &self.prefix, &self.extension).await?;
        Ok(FileInfo {
            total_files: files.len(),
            total_records: self.total_lines,
            files: files
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect(),
        })
    }

    /// Opens chunk `index`. The counter only moves once the file exists.
    async fn start_chunk(&mut self, index: usize) -> Result<()> {
        if let Some(mut previous) = self.file.take() {
            previous.flush().await?;
        }
        let path = chunk_path(&self.output_dir, &self.prefix, index, &self.extension);
        self.file = Some(File::create(&path).await?);
        self.current_chunk = index;
        self.lines_in_chunk = 0;
        debug!("Started new file: {}", path.display());
        Ok(())
    }
}

/// `{prefix}_{index:03}.{ext}` inside `dir`.
pub fn chunk_path(dir: &Path, prefix: &str, index: usize, extension: &str) -> PathBuf {
    dir.join(format!("{prefix}_{index:03}.{extension}"))
}

/// Whether `file_name` is a chunk file of `prefix`: `{prefix}_{digits}.{ext}`.
pub fn is_chunk_file(file_name: &str, prefix: &str, extension: &str) -> bool {
    file_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(extension))
        .and_then(|rest| rest.strip_suffix('.'))
        .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
}

/// Chunk files of `prefix` in `dir`, sorted by name.
pub async fn list_chunk_files(dir: &Path, prefix: &str, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if is_chunk_file(&name.to_string_lossy(), prefix, extension)
            && entry.file_type().await?.is_file()
        {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Writes a whole slice of records through a fresh writer. Nothing is created for an empty slice.
pub async fn save_jsonl<T: Serialize>(
    records: &[T],
    output_dir: impl AsRef<Path>,
    prefix: &str,
    chunk_size: usize,
) -> Result<WriterSummary> {
    if records.is_empty() {
        fs::create_dir_all(output_dir.as_ref()).await?;
        return Ok(WriterSummary {
            total_records: 0,
            files_created: 0,
        });
    }
    let mut writer = ChunkedWriter::open(output_dir, prefix, chunk_size).await?;
    let mut dropped = 0;
    for record in records {
        if !writer.write(record).await? {
            dropped += 1;
        }
    }
    if dropped > 0 {
        warn!(prefix, "Dropped {dropped} of {} records", records.len());
    }
    writer.close().await
}

/// Serializes a record to one newline-terminated line, checking it is an object that round-trips.
fn to_jsonl_line<T: Serialize + ?Sized>(record: &T) -> core::result::Result<String, String> {
    let value = serde_json::to_value(record).map_err(|e| e.to_string())?;
    if !value.is_object() {
        return Err("record is not a JSON object".into());
    }
    let mut line = serde_json::to_string(&value).map_err(|e| e.to_string())?;
    let reparsed: Value = serde_json::from_str(&line).map_err(|e| e.to_string())?;
    if reparsed != value {
        return Err("record does not round-trip".into());
    }
    line.push('\n');
    Ok(line)
}
