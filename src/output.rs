use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tokio::{
    fs::{self, File},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
};
use tracing::info;

use crate::writer::{list_chunk_files, FileInfo};
use crate::Result;

pub const SUMMARY_FILE: &str = "scraping_summary.json";

/// Writes `records` as one pretty-printed JSON array to `<dir>/<category>.json`.
pub async fn save_json_array<T: Serialize>(
    dir: impl AsRef<Path>,
    category: &str,
    records: &[T],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{category}.json"));
    write_pretty(&path, records).await?;
    info!("Wrote {} records to {}", records.len(), path.display());
    Ok(path)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_items: usize,
    pub successfully_fetched: usize,
    pub success_rate: String,
    pub elapsed_secs: f64,
    /// Written records per value of the breakdown field of the original item.
    pub breakdown: BTreeMap<String, usize>,
    pub files: FileInfo,
}

impl RunSummary {
    pub fn new(
        total_items: usize,
        successfully_fetched: usize,
        elapsed_secs: f64,
        files: FileInfo,
    ) -> Self {
        Self {
            total_items,
            successfully_fetched,
            success_rate: success_rate(successfully_fetched, total_items),
            elapsed_secs: (elapsed_secs * 100.0).round() / 100.0,
            breakdown: BTreeMap::new(),
            files,
        }
    }

    pub fn with_breakdown(mut self, breakdown: BTreeMap<String, usize>) -> Self {
        self.breakdown = breakdown;
        self
    }

    /// Writes the summary to `<dir>/scraping_summary.json`.
    pub async fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = dir.join(SUMMARY_FILE);
        write_pretty(&path, self).await?;
        Ok(path)
    }
}

/// `"NN.NN%"`; `"0.00%"` when there was nothing to do.
pub fn success_rate(succeeded: usize, total: usize) -> String {
    if total == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", succeeded as f64 / total as f64 * 100.0)
}

/// Counts `original.<field>` across the chunk files of `prefix`. Records without the field are
/// counted under `"unknown"`.
pub async fn field_breakdown(
    output_dir: impl AsRef<Path>,
    prefix: &str,
    extension: &str,
    field: &str,
) -> Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    for path in list_chunk_files(output_dir.as_ref(), prefix, extension).await? {
        let mut lines = BufReader::new(File::open(&path).await?).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(&line)?;
            let key = record
                .get("original")
                .and_then(|o| o.get(field))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

async fn write_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    let mut file = File::create(path).await?;
    file.write_all(&body).await?;
    file.flush().await?;
    Ok(())
}
