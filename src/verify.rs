use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};
use tracing::{error, info};

use crate::writer::list_chunk_files;
use crate::{Error, Result, DEFAULT_EXTENSION};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// `(file name, records)` in file order.
    pub files: Vec<(String, usize)>,
    pub total_records: usize,
}

/// Re-reads every `{prefix}_NNN.jsonl` file in `output_dir` and checks that each non-blank line is
/// one complete JSON object and that the total line count equals `expected_total`.
pub async fn verify_integrity(
    output_dir: impl AsRef<Path>,
    prefix: &str,
    expected_total: usize,
) -> Result<IntegrityReport> {
    verify_integrity_with_extension(output_dir, prefix, DEFAULT_EXTENSION, expected_total).await
}

pub async fn verify_integrity_with_extension(
    output_dir: impl AsRef<Path>,
    prefix: &str,
    extension: &str,
    expected_total: usize,
) -> Result<IntegrityReport> {
    let output_dir = output_dir.as_ref();
    info!("Verifying JSONL file integrity...");

    let chunk_files = list_chunk_files(output_dir, prefix, extension).await?;
    let mut report = IntegrityReport {
        files: Vec::with_capacity(chunk_files.len()),
        total_records: 0,
    };

    for path in &chunk_files {
        let records = verify_chunk(path).await.inspect_err(|e| {
            error!("Error verifying {}: {e}", path.display());
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Verified {name}: {records} valid records");
        report.total_records += records;
        report.files.push((name, records));
    }

    if report.total_records != expected_total {
        error!(
            "Data integrity check failed: expected {expected_total} records, found {}",
            report.total_records
        );
        return Err(Error::IntegrityCount {
            expected: expected_total,
            found: report.total_records,
        });
    }

    info!(
        "JSONL integrity verification passed: {} records across {} files",
        report.total_records,
        report.files.len()
    );
    Ok(report)
}

async fn verify_chunk(path: &Path) -> Result<usize> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut buf = Vec::new();
    let mut line_num = 0;
    let mut records = 0;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        line_num += 1;
        let invalid = |reason: String| Error::IntegrityLine {
            file: path.to_path_buf(),
            line: line_num,
            reason,
        };
        let line = std::str::from_utf8(&buf)
            .map_err(|_| invalid("invalid UTF-8".into()))?
            .trim();
        if line.is_empty() {
            continue;
        }
        serde_json::from_str::<Value>(line).map_err(|e| invalid(format!("invalid JSON: {e}")))?;
        if !(line.starts_with('{') && line.ends_with('}')) {
            return Err(invalid("line is not a complete JSON object".into()));
        }
        records += 1;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_lines(dir: &Path, name: &str, lines: &[&str]) {
        let mut body = lines.join("\n");
        body.push('\n');
        std::fs::write(dir.join(name), body).unwrap();
    }

    fn objects(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{{\"i\":{i}}}")).collect()
    }

    #[tokio::test]
    async fn counts_across_chunk_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = objects(10);
        let second = objects(3);
        write_lines(
            dir.path(),
            "p_001.jsonl",
            &first.iter().map(String::as_str).collect::<Vec<_>>(),
        );
        write_lines(
            dir.path(),
            "p_002.jsonl",
            &second.iter().map(String::as_str).collect::<Vec<_>>(),
        );

        let report = verify_integrity(dir.path(), "p", 13).await.unwrap();
        assert_eq!(report.total_records, 13);
        assert_eq!(
            report.files,
            [("p_001.jsonl".to_string(), 10), ("p_002.jsonl".to_string(), 3)]
        );

        let err = verify_integrity(dir.path(), "p", 14).await.unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityCount {
                expected: 14,
                found: 13
            }
        ));
    }

    #[tokio::test]
    async fn blank_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_lines(dir.path(), "p_001.jsonl", &["{\"a\":1}", "", "   ", "{\"a\":2}"]);
        let report = verify_integrity(dir.path(), "p", 2).await.unwrap();
        assert_eq!(report.total_records, 2);
    }

    #[tokio::test]
    async fn rejects_unparsable_lines() {
        let dir = tempfile::tempdir().unwrap();
        write_lines(dir.path(), "p_001.jsonl", &["{\"a\":1}", "{\"a\":"]);
        let err = verify_integrity(dir.path(), "p", 2).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityLine { line: 2, .. }));
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("p_001.jsonl"),
            b"{\"a\":1}\n{\"a\":\"\xff\"}\n",
        )
        .unwrap();
        let err = verify_integrity(dir.path(), "p", 2).await.unwrap_err();
        assert!(err.is_integrity());
        assert!(matches!(
            err,
            Error::IntegrityLine { line: 2, ref reason, .. } if reason == "invalid UTF-8"
        ));
    }

    #[tokio::test]
    async fn rejects_non_object_lines() {
        let dir = tempfile::tempdir().unwrap();
        write_lines(dir.path(), "p_001.jsonl", &["{\"a\":1}", "[1,2]", "42"]);
        let err = verify_integrity(dir.path(), "p", 3).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityLine { line: 2, .. }));
    }

    #[tokio::test]
    async fn ignores_other_prefixes_and_names() {
        let dir = tempfile::tempdir().unwrap();
        write_lines(dir.path(), "p_001.jsonl", &["{}"]);
        write_lines(dir.path(), "p_backup.jsonl", &["not json"]);
        write_lines(dir.path(), "pq_001.jsonl", &["not json"]);
        write_lines(dir.path(), "p_002.json", &["not json"]);

        let report = verify_integrity(dir.path(), "p", 1).await.unwrap();
        assert_eq!(report.files.len(), 1);
    }

    #[tokio::test]
    async fn empty_directory_matches_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            verify_integrity(dir.path(), "p", 0).await.unwrap().total_records,
            0
        );
        assert!(verify_integrity(dir.path(), "p", 1).await.is_err());
    }
}
