use std::future::Future;

use chrono::Local;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{validate_prefix, RunConfig};
use crate::fetch::{is_empty_payload, Fetcher};
use crate::input::{read_work_items, WorkItem};
use crate::macros::secs_since;
use crate::output::{field_breakdown, save_json_array, RunSummary};
use crate::runner::{BatchRunner, RunStats};
use crate::verify::{verify_integrity_with_extension, IntegrityReport};
use crate::writer::{save_jsonl, ChunkedWriter, WriterSummary};
use crate::{info_time, Result};

/// Result of a full run that got as far as verification.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stats: RunStats,
    pub writer: WriterSummary,
    /// `None` when nothing was written.
    pub report: Option<IntegrityReport>,
    pub summary: Option<RunSummary>,
}

/// Reads the configured CSV and processes it. See [`process_items`].
pub async fn process_csv<F, S>(config: &RunConfig, fetcher: &F, shutdown: S) -> Result<RunOutcome>
where
    F: Fetcher + ?Sized,
    S: Future<Output = ()>,
{
    let items = read_work_items(&config.input_csv, &config.id_column)?;
    process_items(config, &items, fetcher, shutdown).await
}

/// Runs all batches, closes the output, verifies it and writes the run summary.
///
/// The summary is written whenever at least one record reached disk, also when the run ends
/// with an error; the error is returned afterwards.
pub async fn process_items<F, S>(
    config: &RunConfig,
    items: &[WorkItem],
    fetcher: &F,
    shutdown: S,
) -> Result<RunOutcome>
where
    F: Fetcher + ?Sized,
    S: Future<Output = ()>,
{
    config.validate()?;
    let start_time = Local::now();

    if items.is_empty() {
        warn!("No work items found, nothing to do");
        return Ok(RunOutcome {
            stats: RunStats::default(),
            writer: WriterSummary {
                total_records: 0,
                files_created: 0,
            },
            report: None,
            summary: None,
        });
    }

    info!(
        "Results will be saved incrementally to {} as {}_NNN.{}",
        config.output_dir.display(),
        config.prefix,
        config.extension
    );

    let mut writer = ChunkedWriter::open_with_extension(
        &config.output_dir,
        &config.prefix,
        &config.extension,
        config.chunk_size,
    )
    .await?;
    let runner = BatchRunner::new(config.runner_config())?;

    let run_res = runner
        .run_until(items, &mut writer, fetcher, shutdown)
        .await;
    let writer_summary = match writer.close().await {
        Ok(summary) => summary,
        Err(close_err) if run_res.is_err() => {
            error!("Failed to close writer: {close_err}");
            writer.summary()
        }
        Err(close_err) => return Err(close_err),
    };

    let stats = match run_res {
        Ok(stats) => stats,
        Err(e) => {
            error!("Run ended early: {e}");
            if writer_summary.total_records > 0 {
                match summarize(config, items.len(), &writer, secs_since(start_time)).await {
                    Ok(summary) => info!(
                        "Partial progress saved, {} records in {} files",
                        summary.successfully_fetched, summary.files.total_files
                    ),
                    Err(summary_err) => error!("Could not write run summary: {summary_err}"),
                }
            }
            return Err(e);
        }
    };

    if stats.written == 0 {
        warn!("No items were successfully fetched");
        return Ok(RunOutcome {
            stats,
            writer: writer_summary,
            report: None,
            summary: None,
        });
    }

    let report = verify_integrity_with_extension(
        &config.output_dir,
        &config.prefix,
        &config.extension,
        stats.written,
    )
    .await
    .inspect_err(|e| {
        if e.is_integrity() {
            error!(
                "Output left in {} for inspection",
                config.output_dir.display()
            );
        }
    })?;
    let summary = summarize(config, items.len(), &writer, secs_since(start_time)).await?;
    info_time!(start_time, "Finished run, {} success rate", summary.success_rate);

    Ok(RunOutcome {
        stats,
        writer: writer_summary,
        report: Some(report),
        summary: Some(summary),
    })
}

async fn summarize(
    config: &RunConfig,
    total_items: usize,
    writer: &ChunkedWriter,
    elapsed_secs: f64,
) -> Result<RunSummary> {
    let files = writer.file_info().await?;
    let breakdown = field_breakdown(
        &config.output_dir,
        &config.prefix,
        &config.extension,
        &config.breakdown_field,
    )
    .await?;
    let summary = RunSummary::new(total_items, writer.total_records(), elapsed_secs, files)
        .with_breakdown(breakdown);
    let path = summary.save(&config.summary_dir).await?;
    info!("Run summary written to {}", path.display());
    Ok(summary)
}

/// Fetches `ids` in one call and writes the non-empty results both as `<category>.json` in the
/// summary dir and as `<category>_NNN.jsonl` chunks in the output dir. Array payloads are
/// flattened into one record per entry and entries that are not JSON objects are skipped.
/// Returns the number of records written to the chunks.
pub async fn process_collect<F>(
    config: &RunConfig,
    fetcher: &F,
    category: &str,
    ids: &[String],
) -> Result<usize>
where
    F: Fetcher + ?Sized,
{
    validate_prefix(category)?;
    let start_time = Local::now();
    info!("Collecting {} {category} pages", ids.len());

    let mut skipped = 0;
    let records: Vec<Value> = fetcher
        .fetch(ids)
        .await?
        .into_iter()
        .flatten()
        .flat_map(|payload| match payload {
            Value::Array(entries) => entries,
            other => vec![other],
        })
        .filter(|v| !is_empty_payload(v))
        .filter(|v| {
            let keep = v.is_object();
            if !keep {
                skipped += 1;
            }
            keep
        })
        .collect();
    if skipped > 0 {
        warn!("Skipped {skipped} {category} entries that are not JSON objects");
    }

    save_json_array(&config.summary_dir, category, &records).await?;
    let written = save_jsonl(&records, &config.output_dir, category, config.chunk_size)
        .await?
        .total_records;

    info_time!(
        start_time,
        "Collected {written}/{} {category} records",
        ids.len()
    );
    Ok(written)
}
