//! Sequential batch processing against a [`Fetcher`], with incremental output.
//!
//! Items are split into consecutive batches of at most `batch_size`. Each batch is fetched in one
//! call, every non-empty result is wrapped in an [`Envelope`] and written immediately, and the
//! runner sleeps `inter_batch_delay` before the next batch. The fetch call and the sleep are the
//! only places a run can be interrupted, so a record line is never cut in half.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::fetch::Fetcher;
use crate::input::WorkItem;
use crate::writer::ChunkedWriter;
use crate::{info_time, Error, Result};

/// What to do when the fetch call for a batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchErrorPolicy {
    /// Log the failure, count the batch as zero successes and move on.
    #[default]
    Continue,
    /// Close the writer and return the fetch error.
    Abort,
    /// Try the batch up to `n` more times, then continue.
    Retry(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub on_batch_error: BatchErrorPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            inter_batch_delay: crate::DEFAULT_INTER_BATCH_DELAY,
            on_batch_error: BatchErrorPolicy::Continue,
        }
    }
}

/// One written output record: the input item, what the backend returned for it and bookkeeping.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub original: &'a WorkItem,
    pub payload: &'a Value,
    pub fetched_at: DateTime<Utc>,
    /// 1-based.
    pub batch_number: usize,
    /// 0-based position of the item in the whole input.
    pub record_index: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub total_items: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub written: usize,
}

pub struct BatchRunner {
    config: RunnerConfig,
}

enum Step<T> {
    Done(T),
    Shutdown,
}

impl BatchRunner {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be at least 1".into()));
        }
        Ok(Self { config })
    }

    pub async fn run<F>(
        &self,
        items: &[WorkItem],
        writer: &mut ChunkedWriter,
        fetcher: &F,
    ) -> Result<RunStats>
    where
        F: Fetcher + ?Sized,
    {
        self.run_until(items, writer, fetcher, std::future::pending::<()>())
            .await
    }

    /// Like [`run`](Self::run), but stops when `shutdown` resolves. On shutdown the writer is
    /// closed and [`Error::Interrupted`] is returned.
    pub async fn run_until<F, S>(
        &self,
        items: &[WorkItem],
        writer: &mut ChunkedWriter,
        fetcher: &F,
        shutdown: S,
    ) -> Result<RunStats>
    where
        F: Fetcher + ?Sized,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        match self.process(items, writer, fetcher, &mut shutdown).await {
            Ok(Step::Done(stats)) => Ok(stats),
            Ok(Step::Shutdown) => {
                warn!("Run interrupted, closing output files");
                writer.close().await?;
                Err(Error::Interrupted {
                    written: writer.total_records(),
                })
            }
            Err(e) => {
                if let Err(close_err) = writer.close().await {
                    error!("Failed to close writer after error: {close_err}");
                }
                Err(e)
            }
        }
    }

    async fn process<F, S>(
        &self,
        items: &[WorkItem],
        writer: &mut ChunkedWriter,
        fetcher: &F,
        shutdown: &mut std::pin::Pin<&mut S>,
    ) -> Result<Step<RunStats>>
    where
        F: Fetcher + ?Sized,
        S: Future<Output = ()>,
    {
        let batch_size = self.config.batch_size;
        let total_batches = items.len().div_ceil(batch_size);
        let mut stats = RunStats {
            total_items: items.len(),
            ..RunStats::default()
        };

        info!(
            "Starting to fetch {} items in batches of {batch_size}",
            items.len()
        );
        let start_time = Local::now();

        for (batch_idx, batch) in items.chunks(batch_size).enumerate() {
            let batch_number = batch_idx + 1;
            let first_index = batch_idx * batch_size;
            let ids: Vec<String> = batch.iter().map(|item| item.id.clone()).collect();
            stats.batches += 1;

            info!(
                "Fetching batch {batch_number}/{total_batches} ({} items)",
                batch.len()
            );

            let results = match self.fetch_batch(fetcher, &ids, batch_number, shutdown).await? {
                Step::Done(Some(results)) => results,
                Step::Done(None) => {
                    stats.failed_batches += 1;
                    if batch_number < total_batches
                        && matches!(self.pause(shutdown).await, Step::Shutdown)
                    {
                        return Ok(Step::Shutdown);
                    }
                    continue;
                }
                Step::Shutdown => return Ok(Step::Shutdown),
            };

            if results.len() != batch.len() {
                warn!(
                    "Batch {batch_number}: fetcher returned {} results for {} items",
                    results.len(),
                    batch.len()
                );
            }

            let mut batch_written = 0;
            for (offset, (item, payload)) in batch.iter().zip(&results).enumerate() {
                let Some(payload) = payload else {
                    continue;
                };
                let envelope = Envelope {
                    original: item,
                    payload,
                    fetched_at: Utc::now(),
                    batch_number,
                    record_index: first_index + offset,
                };
                if writer.write(&envelope).await? {
                    batch_written += 1;
                }
            }
            stats.written += batch_written;
            info!("Saved {batch_written} records from batch {batch_number}");

            if batch_number < total_batches && matches!(self.pause(shutdown).await, Step::Shutdown)
            {
                return Ok(Step::Shutdown);
            }
        }

        info_time!(
            start_time,
            "Completed run. Total successful records: {}/{}",
            stats.written,
            stats.total_items
        );
        Ok(Step::Done(stats))
    }

    /// Fetches one batch under the error policy. `Done(None)` means the batch was given up on.
    async fn fetch_batch<F, S>(
        &self,
        fetcher: &F,
        ids: &[String],
        batch_number: usize,
        shutdown: &mut std::pin::Pin<&mut S>,
    ) -> Result<Step<Option<Vec<Option<Value>>>>>
    where
        F: Fetcher + ?Sized,
        S: Future<Output = ()>,
    {
        let retries = match self.config.on_batch_error {
            BatchErrorPolicy::Retry(n) => n,
            _ => 0,
        };

        let mut attempt = 0;
        loop {
            let outcome = tokio::select! {
                res = fetcher.fetch(ids) => res,
                _ = shutdown.as_mut() => return Ok(Step::Shutdown),
            };
            let err = match outcome {
                Ok(results) => return Ok(Step::Done(Some(results))),
                Err(e) => e,
            };

            error!("Error fetching batch {batch_number}: {err}");
            match self.config.on_batch_error {
                BatchErrorPolicy::Abort => return Err(err),
                BatchErrorPolicy::Retry(_) if attempt < retries => {
                    attempt += 1;
                    info!("Retrying batch {batch_number} ({attempt}/{retries})");
                    if matches!(self.pause(shutdown).await, Step::Shutdown) {
                        return Ok(Step::Shutdown);
                    }
                }
                _ => return Ok(Step::Done(None)),
            }
        }
    }

    async fn pause<S>(&self, shutdown: &mut std::pin::Pin<&mut S>) -> Step<()>
    where
        S: Future<Output = ()>,
    {
        let delay = self.config.inter_batch_delay;
        if delay.is_zero() {
            return Step::Done(());
        }
        info!("Waiting {} seconds before next batch...", delay.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(delay) => Step::Done(()),
            _ = shutdown.as_mut() => Step::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    /// Answers each call from a script; records the ids it was asked for.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<Vec<Option<Value>>>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<Vec<Option<Value>>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, ids: &[String]) -> Result<Vec<Option<Value>>> {
            self.calls.lock().unwrap().push(ids.to_vec());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ids.iter().map(|id| Some(json!({ "id": id }))).collect()))
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        WorkItem::from_ids((0..n).map(|i| format!("id-{i}")), "url")
    }

    fn runner(batch_size: usize, policy: BatchErrorPolicy) -> BatchRunner {
        BatchRunner::new(RunnerConfig {
            batch_size,
            inter_batch_delay: Duration::from_secs(2),
            on_batch_error: policy,
        })
        .unwrap()
    }

    fn read_records(dir: &std::path::Path, prefix: &str) -> Vec<Value> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with(&format!("{prefix}_"))
            })
            .collect();
        names.sort();
        names
            .iter()
            .flat_map(|p| {
                std::fs::read_to_string(p)
                    .unwrap()
                    .lines()
                    .map(|l| serde_json::from_str(l).unwrap())
                    .collect::<Vec<Value>>()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn calls_fetch_once_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkedWriter::open(dir.path(), "p", 100).await.unwrap();
        let fetcher = ScriptedFetcher::new(vec![]);

        let stats = runner(4, BatchErrorPolicy::Continue)
            .run(&items(10), &mut writer, &fetcher)
            .await
            .unwrap();

        let calls = fetcher.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls.iter().map(Vec::len).collect::<Vec<_>>(),
            [4, 4, 2]
        );
        assert_eq!(calls[2], ["id-8", "id-9"]);
        assert_eq!(stats.written, 10);
        assert_eq!(stats.batches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_empty_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkedWriter::open(dir.path(), "p", 100).await.unwrap();
        let fetcher = ScriptedFetcher::new(vec![Ok(vec![
            Some(json!({ "name": "A" })),
            None,
            Some(json!({ "name": "C" })),
        ])]);

        let stats = runner(3, BatchErrorPolicy::Continue)
            .run(&items(3), &mut writer, &fetcher)
            .await
            .unwrap();
        writer.close().await.unwrap();

        assert_eq!(stats.written, 2);
        let records = read_records(dir.path(), "p");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["record_index"], 0);
        assert_eq!(records[0]["payload"]["name"], "A");
        assert_eq!(records[0]["original"]["url"], "id-0");
        assert_eq!(records[1]["record_index"], 2);
        assert_eq!(records[1]["batch_number"], 1);
        assert!(records[1]["fetched_at"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkedWriter::open(dir.path(), "p", 100).await.unwrap();
        let fetcher = ScriptedFetcher::new(vec![
            Ok(vec![Some(json!({ "n": 0 })), Some(json!({ "n": 1 }))]),
            Err(Error::Fetch("rate limited".into())),
        ]);

        let stats = runner(2, BatchErrorPolicy::Continue)
            .run(&items(6), &mut writer, &fetcher)
            .await
            .unwrap();

        assert_eq!(fetcher.calls().len(), 3);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.written, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn any_fetch_error_is_left_to_the_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkedWriter::open(dir.path(), "p", 100).await.unwrap();
        let fetcher = ScriptedFetcher::new(vec![Err(Error::Io(std::io::Error::other(
            "connection reset",
        )))]);

        let stats = runner(2, BatchErrorPolicy::Continue)
            .run(&items(6), &mut writer, &fetcher)
            .await
            .unwrap();

        assert_eq!(fetcher.calls().len(), 3);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.written, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_refetches_the_same_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkedWriter::open(dir.path(), "p", 100).await.unwrap();
        let fetcher = ScriptedFetcher::new(vec![
            Err(Error::Fetch("timeout".into())),
            Err(Error::Fetch("timeout".into())),
        ]);

        let stats = runner(5, BatchErrorPolicy::Retry(2))
            .run(&items(5), &mut writer, &fetcher)
            .await
            .unwrap();

        let calls = fetcher.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c == &calls[0]));
        assert_eq!(stats.written, 5);
        assert_eq!(stats.failed_batches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fall_back_to_continue() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkedWriter::open(dir.path(), "p", 100).await.unwrap();
        let fetcher = ScriptedFetcher::new(vec![
            Err(Error::Fetch("down".into())),
            Err(Error::Fetch("down".into())),
        ]);

        let stats = runner(2, BatchErrorPolicy::Retry(1))
            .run(&items(4), &mut writer, &fetcher)
            .await
            .unwrap();

        assert_eq!(fetcher.calls().len(), 3);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.written, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_policy_closes_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkedWriter::open(dir.path(), "p", 100).await.unwrap();
        let fetcher = ScriptedFetcher::new(vec![
            Ok(vec![Some(json!({ "n": 0 }))]),
            Err(Error::Fetch("forbidden".into())),
        ]);

        let err = runner(1, BatchErrorPolicy::Abort)
            .run(&items(3), &mut writer, &fetcher)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Fetch(_)));
        assert_eq!(fetcher.calls().len(), 2);
        assert!(writer.is_closed());
        assert_eq!(read_records(dir.path(), "p").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_batches_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkedWriter::open(dir.path(), "p", 100).await.unwrap();
        let fetcher = ScriptedFetcher::new(vec![]);

        let started = tokio::time::Instant::now();
        runner(2, BatchErrorPolicy::Continue)
            .run(&items(6), &mut writer, &fetcher)
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn envelopes_roll_over_chunk_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkedWriter::open(dir.path(), "p", 10).await.unwrap();
        let fetcher = ScriptedFetcher::new(vec![]);

        runner(7, BatchErrorPolicy::Continue)
            .run(&items(25), &mut writer, &fetcher)
            .await
            .unwrap();
        assert_eq!(writer.close().await.unwrap().files_created, 3);

        let indices: Vec<u64> = read_records(dir.path(), "p")
            .iter()
            .map(|r| r["record_index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, (0..25).collect::<Vec<u64>>());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = RunnerConfig {
            batch_size: 0,
            ..RunnerConfig::default()
        };
        assert!(matches!(
            BatchRunner::new(config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn policy_deserializes_from_config_values() {
        let continue_: BatchErrorPolicy = serde_json::from_value(json!("continue")).unwrap();
        let abort: BatchErrorPolicy = serde_json::from_value(json!("abort")).unwrap();
        let retry: BatchErrorPolicy = serde_json::from_value(json!({ "retry": 4 })).unwrap();
        assert_eq!(continue_, BatchErrorPolicy::Continue);
        assert_eq!(abort, BatchErrorPolicy::Abort);
        assert_eq!(retry, BatchErrorPolicy::Retry(4));
    }
}
