//! Drives a scraping backend over a list of work items in fixed-size batches and persists every
//! fetched record as newline-delimited JSON, split across numbered chunk files.
//!
//! The pieces, bottom up:
//! - [`writer::ChunkedWriter`] appends one JSON object per line and rolls over to
//!   `{prefix}_{NNN}.jsonl` every `chunk_size` records.
//! - [`runner::BatchRunner`] fetches batches through a [`fetch::Fetcher`], wraps each result in an
//!   [`runner::Envelope`] and hands it to the writer.
//! - [`verify::verify_integrity`] re-reads the output once the run is done.

mod error;
pub mod config;
pub mod fetch;
pub mod input;
#[doc(hidden)]
pub mod macros;
pub mod output;
pub mod process;
pub mod runner;
pub mod telemetry;
pub mod verify;
pub mod writer;

use std::time::Duration;

pub use error::{Error, Result};

pub const DEFAULT_EXTENSION: &str = "jsonl";
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_INTER_BATCH_DELAY: Duration = Duration::from_secs(2);
