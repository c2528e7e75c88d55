use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::runner::{BatchErrorPolicy, RunnerConfig};
use crate::{
    Error, Result, DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_EXTENSION,
    DEFAULT_INTER_BATCH_DELAY,
};

const DEFAULT_CONFIG_FILE: &str = "linkharvest";
const ENV_PREFIX: &str = "LINKHARVEST";

/// Everything a run needs, passed explicitly to the components that use it.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub input_csv: PathBuf,
    /// CSV column holding the identifier handed to the backend.
    pub id_column: String,
    pub output_dir: PathBuf,
    pub summary_dir: PathBuf,
    pub prefix: String,
    pub extension: String,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub inter_batch_delay_secs: u64,
    pub on_batch_error: BatchErrorPolicy,
    /// Field of the original item counted in the run summary.
    pub breakdown_field: String,
    pub backend: BackendConfig,
}

/// Connection settings for the scraping backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub endpoint: String,
    /// Query parameter that carries the identifier.
    pub url_param: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub cache: bool,
    pub debug: bool,
}

impl RunConfig {
    /// Defaults, then `linkharvest.toml` (or `path`), then `LINKHARVEST__*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let cfg: RunConfig = Config::builder()
            .set_default("input_csv", "raw_links.csv")?
            .set_default("id_column", "linkedin_url")?
            .set_default("output_dir", "data_source")?
            .set_default("summary_dir", "results")?
            .set_default("prefix", "linkedin_profiles")?
            .set_default("extension", DEFAULT_EXTENSION)?
            .set_default("chunk_size", DEFAULT_CHUNK_SIZE as u64)?
            .set_default("batch_size", DEFAULT_BATCH_SIZE as u64)?
            .set_default("inter_batch_delay_secs", DEFAULT_INTER_BATCH_DELAY.as_secs())?
            .set_default("on_batch_error", "continue")?
            .set_default("breakdown_field", "profession")?
            .set_default("backend.endpoint", "http://127.0.0.1:3000/scrape")?
            .set_default("backend.url_param", "url")?
            .set_default("backend.timeout_secs", 60)?
            .set_default("backend.cache", false)?
            .set_default("backend.debug", false)?
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be at least 1".into()));
        }
        validate_prefix(&self.prefix)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_secs(self.inter_batch_delay_secs)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            batch_size: self.batch_size,
            inter_batch_delay: self.inter_batch_delay(),
            on_batch_error: self.on_batch_error,
        }
    }
}

impl BackendConfig {
    /// Static query parameters sent with every request, cache/debug flags included.
    pub fn query_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.push(("cache".into(), self.cache.to_string()));
        params.push(("debug".into(), self.debug.to_string()));
        params
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub(crate) fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(Error::InvalidConfig("prefix must not be empty".into()));
    }
    if prefix.contains(['/', '\\']) {
        return Err(Error::InvalidConfig(format!(
            "prefix must not contain a path separator: {prefix}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let cfg = RunConfig::load(None).unwrap();
        assert_eq!(cfg.chunk_size, 100_000);
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.prefix, "linkedin_profiles");
        assert_eq!(cfg.on_batch_error, BatchErrorPolicy::Continue);
        assert_eq!(cfg.inter_batch_delay(), Duration::from_secs(2));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            r#"
chunk_size = 25
prefix = "companies"
on_batch_error = { retry = 3 }

[backend]
endpoint = "http://localhost:9000/scrape"
params = { asp = "true" }
"#,
        )
        .unwrap();

        let cfg = RunConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(cfg.chunk_size, 25);
        assert_eq!(cfg.prefix, "companies");
        assert_eq!(cfg.on_batch_error, BatchErrorPolicy::Retry(3));
        assert_eq!(cfg.backend.endpoint, "http://localhost:9000/scrape");
        assert!(cfg
            .backend
            .query_params()
            .contains(&("asp".to_string(), "true".to_string())));
    }

    #[test]
    fn rejects_zero_sizes_and_bad_prefixes() {
        let mut cfg = RunConfig::load(None).unwrap();
        cfg.chunk_size = 0;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        cfg.chunk_size = 10;
        cfg.batch_size = 0;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        cfg.batch_size = 10;
        cfg.prefix = "../escape".into();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }
}
