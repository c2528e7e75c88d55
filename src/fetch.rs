use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::{Error, Result};

/// The external scraping capability: one result per identifier, in input order.
/// `None` marks an identifier that could not be fetched.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, ids: &[String]) -> Result<Vec<Option<Value>>>;
}

/// Forwards identifiers to a scraping backend over HTTP, one request per identifier.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    endpoint: String,
    url_param: String,
    params: Vec<(String, String)>,
}

impl HttpFetcher {
    pub fn new(backend: &BackendConfig) -> Result<Self> {
        let client = Client::builder().timeout(backend.timeout()).build()?;
        Ok(Self::with_client(client, backend))
    }

    pub fn with_client(client: Client, backend: &BackendConfig) -> Self {
        Self {
            client,
            endpoint: backend.endpoint.clone(),
            url_param: backend.url_param.clone(),
            params: backend.query_params(),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let mut task_set = JoinSet::new();
        for (idx, id) in ids.iter().enumerate() {
            task_set.spawn({
                // RequestBuilder owns its own Client handle, so the task is 'static.
                let request = self
                    .client
                    .get(&self.endpoint)
                    .query(&[(self.url_param.as_str(), id.as_str())])
                    .query(&self.params);
                let id = id.clone();
                async move { (idx, id, request.send().await) }
            });
        }

        let mut results = vec![None; ids.len()];
        let mut transport_failures = 0;
        let mut last_error = None;
        while let Some(task) = task_set.join_next().await {
            let (idx, id, response) = task?;
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!(%id, "request to scraping backend failed: {e}");
                    transport_failures += 1;
                    last_error = Some(e);
                    continue;
                }
            };
            let status = response.status();
            if !status.is_success() {
                warn!(%id, %status, "scraping backend rejected request");
                continue;
            }
            match response.json::<Value>().await {
                Ok(body) if !is_empty_payload(&body) => results[idx] = Some(body),
                Ok(_) => debug!(%id, "scraping backend returned an empty payload"),
                Err(e) => warn!(%id, "unreadable response body: {e}"),
            }
        }

        if !ids.is_empty() && transport_failures == ids.len() {
            return Err(match last_error {
                Some(e) => Error::Reqwest(e),
                None => Error::Fetch("every request in the batch failed".into()),
            });
        }
        Ok(results)
    }
}

/// `null`, `{}`, `[]` and `""` count as a failed fetch.
pub fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
