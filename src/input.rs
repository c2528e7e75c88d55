use std::collections::BTreeMap;
use std::path::Path;

use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::{Error, Result};

/// One unit of input: the identifier sent to the backend plus the row it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    /// All input columns, the id column included.
    pub fields: BTreeMap<String, String>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Builds items from a plain identifier list, storing each id under `id_column`.
    pub fn from_ids<I, S>(ids: I, id_column: &str) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ids.into_iter()
            .map(|id| {
                let id = id.into();
                WorkItem::new(id.clone()).with_field(id_column, id)
            })
            .collect()
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

impl Serialize for WorkItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

/// Reads a headered CSV into work items. Values are trimmed; rows with an empty id are skipped.
pub fn read_work_items(path: impl AsRef<Path>, id_column: &str) -> Result<Vec<WorkItem>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let Some(id_idx) = headers.iter().position(|h| h == id_column) else {
        return Err(Error::InvalidConfig(format!(
            "{} has no `{id_column}` column",
            path.display()
        )));
    };

    let mut items = Vec::new();
    for (row_idx, row) in reader.records().enumerate() {
        let row = row?;
        let id = row.get(id_idx).map(str::trim).unwrap_or_default();
        if id.is_empty() {
            // +2: header line and 1-based numbering
            warn!(line = row_idx + 2, "skipping row without `{id_column}`");
            continue;
        }
        let fields = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.clone(), v.trim().to_string()))
            .collect();
        items.push(WorkItem {
            id: id.to_string(),
            fields,
        });
    }

    info!("Loaded {} work items from {}", items.len(), path.display());
    Ok(items)
}
