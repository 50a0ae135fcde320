//! JSON-file bet history.
//!
//! Layout under the root directory:
//!
//! ```text
//! history/<user>/<YYYY-MM-DD>/<id>.json    permanent
//! realtime/<user>/<YYYY-MM-DD>/<id>.json   realtime mirror
//! ```
//!
//! Each write replaces the whole file (write to a temp file, then rename).
//! Listing a (user, date) is a directory scan.

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{HistoryStore, Namespace};
use crate::types::{StoreError, TwoLegBetRecord};

/// Default history root.
const DEFAULT_ROOT: &str = "hedge_history";

pub struct FileHistoryStore {
    root: PathBuf,
}

impl FileHistoryStore {
    pub fn new(root: Option<&str>) -> Self {
        Self {
            root: PathBuf::from(root.unwrap_or(DEFAULT_ROOT)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, ns: Namespace, user_id: &str, date: NaiveDate) -> PathBuf {
        let ns_dir = match ns {
            Namespace::Permanent => "history",
            Namespace::Realtime => "realtime",
        };
        self.root
            .join(ns_dir)
            .join(&*urlencoding::encode(user_id))
            .join(date.format("%Y-%m-%d").to_string())
    }

    fn path(&self, ns: Namespace, record: &TwoLegBetRecord) -> PathBuf {
        self.dir(ns, &record.user_id, record.date)
            .join(format!("{}.json", urlencoding::encode(&record.id)))
    }

    async fn write_one(&self, ns: Namespace, record: &TwoLegBetRecord) -> anyhow::Result<()> {
        let path = self.path(ns, record);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(record).context("Failed to serialise bet record")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move record into {}", path.display()))?;

        debug!(path = %path.display(), "Bet record saved");
        Ok(())
    }

    async fn write_all(&self, records: &[TwoLegBetRecord]) -> Result<(), StoreError> {
        for record in records {
            for ns in [Namespace::Permanent, Namespace::Realtime] {
                self.write_one(ns, record)
                    .await
                    .map_err(|e| StoreError::Backend(format!("{e:#}")))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn save(&self, record: &TwoLegBetRecord) -> Result<(), StoreError> {
        self.write_all(std::slice::from_ref(record)).await
    }

    async fn save_batch(&self, records: &[TwoLegBetRecord]) -> Result<(), StoreError> {
        self.write_all(records).await
    }

    async fn list(&self, ns: Namespace, user_id: &str, date: NaiveDate) -> Result<Vec<TwoLegBetRecord>, StoreError> {
        let dir = self.dir(ns, user_id, date);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<TwoLegBetRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable bet record"),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
