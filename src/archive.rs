use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::purge::PurgeRecord;

const INDEX_FILE: &str = "index.json";

/// The records purged in one scan cycle. Never edited once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveBatch {
    pub batch_id: String,
    pub count: usize,
    #[serde(rename = "tabs")]
    pub records: Vec<PurgeRecord>,
}

enum IndexRead {
    Missing,
    Loaded(Vec<ArchiveBatch>),
    Corrupt(String),
}

/// Append-only archive of purged tabs.
///
/// ```text
/// index.json                       every batch ever saved, in order
/// 2024-05-01/purged_<batch>.md     one readable summary per batch
/// ```
pub struct ArchiveStore {
    base_dir: PathBuf,
    /// Serialises read-modify-write of the index across sessions
    write_lock: Mutex<()>,
}

impl ArchiveStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.base_dir.join(INDEX_FILE)
    }

    /// All batches saved so far. A missing or unreadable index reads as empty.
    pub async fn load_index(&self) -> Vec<ArchiveBatch> {
        match self.read_index().await {
            IndexRead::Loaded(batches) => batches,
            IndexRead::Missing => Vec::new(),
            IndexRead::Corrupt(reason) => {
                tracing::error!(path = %self.index_path().display(), %reason, "archive index unreadable");
                Vec::new()
            }
        }
    }

    async fn read_index(&self) -> IndexRead {
        let contents = match tokio::fs::read_to_string(self.index_path()).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return IndexRead::Missing,
            Err(e) => return IndexRead::Corrupt(e.to_string()),
        };
        match serde_json::from_str(&contents) {
            Ok(batches) => IndexRead::Loaded(batches),
            Err(e) => IndexRead::Corrupt(e.to_string()),
        }
    }

    /// Append `records` as a new batch and write its summary document.
    ///
    /// Does nothing for an empty slice. A corrupt index is set aside as
    /// `index.json.corrupt-<batch id>` and a fresh one started.
    pub async fn save_batch(&self, records: &[PurgeRecord]) -> Result<Option<ArchiveBatch>> {
        if records.is_empty() {
            return Ok(None);
        }
        let _guard = self.write_lock.lock().await;

        let now = Local::now();
        let day_dir = self.base_dir.join(now.format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&day_dir)
            .await
            .with_context(|| format!("Failed to create {}", day_dir.display()))?;

        let base_id = now.format("%Y-%m-%d_%H-%M-%S").to_string();
        let (mut batches, corrupt) = match self.read_index().await {
            IndexRead::Loaded(batches) => (batches, None),
            IndexRead::Missing => (Vec::new(), None),
            IndexRead::Corrupt(reason) => (Vec::new(), Some(reason)),
        };

        let batch_id = unique_batch_id(&base_id, &batches, &day_dir);

        if let Some(reason) = corrupt {
            let backup = self.base_dir.join(format!("{INDEX_FILE}.corrupt-{batch_id}"));
            tracing::error!(
                %reason,
                backup = %backup.display(),
                "archive index unreadable, starting a new one"
            );
            if let Err(e) = tokio::fs::rename(self.index_path(), &backup).await {
                tracing::warn!(error = %e, "could not set aside corrupt index");
            }
        }

        let batch = ArchiveBatch {
            batch_id,
            count: records.len(),
            records: records.to_vec(),
        };
        batches.push(batch.clone());
        self.write_index(&batches).await?;

        let summary_path = summary_path(&day_dir, &batch.batch_id);
        write_new(&summary_path, render_summary(&batch).as_bytes()).await?;

        tracing::info!(
            count = batch.count,
            path = %summary_path.display(),
            "archived purged tabs"
        );
        Ok(Some(batch))
    }

    async fn write_index(&self, batches: &[ArchiveBatch]) -> Result<()> {
        let json = serde_json::to_string_pretty(batches).context("Failed to encode archive index")?;
        let index = self.index_path();
        let tmp = self.base_dir.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &index)
            .await
            .with_context(|| format!("Failed to replace {}", index.display()))?;
        Ok(())
    }
}

fn summary_path(day_dir: &Path, batch_id: &str) -> PathBuf {
    day_dir.join(format!("purged_{batch_id}.md"))
}

/// `base`, or `base-2`, `base-3`, ... if a batch or document already uses it
fn unique_batch_id(base: &str, batches: &[ArchiveBatch], day_dir: &Path) -> String {
    let taken = |id: &str| {
        batches.iter().any(|b| b.batch_id == id) || summary_path(day_dir, id).exists()
    };
    let mut candidate = base.to_string();
    let mut n = 2;
    while taken(&candidate) {
        candidate = format!("{base}-{n}");
        n += 1;
    }
    candidate
}

async fn write_new(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

fn render_summary(batch: &ArchiveBatch) -> String {
    let mut out = format!(
        "# Purged Tabs - {}\n\n**Total Purged**: {}\n\n",
        batch.batch_id, batch.count
    );
    for record in &batch.records {
        let title = if record.title.trim().is_empty() {
            "No Title"
        } else {
            record.title.as_str()
        };
        out.push_str(&format!(
            "- [{}]({}) ({})\n",
            title, record.url, record.fingerprint
        ));
    }
    out
}
