//! Persistent configuration document store.
//!
//! JSON file with atomic write-replace (temp file, sync, rename). Writes
//! are coalesced through a single saver task signalled by a capacity-1
//! channel: a burst of checkpoint updates produces one snapshot on disk.
//! Implements StatePort; `spider.lastIds` is the only state the core
//! writes back.

use crate::domain::DomainError;
use crate::ports::StatePort;
use crate::shared::config::ConfigDoc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, mpsc};
use tracing::warn;

pub struct JsonConfigStore {
    path: PathBuf,
    doc: Arc<RwLock<ConfigDoc>>,
    save_tx: mpsc::Sender<()>,
}

impl JsonConfigStore {
    /// Load the document (missing file yields defaults) and start the
    /// saver task.
    pub async fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, DomainError> {
        let path = path.as_ref().to_path_buf();
        let doc: ConfigDoc = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| DomainError::Config(format!("parse {}: {e}", path.display())))?,
            Err(_) => ConfigDoc::default(),
        };
        let doc = Arc::new(RwLock::new(doc));
        let (save_tx, mut save_rx) = mpsc::channel::<()>(1);

        let saver_doc = Arc::clone(&doc);
        let saver_path = path.clone();
        tokio::spawn(async move {
            while save_rx.recv().await.is_some() {
                // Coalesce any signals that arrived while we slept.
                while save_rx.try_recv().is_ok() {}
                let snapshot = {
                    let doc = saver_doc.read().await;
                    serde_json::to_string_pretty(&*doc)
                };
                match snapshot {
                    Ok(json) => {
                        if let Err(e) = write_atomic(&saver_path, &json).await {
                            warn!(path = %saver_path.display(), error = %e, "config save failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "config serialization failed"),
                }
            }
        });

        Ok(Arc::new(Self { path, doc, save_tx }))
    }

    /// Snapshot of the current document.
    pub async fn document(&self) -> ConfigDoc {
        self.doc.read().await.clone()
    }

    /// Write the current document out immediately. Used at shutdown so a
    /// coalesced save pending in the saver task cannot be lost.
    pub async fn flush(&self) -> Result<(), DomainError> {
        let json = {
            let doc = self.doc.read().await;
            serde_json::to_string_pretty(&*doc)
                .map_err(|e| DomainError::State(e.to_string()))?
        };
        write_atomic(&self.path, &json).await
    }

    fn schedule_save(&self) {
        // A full queue already means a save is pending.
        let _ = self.save_tx.try_send(());
    }
}

/// Write-replace: temp file, sync_all, atomic rename.
async fn write_atomic(path: &Path, json: &str) -> Result<(), DomainError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl StatePort for JsonConfigStore {
    async fn last_id(&self, channel_id: &str) -> i32 {
        self.doc
            .read()
            .await
            .spider
            .last_ids
            .get(channel_id)
            .copied()
            .unwrap_or(0)
    }

    async fn set_last_id(&self, channel_id: &str, message_id: i32) -> Result<(), DomainError> {
        {
            let mut doc = self.doc.write().await;
            doc.spider
                .last_ids
                .insert(channel_id.to_string(), message_id);
        }
        self.schedule_save();
        Ok(())
    }
}
