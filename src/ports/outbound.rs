//! Outbound ports. Application calls into infrastructure.
//!
//! Implemented by adapters.

use crate::domain::{
    Channel, Dialog, DomainError, FileLocation, Media, MessageMeta, Topic,
};
use std::path::Path;
use std::sync::Arc;

/// One chunk read result. Data-center migration is a value here, not an
/// error: the downloader switches senders and retries at no budget cost.
#[derive(Debug, Clone)]
pub enum FileChunk {
    Bytes(Vec<u8>),
    Migrate(i32),
}

/// An RPC sender bound to one data center. Once created it is shared and
/// reusable; implementations serialize their own framing.
#[async_trait::async_trait]
pub trait FileSender: Send + Sync {
    /// Read `[offset, offset + limit)` of the file. Always precise.
    async fn get_file(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: usize,
    ) -> Result<FileChunk, DomainError>;
}

/// Telegram RPC facade. Only the calls the engine needs.
#[async_trait::async_trait]
pub trait TgGateway: Send + Sync {
    /// Enumerate dialogs once each. Entries without a last message are
    /// skipped silently (known upstream iteration bug).
    async fn iter_dialogs(&self) -> Result<Vec<Dialog>, DomainError>;

    /// Resolve channel descriptors. On any error the id list is bisected
    /// and both halves retried, so one corrupt id cannot fail the batch;
    /// a failing single id resolves to nothing.
    async fn get_channels(&self, ids: &[String]) -> Result<Vec<Channel>, DomainError>;

    /// Best-effort topic list; errors yield an empty list.
    async fn get_forum_topics(&self, channel_id: &str) -> Vec<Topic>;

    /// One page of channel history, newest first, as the server returns it.
    async fn get_history(
        &self,
        channel_id: &str,
        offset_id: i32,
        add_offset: i32,
        limit: i32,
    ) -> Result<Vec<MessageMeta>, DomainError>;

    /// One page of the comment thread under `msg_id`, newest first.
    async fn get_replies(
        &self,
        channel_id: &str,
        msg_id: i32,
        offset_id: i32,
        limit: i32,
    ) -> Result<Vec<MessageMeta>, DomainError>;

    /// Sender bound to the given data center, created lazily and cached.
    async fn sender_for(&self, dc_id: i32) -> Result<Arc<dyn FileSender>, DomainError>;
}

/// Media download port: writes the media's full byte stream to `dest`.
/// The progress callback receives `(downloaded, total)` after every chunk.
#[async_trait::async_trait]
pub trait MediaDownloadPort: Send + Sync {
    async fn download(
        &self,
        media: &Media,
        dest: &Path,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<(), DomainError>;
}

/// State port. Tracks the per-channel checkpoint (`spider.lastIds`).
#[async_trait::async_trait]
pub trait StatePort: Send + Sync {
    /// Last fully downloaded message id for a channel. 0 if none.
    async fn last_id(&self, channel_id: &str) -> i32;

    /// Advance the checkpoint after a successful download.
    async fn set_last_id(&self, channel_id: &str, message_id: i32) -> Result<(), DomainError>;
}
