//! Per-channel ingestion: one page of remote history per pass, converted
//! into a bounded, ordered batch of download tasks.
//!
//! The outer scheduler drives further pages by reinvoking on its timer, so
//! a single pass never holds more than one page (plus expanded comment
//! threads) in memory. Comment threads are paged explicitly and appended
//! after their parent; comments never advance the channel checkpoint.

use crate::domain::{
    Channel, DomainError, DownloadTask, FilterPolicy, MediaKindSet, MessageMeta,
};
use crate::ports::TgGateway;
use std::sync::Arc;
use tracing::{debug, warn};

/// History page size per ingestion pass.
pub const PAGE_LIMIT: i32 = 100;

/// Comment threads are paged with this size instead of the upstream
/// "effectively unlimited" sentinel.
const REPLY_PAGE_LIMIT: i32 = 100;

/// Topic sentinel for forum messages without a resolvable topic.
const FALLBACK_TOPIC: &str = "1";

/// Result of one ingestion pass over a channel.
#[derive(Debug, Default)]
pub struct IngestPage {
    /// Ascending by id; comments follow their parent.
    pub tasks: Vec<DownloadTask>,
    /// Checkpoint to record immediately, for anchor-only strategies.
    pub anchor: Option<i32>,
}

/// Converts remote history into ordered local tasks, one channel at a time.
pub struct ChannelIngestor {
    gateway: Arc<dyn TgGateway>,
    filter: FilterPolicy,
    /// First-contact behavior: -1 newest message only, 0 anchor without
    /// downloading, k > 0 the newest k messages.
    new_channel_strategy: i32,
}

impl ChannelIngestor {
    pub fn new(
        gateway: Arc<dyn TgGateway>,
        filter: FilterPolicy,
        new_channel_strategy: i32,
    ) -> Self {
        Self {
            gateway,
            filter,
            new_channel_strategy,
        }
    }

    /// Fetch one page of messages newer than `last_id` and expand comment
    /// threads. `allowed` is the channel's media allow set.
    pub async fn fetch_page(
        &self,
        channel: &Channel,
        last_id: i32,
        allowed: MediaKindSet,
    ) -> Result<IngestPage, DomainError> {
        if last_id > 0 {
            let raw = self
                .gateway
                .get_history(&channel.id, last_id, -1 - PAGE_LIMIT, PAGE_LIMIT)
                .await?;
            let messages = ascending_newer_than(raw, last_id);
            let expanded = self.expand_comments(&channel.id, messages).await;
            return Ok(IngestPage {
                tasks: self.build_tasks(channel, expanded, allowed),
                anchor: None,
            });
        }

        // First contact with this channel.
        match self.new_channel_strategy {
            0 => {
                let raw = self.gateway.get_history(&channel.id, 1, -1, 1).await?;
                let anchor = raw.iter().map(|m| m.id).max();
                debug!(channel = %channel.id, ?anchor, "anchored without backlog");
                Ok(IngestPage {
                    tasks: Vec::new(),
                    anchor,
                })
            }
            k if k > 0 => {
                let raw = self.gateway.get_history(&channel.id, 0, 0, k).await?;
                let messages = ascending_newer_than(raw, 0);
                let expanded = self.expand_comments(&channel.id, messages).await;
                Ok(IngestPage {
                    tasks: self.build_tasks(channel, expanded, allowed),
                    anchor: None,
                })
            }
            _ => {
                // Default: the single newest message anchors the channel and
                // is downloaded like any other task.
                let raw = self.gateway.get_history(&channel.id, 1, -1, 1).await?;
                let messages = ascending_newer_than(raw, 0);
                let expanded = self.expand_comments(&channel.id, messages).await;
                Ok(IngestPage {
                    tasks: self.build_tasks(channel, expanded, allowed),
                    anchor: None,
                })
            }
        }
    }

    /// Append each message's comment thread directly after it. Reply-thread
    /// errors degrade to an empty thread.
    async fn expand_comments(
        &self,
        channel_id: &str,
        messages: Vec<MessageMeta>,
    ) -> Vec<MessageMeta> {
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            let wants_thread = message.reply_count > 0 && message.replies_channel.is_some();
            let msg_id = message.id;
            out.push(message);
            if wants_thread {
                out.extend(self.fetch_thread(channel_id, msg_id).await);
            }
        }
        out
    }

    async fn fetch_thread(&self, channel_id: &str, msg_id: i32) -> Vec<MessageMeta> {
        let mut comments: Vec<MessageMeta> = Vec::new();
        let mut offset_id = 0;
        loop {
            let page = match self
                .gateway
                .get_replies(channel_id, msg_id, offset_id, REPLY_PAGE_LIMIT)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(channel_id, msg_id, error = %e, "reply thread fetch failed, skipping");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            let page_min = page.iter().map(|m| m.id).min().unwrap_or(0);
            let page_len = page.len();
            comments.extend(page);
            if (page_len as i32) < REPLY_PAGE_LIMIT {
                break;
            }
            offset_id = page_min;
        }
        comments.sort_by_key(|m| m.id);
        for comment in &mut comments {
            comment.is_comment = true;
        }
        comments
    }

    fn build_tasks(
        &self,
        channel: &Channel,
        messages: Vec<MessageMeta>,
        allowed: MediaKindSet,
    ) -> Vec<DownloadTask> {
        messages
            .into_iter()
            .map(|mut message| {
                if channel.is_forum && !message.is_comment && message.topic_id.is_none() {
                    message.topic_id = Some(FALLBACK_TOPIC.to_string());
                }
                let task_allowed = self.allowed_for(&channel.id, allowed, &message);
                DownloadTask {
                    channel_id: channel.id.clone(),
                    message,
                    allowed: task_allowed,
                }
            })
            .collect()
    }

    /// Intersect the channel allow set with the size filter for the media
    /// present on this message.
    fn allowed_for(
        &self,
        channel_id: &str,
        allowed: MediaKindSet,
        message: &MessageMeta,
    ) -> MediaKindSet {
        let mut set = MediaKindSet::none();
        if let Some(media) = &message.media {
            let kind = media.kind();
            if allowed.contains(kind) && self.filter.accept(channel_id, kind, media.size()) {
                set.insert(kind);
            }
        }
        set
    }
}

/// Keep messages strictly newer than `floor`, oldest first.
fn ascending_newer_than(raw: Vec<MessageMeta>, floor: i32) -> Vec<MessageMeta> {
    let mut messages: Vec<MessageMeta> = raw.into_iter().filter(|m| m.id > floor).collect();
    messages.sort_by_key(|m| m.id);
    messages
}
