//! Implements TgGateway using grammers Client.
//!
//! Handles FloodWait by sleeping and retrying, caches InputPeer by channel
//! id so repeated history requests never re-enumerate dialogs, and hands
//! out one file sender per data center. Chunk reads surface FILE_MIGRATE
//! as a value so the downloader can switch senders without burning a retry.

use crate::adapters::telegram::mapper;
use crate::domain::{Channel, Dialog, DomainError, FileLocation, MessageMeta, Topic};
use crate::ports::{FileChunk, FileSender, TgGateway};
use async_trait::async_trait;
use grammers_client::Client;
use grammers_client::InvocationError;
use grammers_client::tl;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// FloodWait is honoured at most this many times per call.
const FLOOD_WAIT_ATTEMPTS: u32 = 3;

#[derive(Clone)]
struct CachedPeer {
    input: tl::enums::InputPeer,
    title: String,
}

/// Telegram gateway adapter. Wraps a grammers Client handle.
pub struct GrammersTgGateway {
    client: Client,
    /// InputPeer + title by channel id, filled from dialog enumeration.
    peer_cache: Mutex<HashMap<String, CachedPeer>>,
    /// Forum flag by channel id, recorded during channel resolution and
    /// consulted when mapping history pages.
    forum_flags: Mutex<HashMap<String, bool>>,
    /// One reusable sender per data center.
    senders: Mutex<HashMap<i32, Arc<dyn FileSender>>>,
}

impl GrammersTgGateway {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            peer_cache: Mutex::new(HashMap::new()),
            forum_flags: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Invoke with FloodWait handling: error 420 sleeps for the
    /// server-provided duration and retries.
    async fn invoke_retrying<R>(&self, request: &R) -> Result<R::Return, DomainError>
    where
        R: tl::RemoteCall,
    {
        for attempt in 0..FLOOD_WAIT_ATTEMPTS {
            match self.client.invoke(request).await {
                Ok(response) => return Ok(response),
                Err(InvocationError::Rpc(rpc)) if rpc.code == 420 => {
                    let wait_secs = rpc.value.unwrap_or(60) as u64;
                    warn!(attempt, wait_secs, "FloodWait, sleeping");
                    tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                }
                Err(e) => return Err(DomainError::Gateway(e.to_string())),
            }
        }
        Err(DomainError::Gateway("FloodWait max retries".into()))
    }

    /// Enumerate dialogs, filling the peer cache. Entries without a last
    /// message are skipped: the upstream iterator aborts on them otherwise.
    async fn refresh_dialogs(&self) -> Result<Vec<Dialog>, DomainError> {
        let mut dialogs = self.client.iter_dialogs();
        let mut out = Vec::new();
        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| DomainError::Gateway(e.to_string()))?
        {
            if dialog.last_message.is_none() {
                continue;
            }
            let peer = dialog.peer();
            let id = peer.id().bot_api_dialog_id().to_string();
            let title = peer
                .name()
                .map(String::from)
                .unwrap_or_else(|| peer.id().to_string());
            if let Some(peer_ref) = peer.to_ref().await {
                let input: tl::enums::InputPeer = peer_ref.into();
                self.peer_cache.lock().await.insert(
                    id.clone(),
                    CachedPeer {
                        input,
                        title: title.clone(),
                    },
                );
            }
            out.push(Dialog { id, title });
        }
        Ok(out)
    }

    /// Resolve a channel id to a cached peer, enumerating dialogs on miss.
    async fn lookup_peer(&self, channel_id: &str) -> Result<CachedPeer, DomainError> {
        if channel_id == "me" {
            return Ok(CachedPeer {
                input: tl::enums::InputPeer::PeerSelf(tl::types::InputPeerSelf {}),
                title: "Saved Messages".into(),
            });
        }
        if let Some(peer) = self.peer_cache.lock().await.get(channel_id) {
            return Ok(peer.clone());
        }
        self.refresh_dialogs().await?;
        self.peer_cache
            .lock()
            .await
            .get(channel_id)
            .cloned()
            .ok_or_else(|| {
                DomainError::Gateway(format!("peer {channel_id} not found in dialogs"))
            })
    }

    async fn is_forum(&self, channel_id: &str) -> bool {
        self.forum_flags
            .lock()
            .await
            .get(channel_id)
            .copied()
            .unwrap_or(false)
    }

    /// Resolve one batch of ids in a single channels.GetChannels call.
    async fn try_resolve_batch(&self, ids: &[String]) -> Result<Vec<Channel>, DomainError> {
        let mut out = Vec::new();
        let mut inputs = Vec::new();
        let mut raw_to_id: HashMap<i64, String> = HashMap::new();
        for id in ids {
            if id == "me" {
                out.push(Channel {
                    id: "me".into(),
                    title: "Saved Messages".into(),
                    is_forum: false,
                    topics: Vec::new(),
                });
                continue;
            }
            let peer = self.lookup_peer(id).await?;
            match peer.input {
                tl::enums::InputPeer::Channel(c) => {
                    raw_to_id.insert(c.channel_id, id.clone());
                    inputs.push(tl::enums::InputChannel::Channel(tl::types::InputChannel {
                        channel_id: c.channel_id,
                        access_hash: c.access_hash,
                    }));
                }
                _ => {
                    // Plain group or user dialog: no channel-side metadata.
                    out.push(Channel {
                        id: id.clone(),
                        title: peer.title,
                        is_forum: false,
                        topics: Vec::new(),
                    });
                }
            }
        }
        if inputs.is_empty() {
            return Ok(out);
        }
        let response = self
            .invoke_retrying(&tl::functions::channels::GetChannels { id: inputs })
            .await?;
        let chats = match response {
            tl::enums::messages::Chats::Chats(c) => c.chats,
            tl::enums::messages::Chats::Slice(c) => c.chats,
        };
        for chat in chats {
            if let tl::enums::Chat::Channel(ch) = chat {
                if let Some(cfg_id) = raw_to_id.get(&ch.id) {
                    self.forum_flags
                        .lock()
                        .await
                        .insert(cfg_id.clone(), ch.forum);
                    out.push(Channel {
                        id: cfg_id.clone(),
                        title: ch.title.clone(),
                        is_forum: ch.forum,
                        topics: Vec::new(),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Bisect on failure so one corrupt id cannot fail the whole batch.
    fn resolve_channels<'a>(
        &'a self,
        ids: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Vec<Channel>> + Send + 'a>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Vec::new();
            }
            match self.try_resolve_batch(ids).await {
                Ok(channels) => channels,
                Err(e) if ids.len() == 1 => {
                    warn!(id = %ids[0], error = %e, "channel resolution failed, skipping");
                    Vec::new()
                }
                Err(e) => {
                    debug!(count = ids.len(), error = %e, "batch resolution failed, bisecting");
                    let mid = ids.len() / 2;
                    let mut resolved = self.resolve_channels(&ids[..mid]).await;
                    resolved.extend(self.resolve_channels(&ids[mid..]).await);
                    resolved
                }
            }
        })
    }
}

#[async_trait]
impl TgGateway for GrammersTgGateway {
    async fn iter_dialogs(&self) -> Result<Vec<Dialog>, DomainError> {
        self.refresh_dialogs().await
    }

    async fn get_channels(&self, ids: &[String]) -> Result<Vec<Channel>, DomainError> {
        Ok(self.resolve_channels(ids).await)
    }

    async fn get_forum_topics(&self, channel_id: &str) -> Vec<Topic> {
        let peer = match self.lookup_peer(channel_id).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!(channel_id, error = %e, "topic fetch failed");
                return Vec::new();
            }
        };
        let tl::enums::InputPeer::Channel(c) = peer.input else {
            return Vec::new();
        };
        let request = tl::functions::channels::GetForumTopics {
            channel: tl::enums::InputChannel::Channel(tl::types::InputChannel {
                channel_id: c.channel_id,
                access_hash: c.access_hash,
            }),
            q: None,
            offset_date: 0,
            offset_id: 0,
            offset_topic: 0,
            limit: 100,
        };
        match self.invoke_retrying(&request).await {
            Ok(tl::enums::messages::ForumTopics::Topics(topics)) => topics
                .topics
                .into_iter()
                .filter_map(|topic| match topic {
                    tl::enums::ForumTopic::Topic(t) => Some(Topic {
                        id: t.id.to_string(),
                        title: t.title,
                    }),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                warn!(channel_id, error = %e, "topic fetch failed");
                Vec::new()
            }
        }
    }

    async fn get_history(
        &self,
        channel_id: &str,
        offset_id: i32,
        add_offset: i32,
        limit: i32,
    ) -> Result<Vec<MessageMeta>, DomainError> {
        let peer = self.lookup_peer(channel_id).await?;
        let request = tl::functions::messages::GetHistory {
            peer: peer.input,
            offset_id,
            offset_date: 0,
            add_offset,
            limit,
            max_id: 0,
            min_id: 0,
            hash: 0,
        };
        let response = self.invoke_retrying(&request).await?;
        let raw = match response {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            tl::enums::messages::Messages::NotModified(_) => return Ok(vec![]),
        };
        let is_forum = self.is_forum(channel_id).await;
        Ok(raw
            .iter()
            .filter_map(|msg| mapper::message_to_meta(msg, is_forum))
            .collect())
    }

    async fn get_replies(
        &self,
        channel_id: &str,
        msg_id: i32,
        offset_id: i32,
        limit: i32,
    ) -> Result<Vec<MessageMeta>, DomainError> {
        let peer = self.lookup_peer(channel_id).await?;
        let request = tl::functions::messages::GetReplies {
            peer: peer.input,
            msg_id,
            offset_id,
            offset_date: 0,
            add_offset: 0,
            limit,
            max_id: 0,
            min_id: 0,
            hash: 0,
        };
        let response = self.invoke_retrying(&request).await?;
        let raw = match response {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            tl::enums::messages::Messages::NotModified(_) => return Ok(vec![]),
        };
        Ok(raw
            .iter()
            .filter_map(|msg| mapper::message_to_meta(msg, false))
            .collect())
    }

    async fn sender_for(&self, dc_id: i32) -> Result<Arc<dyn FileSender>, DomainError> {
        let mut senders = self.senders.lock().await;
        if let Some(sender) = senders.get(&dc_id) {
            return Ok(Arc::clone(sender));
        }
        debug!(dc_id, "creating file sender");
        let sender: Arc<dyn FileSender> = Arc::new(DcFileSender {
            client: self.client.clone(),
            dc_id,
        });
        senders.insert(dc_id, Arc::clone(&sender));
        Ok(sender)
    }
}

/// Chunk reader handle for one data center.
///
/// Requests go through the shared client's connection pool; the pool owns
/// transport routing, so a chunk the pool cannot serve from the target DC
/// comes back as FILE_MIGRATE and is surfaced as a value. The per-DC cache
/// keeps one handle per destination so a migration switch is a cheap
/// lookup, not a reconnect.
struct DcFileSender {
    client: Client,
    dc_id: i32,
}

#[async_trait]
impl FileSender for DcFileSender {
    async fn get_file(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: usize,
    ) -> Result<FileChunk, DomainError> {
        let request = tl::functions::upload::GetFile {
            precise: true,
            cdn_supported: false,
            location: input_location(location),
            offset: offset as i64,
            limit: limit as i32,
        };
        match self.client.invoke(&request).await {
            Ok(tl::enums::upload::File::File(file)) => Ok(FileChunk::Bytes(file.bytes)),
            Ok(tl::enums::upload::File::CdnRedirect(_)) => {
                Err(DomainError::Gateway("CDN redirect not supported".into()))
            }
            Err(InvocationError::Rpc(rpc)) if rpc.name.starts_with("FILE_MIGRATE") => {
                Ok(FileChunk::Migrate(
                    rpc.value.map(|v| v as i32).unwrap_or(self.dc_id),
                ))
            }
            Err(e) => Err(DomainError::Gateway(e.to_string())),
        }
    }
}

fn input_location(location: &FileLocation) -> tl::enums::InputFileLocation {
    match location {
        FileLocation::Photo {
            id,
            access_hash,
            file_reference,
            thumb_size,
        } => tl::enums::InputFileLocation::InputPhotoFileLocation(
            tl::types::InputPhotoFileLocation {
                id: *id,
                access_hash: *access_hash,
                file_reference: file_reference.clone(),
                thumb_size: thumb_size.clone(),
            },
        ),
        FileLocation::Document {
            id,
            access_hash,
            file_reference,
        } => tl::enums::InputFileLocation::InputDocumentFileLocation(
            tl::types::InputDocumentFileLocation {
                id: *id,
                access_hash: *access_hash,
                file_reference: file_reference.clone(),
                thumb_size: String::new(),
            },
        ),
    }
}
