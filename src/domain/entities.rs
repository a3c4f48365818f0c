//! Domain entities. Pure data structures for the core business.
//!
//! No Telegram/IO types here — these are mapped from adapters.

use serde::{Deserialize, Serialize};

/// A crawlable channel surface. `"me"` denotes the user's saved messages.
///
/// Built once at startup from dialog enumeration; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Stable opaque id ("me" or a numeric id rendered as string).
    pub id: String,
    pub title: String,
    pub is_forum: bool,
    /// Forum topics, empty for non-forum channels. Best-effort.
    pub topics: Vec<Topic>,
}

/// A sub-thread of a forum-enabled channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub title: String,
}

/// A dialog entry from enumeration. Channel selection happens outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialog {
    pub id: String,
    pub title: String,
}

/// The subset of a message the engine needs.
///
/// Within one channel, ids seen by the engine are strictly increasing.
/// Comments harvested from a reply thread carry `is_comment` and never
/// advance the channel checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: i32,
    /// Groups multiple media messages into one logical post.
    pub grouped_id: Option<String>,
    /// Present for forum channels; `"1"` when no topic is resolvable.
    pub topic_id: Option<String>,
    pub media: Option<Media>,
    /// Unix seconds.
    pub date: i64,
    /// True when harvested from a reply (discussion) thread.
    pub is_comment: bool,
    /// Number of replies in the attached discussion thread, 0 if none.
    pub reply_count: i32,
    /// Discussion channel id when the reply thread lives in one.
    pub replies_channel: Option<i64>,
}

/// Downloadable media attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Media {
    Photo(PhotoMeta),
    Document(DocumentMeta),
}

/// Photo with the largest size already selected by the mapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoMeta {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    pub dc_id: i32,
    /// Selector (`type`) of the largest size; empty for progressive sizes.
    pub thumb_size: String,
    /// Byte size of the chosen rendition, when the server reported one.
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    pub dc_id: i32,
    pub size: u64,
    pub mime_type: String,
    /// From the filename attribute, when present.
    pub file_name: Option<String>,
    /// Classified at map time from the document's attributes.
    pub kind: MediaKind,
}

impl Media {
    pub fn kind(&self) -> MediaKind {
        match self {
            Media::Photo(_) => MediaKind::Photo,
            Media::Document(d) => d.kind,
        }
    }

    /// Total byte size, when determinable.
    pub fn size(&self) -> Option<u64> {
        match self {
            Media::Photo(p) => p.size,
            Media::Document(d) => Some(d.size),
        }
    }

    /// Home data center of the file bytes.
    pub fn dc_id(&self) -> i32 {
        match self {
            Media::Photo(p) => p.dc_id,
            Media::Document(d) => d.dc_id,
        }
    }

    pub fn raw_file_name(&self) -> Option<&str> {
        match self {
            Media::Photo(_) => None,
            Media::Document(d) => d.file_name.as_deref(),
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Media::Photo(_) => Some("image/jpeg"),
            Media::Document(d) => Some(d.mime_type.as_str()),
        }
    }

    /// File location for chunk reads.
    pub fn location(&self) -> FileLocation {
        match self {
            Media::Photo(p) => FileLocation::Photo {
                id: p.id,
                access_hash: p.access_hash,
                file_reference: p.file_reference.clone(),
                thumb_size: p.thumb_size.clone(),
            },
            Media::Document(d) => FileLocation::Document {
                id: d.id,
                access_hash: d.access_hash,
                file_reference: d.file_reference.clone(),
            },
        }
    }
}

/// Location of a file on a Telegram data center, as needed by chunk reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLocation {
    Photo {
        id: i64,
        access_hash: i64,
        file_reference: Vec<u8>,
        thumb_size: String,
    },
    Document {
        id: i64,
        access_hash: i64,
        file_reference: Vec<u8>,
    },
}

/// Derived media classification used by filtering and path layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    File,
}

impl MediaKind {
    /// Dispatch order inside the scheduler: photos, videos, audios, files.
    pub const ALL: [MediaKind; 4] = [
        MediaKind::Photo,
        MediaKind::Video,
        MediaKind::Audio,
        MediaKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<MediaKind> {
        match s.trim() {
            "photo" => Some(MediaKind::Photo),
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            "file" => Some(MediaKind::File),
            _ => None,
        }
    }

    /// Classify a document by its attributes alone. A document whose only
    /// attribute is a filename is a plain file, whatever its mime type.
    pub fn of_document(has_video_attr: bool, has_audio_attr: bool) -> MediaKind {
        if has_video_attr {
            MediaKind::Video
        } else if has_audio_attr {
            MediaKind::Audio
        } else {
            MediaKind::File
        }
    }
}

/// Subset of `{photo, video, audio, file}` allowed for a channel or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaKindSet {
    photo: bool,
    video: bool,
    audio: bool,
    file: bool,
}

impl MediaKindSet {
    pub fn all() -> Self {
        Self {
            photo: true,
            video: true,
            audio: true,
            file: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list ("photo,video"). Unknown entries are
    /// ignored; the `"_"` placeholder (and an empty string) yields the
    /// default full set.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "_" {
            return Self::all();
        }
        let mut set = Self::none();
        for part in trimmed.split(',') {
            if let Some(kind) = MediaKind::parse(part) {
                set.insert(kind);
            }
        }
        set
    }

    pub fn contains(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Photo => self.photo,
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
            MediaKind::File => self.file,
        }
    }

    pub fn insert(&mut self, kind: MediaKind) {
        match kind {
            MediaKind::Photo => self.photo = true,
            MediaKind::Video => self.video = true,
            MediaKind::Audio => self.audio = true,
            MediaKind::File => self.file = true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.photo || self.video || self.audio || self.file)
    }
}

/// Unit of work between ingestor and scheduler.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub channel_id: String,
    pub message: MessageMeta,
    /// Media kinds that passed the per-channel allow set and size filter.
    pub allowed: MediaKindSet,
}

/// Emitted after every successful chunk write. Consumers are external.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub channel_id: String,
    pub file_name: String,
    pub downloaded: u64,
    pub total: u64,
}
