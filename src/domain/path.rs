//! Destination-path recipe. A pure function of its inputs.
//!
//! Layout:
//! `<dataDir>/<channel folder>[/_<topic>][/<groupedId>][/<mediaType>]/<filename>`
//! The grouped segment appears only when grouping is enabled; the media-type
//! segment only when file organization with subfolders is enabled.

use crate::domain::MediaKind;
use std::path::{Path, PathBuf};

/// Fixed mime -> extension table. Misses fall back to the per-kind default.
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("image/heic", "heic"),
    ("video/mp4", "mp4"),
    ("video/quicktime", "mov"),
    ("video/webm", "webm"),
    ("video/x-matroska", "mkv"),
    ("audio/mpeg", "mp3"),
    ("audio/mp4", "m4a"),
    ("audio/ogg", "ogg"),
    ("audio/flac", "flac"),
    ("audio/x-wav", "wav"),
    ("application/pdf", "pdf"),
    ("application/zip", "zip"),
    ("application/x-tgsticker", "tgs"),
    ("text/plain", "txt"),
];

/// Everything the path recipe depends on.
#[derive(Debug, Clone)]
pub struct PathOptions<'a> {
    pub data_dir: &'a Path,
    pub channel_id: &'a str,
    pub channel_title: &'a str,
    pub topic_id: Option<&'a str>,
    pub grouped_id: Option<&'a str>,
    /// `spider.groupMessage`: grouped posts get their own folder.
    pub group_message: bool,
    /// `fileOrganization.enabled`.
    pub organize_enabled: bool,
    /// `fileOrganization.createSubfolders`.
    pub create_subfolders: bool,
    pub message_id: i32,
    pub raw_file_name: Option<&'a str>,
    pub mime_type: Option<&'a str>,
    pub kind: MediaKind,
}

/// Compute the destination path. No side effects; the caller creates the
/// directory right before writing.
pub fn media_path(o: &PathOptions<'_>) -> PathBuf {
    let mut dir = o
        .data_dir
        .join(channel_folder(o.channel_title, o.channel_id));
    if let Some(topic) = o.topic_id {
        dir.push(format!("_{topic}"));
    }
    if o.group_message {
        if let Some(grouped) = o.grouped_id {
            dir.push(grouped);
        }
    }
    if o.organize_enabled && o.create_subfolders {
        dir.push(o.kind.as_str());
    }
    dir.join(file_name(o))
}

/// Sanitized channel folder name. Each of `/ \ : * ? " < > |` becomes `_`;
/// an empty result falls back to the channel id.
pub fn channel_folder(title: &str, id: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    if sanitized.is_empty() {
        id.to_string()
    } else {
        sanitized
    }
}

fn file_name(o: &PathOptions<'_>) -> String {
    let mut name = String::new();
    if !o.group_message {
        if let Some(grouped) = o.grouped_id {
            name.push_str(grouped);
            name.push('_');
        }
    }
    name.push_str(&o.message_id.to_string());
    if let Some(raw) = o.raw_file_name {
        name.push('_');
        name.push_str(raw);
    }
    if !has_usable_extension(o.raw_file_name) {
        name.push('.');
        name.push_str(extension_for(o.mime_type, o.kind));
    }
    name
}

/// True when the raw file name carries a dot after the last path separator
/// and not as the first character of that segment.
fn has_usable_extension(raw: Option<&str>) -> bool {
    let Some(raw) = raw else {
        return false;
    };
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    base.char_indices().any(|(i, c)| c == '.' && i > 0)
}

fn extension_for(mime: Option<&str>, kind: MediaKind) -> &'static str {
    if let Some(mime) = mime {
        if let Some((_, ext)) = MIME_EXTENSIONS.iter().find(|(m, _)| *m == mime) {
            return ext;
        }
    }
    match kind {
        MediaKind::Photo => "jpg",
        MediaKind::Video => "mp4",
        MediaKind::Audio => "mp3",
        MediaKind::File => "dat",
    }
}
