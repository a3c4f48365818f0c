//! Map grammers tl types to domain entities.
//!
//! Extracts MessageMeta and Media from raw history pages. Service messages
//! and empty messages are skipped (skip conditions, not errors).

use crate::domain::{DocumentMeta, Media, MediaKind, MessageMeta, PhotoMeta};
use grammers_client::tl;

/// Map a raw message. `is_forum` controls topic extraction from the reply
/// header; the sentinel for unresolvable topics is applied downstream.
pub fn message_to_meta(msg: &tl::enums::Message, is_forum: bool) -> Option<MessageMeta> {
    let m = match msg {
        tl::enums::Message::Message(m) => m,
        tl::enums::Message::Empty(_) | tl::enums::Message::Service(_) => return None,
    };

    let topic_id = if is_forum { topic_of(m) } else { None };
    let (reply_count, replies_channel) = match m.replies.as_ref() {
        Some(tl::enums::MessageReplies::Replies(r)) => (r.replies, r.channel_id),
        None => (0, None),
    };

    Some(MessageMeta {
        id: m.id,
        grouped_id: m.grouped_id.map(|g| g.to_string()),
        topic_id,
        media: m.media.as_ref().and_then(extract_media),
        date: m.date as i64,
        is_comment: false,
        reply_count,
        replies_channel,
    })
}

/// Topic id from the reply header of a forum message.
fn topic_of(m: &tl::types::Message) -> Option<String> {
    match m.reply_to.as_ref() {
        Some(tl::enums::MessageReplyHeader::Header(h)) if h.forum_topic => h
            .reply_to_top_id
            .or(h.reply_to_msg_id)
            .map(|id| id.to_string()),
        _ => None,
    }
}

/// Extract downloadable media. Unsupported media variants yield None.
pub fn extract_media(media: &tl::enums::MessageMedia) -> Option<Media> {
    match media {
        tl::enums::MessageMedia::Photo(photo_media) => {
            let photo = match photo_media.photo.as_ref()? {
                tl::enums::Photo::Photo(p) => p,
                tl::enums::Photo::Empty(_) => return None,
            };
            let (size, thumb_size) = largest_photo_size(&photo.sizes);
            Some(Media::Photo(PhotoMeta {
                id: photo.id,
                access_hash: photo.access_hash,
                file_reference: photo.file_reference.clone(),
                dc_id: photo.dc_id,
                thumb_size,
                size,
            }))
        }
        tl::enums::MessageMedia::Document(doc_media) => {
            let doc = match doc_media.document.as_ref()? {
                tl::enums::Document::Document(d) => d,
                tl::enums::Document::Empty(_) => return None,
            };
            let mut file_name = None;
            let mut has_video = false;
            let mut has_audio = false;
            for attr in &doc.attributes {
                match attr {
                    tl::enums::DocumentAttribute::Filename(f) => {
                        file_name = Some(f.file_name.clone());
                    }
                    tl::enums::DocumentAttribute::Video(_) => has_video = true,
                    tl::enums::DocumentAttribute::Audio(_) => has_audio = true,
                    _ => {}
                }
            }
            Some(Media::Document(DocumentMeta {
                id: doc.id,
                access_hash: doc.access_hash,
                file_reference: doc.file_reference.clone(),
                dc_id: doc.dc_id,
                size: doc.size.max(0) as u64,
                mime_type: doc.mime_type.clone(),
                file_name,
                kind: MediaKind::of_document(has_video, has_audio),
            }))
        }
        _ => None,
    }
}

/// Pick the largest rendition. The selector is the `type` string of the
/// largest plain size, or empty when the largest is progressive.
fn largest_photo_size(sizes: &[tl::enums::PhotoSize]) -> (Option<u64>, String) {
    let mut best: Option<(i32, String)> = None;
    for size in sizes {
        let candidate = match size {
            tl::enums::PhotoSize::Size(ps) => Some((ps.size, ps.r#type.clone())),
            tl::enums::PhotoSize::Progressive(p) => p
                .sizes
                .iter()
                .copied()
                .max()
                .map(|bytes| (bytes, String::new())),
            _ => None,
        };
        if let Some((bytes, selector)) = candidate {
            if best.as_ref().is_none_or(|(b, _)| bytes > *b) {
                best = Some((bytes, selector));
            }
        }
    }
    match best {
        Some((bytes, selector)) => (Some(bytes.max(0) as u64), selector),
        None => (None, String::new()),
    }
}
