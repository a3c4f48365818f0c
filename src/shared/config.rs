//! Application configuration. API credentials, paths, and the persistent
//! spider document.
//!
//! Bootstrap settings (credentials, directories) come from the environment
//! via the `config` crate; the spider document is a JSON file owned by the
//! persistence adapter and shaped like the keys it documents:
//! `spider.*`, `filter.*`, `fileOrganization.*`.

use crate::domain::{FilterPolicy, MediaKind, MediaKindSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bootstrap settings from environment / .env.
#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    pub data_dir: Option<String>,
    pub session_path: Option<String>,
    /// Path of the spider document; defaults to `<dataDir>/config.json`.
    pub config_path: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        let mut c = config::Config::builder();
        c = c.add_source(config::Environment::with_prefix("TG_SPIDER"));
        if let Ok(path) = std::env::var("TG_SPIDER_CONFIG") {
            c = c.add_source(config::File::with_name(&path));
        }
        c.build()?.try_deserialize()
    }

    pub fn data_dir_or_default(&self) -> String {
        self.data_dir.clone().unwrap_or_else(|| "./data".into())
    }

    pub fn session_path_or_default(&self) -> String {
        self.session_path
            .clone()
            .unwrap_or_else(|| "./session.db".into())
    }
}

/// The persistent configuration document. The core writes back only
/// `spider.lastIds`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigDoc {
    pub spider: SpiderSection,
    pub filter: FilterSection,
    pub file_organization: FileOrganizationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpiderSection {
    /// Maximum concurrently active channels.
    pub concurrency: usize,
    /// Selected channel ids; `"me"` is the saved-messages sink.
    pub channels: Vec<String>,
    /// Per-channel checkpoint: highest fully downloaded message id.
    pub last_ids: HashMap<String, i32>,
    /// Per-channel media allow list, comma-separated. `"_"` documents the
    /// placeholder and means the default full set.
    pub medias: HashMap<String, String>,
    pub group_message: bool,
    pub enable_download_acceleration: bool,
    pub download_threads: usize,
    pub chunk_size: usize,
    pub max_retries: u32,
    /// First-contact behavior: -1 newest only, 0 anchor only, k > 0 the
    /// newest k messages.
    pub new_channel_strategy: i32,
}

impl Default for SpiderSection {
    fn default() -> Self {
        Self {
            concurrency: 5,
            channels: Vec::new(),
            last_ids: HashMap::new(),
            medias: HashMap::new(),
            group_message: false,
            enable_download_acceleration: true,
            download_threads: 5,
            chunk_size: 512 * 1024,
            max_retries: 3,
            new_channel_strategy: -1,
        }
    }
}

/// `filter.default.<kind>` plus `filter.<kind>.<channelId>` overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSection {
    pub default: HashMap<String, String>,
    #[serde(flatten)]
    pub per_kind: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileOrganizationSection {
    pub enabled: bool,
    pub create_subfolders: bool,
}

impl ConfigDoc {
    /// Resolved size-filter table.
    pub fn filter_policy(&self) -> FilterPolicy {
        let mut policy = FilterPolicy::new();
        for (kind, range) in &self.filter.default {
            if let Some(kind) = MediaKind::parse(kind) {
                policy.set_default(kind, range.clone());
            }
        }
        for (kind, overrides) in &self.filter.per_kind {
            if let Some(kind) = MediaKind::parse(kind) {
                for (channel, range) in overrides {
                    policy.set_override(kind, channel.clone(), range.clone());
                }
            }
        }
        policy
    }

    /// Media kinds allowed for a channel; absent entries mean all.
    pub fn medias_allowed(&self, channel_id: &str) -> MediaKindSet {
        match self.spider.medias.get(channel_id) {
            Some(list) => MediaKindSet::parse(list),
            None => MediaKindSet::all(),
        }
    }

    pub fn last_id(&self, channel_id: &str) -> i32 {
        self.spider
            .last_ids
            .get(channel_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_defaults() {
        let doc: ConfigDoc = serde_json::from_str("{}").unwrap();
        assert_eq!(doc.spider.concurrency, 5);
        assert_eq!(doc.spider.download_threads, 5);
        assert_eq!(doc.spider.chunk_size, 512 * 1024);
        assert_eq!(doc.spider.max_retries, 3);
        assert_eq!(doc.spider.new_channel_strategy, -1);
        assert!(doc.spider.enable_download_acceleration);
        assert!(!doc.spider.group_message);
        assert!(!doc.file_organization.enabled);
    }

    #[test]
    fn camel_case_keys_round_trip() {
        let raw = r#"{
            "spider": {
                "concurrency": 2,
                "channels": ["me", "-1001234"],
                "lastIds": { "-1001234": 500 },
                "medias": { "-1001234": "photo,video", "me": "_" },
                "groupMessage": true,
                "enableDownloadAcceleration": false,
                "downloadThreads": 8,
                "chunkSize": 131072,
                "maxRetries": 5,
                "newChannelStrategy": 10
            },
            "filter": {
                "default": { "video": "0-1048576" },
                "photo": { "-1001234": "1k-2m" }
            },
            "fileOrganization": { "enabled": true, "createSubfolders": true }
        }"#;
        let doc: ConfigDoc = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.spider.concurrency, 2);
        assert_eq!(doc.last_id("-1001234"), 500);
        assert_eq!(doc.last_id("me"), 0);
        assert!(doc.spider.group_message);
        assert!(!doc.spider.enable_download_acceleration);
        assert_eq!(doc.spider.new_channel_strategy, 10);

        let allowed = doc.medias_allowed("-1001234");
        assert!(allowed.contains(MediaKind::Photo));
        assert!(!allowed.contains(MediaKind::File));
        assert_eq!(doc.medias_allowed("me"), MediaKindSet::all());
        assert_eq!(doc.medias_allowed("other"), MediaKindSet::all());

        // Round-trip keeps camelCase keys.
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("lastIds"));
        assert!(json.contains("createSubfolders"));
        let again: ConfigDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(again.last_id("-1001234"), 500);
    }

    #[test]
    fn filter_policy_resolution() {
        let raw = r#"{
            "filter": {
                "default": { "video": "0-1048576" },
                "video": { "c9": "0-99" }
            }
        }"#;
        let doc: ConfigDoc = serde_json::from_str(raw).unwrap();
        let policy = doc.filter_policy();
        assert!(policy.accept("c1", MediaKind::Video, Some(1024)));
        assert!(!policy.accept("c1", MediaKind::Video, Some(2 * 1024 * 1024)));
        assert!(!policy.accept("c9", MediaKind::Video, Some(1024)));
        assert!(policy.accept("c9", MediaKind::Video, Some(50)));
    }
}
