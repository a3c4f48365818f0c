//! Engine: couples the ingestion tick with a bounded dispatcher pool.
//!
//! Concurrency is across channels, never within one: each channel is
//! strictly serialized so its checkpoint advances monotonically. Workers
//! pick the idle channel that has waited longest. The checkpoint is
//! advanced and persisted only after every media invocation for a
//! non-comment message succeeded; any failure clears the channel queue so
//! the next ingestion tick re-offers from the unchanged checkpoint.

use crate::domain::path::{PathOptions, media_path};
use crate::domain::{
    Channel, DomainError, DownloadTask, MediaKind, MediaKindSet, ProgressEvent,
};
use crate::ports::{MediaDownloadPort, StatePort};
use crate::usecases::ingestor::ChannelIngestor;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Engine knobs from `spider.*` and `fileOrganization.*`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum concurrently active channels.
    pub concurrency: usize,
    pub ingest_interval: Duration,
    pub data_dir: PathBuf,
    pub group_message: bool,
    pub organize_enabled: bool,
    pub create_subfolders: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            ingest_interval: Duration::from_secs(10),
            data_dir: PathBuf::from("./data"),
            group_message: false,
            organize_enabled: false,
            create_subfolders: false,
        }
    }
}

/// Initial per-channel state handed to the engine at startup.
pub struct ChannelSeed {
    pub channel: Channel,
    pub allowed: MediaKindSet,
    pub last_id: i32,
}

/// Per-channel state, owned by the engine and touched only under its lock.
struct ChannelRuntime {
    channel: Channel,
    allowed: MediaKindSet,
    queue: VecDeque<DownloadTask>,
    downloading: bool,
    last_download: Option<Instant>,
    last_id: i32,
}

pub struct Engine {
    ingestor: ChannelIngestor,
    downloader: Arc<dyn MediaDownloadPort>,
    state: Arc<dyn StatePort>,
    progress: mpsc::Sender<ProgressEvent>,
    opts: EngineOptions,
    channels: Mutex<HashMap<String, ChannelRuntime>>,
    work: Notify,
    stop_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(
        ingestor: ChannelIngestor,
        downloader: Arc<dyn MediaDownloadPort>,
        state: Arc<dyn StatePort>,
        progress: mpsc::Sender<ProgressEvent>,
        seeds: Vec<ChannelSeed>,
        opts: EngineOptions,
    ) -> Arc<Self> {
        let channels = seeds
            .into_iter()
            .map(|seed| {
                (
                    seed.channel.id.clone(),
                    ChannelRuntime {
                        channel: seed.channel,
                        allowed: seed.allowed,
                        queue: VecDeque::new(),
                        downloading: false,
                        last_download: None,
                        last_id: seed.last_id,
                    },
                )
            })
            .collect();
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            ingestor,
            downloader,
            state,
            progress,
            opts,
            channels: Mutex::new(channels),
            work: Notify::new(),
            stop_tx,
        })
    }

    /// Run ingestion and the worker pool until `stop` and a natural drain.
    pub async fn run(self: Arc<Self>) {
        let mut join = JoinSet::new();
        {
            let engine = Arc::clone(&self);
            join.spawn(async move { engine.ingest_loop().await });
        }
        for worker in 0..self.opts.concurrency.max(1) {
            let engine = Arc::clone(&self);
            join.spawn(async move { engine.worker_loop(worker).await });
        }
        while join.join_next().await.is_some() {}
        info!("engine stopped");
    }

    /// Cooperative stop: no new tasks are enqueued, workers drain naturally.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.work.notify_waiters();
    }

    fn stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Current checkpoint of a channel, for observers.
    pub async fn last_id(&self, channel_id: &str) -> Option<i32> {
        self.channels
            .lock()
            .await
            .get(channel_id)
            .map(|rt| rt.last_id)
    }

    /// True when no channel has queued or active work.
    pub async fn is_idle(&self) -> bool {
        self.channels
            .lock()
            .await
            .values()
            .all(|rt| rt.queue.is_empty() && !rt.downloading)
    }

    async fn ingest_loop(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut tick = tokio::time::interval(self.opts.ingest_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = stop_rx.changed() => {}
            }
            if self.stopped() {
                break;
            }
            self.ingest_pass().await;
        }
        debug!("ingestion stopped");
    }

    /// One tick: request a page for every channel that is fully idle. A
    /// channel with queued or in-flight work is skipped, which keeps a
    /// single message in flight per channel.
    async fn ingest_pass(&self) {
        let idle: Vec<(Channel, i32, MediaKindSet)> = {
            let channels = self.channels.lock().await;
            channels
                .values()
                .filter(|rt| rt.queue.is_empty() && !rt.downloading)
                .map(|rt| (rt.channel.clone(), rt.last_id, rt.allowed))
                .collect()
        };
        for (channel, last_id, allowed) in idle {
            if self.stopped() {
                break;
            }
            match self.ingestor.fetch_page(&channel, last_id, allowed).await {
                Ok(page) => {
                    if let Some(anchor) = page.anchor {
                        self.record_checkpoint(&channel.id, anchor).await;
                    }
                    if page.tasks.is_empty() {
                        continue;
                    }
                    let count = page.tasks.len();
                    let mut channels = self.channels.lock().await;
                    if let Some(rt) = channels.get_mut(&channel.id) {
                        rt.queue.extend(page.tasks);
                        debug!(channel = %channel.id, count, "tasks enqueued");
                    }
                    drop(channels);
                    self.work.notify_waiters();
                }
                Err(e) => {
                    // Checkpoint untouched; the next tick retries.
                    warn!(channel = %channel.id, error = %e, "ingestion pass failed");
                }
            }
        }
    }

    async fn worker_loop(&self, worker: usize) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if let Some(task) = self.claim_next().await {
                let channel_id = task.channel_id.clone();
                let msg_id = task.message.id;
                let is_comment = task.message.is_comment;
                let ok = match self.process_task(&task).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(
                            channel = %channel_id,
                            msg_id,
                            error = %e,
                            "download failed, checkpoint held back"
                        );
                        false
                    }
                };
                self.release_channel(&channel_id, msg_id, is_comment, ok).await;
                continue;
            }
            if self.stopped() && self.is_idle().await {
                break;
            }
            // The sleep arm guards against a notification landing between
            // the failed claim and this await.
            tokio::select! {
                _ = self.work.notified() => {}
                _ = stop_rx.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
        debug!(worker, "worker stopped");
    }

    /// Pick the ready channel that has waited longest and mark it busy.
    async fn claim_next(&self) -> Option<DownloadTask> {
        let mut channels = self.channels.lock().await;
        let rt = channels
            .values_mut()
            .filter(|rt| !rt.downloading && !rt.queue.is_empty())
            .min_by_key(|rt| rt.last_download)?;
        rt.downloading = true;
        let task = rt.queue.pop_front();
        if task.is_none() {
            rt.downloading = false;
        }
        task
    }

    /// Download every allowed media kind on the message, in fixed order.
    async fn process_task(&self, task: &DownloadTask) -> Result<(), DomainError> {
        let message = &task.message;
        let Some(media) = &message.media else {
            return Ok(());
        };
        let title = {
            self.channels
                .lock()
                .await
                .get(&task.channel_id)
                .map(|rt| rt.channel.title.clone())
                .unwrap_or_else(|| task.channel_id.clone())
        };
        for kind in MediaKind::ALL {
            if media.kind() != kind || !task.allowed.contains(kind) {
                continue;
            }
            let dest = media_path(&PathOptions {
                data_dir: &self.opts.data_dir,
                channel_id: &task.channel_id,
                channel_title: &title,
                topic_id: message.topic_id.as_deref(),
                grouped_id: message.grouped_id.as_deref(),
                group_message: self.opts.group_message,
                organize_enabled: self.opts.organize_enabled,
                create_subfolders: self.opts.create_subfolders,
                message_id: message.id,
                raw_file_name: media.raw_file_name(),
                mime_type: media.mime_type(),
                kind,
            });
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                debug!(path = %dest.display(), "file already exists, skipping");
                continue;
            }
            let file_name = dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let progress_tx = self.progress.clone();
            let channel_id = task.channel_id.clone();
            let on_progress = move |downloaded: u64, total: u64| {
                let _ = progress_tx.try_send(ProgressEvent {
                    channel_id: channel_id.clone(),
                    file_name: file_name.clone(),
                    downloaded,
                    total,
                });
            };
            self.downloader.download(media, &dest, &on_progress).await?;
            info!(
                channel = %task.channel_id,
                msg_id = message.id,
                path = %dest.display(),
                "media downloaded"
            );
        }
        Ok(())
    }

    /// Return the channel to the pool. On success of a non-comment message
    /// the checkpoint advances; on failure the queue is dropped so the next
    /// tick re-offers everything after the unchanged checkpoint.
    async fn release_channel(&self, channel_id: &str, msg_id: i32, is_comment: bool, ok: bool) {
        let advance = {
            let mut channels = self.channels.lock().await;
            match channels.get_mut(channel_id) {
                Some(rt) => {
                    rt.downloading = false;
                    rt.last_download = Some(Instant::now());
                    if !ok {
                        rt.queue.clear();
                    }
                    ok && !is_comment && msg_id > rt.last_id
                }
                None => false,
            }
        };
        if advance {
            self.record_checkpoint(channel_id, msg_id).await;
        }
        self.work.notify_one();
    }

    /// Advance the in-memory checkpoint (monotonically) and persist it.
    async fn record_checkpoint(&self, channel_id: &str, id: i32) {
        {
            let mut channels = self.channels.lock().await;
            match channels.get_mut(channel_id) {
                Some(rt) if id > rt.last_id => rt.last_id = id,
                _ => return,
            }
        }
        if let Err(e) = self.state.set_last_id(channel_id, id).await {
            warn!(channel_id, error = %e, "checkpoint persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Dialog, DocumentMeta, FilterPolicy, Media, MessageMeta, PhotoMeta, Topic,
    };
    use crate::ports::{FileSender, TgGateway};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct EngineGateway {
        /// channel id -> full history, any order
        history: StdMutex<HashMap<String, Vec<MessageMeta>>>,
        replies: StdMutex<HashMap<i32, Vec<MessageMeta>>>,
    }

    impl EngineGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                history: StdMutex::new(HashMap::new()),
                replies: StdMutex::new(HashMap::new()),
            })
        }

        fn set_history(&self, channel: &str, messages: Vec<MessageMeta>) {
            self.history.lock().unwrap().insert(channel.into(), messages);
        }
    }

    #[async_trait::async_trait]
    impl TgGateway for EngineGateway {
        async fn iter_dialogs(&self) -> Result<Vec<Dialog>, DomainError> {
            Ok(vec![])
        }

        async fn get_channels(&self, _ids: &[String]) -> Result<Vec<Channel>, DomainError> {
            Ok(vec![])
        }

        async fn get_forum_topics(&self, _channel_id: &str) -> Vec<Topic> {
            vec![]
        }

        async fn get_history(
            &self,
            channel_id: &str,
            offset_id: i32,
            add_offset: i32,
            limit: i32,
        ) -> Result<Vec<MessageMeta>, DomainError> {
            let all = self
                .history
                .lock()
                .unwrap()
                .get(channel_id)
                .cloned()
                .unwrap_or_default();
            let mut page: Vec<MessageMeta> = if offset_id > 0 && add_offset < -1 {
                // resumed fetch: everything newer than the checkpoint
                all.into_iter().filter(|m| m.id > offset_id).collect()
            } else {
                all
            };
            page.sort_by_key(|m| std::cmp::Reverse(m.id));
            page.truncate(limit.max(0) as usize);
            Ok(page)
        }

        async fn get_replies(
            &self,
            _channel_id: &str,
            msg_id: i32,
            offset_id: i32,
            limit: i32,
        ) -> Result<Vec<MessageMeta>, DomainError> {
            let mut thread = self
                .replies
                .lock()
                .unwrap()
                .get(&msg_id)
                .cloned()
                .unwrap_or_default();
            thread.sort_by_key(|m| std::cmp::Reverse(m.id));
            Ok(thread
                .into_iter()
                .filter(|m| offset_id == 0 || m.id < offset_id)
                .take(limit.max(0) as usize)
                .collect())
        }

        async fn sender_for(&self, _dc_id: i32) -> Result<Arc<dyn FileSender>, DomainError> {
            Err(DomainError::Gateway("no file backend".into()))
        }
    }

    /// Records downloads, writes a marker file, injects failures, and
    /// checks both concurrency invariants.
    struct RecordingDownloader {
        data_dir: PathBuf,
        downloads: StdMutex<Vec<PathBuf>>,
        attempts: AtomicUsize,
        /// channel id -> failures left to inject
        failures: StdMutex<HashMap<String, u32>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        per_channel: StdMutex<HashMap<String, usize>>,
        serialization_violated: AtomicBool,
        delay: Duration,
    }

    impl RecordingDownloader {
        fn new(data_dir: &Path) -> Arc<Self> {
            Arc::new(Self {
                data_dir: data_dir.to_path_buf(),
                downloads: StdMutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                failures: StdMutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                per_channel: StdMutex::new(HashMap::new()),
                serialization_violated: AtomicBool::new(false),
                delay: Duration::from_millis(20),
            })
        }

        fn channel_of(&self, dest: &Path) -> String {
            dest.strip_prefix(&self.data_dir)
                .ok()
                .and_then(|p| p.components().next())
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default()
        }

        fn paths(&self) -> Vec<PathBuf> {
            self.downloads.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl MediaDownloadPort for RecordingDownloader {
        async fn download(
            &self,
            _media: &Media,
            dest: &Path,
            on_progress: &(dyn Fn(u64, u64) + Send + Sync),
        ) -> Result<(), DomainError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let channel = self.channel_of(dest);
            {
                let mut per_channel = self.per_channel.lock().unwrap();
                let slot = per_channel.entry(channel.clone()).or_insert(0);
                *slot += 1;
                if *slot > 1 {
                    self.serialization_violated.store(true, Ordering::SeqCst);
                }
            }
            let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(current, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            *self
                .per_channel
                .lock()
                .unwrap()
                .get_mut(&channel)
                .unwrap() -= 1;

            let should_fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&channel) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(DomainError::Download {
                    offset: 0,
                    reason: "injected".into(),
                });
            }
            tokio::fs::write(dest, b"x").await?;
            on_progress(1, 1);
            self.downloads.lock().unwrap().push(dest.to_path_buf());
            Ok(())
        }
    }

    struct MemoryState {
        log: StdMutex<Vec<(String, i32)>>,
    }

    impl MemoryState {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl StatePort for MemoryState {
        async fn last_id(&self, channel_id: &str) -> i32 {
            self.log
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(c, _)| c == channel_id)
                .map(|(_, id)| *id)
                .unwrap_or(0)
        }

        async fn set_last_id(&self, channel_id: &str, id: i32) -> Result<(), DomainError> {
            self.log.lock().unwrap().push((channel_id.into(), id));
            Ok(())
        }
    }

    fn msg(id: i32) -> MessageMeta {
        MessageMeta {
            id,
            grouped_id: None,
            topic_id: None,
            media: None,
            date: 1_700_000_000 + id as i64,
            is_comment: false,
            reply_count: 0,
            replies_channel: None,
        }
    }

    fn photo_msg(id: i32, size: u64) -> MessageMeta {
        MessageMeta {
            media: Some(Media::Photo(PhotoMeta {
                id: id as i64,
                access_hash: 1,
                file_reference: vec![],
                dc_id: 2,
                thumb_size: "y".into(),
                size: Some(size),
            })),
            ..msg(id)
        }
    }

    fn video_msg(id: i32, size: u64) -> MessageMeta {
        MessageMeta {
            media: Some(Media::Document(DocumentMeta {
                id: id as i64,
                access_hash: 1,
                file_reference: vec![],
                dc_id: 2,
                size,
                mime_type: "video/mp4".into(),
                file_name: None,
                kind: MediaKind::Video,
            })),
            ..msg(id)
        }
    }

    fn seed(id: &str, last_id: i32) -> ChannelSeed {
        ChannelSeed {
            channel: Channel {
                id: id.into(),
                title: id.into(),
                is_forum: false,
                topics: vec![],
            },
            allowed: MediaKindSet::all(),
            last_id,
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        gateway: Arc<EngineGateway>,
        downloader: Arc<RecordingDownloader>,
        state: Arc<MemoryState>,
        _dir: tempfile::TempDir,
        data_dir: PathBuf,
    }

    fn harness(seeds: Vec<ChannelSeed>, concurrency: usize, filter: FilterPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let gateway = EngineGateway::new();
        let downloader = RecordingDownloader::new(&data_dir);
        let state = MemoryState::new();
        let ingestor = ChannelIngestor::new(
            Arc::clone(&gateway) as Arc<dyn TgGateway>,
            filter,
            -1,
        );
        let (progress_tx, _progress_rx) = mpsc::channel(64);
        let engine = Engine::new(
            ingestor,
            Arc::clone(&downloader) as Arc<dyn MediaDownloadPort>,
            Arc::clone(&state) as Arc<dyn StatePort>,
            progress_tx,
            seeds,
            EngineOptions {
                concurrency,
                ingest_interval: Duration::from_millis(25),
                data_dir: data_dir.clone(),
                ..EngineOptions::default()
            },
        );
        Harness {
            engine,
            gateway,
            downloader,
            state,
            _dir: dir,
            data_dir,
        }
    }

    /// Poll until the condition holds or the deadline passes.
    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if condition().await {
                return;
            }
            if Instant::now() > deadline {
                panic!("condition not reached within deadline");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn shutdown(h: &Harness, handle: tokio::task::JoinHandle<()>) {
        h.engine.stop();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    #[tokio::test]
    async fn fresh_channel_anchors_on_newest_without_files() {
        let h = harness(vec![seed("c1", 0)], 2, FilterPolicy::new());
        h.gateway.set_history("c1", (100..110).map(msg).collect());
        let handle = tokio::spawn(Arc::clone(&h.engine).run());
        wait_for(|| async { h.engine.last_id("c1").await == Some(109) }).await;
        shutdown(&h, handle).await;
        assert!(h.downloader.paths().is_empty());
        assert_eq!(h.state.last_id("c1").await, 109);
    }

    #[tokio::test]
    async fn downloads_advance_checkpoint_in_order() {
        let h = harness(vec![seed("c1", 100)], 2, FilterPolicy::new());
        h.gateway
            .set_history("c1", (101..=105).map(|id| photo_msg(id, 2048)).collect());
        let handle = tokio::spawn(Arc::clone(&h.engine).run());
        wait_for(|| async { h.engine.last_id("c1").await == Some(105) }).await;
        shutdown(&h, handle).await;

        let paths = h.downloader.paths();
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["101.jpg", "102.jpg", "103.jpg", "104.jpg", "105.jpg"]);
        assert!(paths.iter().all(|p| p.starts_with(h.data_dir.join("c1"))));
        assert!(!h.downloader.serialization_violated.load(Ordering::SeqCst));

        // Persisted checkpoints are non-decreasing.
        let log = h.state.log.lock().unwrap().clone();
        let mut last = 0;
        for (_, id) in log {
            assert!(id >= last);
            last = id;
        }
        assert_eq!(last, 105);
    }

    #[tokio::test]
    async fn failure_holds_checkpoint_then_reoffer_succeeds() {
        let h = harness(vec![seed("c1", 200)], 2, FilterPolicy::new());
        h.gateway.set_history("c1", vec![photo_msg(201, 2048)]);
        h.downloader.failures.lock().unwrap().insert("c1".into(), 1);
        let handle = tokio::spawn(Arc::clone(&h.engine).run());
        wait_for(|| async { h.engine.last_id("c1").await == Some(201) }).await;
        shutdown(&h, handle).await;
        // First attempt failed, the re-offered message succeeded.
        assert!(h.downloader.attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(h.state.last_id("c1").await, 201);
    }

    #[tokio::test]
    async fn persistent_failure_never_advances_checkpoint() {
        let h = harness(vec![seed("c1", 200)], 2, FilterPolicy::new());
        h.gateway.set_history("c1", vec![photo_msg(201, 2048)]);
        h.downloader
            .failures
            .lock()
            .unwrap()
            .insert("c1".into(), u32::MAX);
        let handle = tokio::spawn(Arc::clone(&h.engine).run());
        // Give it several ticks' worth of attempts.
        wait_for(|| async { h.downloader.attempts.load(Ordering::SeqCst) >= 3 }).await;
        shutdown(&h, handle).await;
        assert_eq!(h.engine.last_id("c1").await, Some(200));
        assert!(h.state.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_channels_bounded_by_concurrency() {
        let seeds = vec![seed("a", 10), seed("b", 10), seed("c", 10), seed("d", 10)];
        let h = harness(seeds, 2, FilterPolicy::new());
        for id in ["a", "b", "c", "d"] {
            h.gateway
                .set_history(id, (11..=14).map(|m| photo_msg(m, 2048)).collect());
        }
        let handle = tokio::spawn(Arc::clone(&h.engine).run());
        wait_for(|| async {
            for id in ["a", "b", "c", "d"] {
                if h.engine.last_id(id).await != Some(14) {
                    return false;
                }
            }
            true
        })
        .await;
        shutdown(&h, handle).await;
        assert!(h.downloader.max_active.load(Ordering::SeqCst) <= 2);
        assert!(!h.downloader.serialization_violated.load(Ordering::SeqCst));
        assert_eq!(h.downloader.paths().len(), 16);
    }

    #[tokio::test]
    async fn size_filtered_message_advances_without_files() {
        let mut filter = FilterPolicy::new();
        filter.set_default(MediaKind::Video, "0-1048576");
        let h = harness(vec![seed("c1", 300)], 2, filter);
        h.gateway
            .set_history("c1", vec![video_msg(301, 2 * 1024 * 1024)]);
        let handle = tokio::spawn(Arc::clone(&h.engine).run());
        wait_for(|| async { h.engine.last_id("c1").await == Some(301) }).await;
        shutdown(&h, handle).await;
        assert!(h.downloader.paths().is_empty());
    }

    #[tokio::test]
    async fn comments_download_but_do_not_advance_checkpoint() {
        let h = harness(vec![seed("c1", 400)], 2, FilterPolicy::new());
        let mut parent = photo_msg(401, 2048);
        parent.reply_count = 1;
        parent.replies_channel = Some(999);
        h.gateway.set_history("c1", vec![parent]);
        h.gateway
            .replies
            .lock()
            .unwrap()
            .insert(401, vec![photo_msg(9001, 2048)]);
        let handle = tokio::spawn(Arc::clone(&h.engine).run());
        wait_for(|| async {
            h.engine.last_id("c1").await == Some(401) && h.downloader.paths().len() == 2
        })
        .await;
        shutdown(&h, handle).await;
        assert_eq!(h.engine.last_id("c1").await, Some(401));
        let names: Vec<String> = h
            .downloader
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["401.jpg", "9001.jpg"]);
    }

    #[tokio::test]
    async fn stop_prevents_new_ingestion() {
        let h = harness(vec![seed("c1", 500)], 2, FilterPolicy::new());
        let handle = tokio::spawn(Arc::clone(&h.engine).run());
        // Let it go idle, then stop and verify new history is ignored.
        tokio::time::sleep(Duration::from_millis(80)).await;
        h.engine.stop();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        h.gateway.set_history("c1", vec![photo_msg(501, 2048)]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.engine.last_id("c1").await, Some(500));
        assert!(h.downloader.paths().is_empty());
    }
}
