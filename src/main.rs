//! Wiring & DI. Entry point: bootstrap adapters, inject into the engine,
//! run until Ctrl-C. No business logic here; the interactive login flow is
//! external, and an unauthorized session is fatal at startup.

use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tg_spider::adapters::persistence::JsonConfigStore;
use tg_spider::adapters::telegram::GrammersTgGateway;
use tg_spider::domain::ProgressEvent;
use tg_spider::ports::{MediaDownloadPort, StatePort, TgGateway};
use tg_spider::usecases::{
    ChannelIngestor, ChannelSeed, ChunkedDownloader, DownloadOptions, Engine, EngineOptions,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Buffer for progress events between the engine and its consumer.
const PROGRESS_QUEUE_SIZE: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_loaded = dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &env_loaded {
        Ok(path) => info!(path = %path.display(), "loaded .env"),
        Err(_) => info!("no .env found"),
    }

    let cfg = tg_spider::shared::config::AppConfig::load().unwrap_or_default();
    let api_hash = cfg
        .api_hash
        .clone()
        .or_else(|| std::env::var("TG_SPIDER_API_HASH").ok())
        .unwrap_or_default();
    if api_hash.is_empty() {
        anyhow::bail!("Set TG_SPIDER_API_HASH (env or .env). Get from https://my.telegram.org");
    }

    let data_dir = PathBuf::from(cfg.data_dir_or_default());
    info!(path = %data_dir.display(), "data directory");
    let session_path = PathBuf::from(cfg.session_path_or_default());
    let config_path = cfg
        .config_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("config.json"));

    // --- Telegram client ---
    let client = connect_client(&cfg, &session_path).await?;
    if !client
        .is_authorized()
        .await
        .map_err(|e| anyhow::anyhow!("authorization check: {}", e))?
    {
        anyhow::bail!(
            "session at {} is not authorized; complete the login flow first",
            session_path.display()
        );
    }

    // --- Configuration document (checkpoints live here) ---
    let store = JsonConfigStore::open(&config_path).await?;
    let doc = store.document().await;
    if doc.spider.channels.is_empty() {
        anyhow::bail!(
            "no channels configured in {} (spider.channels)",
            config_path.display()
        );
    }

    // --- Gateway + channel descriptors ---
    let gateway: Arc<dyn TgGateway> = Arc::new(GrammersTgGateway::new(client));
    let mut channels = gateway.get_channels(&doc.spider.channels).await?;
    if channels.is_empty() {
        anyhow::bail!("none of the configured channels could be resolved");
    }
    for channel in &mut channels {
        if channel.is_forum {
            channel.topics = gateway.get_forum_topics(&channel.id).await;
            info!(
                channel = %channel.id,
                topics = channel.topics.len(),
                "forum channel resolved"
            );
        }
    }

    let seeds: Vec<ChannelSeed> = channels
        .into_iter()
        .map(|channel| {
            let last_id = doc.last_id(&channel.id);
            let allowed = doc.medias_allowed(&channel.id);
            info!(channel = %channel.id, title = %channel.title, last_id, "channel ready");
            ChannelSeed {
                channel,
                allowed,
                last_id,
            }
        })
        .collect();

    // --- Progress pipeline: consumers are external; here we just log ---
    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressEvent>(PROGRESS_QUEUE_SIZE);
    tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            debug!(
                channel = %event.channel_id,
                file = %event.file_name,
                downloaded = event.downloaded,
                total = event.total,
                "download progress"
            );
        }
    });

    // --- Engine ---
    let ingestor = ChannelIngestor::new(
        Arc::clone(&gateway),
        doc.filter_policy(),
        doc.spider.new_channel_strategy,
    );
    let downloader: Arc<dyn MediaDownloadPort> = Arc::new(ChunkedDownloader::new(
        Arc::clone(&gateway),
        DownloadOptions {
            accelerate: doc.spider.enable_download_acceleration,
            chunk_size: doc.spider.chunk_size,
            threads: doc.spider.download_threads,
            max_retries: doc.spider.max_retries,
        },
    ));
    let engine = Engine::new(
        ingestor,
        downloader,
        Arc::clone(&store) as Arc<dyn StatePort>,
        progress_tx,
        seeds,
        EngineOptions {
            concurrency: doc.spider.concurrency,
            ingest_interval: Duration::from_secs(10),
            data_dir,
            group_message: doc.spider.group_message,
            organize_enabled: doc.file_organization.enabled,
            create_subfolders: doc.file_organization.create_subfolders,
        },
    );

    // --- Run until Ctrl-C, then drain and persist ---
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("stop requested, draining");
                engine.stop();
            }
        });
    }
    engine.run().await;

    if let Err(e) = store.flush().await {
        warn!(error = %e, "final config flush failed");
    }
    Ok(())
}

/// Bring up the MTProto connection from the stored session. The session
/// must already hold an authorization; this binary never logs in.
async fn connect_client(
    cfg: &tg_spider::shared::config::AppConfig,
    session_path: &std::path::Path,
) -> anyhow::Result<grammers_client::Client> {
    let api_id = cfg.api_id.or_else(|| {
        std::env::var("TG_SPIDER_API_ID")
            .ok()
            .and_then(|s| s.parse().ok())
    });
    let Some(api_id) = api_id.filter(|id| *id != 0) else {
        anyhow::bail!(
            "TG_SPIDER_API_ID is missing or zero; obtain API credentials at my.telegram.org"
        );
    };

    let session = tg_spider::adapters::telegram::session::open_session_store(session_path)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    // The pool owns the transport; the engine only ever sees the client
    // handle. The runner lives as long as the process.
    let pool = grammers_client::SenderPool::new(Arc::new(session), api_id);
    let client = grammers_client::Client::new(pool.handle.clone());
    tokio::spawn(async move {
        pool.runner.run().await;
    });

    Ok(client)
}
