use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use aigate::bus::{DeadLetterQueue, Queue, RedrivePolicy, Topic, spawn_consumer};
use aigate::config::Config;
use aigate::engines::{EngineDeps, EngineWorker, IDEOGRAM_RESULT_QUEUE, IdeogramResultWorker, build_engines};
use aigate::gateway::{Gateway, GatewaySettings, WebhookState, router};
use aigate::relay::Relay;
use aigate::store::{BlobStore, Database};
use aigate::telegram::TelegramClient;
use aigate::telegram_log::TelegramLogLayer;
use aigate::voice::Transcriber;

const MAX_RECEIVE_COUNT: u32 = 3;
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

fn fail(message: impl std::fmt::Display) -> ! {
    error!("{message}");
    eprintln!("{message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "aigate.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => fail(e),
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        fail(format!("Cannot create log directory {:?}: {e}", log_dir));
    }
    let (non_blocking, _guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "aigate.log"));

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        registry.with(TelegramLogLayer::new(bot.clone(), log_chat_id)).init();
    } else {
        registry.init();
    }

    info!("🚀 Starting aigate...");
    info!("Loaded config from {config_path}");

    let db = match Database::open(&config.database_path()) {
        Ok(db) => Arc::new(db),
        Err(e) => fail(format!("Cannot open database: {e}")),
    };
    let blobs = BlobStore::new(config.blobs_dir());
    let http = match config.http_client() {
        Ok(http) => http,
        Err(e) => fail(e),
    };

    // Bus
    let dead_letters = DeadLetterQueue::new("dead-letters");
    let redrive = RedrivePolicy {
        dead_letter: dead_letters.clone(),
        max_receive_count: MAX_RECEIVE_COUNT,
        visibility_timeout: VISIBILITY_TIMEOUT,
    };
    let topic = Arc::new(Topic::new("requests"));
    let results = Queue::with_redrive("results", redrive.clone());
    let ideogram_results = Queue::with_redrive(IDEOGRAM_RESULT_QUEUE, redrive.clone());

    let deps = EngineDeps {
        http: http.clone(),
        db: db.clone(),
        blobs: blobs.clone(),
        results: results.clone(),
        ideogram_results: ideogram_results.clone(),
    };
    let engines = build_engines(&config, &deps);
    for engine in &engines {
        let kind = engine.engine_type();
        let queue = Queue::with_redrive(&format!("engine-{}", kind.name()), redrive.clone());
        topic.subscribe(queue.clone(), kind.filter_policy());
        let worker = Arc::new(EngineWorker::new(engine.clone(), db.clone(), results.clone()));
        spawn_consumer(queue, worker, config.worker_concurrency);
    }
    if !config.credentials.ideogram_token.is_empty() {
        let worker = IdeogramResultWorker::new(
            http.clone(),
            config.credentials.ideogram_token.clone(),
            db.clone(),
            ideogram_results.clone(),
            results.clone(),
        );
        spawn_consumer(ideogram_results, Arc::new(worker), config.worker_concurrency);
    }

    let telegram = Arc::new(TelegramClient::new(bot.clone()));
    spawn_consumer(results.clone(), Arc::new(Relay::new(telegram.clone())), config.worker_concurrency);

    let purge_db = db.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match purge_db.purge_expired(chrono::Utc::now().timestamp()) {
                Ok(0) => {}
                Ok(n) => info!("Purged {n} expired row(s)"),
                Err(e) => warn!("Purge failed: {e}"),
            }
        }
    });

    let transcriber = config.whisper_model_path.as_ref().and_then(|path| match Transcriber::new(path) {
        Ok(transcriber) => Some(transcriber),
        Err(e) => {
            warn!("Voice messages disabled: {e}");
            None
        }
    });

    let bot_username = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            Some(me.username().to_string())
        }
        Err(e) => {
            warn!("Failed to get bot info: {e}");
            None
        }
    };

    if let Some(ref url) = config.webhook_url
        && let Err(e) = telegram.set_webhook(url, config.webhook_secret.as_deref()).await
    {
        warn!("{e}");
    }

    let gateway = Arc::new(Gateway::new(
        GatewaySettings {
            bot_username,
            allowed_users: config.allowed_users.clone(),
            admin_ids: config.admin_ids.clone(),
            default_engines: config.default_engines.clone(),
        },
        db.clone(),
        blobs,
        topic,
        dead_letters,
        telegram,
        transcriber,
    ));
    let app = router(WebhookState {
        gateway,
        webhook_secret: config.webhook_secret.clone(),
        callback_secret: config.monsterapi_callback_secret.clone(),
        db,
        results,
    });

    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => fail(format!("Cannot listen on {}: {e}", config.listen_addr)),
    };
    info!("Listening on {}", config.listen_addr);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for shutdown signal: {e}");
        }
        info!("Shutting down");
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!("Server error: {e}");
    }

    for engine in &engines {
        engine.close().await;
    }
}
