//! MindEase terminal client - composition root.
//!
//! Ties the MindEase crates into one executable:
//! 1. Load configuration from TOML, environment and flags
//! 2. Open the local SQLite database (offline queue, voice settings)
//! 3. Build the chat session: store, history, offline queue, HTTP API
//! 4. Start the STOMP push connection with backoff and credential refresh
//! 5. Start the voice coordinator on console speech adapters
//! 6. Run the line-oriented front end until `/quit` or EOF

mod cli;
mod repl;
mod voice;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;

use mindease_chat::{
    ChatSession, ConnectionManager, CredentialProvider, HistoryPaginator, HttpChatApi,
    HttpCredentialProvider, MessageStore, OfflineQueue, StompTransport,
};
use mindease_core::config::MindeaseConfig;
use mindease_core::error::MindeaseError;
use mindease_core::events::EventBus;
use mindease_storage::{Database, KvRepository, OfflineQueueRepository};
use mindease_voice::{VoiceCoordinator, VoiceServices, VoiceSettingsManager};

use cli::CliArgs;
use repl::Repl;
use voice::{ConsolePermission, ConsoleSynthesizer, CoordinatorSink, SessionLink, TypedRecognizer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let config = MindeaseConfig::load_or_default(&config_file)
        .with_env_overrides()
        .with_base_url_override(args.resolve_base_url());

    // Tracing. RUST_LOG wins, then --log-level, then the config file.
    let fallback_level = args
        .resolve_log_level()
        .unwrap_or_else(|| config.general.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&fallback_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting MindEase v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), base_url = %config.api.base_url, "Configuration loaded");

    // Identity.
    let (Some(user_id), Some(token)) = (args.resolve_user(), args.resolve_token()) else {
        tracing::error!("No credentials: pass --user and --token or set MINDEASE_USER_ID and MINDEASE_TOKEN");
        return Err(MindeaseError::Unauthenticated.into());
    };

    // Storage.
    let data_dir = args.resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("mindease.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let events = EventBus::new();

    // Chat.
    let http = reqwest::Client::builder()
        .timeout(config.api.request_timeout())
        .build()?;
    let credentials: Arc<dyn CredentialProvider> = Arc::new(HttpCredentialProvider::new(
        http,
        config.api.base_url.clone(),
        user_id.clone(),
        token,
        args.resolve_refresh_token(),
    ));
    let api = Arc::new(HttpChatApi::new(
        config.api.base_url.clone(),
        config.api.request_timeout(),
        Arc::clone(&credentials),
    )?);

    let store = Arc::new(MessageStore::new(config.store.clone(), events.clone()));
    let queue = Arc::new(OfflineQueue::new(
        OfflineQueueRepository::new(Arc::clone(&db)),
        config.queue.max_retries,
        events.clone(),
    ));
    let history = Arc::new(HistoryPaginator::new(
        api.clone(),
        Arc::clone(&store),
        events.clone(),
        config.api.history_page_size,
        config.api.request_timeout(),
    ));
    history.set_session_id(args.session.clone());

    let session = Arc::new(ChatSession::new(
        Arc::clone(&store),
        queue,
        api,
        Arc::clone(&history),
        events.clone(),
        std::time::Duration::from_millis(config.connection.flush_delay_ms),
    ));
    tracing::info!(user_id = %user_id, "Chat session ready");

    let shutdown = Arc::new(Notify::new());
    let sweeper = store.spawn_dedup_sweeper(Arc::clone(&shutdown));
    let printer = repl::spawn_event_printer(&events, Arc::clone(&session));

    if let Err(e) = history.load_initial().await {
        tracing::warn!(error = %e, "Initial history load failed");
    }

    // Push connection.
    let transport = Arc::new(StompTransport::new(&config.api.base_url, &config.connection)?);
    tracing::info!(url = %transport.url(), "Push transport configured");
    let connection = Arc::new(ConnectionManager::spawn(
        transport,
        credentials,
        session.clone(),
        &config.connection,
        events.clone(),
    ));
    session.bind_connection(connection.subscribe());

    // Voice.
    let settings = Arc::new(VoiceSettingsManager::load(
        KvRepository::new(Arc::clone(&db)),
        events.clone(),
    )?);
    let recognizer = Arc::new(TypedRecognizer::default());
    let coordinator = Arc::new(VoiceCoordinator::spawn(
        VoiceServices {
            recognizer: recognizer.clone(),
            synthesizer: Arc::new(ConsoleSynthesizer::default()),
            permission: Arc::new(ConsolePermission),
            link: Arc::new(SessionLink::new(Arc::clone(&session))),
        },
        settings,
        &config.voice,
        events.clone(),
    ));
    session.bind_bot_sink(Arc::new(CoordinatorSink::new(Arc::clone(&coordinator))));
    tracing::info!("Voice coordinator started");

    // Front end.
    let front_end = Repl {
        session,
        connection: Arc::clone(&connection),
        voice: Arc::clone(&coordinator),
        recognizer,
    };
    if let Err(e) = front_end.run().await {
        tracing::error!(error = %e, "Front end stopped");
    }

    // Shutdown.
    coordinator.shutdown().await;
    connection.shutdown().await;
    shutdown.notify_one();
    let _ = sweeper.await;
    printer.abort();

    tracing::info!("MindEase stopped");
    Ok(())
}
