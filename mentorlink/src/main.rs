//! `MentorLink` engine — headless demo harness.
//!
//! The engine ships as a library; an embedding app wires
//! [`mentorlink::transport::ws::WsTransport`] and its hosted record store
//! into the same components. This binary exercises the full offline-first
//! lifecycle in-process: author messages while disconnected, reconnect,
//! and watch sync drive everything to convergence.
//!
//! ```bash
//! cargo run --bin mentorlink
//! cargo run --bin mentorlink -- --storage-path /tmp/mentorlink-demo.db3 --log-level debug
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use mentorlink::config::{CliArgs, EngineConfig};
use mentorlink::connection::ConnectionManager;
use mentorlink::history::HistoryCache;
use mentorlink::remote::{InMemoryRemote, LogNotifier, RemoteMessage};
use mentorlink::store::MessageStore;
use mentorlink::store::record::MessageRecord;
use mentorlink::sync::SyncCoordinator;
use mentorlink::transport::SessionIdentity;
use mentorlink::transport::loopback::LoopbackTransport;

use mentorlink_proto::envelope::{ConversationId, MessageKind, UserId};

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match EngineConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            EngineConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("mentorlink engine starting");

    run_demo(&config).await?;

    tracing::info!("mentorlink engine exiting");
    Ok(())
}

/// Initialize logging: stdout by default, a non-blocking file appender when
/// `--log-file` is given. The returned guard must live until shutdown so
/// buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if let Some(log_path) = file_path {
        let log_dir = log_path.parent()?;
        let file_name = log_path.file_name()?.to_str()?;
        let file_appender = tracing_appender::rolling::never(log_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_env_filter(env_filter)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        None
    }
}

/// Drives the engine through one offline→online→converged cycle.
async fn run_demo(config: &EngineConfig) -> io::Result<()> {
    let storage_path = config
        .resolved_storage_path()
        .unwrap_or_else(|| std::env::temp_dir().join("mentorlink-demo.db3"));
    let store =
        Arc::new(MessageStore::open(&storage_path).map_err(io::Error::other)?);
    tracing::info!(path = %storage_path.display(), "durable store opened");

    let identity = config.identity().unwrap_or_else(|| {
        SessionIdentity::new(UserId::new("demo-mentee"), "demo-token", "demo device")
    });
    let me = identity.user_id.clone();
    let mentor = UserId::new("demo-mentor");
    let conversation = ConversationId::new();
    store
        .upsert_conversation(&conversation, &mentor, &me, Some("Demo session"))
        .map_err(io::Error::other)?;

    // In-process stand-ins for the hosted services.
    let (transport, _server) = LoopbackTransport::pair();
    let remote = Arc::new(InMemoryRemote::new());
    let welcome = RemoteMessage {
        id: mentorlink_proto::envelope::MessageId::new(),
        conversation_id: conversation.clone(),
        sender_id: mentor.clone(),
        sender_name: "Demo Mentor".to_string(),
        kind: MessageKind::Text,
        content: "Welcome! Ask me anything.".to_string(),
        created_at_local: chrono::Utc::now(),
        server_timestamp: chrono::Utc::now(),
        read: false,
        delivered: false,
    };
    remote.seed(welcome, chrono::Utc::now());

    let connection = ConnectionManager::new(transport, config.connection.clone());
    let coordinator = SyncCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&remote),
        LogNotifier,
        Arc::clone(&connection),
        me.clone(),
        config.sync.clone(),
    );
    let history = HistoryCache::new(
        Arc::clone(&store),
        Arc::clone(&remote),
        config.history.clone(),
    );

    // Author messages while fully offline: durably stored, nothing lost.
    for text in ["Hi, I have a question about ownership.", "Also: lifetimes?"] {
        let record = MessageRecord::new(
            conversation.clone(),
            me.clone(),
            "Demo Mentee",
            MessageKind::Text,
            text,
        );
        store.save_local(&record, true).map_err(io::Error::other)?;
    }
    let counts = store.status_counts().map_err(io::Error::other)?;
    tracing::info!(pending = counts.pending, "authored messages while offline");

    // Reconnect: the live session comes up and sync reconciles both ways.
    connection
        .connect(identity)
        .await
        .map_err(io::Error::other)?;
    let _listener = coordinator.spawn_inbound_listener();
    let _periodic = coordinator.spawn_periodic();

    let report = coordinator.sync_now().await.map_err(io::Error::other)?;
    tracing::info!(
        pushed = report.pushed,
        pulled = report.pulled,
        failed = report.failed,
        "sync pass complete"
    );

    let view = history
        .load(&conversation, true)
        .await
        .map_err(io::Error::other)?;
    println!("conversation after convergence ({} messages):", view.len());
    for message in &view {
        println!(
            "  [{}] {}: {}",
            message.sync_status, message.sender_name, message.content
        );
    }

    let summaries = store.conversations(&me).map_err(io::Error::other)?;
    for summary in summaries {
        println!(
            "{} — unread: {}, last activity: {}",
            summary.subject.as_deref().unwrap_or("(no subject)"),
            summary.unread_count,
            summary
                .last_activity
                .map_or_else(|| "never".to_string(), |t| t.to_rfc3339()),
        );
    }

    // Give the heartbeat a beat, then shut down cleanly.
    tokio::time::sleep(Duration::from_millis(100)).await;
    connection.disconnect().await;
    Ok(())
}
