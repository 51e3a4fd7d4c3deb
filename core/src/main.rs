/// Portal realtime client - terminal entry point
///
/// Reads the session from PORTAL_TOKEN / PORTAL_USER_ID / PORTAL_ROLE, keeps the
/// push channel open and logs every update. With `--conversation <id>`, each
/// stdin line is sent as a message to that conversation.
use portal_realtime::transport::{HttpPortalApi, SseConnector};
use portal_realtime::{ClientUpdate, Config, RealtimeClient, Role, Session, SessionHandle};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn session_from_env() -> anyhow::Result<Session> {
    let token = env::var("PORTAL_TOKEN").map_err(|_| anyhow::anyhow!("PORTAL_TOKEN is not set"))?;
    let user_id =
        env::var("PORTAL_USER_ID").map_err(|_| anyhow::anyhow!("PORTAL_USER_ID is not set"))?;
    let role: Role = env::var("PORTAL_ROLE")
        .unwrap_or_else(|_| "family".to_string())
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    Ok(Session::new(token, role, user_id))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let session = session_from_env()?;

    let handle = SessionHandle::new();
    let api = Arc::new(HttpPortalApi::new(&config, handle.clone()));
    let connector = Arc::new(SseConnector::new(&config));
    let client = RealtimeClient::new(config.clone(), api, connector, handle.clone());

    info!("Starting portal realtime client");
    info!("   API: {}", config.api_base_url);
    info!("   User: {} ({:?})", session.user_id, session.role);

    client.start().await;
    handle.login(session);

    let logger = tokio::spawn(log_updates(client.clone()));

    if let Some(conversation_id) = config.conversation.clone() {
        client.select_conversation(Some(&conversation_id)).await;
        if let Err(e) = client.load_older(&conversation_id).await {
            warn!("Could not load history for {}: {}", conversation_id, e);
        }
        tokio::spawn(send_stdin_lines(client.clone(), conversation_id));
    }

    wait_for_shutdown().await;

    handle.logout();
    client.shutdown().await;
    logger.abort();
    info!("Client stopped");
    Ok(())
}

async fn log_updates(client: RealtimeClient) {
    let mut updates = client.updates();
    while let Ok(update) = updates.recv().await {
        match update {
            ClientUpdate::Connection { state } => info!("Connection: {:?}", state),
            ClientUpdate::Conversation { conversation_id } => {
                if let Some(last) = client.messages(&conversation_id).await.last() {
                    info!(
                        "[{}] {}: {} ({:?})",
                        conversation_id,
                        last.sender_id,
                        last.preview().text,
                        last.status
                    );
                }
            }
            ClientUpdate::Typing { conversation_id } => {
                let users = client.typing_users(&conversation_id).await;
                if !users.is_empty() {
                    info!("[{}] typing: {}", conversation_id, users.join(", "));
                }
            }
            ClientUpdate::Notifications => {
                info!("Notifications: {} unread", client.unread_notifications().await);
            }
        }
    }
}

async fn send_stdin_lines(client: RealtimeClient, conversation_id: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match client.send(&conversation_id, &line, Vec::new()).await {
                    Ok(outcome) => info!("Send: {:?}", outcome),
                    Err(e) => warn!("Send rejected: {}", e),
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("stdin error: {}", e);
                return;
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
