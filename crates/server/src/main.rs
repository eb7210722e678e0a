use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use shared::domain::UserId;
use shared::protocol::ClientEvent;
use storage::Storage;

mod config;
mod relay;

use config::{load_settings, prepare_database_url};
use relay::Relay;

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        relay: Arc::new(Relay::new(storage)),
    };
    let app = build_router(state);

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state.relay, socket))
}

/// One task per socket. The socket stays anonymous until its first accepted
/// introduce; everything else it sends before that is dropped.
async fn ws_connection(relay: Arc<Relay>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut identity: Option<UserId> = None;
    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(ClientEvent::Introduce {
                user_id,
                name,
                secret,
            }) if identity.is_none() => match relay.introduce(&tx, user_id, name, secret).await {
                Ok(accepted) => identity = accepted,
                Err(error) => {
                    error!(%error, "introduce failed");
                    break;
                }
            },
            Ok(event) => match &identity {
                Some(user) => {
                    if let Err(error) = relay.handle(user, event).await {
                        error!(%user, %error, "failed to process client event");
                    }
                }
                None => warn!("dropping event from an anonymous socket"),
            },
            Err(error) => debug!(%error, "discarding unparseable client event"),
        }
    }

    if let Some(user) = &identity {
        relay.disconnect(user, &tx).await;
    }
    send_task.abort();
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod relay_tests;
