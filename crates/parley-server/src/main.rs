mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header::{AUTHORIZATION, CONTENT_TYPE}},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use parley_api::auth::{AppState, AppStateInner};
use parley_gateway::auth::{AuthError, bearer_token};
use parley_gateway::connection;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::relay::Relay;
use parley_gateway::store::ChatStore;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_api=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    // Init database
    let db = Arc::new(parley_db::Database::open(&config.db_path)?);
    info!("Database ready at {}", config.db_path.display());

    // Shared state
    let store: Arc<dyn ChatStore> = db.clone();
    let relay = Relay::with_timeout(
        store,
        Dispatcher::new(),
        &config.jwt_secret,
        config.store_timeout,
    );

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        relay: relay.clone(),
        jwt_secret: config.jwt_secret.clone(),
        token_ttl: config.token_ttl,
    });

    // Routes
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(relay);

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::exact(HeaderValue::from_str(&config.allowed_origin)?))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    let app = Router::new()
        .merge(parley_api::router(app_state))
        .merge(ws_route)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        );

    info!("Parley server listening on {}", config.addr);
    info!("Accepting browser origin {}", config.allowed_origin);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayQuery {
    token: Option<String>,
    chat_id: Option<Uuid>,
}

/// Authenticate before upgrading so a rejected client never holds a socket.
async fn ws_upgrade(
    State(relay): State<Relay>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let header_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let token = query.token.as_deref().or(header_token);

    match relay.authenticate(token).await {
        Ok(user) => {
            let chat_id = query.chat_id;
            ws.on_upgrade(move |socket| connection::handle_connection(socket, relay, user, chat_id))
        }
        Err(e) => {
            warn!("Gateway handshake rejected: {}", e);
            let status = match e {
                AuthError::LookupFailed => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNAUTHORIZED,
            };
            (status, e.to_string()).into_response()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(e) => {
                    warn!("Could not install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
