use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use echohub_core::Identity;
use echohub_store::{
    ConversationRepo, Database, MessageRepo, SessionAuthenticator, SessionRepo, UserRepo,
};

use crate::api;
use crate::auth::{auth_middleware, AuthState};
use crate::config::HubConfig;
use crate::connection::{reject_unauthorized, serve_connection, ConnectionContext};
use crate::dispatcher::Dispatcher;
use crate::protocol::ProtocolHandler;
use crate::ratelimit::{rate_limit_middleware, RateLimiter};
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub connections: ConnectionContext,
    pub users: UserRepo,
    pub conversations: ConversationRepo,
    pub messages: MessageRepo,
    pub started_at: Instant,
}

impl AppState {
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.connections.registry
    }
}

/// Everything `start` wires together, before any task is spawned.
pub struct Hub {
    pub router: Router,
    pub dispatcher: Dispatcher,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<ConnectionRegistry>,
}

impl Hub {
    pub fn new(config: &HubConfig, db: Database, shutdown: CancellationToken) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (dispatcher, broadcasts) =
            Dispatcher::new(Arc::clone(&registry), config.server.broadcast_queue);

        let users = UserRepo::new(db.clone());
        let conversations = ConversationRepo::new(db.clone());
        let messages = MessageRepo::new(db.clone());
        let protocol = ProtocolHandler::new(
            Arc::new(conversations.clone()),
            Arc::new(messages.clone()),
            broadcasts,
        );

        let state = AppState {
            connections: ConnectionContext {
                registry: Arc::clone(&registry),
                protocol: Arc::new(protocol),
                shutdown,
                max_send_queue: config.server.max_send_queue,
                max_frame_bytes: config.server.max_frame_bytes,
            },
            users: users.clone(),
            conversations,
            messages,
            started_at: Instant::now(),
        };
        let auth = AuthState {
            authenticator: Arc::new(SessionAuthenticator::new(SessionRepo::new(db), users)),
            cookie_name: Arc::from(config.session.cookie_name.as_str()),
        };
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));

        Self {
            router: build_router(state, auth, Arc::clone(&limiter)),
            dispatcher,
            limiter,
            registry,
        }
    }
}

/// Rate limiting wraps everything, then authentication, then the routes.
pub fn build_router(state: AppState, auth: AuthState, limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health))
        .route("/me", post(api::me))
        .route("/recent", post(api::recent))
        .route("/conversation", post(api::conversation))
        .route("/mark-seen", post(api::mark_seen))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
) -> Response {
    match identity {
        Some(Extension(identity)) => {
            ws.on_upgrade(move |socket| serve_connection(socket, identity, state.connections))
        }
        None => ws.on_upgrade(reject_unauthorized),
    }
}

/// Bind, spawn the dispatcher, the rate-limiter sweep and the HTTP server.
pub async fn start(config: &HubConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    let coordinator = ShutdownCoordinator::new();
    let shutdown = coordinator.token();
    let hub = Hub::new(config, db, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;

    let mut tasks = vec![hub.dispatcher.spawn(shutdown.clone())];
    if config.rate_limit.enabled {
        tasks.push(Arc::clone(&hub.limiter).spawn_sweeper(shutdown.clone()));
    }
    let router = hub.router;
    let server = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
        if let Err(e) = result {
            error!(error = %e, "http server failed");
        }
    });

    tasks.push(server);

    info!(%addr, "echohub server started");
    Ok(ServerHandle {
        addr,
        coordinator,
        registry: hub.registry,
        tasks,
    })
}

/// Handle returned by `start()`; owns the background tasks.
pub struct ServerHandle {
    addr: SocketAddr,
    coordinator: ShutdownCoordinator,
    registry: Arc<ConnectionRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections(&self) -> usize {
        self.registry.count()
    }

    /// Stop accepting, close live connections, and wait for background tasks.
    pub async fn shutdown(self, timeout: Option<Duration>) -> bool {
        let clean = self.coordinator.graceful_shutdown(self.tasks, timeout).await;
        info!(clean, "echohub server stopped");
        clean
    }
}
