//! Chat HTTP endpoints used by the web client alongside the socket.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use echohub_core::{ConversationId, Identity};
use echohub_store::messages::{MessageRow, PageRequest};
use echohub_store::users::ContactRow;
use echohub_store::StoreError;

use crate::server::AppState;

const DEFAULT_PAGE: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            Self::NotFound | Self::Store(StoreError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "Not found".to_string())
            }
            Self::Store(_) | Self::Task(_) => {
                error!(error = %self, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Task(e.to_string()))?
        .map_err(ApiError::from)
}

#[derive(Debug, Default, Deserialize)]
pub struct ConversationQuery {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// Return messages older than this id; `-1` or absent starts from the newest.
    #[serde(default)]
    pub start_id: Option<i64>,
    #[serde(default)]
    pub n_message: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MarkSeenRequest {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Serialize)]
pub struct ConversationPage {
    pub conversation_id: ConversationId,
    pub messages: Vec<MessageRow>,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub connections: usize,
    pub uptime_secs: u64,
}

fn required(id: Option<ConversationId>) -> Result<ConversationId, ApiError> {
    match id {
        Some(id) if !id.is_unset() => Ok(id),
        _ => Err(ApiError::BadRequest("conversation_id is required".into())),
    }
}

/// Fail with 403 unless `viewer` is one of the conversation's two users.
async fn ensure_participant(
    state: &AppState,
    viewer: &Identity,
    conversation_id: ConversationId,
) -> Result<(), ApiError> {
    let repo = state.conversations.clone();
    let row = blocking(move || repo.get(conversation_id)).await?;
    if row.participants.contains(viewer.id) {
        Ok(())
    } else {
        warn!(user_id = %viewer.id, %conversation_id, "conversation access denied");
        Err(ApiError::Forbidden)
    }
}

pub async fn me(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}

pub async fn recent(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<ContactRow>>, ApiError> {
    let repo = state.users.clone();
    let contacts = blocking(move || repo.contacts_by_recent(identity.id)).await?;
    Ok(Json(contacts))
}

pub async fn conversation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(query): Json<ConversationQuery>,
) -> Result<Json<ConversationPage>, ApiError> {
    let conversation_id = required(query.conversation_id)?;
    ensure_participant(&state, &identity, conversation_id).await?;

    let request = PageRequest {
        conversation_id,
        before_id: query.start_id.unwrap_or(-1),
        limit: query.n_message.unwrap_or(DEFAULT_PAGE),
    };
    let repo = state.messages.clone();
    let viewer = identity.id;
    let messages = blocking(move || repo.page(viewer, request)).await?;
    Ok(Json(ConversationPage {
        conversation_id,
        messages,
    }))
}

pub async fn mark_seen(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<MarkSeenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conversation_id = required(body.conversation_id)?;
    ensure_participant(&state, &identity, conversation_id).await?;

    let repo = state.messages.clone();
    let viewer = identity.id;
    let updated = blocking(move || repo.mark_seen(viewer, conversation_id)).await?;
    Ok(Json(json!({ "conversation_id": conversation_id, "updated": updated })))
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        connections: state.registry().count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
