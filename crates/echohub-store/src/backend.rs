//! Async adapters from the synchronous repositories to the hub's
//! collaborator traits. Every call hops onto the blocking pool so SQLite
//! never stalls a runtime worker.

use async_trait::async_trait;
use tokio::task;

use echohub_core::backend::{Authenticator, ConversationStore, MessageStore};
use echohub_core::messages::NewMessage;
use echohub_core::{ConversationId, HubError, Identity, MessageId, UserId};

use crate::conversations::ConversationRepo;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::sessions::SessionRepo;
use crate::users::UserRepo;

async fn blocking<T, F>(f: F) -> Result<T, HubError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| HubError::Persistence(format!("store task failed: {e}")))?
        .map_err(HubError::from)
}

#[async_trait]
impl ConversationStore for ConversationRepo {
    async fn get_or_create(&self, a: UserId, b: UserId) -> Result<ConversationId, HubError> {
        let repo = self.clone();
        blocking(move || repo.get_or_create(a, b)).await
    }

    async fn touch_last_message(&self, id: ConversationId) -> Result<(), HubError> {
        let repo = self.clone();
        blocking(move || repo.touch_last_message(id)).await
    }
}

#[async_trait]
impl MessageStore for MessageRepo {
    async fn insert(&self, message: &NewMessage) -> Result<MessageId, HubError> {
        let repo = self.clone();
        let message = message.clone();
        blocking(move || repo.insert(&message)).await
    }
}

/// Cookie-token authenticator backed by the sessions and users tables.
#[derive(Clone)]
pub struct SessionAuthenticator {
    sessions: SessionRepo,
    users: UserRepo,
}

impl SessionAuthenticator {
    pub fn new(sessions: SessionRepo, users: UserRepo) -> Self {
        Self { sessions, users }
    }
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    async fn authenticate(&self, session_token: &str) -> Result<Identity, HubError> {
        let this = self.clone();
        let token = session_token.to_owned();
        task::spawn_blocking(move || -> Result<Identity, HubError> {
            let session = this.sessions.lookup(&token).map_err(|e| match e {
                StoreError::NotFound(_) | StoreError::Expired(_) => {
                    HubError::Unauthorized(e.to_string())
                }
                other => other.into(),
            })?;
            match this.users.get(session.user_id) {
                Ok(user) => Ok(user.identity()),
                Err(StoreError::NotFound(_)) => Err(HubError::Unauthorized(format!(
                    "session refers to missing user {}",
                    session.user_id
                ))),
                Err(other) => Err(other.into()),
            }
        })
        .await
        .map_err(|e| HubError::Persistence(format!("auth task failed: {e}")))?
    }
}
