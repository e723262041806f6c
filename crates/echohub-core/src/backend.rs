use async_trait::async_trait;

use crate::errors::HubError;
use crate::identity::Identity;
use crate::ids::{ConversationId, MessageId, UserId};
use crate::messages::NewMessage;

/// Resolves a session token (cookie value) to the user it belongs to.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns `HubError::Unauthorized` for unknown or expired sessions.
    async fn authenticate(&self, session_token: &str) -> Result<Identity, HubError>;
}

/// Conversation persistence as seen by the protocol handler.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Atomic get-or-create for the unordered pair `{a, b}`.
    ///
    /// Concurrent callers for the same pair, in either order, must all get
    /// the same id and leave exactly one row behind.
    async fn get_or_create(&self, a: UserId, b: UserId) -> Result<ConversationId, HubError>;

    async fn touch_last_message(&self, id: ConversationId) -> Result<(), HubError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: &NewMessage) -> Result<MessageId, HubError>;
}
