pub mod backend;
pub mod conversation;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod messages;

pub use errors::HubError;
pub use identity::Identity;
pub use ids::{ConversationId, MessageId, UserId};
