pub mod backend;
pub mod conversations;
pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod users;

pub use backend::SessionAuthenticator;
pub use conversations::ConversationRepo;
pub use database::Database;
pub use error::StoreError;
pub use messages::MessageRepo;
pub use sessions::SessionRepo;
pub use users::UserRepo;
