use serde::{Deserialize, Serialize};
use tracing::instrument;

use echohub_core::{ConversationId, Identity, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now_text};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub profile_img: String,
    pub created_at: String,
}

impl UserRow {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id,
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            profile_img: self.profile_img.clone(),
        }
    }
}

/// Fields needed to create a user. Credential handling lives with the
/// sign-up flow, not here.
#[derive(Clone, Debug, Default)]
pub struct NewUser {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub profile_img: String,
}

/// Another user as listed in the caller's chat sidebar.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContactRow {
    pub id: UserId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub profile_img: String,
    pub conversation_id: Option<ConversationId>,
    pub last_message_at: Option<String>,
}

const USER_COLUMNS: &str = "id, username, first_name, last_name, email, profile_img, created_at";

fn map_user(row: &rusqlite::Row<'_>) -> Result<UserRow, StoreError> {
    Ok(UserRow {
        id: UserId::new(row_helpers::get(row, 0, "users", "id")?),
        username: row_helpers::get(row, 1, "users", "username")?,
        first_name: row_helpers::get(row, 2, "users", "first_name")?,
        last_name: row_helpers::get(row, 3, "users", "last_name")?,
        email: row_helpers::get(row, 4, "users", "email")?,
        profile_img: row_helpers::get(row, 5, "users", "profile_img")?,
        created_at: row_helpers::get(row, 6, "users", "created_at")?,
    })
}

#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, user), fields(username = %user.username))]
    pub fn insert(&self, user: &NewUser) -> Result<UserId, StoreError> {
        let username = user.username.trim().to_lowercase();
        let email = user.email.trim().to_lowercase();
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (username, first_name, last_name, email, profile_img, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT DO NOTHING",
                rusqlite::params![
                    username,
                    user.first_name.trim(),
                    user.last_name.trim(),
                    email,
                    user.profile_img,
                    now_text(),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!(
                    "username {username:?} or email {email:?} already registered"
                )));
            }
            Ok(UserId::new(conn.last_insert_rowid()))
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => map_user(row),
                None => Err(StoreError::NotFound(format!("user {id}"))),
            }
        })
    }

    /// Every user except `viewer`: those sharing a conversation with the
    /// viewer first (most recent message first), then the rest by first name.
    #[instrument(skip(self), fields(user_id = %viewer))]
    pub fn contacts_by_recent(&self, viewer: UserId) -> Result<Vec<ContactRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, u.first_name, u.last_name, u.profile_img,
                        c.id, c.last_message_at
                 FROM users u
                 LEFT JOIN conversations c ON (
                     (c.user1_id = ?1 AND c.user2_id = u.id)
                     OR (c.user2_id = ?1 AND c.user1_id = u.id)
                 )
                 WHERE u.id != ?1
                 ORDER BY
                     CASE WHEN c.id IS NOT NULL THEN 0 ELSE 1 END,
                     c.last_message_at DESC,
                     u.first_name ASC",
            )?;
            let mut rows = stmt.query([viewer.get()])?;
            let mut contacts = Vec::new();
            while let Some(row) = rows.next()? {
                let conversation: Option<i64> = row_helpers::get(row, 5, "conversations", "id")?;
                contacts.push(ContactRow {
                    id: UserId::new(row_helpers::get(row, 0, "users", "id")?),
                    username: row_helpers::get(row, 1, "users", "username")?,
                    first_name: row_helpers::get(row, 2, "users", "first_name")?,
                    last_name: row_helpers::get(row, 3, "users", "last_name")?,
                    profile_img: row_helpers::get(row, 4, "users", "profile_img")?,
                    conversation_id: conversation.map(ConversationId::new),
                    last_message_at: row_helpers::get(row, 6, "conversations", "last_message_at")?,
                });
            }
            Ok(contacts)
        })
    }
}
