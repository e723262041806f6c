use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use echohub_core::conversation::Participants;
use echohub_core::{ConversationId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now_text};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub participants: Participants,
    pub created_at: String,
    pub last_message_at: Option<String>,
}

const CONVERSATION_COLUMNS: &str = "id, user1_id, user2_id, created_at, last_message_at";

fn map_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    let user1: i64 = row_helpers::get(row, 1, "conversations", "user1_id")?;
    let user2: i64 = row_helpers::get(row, 2, "conversations", "user2_id")?;
    Ok(ConversationRow {
        id: ConversationId::new(row_helpers::get(row, 0, "conversations", "id")?),
        participants: Participants::new(UserId::new(user1), UserId::new(user2)),
        created_at: row_helpers::get(row, 3, "conversations", "created_at")?,
        last_message_at: row_helpers::get(row, 4, "conversations", "last_message_at")?,
    })
}

#[derive(Clone)]
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Id of the conversation between `a` and `b`, creating it if needed.
    ///
    /// The pair is canonicalised before touching the table, and the insert
    /// yields to the `(user1_id, user2_id)` unique key, so concurrent callers
    /// in either order converge on the single row that wins.
    #[instrument(skip(self), fields(a = %a, b = %b))]
    pub fn get_or_create(&self, a: UserId, b: UserId) -> Result<ConversationId, StoreError> {
        if a == b {
            return Err(StoreError::Conflict(format!(
                "user {a} cannot start a conversation with themselves"
            )));
        }
        let pair = Participants::new(a, b);

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT INTO conversations (user1_id, user2_id, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (user1_id, user2_id) DO NOTHING",
                rusqlite::params![pair.low().get(), pair.high().get(), now_text()],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM conversations WHERE user1_id = ?1 AND user2_id = ?2",
                [pair.low().get(), pair.high().get()],
                |row| row.get(0),
            )?;
            tx.commit()?;

            if inserted > 0 {
                debug!(conversation_id = id, "conversation created");
            }
            Ok(ConversationId::new(id))
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => map_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }

    /// Existing conversation between two users, without creating one.
    pub fn find_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<ConversationRow>, StoreError> {
        let pair = Participants::new(a, b);
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE user1_id = ?1 AND user2_id = ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([pair.low().get(), pair.high().get()])?;
            match rows.next()? {
                Some(row) => Ok(Some(map_conversation(row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn touch_last_message(&self, id: ConversationId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
                rusqlite::params![now_text(), id.get()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }

    /// Conversations `user` takes part in, most recently active first.
    pub fn list_for_user(&self, user: UserId) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE user1_id = ?1 OR user2_id = ?1
                 ORDER BY COALESCE(last_message_at, created_at) DESC, id DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([user.get()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(map_conversation(row)?);
            }
            Ok(out)
        })
    }
}
