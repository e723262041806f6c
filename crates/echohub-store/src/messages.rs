use serde::{Deserialize, Serialize};
use tracing::instrument;

use echohub_core::messages::NewMessage;
use echohub_core::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now_text};

/// A persisted message as returned to the conversation view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub author_id: UserId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sent_at: String,
    pub seen_at: Option<String>,
    /// True when the viewer who requested the page wrote this message.
    pub is_outgoing: bool,
}

/// Page cursor: `before_id` of `-1` means "start from the newest message".
#[derive(Clone, Copy, Debug)]
pub struct PageRequest {
    pub conversation_id: ConversationId,
    pub before_id: i64,
    pub limit: u32,
}

pub const MAX_PAGE: u32 = 100;

#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id, author_id = %message.author_id))]
    pub fn insert(&self, message: &NewMessage) -> Result<MessageId, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (author_id, conversation_id, content, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    message.author_id.get(),
                    message.conversation_id.get(),
                    message.content,
                    message.sent_at.to_rfc3339(),
                ],
            )?;
            Ok(MessageId::new(conn.last_insert_rowid()))
        })
    }

    /// Highest message id in the conversation, or `None` when it is empty.
    pub fn last_id(&self, conversation_id: ConversationId) -> Result<Option<MessageId>, StoreError> {
        self.db.with_conn(|conn| {
            let id: Option<i64> = conn.query_row(
                "SELECT MAX(id) FROM messages WHERE conversation_id = ?1",
                [conversation_id.get()],
                |row| row.get(0),
            )?;
            Ok(id.map(MessageId::new))
        })
    }

    /// Messages strictly older than `before_id`, newest first.
    #[instrument(skip(self), fields(user_id = %viewer, conversation_id = %req.conversation_id))]
    pub fn page(&self, viewer: UserId, req: PageRequest) -> Result<Vec<MessageRow>, StoreError> {
        let limit = req.limit.min(MAX_PAGE);
        self.db.with_conn(|conn| {
            let before = if req.before_id < 0 { i64::MAX } else { req.before_id };
            let mut stmt = conn.prepare(
                "SELECT id, author_id, conversation_id, content, sent_at, seen_at
                 FROM messages
                 WHERE conversation_id = ?1 AND id < ?2
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![req.conversation_id.get(), before, limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let author_id = UserId::new(row_helpers::get(row, 1, "messages", "author_id")?);
                out.push(MessageRow {
                    id: MessageId::new(row_helpers::get(row, 0, "messages", "id")?),
                    author_id,
                    conversation_id: ConversationId::new(row_helpers::get(
                        row,
                        2,
                        "messages",
                        "conversation_id",
                    )?),
                    content: row_helpers::get(row, 3, "messages", "content")?,
                    sent_at: row_helpers::get(row, 4, "messages", "sent_at")?,
                    seen_at: row_helpers::get(row, 5, "messages", "seen_at")?,
                    is_outgoing: author_id == viewer,
                });
            }
            Ok(out)
        })
    }

    /// Stamp `seen_at` on the viewer's unseen incoming messages. Returns the
    /// number of rows changed.
    #[instrument(skip(self), fields(user_id = %viewer, conversation_id = %conversation_id))]
    pub fn mark_seen(
        &self,
        viewer: UserId,
        conversation_id: ConversationId,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET seen_at = ?1
                 WHERE conversation_id = ?2 AND author_id != ?3 AND seen_at IS NULL",
                rusqlite::params![now_text(), conversation_id.get(), viewer.get()],
            )?;
            Ok(changed)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::conversations::ConversationRepo;
    use crate::users::tests::seed_user;

    struct Fixture {
        repo: MessageRepo,
        conv: ConversationId,
        alice: UserId,
        bob: UserId,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let alice = seed_user(&db, "alice", "Alice");
        let bob = seed_user(&db, "bob", "Bob");
        let conv = ConversationRepo::new(db.clone()).get_or_create(alice, bob).unwrap();
        Fixture {
            repo: MessageRepo::new(db),
            conv,
            alice,
            bob,
        }
    }

    fn send(f: &Fixture, author: UserId, content: &str) -> MessageId {
        f.repo
            .insert(&NewMessage {
                author_id: author,
                conversation_id: f.conv,
                content: content.into(),
                sent_at: Utc::now(),
            })
            .unwrap()
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let f = setup();
        let first = send(&f, f.alice, "hi");
        let second = send(&f, f.bob, "hey");
        assert!(second > first);
        assert_eq!(f.repo.last_id(f.conv).unwrap(), Some(second));
    }

    #[test]
    fn last_id_of_empty_conversation() {
        let f = setup();
        assert_eq!(f.repo.last_id(f.conv).unwrap(), None);
    }

    #[test]
    fn insert_into_missing_conversation_fails() {
        let f = setup();
        let result = f.repo.insert(&NewMessage {
            author_id: f.alice,
            conversation_id: ConversationId::new(999),
            content: "lost".into(),
            sent_at: Utc::now(),
        });
        assert!(matches!(result, Err(StoreError::Database(_))));
    }

    #[test]
    fn page_from_newest_then_older() {
        let f = setup();
        let ids: Vec<MessageId> = (0..5).map(|i| send(&f, f.alice, &format!("m{i}"))).collect();

        let newest = f
            .repo
            .page(f.bob, PageRequest { conversation_id: f.conv, before_id: -1, limit: 2 })
            .unwrap();
        assert_eq!(newest.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let older = f
            .repo
            .page(f.bob, PageRequest { conversation_id: f.conv, before_id: ids[3].get(), limit: 10 })
            .unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[2], ids[1], ids[0]]);
    }

    #[test]
    fn page_marks_outgoing_for_viewer() {
        let f = setup();
        send(&f, f.alice, "from alice");
        send(&f, f.bob, "from bob");
        let page = f
            .repo
            .page(f.alice, PageRequest { conversation_id: f.conv, before_id: -1, limit: 10 })
            .unwrap();
        assert!(!page[0].is_outgoing);
        assert!(page[1].is_outgoing);
    }

    #[test]
    fn mark_seen_only_touches_incoming() {
        let f = setup();
        send(&f, f.alice, "a1");
        send(&f, f.bob, "b1");
        send(&f, f.bob, "b2");

        assert_eq!(f.repo.mark_seen(f.alice, f.conv).unwrap(), 2);
        assert_eq!(f.repo.mark_seen(f.alice, f.conv).unwrap(), 0);

        let page = f
            .repo
            .page(f.alice, PageRequest { conversation_id: f.conv, before_id: -1, limit: 10 })
            .unwrap();
        for msg in page {
            assert_eq!(msg.seen_at.is_some(), !msg.is_outgoing);
        }
    }
}
