use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use echohub_core::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Default lifetime of a login session.
pub fn default_session_ttl() -> Duration {
    Duration::hours(24)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub token: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue a fresh token for `user_id`, replacing any session it had.
    /// One live session per user.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn create(&self, user_id: UserId, ttl: Duration) -> Result<SessionRow, StoreError> {
        let row = SessionRow {
            token: uuid::Uuid::new_v4().to_string(),
            user_id,
            expires_at: Utc::now() + ttl,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (token, user_id, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_id) DO UPDATE SET
                     token = excluded.token,
                     expires_at = excluded.expires_at",
                rusqlite::params![row.token, user_id.get(), row.expires_at.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(row)
    }

    /// Resolve a token. Unknown tokens are `NotFound`, stale ones `Expired`.
    pub fn lookup(&self, token: &str) -> Result<SessionRow, StoreError> {
        let row = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT token, user_id, expires_at FROM sessions WHERE token = ?1")?;
            let mut rows = stmt.query([token])?;
            match rows.next()? {
                Some(row) => {
                    let expires_raw: String = row_helpers::get(row, 2, "sessions", "expires_at")?;
                    Ok(SessionRow {
                        token: row_helpers::get(row, 0, "sessions", "token")?,
                        user_id: UserId::new(row_helpers::get(row, 1, "sessions", "user_id")?),
                        expires_at: row_helpers::parse_timestamp(
                            &expires_raw,
                            "sessions",
                            "expires_at",
                        )?,
                    })
                }
                None => Err(StoreError::NotFound("session".into())),
            }
        })?;

        if row.expires_at <= Utc::now() {
            return Err(StoreError::Expired(format!("session for user {}", row.user_id)));
        }
        Ok(row)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn delete_for_user(&self, user_id: UserId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE user_id = ?1", [user_id.get()])?;
            Ok(())
        })
    }
}
