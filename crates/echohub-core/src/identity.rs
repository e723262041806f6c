use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Authenticated user attached to a request or a live connection.
///
/// Fixed for the lifetime of a connection; the protocol handler stamps
/// `id` onto every inbound frame in place of any client-supplied author.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub profile_img: String,
}

impl Identity {
    /// Identity with only an id and a username, used by tests and seeds.
    pub fn bare(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            first_name: String::new(),
            last_name: String::new(),
            profile_img: String::new(),
        }
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}
