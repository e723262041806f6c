use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Unordered participant pair, stored canonically as `(low, high)`.
///
/// Both orderings of the same two users produce an equal value, which is
/// what the store's uniqueness constraint is keyed on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participants {
    low: UserId,
    high: UserId,
}

impl Participants {
    pub fn new(a: UserId, b: UserId) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// The participant that is not `user`, if `user` is in the pair.
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if self.low == user {
            Some(self.high)
        } else if self.high == user {
            Some(self.low)
        } else {
            None
        }
    }
}
