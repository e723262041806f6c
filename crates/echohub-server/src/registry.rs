use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use echohub_core::{Identity, UserId};

/// Text frame queued for a connection's writer task. Shared between all
/// recipients of one broadcast.
pub type Outbound = Arc<str>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a write to a member's queue did not go through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendFailure {
    /// The writer is not keeping up and the queue is at capacity.
    Full,
    /// The writer task has gone away.
    Closed,
}

impl SendFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// A registered connection: who it belongs to and how to reach it.
pub struct Member {
    pub id: ConnectionId,
    pub identity: Identity,
    tx: mpsc::Sender<Outbound>,
    close: CancellationToken,
}

impl Member {
    pub fn new(identity: Identity, tx: mpsc::Sender<Outbound>, close: CancellationToken) -> Self {
        Self {
            id: ConnectionId::new(),
            identity,
            tx,
            close,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.identity.id
    }

    /// Non-blocking write to the member's outbound queue.
    pub fn try_send(&self, frame: Outbound) -> Result<(), SendFailure> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Ask the connection's reader and writer to stop.
    pub fn close(&self) {
        self.close.cancel();
    }
}

/// All live connections, behind one exclusive lock.
///
/// The lock is only ever held for map operations and non-blocking queue
/// writes; nothing awaits while holding it.
#[derive(Default)]
pub struct ConnectionRegistry {
    members: Mutex<HashMap<ConnectionId, Member>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, member: Member) -> ConnectionId {
        let id = member.id.clone();
        self.members.lock().insert(id.clone(), member);
        id
    }

    /// Remove a connection. Safe to call for an id that was already evicted.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.members.lock().remove(id).is_some()
    }

    /// Visit every member under a single lock acquisition.
    ///
    /// `visit` returns `false` to evict the member it was given; evicted
    /// members are closed before the lock is released. Returns the number
    /// of evictions.
    pub fn for_each<F>(&self, mut visit: F) -> usize
    where
        F: FnMut(&Member) -> bool,
    {
        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|_, member| {
            let keep = visit(member);
            if !keep {
                member.close();
            }
            keep
        });
        before - members.len()
    }

    pub fn count(&self) -> usize {
        self.members.lock().len()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.members.lock().contains_key(id)
    }

    /// Number of live connections held by `user`.
    pub fn connections_for(&self, user: UserId) -> usize {
        self.members
            .lock()
            .values()
            .filter(|m| m.user_id() == user)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(user: i64, capacity: usize) -> (Member, mpsc::Receiver<Outbound>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let close = CancellationToken::new();
        let identity = Identity::bare(UserId::new(user), format!("user{user}"));
        (Member::new(identity, tx, close.clone()), rx, close)
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
    }

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let (m1, _rx1, _) = member(3, 8);
        let (m2, _rx2, _) = member(7, 8);
        let id1 = registry.register(m1);
        let id2 = registry.register(m2);
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(&id1));

        assert!(registry.unregister(&id1));
        assert!(!registry.unregister(&id1));
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&id2));
    }

    #[test]
    fn same_user_may_hold_several_connections() {
        let registry = ConnectionRegistry::new();
        let (m1, _rx1, _) = member(3, 8);
        let (m2, _rx2, _) = member(3, 8);
        registry.register(m1);
        registry.register(m2);
        assert_eq!(registry.connections_for(UserId::new(3)), 2);
    }

    #[test]
    fn for_each_evicts_and_closes_mid_iteration() {
        let registry = ConnectionRegistry::new();
        let (m1, _rx1, close1) = member(3, 8);
        let (m2, _rx2, close2) = member(7, 8);
        let (m3, _rx3, close3) = member(11, 8);
        registry.register(m1);
        let id2 = registry.register(m2);
        registry.register(m3);

        let mut visited = 0;
        let evicted = registry.for_each(|m| {
            visited += 1;
            m.user_id() != UserId::new(7)
        });

        assert_eq!(visited, 3);
        assert_eq!(evicted, 1);
        assert_eq!(registry.count(), 2);
        assert!(!registry.contains(&id2));
        assert!(close2.is_cancelled());
        assert!(!close1.is_cancelled());
        assert!(!close3.is_cancelled());
    }

    #[tokio::test]
    async fn try_send_reports_full_and_closed() {
        let (m, mut rx, _) = member(3, 1);
        assert!(m.try_send(Arc::from("one")).is_ok());
        assert_eq!(m.try_send(Arc::from("two")), Err(SendFailure::Full));
        assert_eq!(&*rx.recv().await.unwrap(), "one");
        drop(rx);
        assert_eq!(m.try_send(Arc::from("three")), Err(SendFailure::Closed));
    }
}
