use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use echohub_core::messages::Broadcast;
use echohub_core::HubError;

use crate::registry::{ConnectionRegistry, Outbound};

/// Producer side of the broadcast queue, cloned into every protocol handler.
#[derive(Clone)]
pub struct BroadcastSender {
    tx: mpsc::Sender<Broadcast>,
}

impl BroadcastSender {
    /// Queue a message for fan-out. Only fails once the dispatcher is gone.
    pub async fn enqueue(&self, message: Broadcast) -> Result<(), HubError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| HubError::Transport("dispatcher stopped".into()))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub evicted: usize,
}

/// Single consumer of the broadcast queue.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    rx: mpsc::Receiver<Broadcast>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, capacity: usize) -> (Self, BroadcastSender) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { registry, rx }, BroadcastSender { tx })
    }

    /// Drain the queue in FIFO order until shutdown or until every sender
    /// is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(message) => {
                        self.dispatch(&message);
                    }
                    None => break,
                },
            }
        }
        info!("dispatcher stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    #[cfg(test)]
    pub(crate) fn queue_mut(&mut self) -> &mut mpsc::Receiver<Broadcast> {
        &mut self.rx
    }

    /// Fan one message out under a single registry lock. Members whose
    /// queue is full or closed are evicted and told to close.
    pub fn dispatch(&self, message: &Broadcast) -> DispatchStats {
        let frame: Outbound = match message.to_frame().to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast frame");
                return DispatchStats::default();
            }
        };

        let mut delivered = 0;
        let evicted = self.registry.for_each(|member| {
            if !message.should_deliver_to(member.user_id()) {
                return true;
            }
            match member.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(failure) => {
                    warn!(
                        conn_id = %member.id,
                        user_id = %member.user_id(),
                        reason = failure.as_str(),
                        "evicting connection after failed write"
                    );
                    false
                }
            }
        });

        debug!(
            kind = message.kind().as_str(),
            author_id = %message.author_id(),
            conversation_id = %message.conversation_id(),
            delivered,
            evicted,
            "broadcast dispatched"
        );
        DispatchStats { delivered, evicted }
    }
}
