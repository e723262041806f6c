use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use echohub_core::backend::{ConversationStore, MessageStore};
use echohub_core::messages::{Broadcast, ChatFrame, ErrorFrame, FrameKind, NewMessage};
use echohub_core::{HubError, Identity};

use crate::dispatcher::BroadcastSender;
use crate::registry::Outbound;

/// Per-frame logic shared by every connection. Holds no per-connection
/// state; the caller supplies the identity and the sender's own queue.
pub struct ProtocolHandler {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    broadcasts: BroadcastSender,
}

impl ProtocolHandler {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        broadcasts: BroadcastSender,
    ) -> Self {
        Self {
            conversations,
            messages,
            broadcasts,
        }
    }

    /// Handle one decoded frame from `identity`.
    ///
    /// Non-fatal failures have already been answered with an error frame on
    /// `reply` when this returns `Ok`. An `Err` means the connection must
    /// close.
    pub async fn handle(
        &self,
        identity: &Identity,
        mut frame: ChatFrame,
        reply: &mpsc::Sender<Outbound>,
    ) -> Result<(), HubError> {
        frame.author_id = identity.id;
        let temp_id = frame.temp_id;

        let kind = frame.kind;
        let outcome = match kind {
            FrameKind::Chat => self.handle_chat(frame, reply).await,
            FrameKind::Typing => self.handle_typing(frame).await,
            FrameKind::Ack | FrameKind::Unknown => {
                warn!(user_id = %identity.id, kind = kind.as_str(), "ignoring unsupported frame type");
                Ok(())
            }
        };

        match outcome {
            Err(err) if !err.closes_connection() => {
                warn!(
                    user_id = %identity.id,
                    error_kind = err.error_kind(),
                    error = %err,
                    "frame rejected"
                );
                send(reply, &error_frame(&err, temp_id)).await
            }
            other => other,
        }
    }

    #[instrument(skip_all, fields(user_id = %frame.author_id, recipient_id = %frame.recipient_id))]
    async fn handle_chat(
        &self,
        frame: ChatFrame,
        reply: &mpsc::Sender<Outbound>,
    ) -> Result<(), HubError> {
        let author_id = frame.author_id;
        let recipient_id = frame.recipient_id;
        if recipient_id.is_unset() || recipient_id == author_id {
            return Err(HubError::InvalidFrame("invalid recipient".into()));
        }
        if frame.content.is_empty() {
            return Err(HubError::InvalidFrame("message content is empty".into()));
        }

        let conversation_id = self.conversations.get_or_create(author_id, recipient_id).await?;
        let sent_at = Utc::now();

        let message_id = self
            .messages
            .insert(&NewMessage {
                author_id,
                conversation_id,
                content: frame.content.clone(),
                sent_at,
            })
            .await?;
        debug!(%conversation_id, %message_id, "message stored");

        // The message is stored; a dead sender must not keep it from the
        // recipient. The ack failure is reported after the fan-out.
        let acked = send(reply, &ChatFrame::ack(frame.temp_id, conversation_id)).await;
        if let Err(e) = &acked {
            warn!(%conversation_id, error = %e, "failed to ack stored message");
        }

        if let Err(e) = self.conversations.touch_last_message(conversation_id).await {
            warn!(%conversation_id, error = %e, "failed to update last_message_at");
        }

        self.broadcasts
            .enqueue(Broadcast::Chat {
                author_id,
                recipient_id,
                conversation_id,
                content: frame.content,
                sent_at,
                temp_id: frame.temp_id,
            })
            .await?;
        acked
    }

    async fn handle_typing(&self, frame: ChatFrame) -> Result<(), HubError> {
        let Some(conversation_id) = frame.conversation_id else {
            debug!(user_id = %frame.author_id, "typing frame without conversation_id dropped");
            return Ok(());
        };
        self.broadcasts
            .enqueue(Broadcast::Typing {
                author_id: frame.author_id,
                conversation_id,
                sent_at: Utc::now(),
            })
            .await
    }
}

/// Error frame sent back to the originator of a rejected frame.
pub fn error_frame(err: &HubError, temp_id: Option<i64>) -> ErrorFrame {
    match err {
        HubError::Persistence(_) => ErrorFrame::not_saved(temp_id),
        HubError::InvalidFrame(reason) => ErrorFrame::new(reason.clone(), temp_id),
        HubError::Unauthorized(_) => ErrorFrame::unauthorized(),
        HubError::AdmissionRejected => ErrorFrame::new("Too many requests", temp_id),
        HubError::Transport(_) => ErrorFrame::new("Connection error", temp_id),
    }
}

/// Write a frame to the sender's own queue, waiting for room if needed.
async fn send<T: serde::Serialize>(reply: &mpsc::Sender<Outbound>, frame: &T) -> Result<(), HubError> {
    let json = serde_json::to_string(frame)
        .map_err(|e| HubError::Transport(format!("encode reply: {e}")))?;
    reply
        .send(Arc::from(json))
        .await
        .map_err(|_| HubError::Transport("connection writer closed".into()))
}
