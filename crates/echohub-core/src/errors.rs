/// Error taxonomy for the messaging hub.
///
/// Conversation resolution races are not represented: the store's
/// get-or-create absorbs them and callers only ever see an id or a
/// persistence failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HubError {
    /// Decode or write failure on a duplex channel. Ends the connection.
    #[error("transport error: {0}")]
    Transport(String),
    /// Backing store unavailable or rejected the write.
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("admission rejected")]
    AdmissionRejected,
    /// Frame decoded but its content is not acceptable (empty chat, bad recipient).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl HubError {
    /// Whether the connection that hit this error must be torn down.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Unauthorized(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Persistence(_) => "persistence",
            Self::Unauthorized(_) => "unauthorized",
            Self::AdmissionRejected => "admission_rejected",
            Self::InvalidFrame(_) => "invalid_frame",
        }
    }
}
