use jockey_proto::track::{ActorId, Notice, SpaceId};
use thiserror::Error;

/// Failures surfaced to the member who issued an action. Everything here is
/// rejected before it can corrupt session state; internal inconsistencies
/// never show up as a variant — they force the session to `Stopped` instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("volume {0} is outside 0-150")]
    OutOfRange(u16),

    #[error("no track at the requested position")]
    InvalidTarget,

    #[error("index {index} out of range (queue length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("actor {actor} is not allowed to {action}")]
    Unauthorized { actor: ActorId, action: &'static str },

    #[error("audio node unavailable")]
    NodeUnavailable,

    #[error("no active session for space {0}")]
    SessionNotFound(SpaceId),

    #[error("status display update failed: {0}")]
    Render(String),
}

impl EngineError {
    /// Localization key + params describing the failure; the bot formats it.
    pub fn notice(&self) -> Notice {
        match self {
            EngineError::OutOfRange(v) => Notice::new("errors.volume_out_of_range").with("volume", v),
            EngineError::InvalidTarget => Notice::new("errors.invalid_target"),
            EngineError::IndexOutOfRange { index, len } => Notice::new("errors.index_out_of_range")
                .with("index", index)
                .with("length", len),
            EngineError::Unauthorized { action, .. } => {
                Notice::new("errors.unauthorized").with("action", action)
            }
            EngineError::NodeUnavailable => Notice::new("errors.node_unavailable"),
            EngineError::SessionNotFound(_) => Notice::new("errors.nothing_playing"),
            EngineError::Render(_) => Notice::new("errors.display_update_failed"),
        }
    }
}
