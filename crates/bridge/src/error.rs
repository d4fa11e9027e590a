use guest::Termination;
use thiserror::Error;

use crate::protocol::{RemoteError, ReplyKind, RequestKey};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    /// A frame that could not be decoded. The key is kept when it was readable
    /// so the receiving side can still answer for it.
    #[error("malformed message: {reason}")]
    Malformed {
        key: Option<RequestKey>,
        reason: String,
    },
}

impl TransportError {
    /// Malformed frames are dropped and the channel keeps going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Remote(RemoteError),
    #[error("module terminated: {0:?}")]
    Terminated(Termination),
    #[error("worker channel closed")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected {received:?} reply, expected {expected:?}")]
    UnexpectedReply {
        expected: ReplyKind,
        received: ReplyKind,
    },
    #[error("batch returned {received} replies for {sent} requests")]
    BatchMismatch { sent: usize, received: usize },
    #[error("failed to launch worker: {0}")]
    Launch(String),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::Disconnected,
            other => Self::Transport(other.to_string()),
        }
    }
}
