use crate::types::Rank;

pub type Result<T> = std::result::Result<T, TenaxError>;

#[derive(Debug, thiserror::Error)]
pub enum TenaxError {
    #[error("link to rank {rank} is down: {reason}")]
    LinkDown { rank: Rank, reason: String },

    #[error("peer signalled a link reset mid-transfer")]
    ResetSignal,

    #[error("tracker rendezvous failed: {0}")]
    Tracker(String),

    #[error("payload size disagreement during recovery: local={local}, remote={remote}")]
    SizeMismatch { local: u64, remote: u64 },

    #[error("too many nodes are down to recover the requested result")]
    Unrecoverable,

    #[error("rank-local model state is not supported in checkpoints")]
    LocalModelUnsupported,

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    ProtocolMismatch { local: u16, remote: u16 },

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TenaxError {
    /// Create a `LinkDown` error for the given peer.
    pub(crate) fn link_down(rank: Rank, reason: impl Into<String>) -> Self {
        Self::LinkDown {
            rank,
            reason: reason.into(),
        }
    }

    /// Whether closing all links and re-running the rendezvous can clear
    /// this error. Everything else is fatal to the calling collective.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(self, Self::LinkDown { .. } | Self::ResetSignal)
    }
}
