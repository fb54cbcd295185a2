use thiserror::Error;

/// Which reservation bound a sequence ran past.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverflowKind {
    #[error("context length {context_len} exceeds the table limit of {max_tokens} tokens")]
    TableWidth {
        context_len: usize,
        max_tokens: usize,
    },

    #[error("logical block {logical_block} is not reserved (row holds {row_len} blocks)")]
    UnassignedBlock {
        logical_block: usize,
        row_len: usize,
    },

    #[error("block {block_id} is outside the cache pool of {num_blocks} blocks")]
    BlockOutOfPool { block_id: usize, num_blocks: usize },
}

/// Failure modes of a context attention call.
///
/// Every variant is detected before the cache is touched, so a failed call
/// leaves the pool exactly as it was. The one exception is [`Self::Candle`]
/// coming out of the scatter itself: sequences whose K/V already landed are
/// not rolled back.
#[derive(Error, Debug)]
pub enum AttentionError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cache overflow in sequence {seq}: {kind}")]
    CacheOverflow { seq: usize, kind: OverflowKind },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    /// Sequence index the error refers to, when there is one.
    pub fn sequence(&self) -> Option<usize> {
        match self {
            Self::CacheOverflow { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;
