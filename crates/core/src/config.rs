use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AttentionError, Result};

/// Which causal attention engine runs the compute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Tensor algebra per sequence (matmul, mask, softmax).
    Naive,
    /// Host kernel with one parallel unit per (sequence, head, query tile).
    #[default]
    Tiled,
}

impl BackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "naive" => Some(Self::Naive),
            "tiled" => Some(Self::Tiled),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Naive => f.write_str("naive"),
            Self::Tiled => f.write_str("tiled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub backend: BackendKind,
    /// Query positions per unit of work in the tiled backend.
    pub query_tile: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            query_tile: 64,
        }
    }
}

impl AttentionConfig {
    pub fn naive() -> Self {
        Self {
            backend: BackendKind::Naive,
            ..Self::default()
        }
    }

    pub fn tiled(query_tile: usize) -> Self {
        Self {
            backend: BackendKind::Tiled,
            query_tile,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.query_tile == 0 {
            return Err(AttentionError::invalid("query_tile must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_tiled_with_64_positions() {
        let config = AttentionConfig::default();
        assert_eq!(config.backend, BackendKind::Tiled);
        assert_eq!(config.query_tile, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_tile_is_rejected() {
        assert!(matches!(
            AttentionConfig::tiled(0).validate(),
            Err(AttentionError::InvalidInput(_))
        ));
    }

    #[test]
    fn backend_kind_parse_and_display() {
        for kind in [BackendKind::Naive, BackendKind::Tiled] {
            assert_eq!(BackendKind::parse(&kind.to_string()), Some(kind));
        }
        assert_eq!(BackendKind::parse("NAIVE"), Some(BackendKind::Naive));
        assert_eq!(BackendKind::parse("flash"), None);
    }
}
