//! Configuration persistence for the prefill runner.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/prefill/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use candle_core::DType;
use prefill_core::{AttentionConfig, BackendKind, KVCacheLayout};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of sequences in the packed batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Token slots per cache block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<usize>,

    /// Width of every block table row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_blocks_per_seq: Option<usize>,

    /// Query heads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_heads: Option<usize>,

    /// Query heads per kv head.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv_group_num: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_dim: Option<usize>,

    /// Give every sequence the full table capacity instead of random lengths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_context: Option<bool>,

    /// Seed for lengths and Q/K/V.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Element type (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Cache layout (hdn, nhd, hnd).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,

    /// Attention backend (naive, tiled).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Query positions per unit of work in the tiled backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_tile: Option<usize>,
}

impl RunConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("prefill").join("config.toml"))
    }

    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::default_path()
            .map(|path| Self::load_or_default(&path))
            .unwrap_or_default()
    }

    /// Load `path`, falling back to defaults when it is missing or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load_from(path) {
            Ok(config) => {
                debug!(path = %path.display(), "loaded config file");
                config
            }
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring config file");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &RunConfig) {
        fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }
        take(&mut self.batch_size, &other.batch_size);
        take(&mut self.block_size, &other.block_size);
        take(&mut self.max_blocks_per_seq, &other.max_blocks_per_seq);
        take(&mut self.num_heads, &other.num_heads);
        take(&mut self.kv_group_num, &other.kv_group_num);
        take(&mut self.head_dim, &other.head_dim);
        take(&mut self.same_context, &other.same_context);
        take(&mut self.seed, &other.seed);
        take(&mut self.dtype, &other.dtype);
        take(&mut self.layout, &other.layout);
        take(&mut self.backend, &other.backend);
        take(&mut self.query_tile, &other.query_tile);
    }

    /// Fill unset fields with defaults and parse the string-valued ones.
    pub fn resolve(&self) -> Result<RunSettings, ConfigError> {
        let d = RunSettings::default();
        let dtype = match &self.dtype {
            Some(s) => parse_dtype(s)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown dtype '{s}'")))?,
            None => d.dtype,
        };
        let layout = match &self.layout {
            Some(s) => KVCacheLayout::parse(s)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown cache layout '{s}'")))?,
            None => d.layout,
        };
        let backend = match &self.backend {
            Some(s) => BackendKind::parse(s)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown backend '{s}'")))?,
            None => d.attention.backend,
        };

        let settings = RunSettings {
            batch_size: self.batch_size.unwrap_or(d.batch_size),
            block_size: self.block_size.unwrap_or(d.block_size),
            max_blocks_per_seq: self.max_blocks_per_seq.unwrap_or(d.max_blocks_per_seq),
            num_heads: self.num_heads.unwrap_or(d.num_heads),
            kv_group_num: self.kv_group_num.unwrap_or(d.kv_group_num),
            head_dim: self.head_dim.unwrap_or(d.head_dim),
            same_context: self.same_context.unwrap_or(d.same_context),
            seed: self.seed.unwrap_or(d.seed),
            dtype,
            layout,
            attention: AttentionConfig {
                backend,
                query_tile: self.query_tile.unwrap_or(d.attention.query_tile),
            },
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Fully resolved parameters of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub batch_size: usize,
    pub block_size: usize,
    pub max_blocks_per_seq: usize,
    pub num_heads: usize,
    pub kv_group_num: usize,
    pub head_dim: usize,
    pub same_context: bool,
    pub seed: u64,
    pub dtype: DType,
    pub layout: KVCacheLayout,
    pub attention: AttentionConfig,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            batch_size: 4,
            block_size: 16,
            max_blocks_per_seq: 8,
            num_heads: 16,
            kv_group_num: 2,
            head_dim: 32,
            same_context: true,
            seed: 0,
            dtype: DType::F16,
            layout: KVCacheLayout::default(),
            attention: AttentionConfig::default(),
        }
    }
}

impl RunSettings {
    pub fn max_seq_len(&self) -> usize {
        self.block_size * self.max_blocks_per_seq
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_heads / self.kv_group_num
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("block_size", self.block_size),
            ("max_blocks_per_seq", self.max_blocks_per_seq),
            ("num_heads", self.num_heads),
            ("kv_group_num", self.kv_group_num),
            ("head_dim", self.head_dim),
            ("query_tile", self.attention.query_tile),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if self.num_heads % self.kv_group_num != 0 {
            return Err(ConfigError::Invalid(format!(
                "num_heads {} is not a multiple of kv_group_num {}",
                self.num_heads, self.kv_group_num
            )));
        }
        Ok(())
    }
}

fn parse_dtype(s: &str) -> Option<DType> {
    match s.to_ascii_lowercase().as_str() {
        "f32" | "fp32" | "float32" => Some(DType::F32),
        "f16" | "fp16" | "half" | "float16" => Some(DType::F16),
        "bf16" | "bfloat16" => Some(DType::BF16),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// A value that does not describe a runnable batch.
    Invalid(String),
    /// No config directory available.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = RunConfig {
            batch_size: Some(7),
            block_size: Some(32),
            dtype: Some("bf16".to_string()),
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let loaded = RunConfig::load_from(&path).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(loaded.layout, None);
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("prefill").join("config.toml");
        RunConfig::default().save_to(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = RunConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "batch_size = \"four\"").unwrap();
        assert!(matches!(
            RunConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert_eq!(RunConfig::load_or_default(&missing), RunConfig::default());

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "block_size = [").unwrap();
        assert_eq!(RunConfig::load_or_default(&bad), RunConfig::default());

        let good = dir.path().join("good.toml");
        fs::write(&good, "block_size = 32").unwrap();
        assert_eq!(RunConfig::load_or_default(&good).block_size, Some(32));
    }

    #[test]
    fn test_merge() {
        let mut base = RunConfig {
            batch_size: Some(4),
            block_size: Some(16),
            ..Default::default()
        };

        let override_config = RunConfig {
            block_size: Some(64),
            backend: Some("naive".to_string()),
            ..Default::default()
        };

        base.merge(&override_config);

        assert_eq!(base.batch_size, Some(4)); // Unchanged
        assert_eq!(base.block_size, Some(64)); // Overridden
        assert_eq!(base.backend, Some("naive".to_string())); // Added
    }

    #[test]
    fn test_resolve_defaults() {
        let settings = RunConfig::default().resolve().unwrap();
        assert_eq!(settings, RunSettings::default());
        assert_eq!(settings.max_seq_len(), 128);
        assert_eq!(settings.num_kv_heads(), 8);
    }

    #[test]
    fn test_resolve_parses_names() {
        let config = RunConfig {
            dtype: Some("FP32".to_string()),
            layout: Some("nhd".to_string()),
            backend: Some("naive".to_string()),
            query_tile: Some(8),
            ..Default::default()
        };
        let settings = config.resolve().unwrap();
        assert_eq!(settings.dtype, DType::F32);
        assert_eq!(settings.layout, KVCacheLayout::NHD);
        assert_eq!(settings.attention.backend, BackendKind::Naive);
        assert_eq!(settings.attention.query_tile, 8);
    }

    #[test]
    fn test_resolve_rejects_bad_values() {
        for config in [
            RunConfig {
                dtype: Some("int8".to_string()),
                ..Default::default()
            },
            RunConfig {
                layout: Some("dhn".to_string()),
                ..Default::default()
            },
            RunConfig {
                block_size: Some(0),
                ..Default::default()
            },
            RunConfig {
                num_heads: Some(12),
                kv_group_num: Some(5),
                ..Default::default()
            },
        ] {
            assert!(matches!(config.resolve(), Err(ConfigError::Invalid(_))), "{config:?}");
        }
    }
}
