//! Configuration structures for QuarryDB.

use crate::error::{QuarryError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the buffer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// K value for the LRU-K replacement policy.
    pub lru_k: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            lru_k: 2,
        }
    }
}

impl BufferConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_frames == 0 {
            return Err(QuarryError::InvalidParameter {
                name: "num_frames".to_string(),
                value: self.num_frames.to_string(),
            });
        }
        if self.lru_k == 0 {
            return Err(QuarryError::InvalidParameter {
                name: "lru_k".to_string(),
                value: self.lru_k.to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for a B+ tree index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum number of entries in a leaf page.
    pub leaf_max_size: usize,
    /// Maximum number of children in an internal page.
    pub internal_max_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            leaf_max_size: 256,
            internal_max_size: 256,
        }
    }
}

impl IndexConfig {
    /// Creates a config with explicit fanouts, for tests that need tiny pages.
    pub fn with_fanout(leaf_max_size: usize, internal_max_size: usize) -> Self {
        Self {
            leaf_max_size,
            internal_max_size,
        }
    }

    /// Validates the configuration.
    ///
    /// A leaf must hold at least three entries so that a split leaves both
    /// halves non-empty; an internal page needs at least three children so
    /// the promoted key always has a sibling on each side.
    pub fn validate(&self) -> Result<()> {
        if self.leaf_max_size < 3 {
            return Err(QuarryError::InvalidParameter {
                name: "leaf_max_size".to_string(),
                value: self.leaf_max_size.to_string(),
            });
        }
        if self.internal_max_size < 3 {
            return Err(QuarryError::InvalidParameter {
                name: "internal_max_size".to_string(),
                value: self.internal_max_size.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_config_defaults() {
        let config = BufferConfig::default();
        assert_eq!(config.num_frames, 1024);
        assert_eq!(config.lru_k, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_buffer_config_rejects_zero_frames() {
        let config = BufferConfig {
            num_frames: 0,
            lru_k: 2,
        };
        assert!(matches!(
            config.validate(),
            Err(QuarryError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_buffer_config_rejects_zero_k() {
        let config = BufferConfig {
            num_frames: 16,
            lru_k: 0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_index_config_defaults() {
        let config = IndexConfig::default();
        assert_eq!(config.leaf_max_size, 256);
        assert_eq!(config.internal_max_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_index_config_with_fanout() {
        let config = IndexConfig::with_fanout(4, 4);
        assert_eq!(config.leaf_max_size, 4);
        assert_eq!(config.internal_max_size, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_index_config_rejects_tiny_fanout() {
        assert!(IndexConfig::with_fanout(2, 4).validate().is_err());
        assert!(IndexConfig::with_fanout(4, 2).validate().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = BufferConfig {
            num_frames: 64,
            lru_k: 3,
        };
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: BufferConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.num_frames, 64);
        assert_eq!(deserialized.lru_k, 3);

        let config = IndexConfig::with_fanout(8, 16);
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: IndexConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.leaf_max_size, 8);
        assert_eq!(deserialized.internal_max_size, 16);
    }
}
