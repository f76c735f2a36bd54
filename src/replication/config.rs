//! Recovery configuration
//!
//! Configured externally (JSON file or defaults), immutable after startup.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::{RecoveryError, RecoveryResult};

fn default_max_push_bytes() -> u64 {
    8 * 1024 * 1024
} // 8 MiB
fn default_max_omap_entries() -> u64 {
    8096
}

/// Recovery tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Byte budget of one push round, shared by omap entries and data.
    #[serde(default = "default_max_push_bytes")]
    pub max_push_bytes: u64,

    /// Maximum omap entries per round.
    #[serde(default = "default_max_omap_entries")]
    pub max_omap_entries: u64,

    /// Emit one log line per transfer round.
    #[serde(default)]
    pub log_rounds: bool,
}

impl RecoveryConfig {
    /// Configuration with an explicit round budget.
    pub fn with_max_push_bytes(max_push_bytes: u64) -> Self {
        Self {
            max_push_bytes,
            ..Self::default()
        }
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> RecoveryResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            RecoveryError::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: RecoveryConfig = serde_json::from_str(&content)
            .map_err(|e| RecoveryError::configuration(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RecoveryResult<()> {
        if self.max_push_bytes == 0 {
            return Err(RecoveryError::configuration("max_push_bytes must be > 0"));
        }
        if self.max_omap_entries == 0 {
            return Err(RecoveryError::configuration("max_omap_entries must be > 0"));
        }
        Ok(())
    }

    pub fn budget(&self) -> RoundBudget {
        RoundBudget {
            max_bytes: self.max_push_bytes,
            max_omap_entries: self.max_omap_entries as usize,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_push_bytes: default_max_push_bytes(),
            max_omap_entries: default_max_omap_entries(),
            log_rounds: false,
        }
    }
}

/// Limits applied when building one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundBudget {
    pub max_bytes: u64,
    pub max_omap_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RecoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_push_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = RecoveryConfig::with_max_push_bytes(0);
        assert!(matches!(
            config.validate(),
            Err(RecoveryError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_push_bytes": 4096}}"#).unwrap();

        let config = RecoveryConfig::load(file.path()).unwrap();
        assert_eq!(config.max_push_bytes, 4096);
        assert_eq!(config.max_omap_entries, 8096);
        assert!(!config.log_rounds);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(RecoveryConfig::load(file.path()).is_err());
    }
}
