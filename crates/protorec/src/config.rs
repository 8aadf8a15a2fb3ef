//! Recovery configuration.

use serde::{Deserialize, Serialize};

/// Tunables for parameter and return value recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Depth bound for the caller-side ancestor-use heuristic.
    pub trim_recurse_max: u32,
    /// Pass cap applied when a model reports a non-zero input or output delay.
    pub max_delay_passes: u32,
    /// Whether unreferenced stack trials of sub-calls break inactive chains.
    pub recover_subcall: bool,
    /// Mark the halves of a split return value as low/high precision pieces.
    pub double_precision: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            trim_recurse_max: 5,
            max_delay_passes: 3,
            recover_subcall: true,
            double_precision: false,
        }
    }
}

impl RecoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trim_recurse_max(mut self, depth: u32) -> Self {
        self.trim_recurse_max = depth;
        self
    }

    pub fn with_max_delay_passes(mut self, passes: u32) -> Self {
        self.max_delay_passes = passes;
        self
    }

    pub fn with_recover_subcall(mut self, on: bool) -> Self {
        self.recover_subcall = on;
        self
    }

    pub fn with_double_precision(mut self, on: bool) -> Self {
        self.double_precision = on;
        self
    }

    /// Number of passes to allow given a model's reported delay.
    pub fn max_pass_for_delay(&self, delay: u32) -> u32 {
        if delay > 0 {
            self.max_delay_passes
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.trim_recurse_max, 5);
        assert_eq!(config.max_pass_for_delay(0), 0);
        assert_eq!(config.max_pass_for_delay(1), 3);
    }

    #[test]
    fn test_builder() {
        let config = RecoveryConfig::new()
            .with_trim_recurse_max(2)
            .with_double_precision(true)
            .with_recover_subcall(false)
            .with_max_delay_passes(1);
        assert_eq!(config.trim_recurse_max, 2);
        assert!(config.double_precision);
        assert!(!config.recover_subcall);
        assert_eq!(config.max_pass_for_delay(2), 1);
    }

    #[test]
    fn test_serde_partial() {
        let config: RecoveryConfig = serde_json::from_str(r#"{"trim_recurse_max": 8}"#).unwrap();
        assert_eq!(config.trim_recurse_max, 8);
        assert_eq!(config.max_delay_passes, 3);
        let text = serde_json::to_string(&config).unwrap();
        let back: RecoveryConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
