//! Process-wide settings shared by every component in one config.

use serde::{Deserialize, Serialize};

/// Global configuration shared across all components.
///
/// # Examples
///
/// ```
/// use ferry_core::config::GlobalConfig;
///
/// let config = GlobalConfig::default();
/// assert_eq!(config.total_concurrency, None);
/// assert_eq!(config.poll_jitter_secs, 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Upper bound on components doing work at the same time.
    ///
    /// For the sync engine this caps concurrently running table syncs, which in
    /// turn bounds pressure on the source connection pool. `None` means no cap.
    #[serde(default)]
    pub total_concurrency: Option<usize>,

    /// Random delay (0 to N seconds) added to start times and poll waits so
    /// components configured with the same interval do not fire together.
    #[serde(default)]
    pub poll_jitter_secs: u64,
}

impl GlobalConfig {
    /// Merge values from another file's global section (last-write-wins for set values).
    pub fn merge_from(&mut self, other: Self) {
        if other.total_concurrency.is_some() {
            self.total_concurrency = other.total_concurrency;
        }
        if other.poll_jitter_secs != 0 {
            self.poll_jitter_secs = other.poll_jitter_secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_parsing() {
        let yaml = "total_concurrency: 4\npoll_jitter_secs: 30";
        let config: GlobalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.total_concurrency, Some(4));
        assert_eq!(config.poll_jitter_secs, 30);
    }

    #[test]
    fn test_yaml_empty() {
        let config: GlobalConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, GlobalConfig::default());
    }

    #[test]
    fn test_merge_keeps_unset_values() {
        let mut base = GlobalConfig {
            total_concurrency: Some(8),
            poll_jitter_secs: 10,
        };
        base.merge_from(GlobalConfig {
            total_concurrency: None,
            poll_jitter_secs: 5,
        });
        assert_eq!(base.total_concurrency, Some(8));
        assert_eq!(base.poll_jitter_secs, 5);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<GlobalConfig, _> = serde_yaml::from_str("connection_pooling: true");
        assert!(result.is_err());
    }
}
