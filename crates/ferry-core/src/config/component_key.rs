//! Keys of configured components (the map keys under `tables:`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a configured component. Ends up as a metric label, a log
/// field and a URL path segment, so [`ComponentKey::validate`] restricts its
/// characters.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKey(String);

impl ComponentKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// Require a non-empty key of ASCII letters, digits, `_`, `-` and `.`.
    ///
    /// ```
    /// use ferry_core::config::ComponentKey;
    ///
    /// assert!(ComponentKey::new("daily-summary.v2").validate().is_ok());
    /// assert!(ComponentKey::new("").validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("key is empty".into());
        }
        match self
            .0
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            Some(c) => Err(format!(
                "key contains {c:?}; only letters, digits, '_', '-' and '.' are allowed"
            )),
            None => Ok(()),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
