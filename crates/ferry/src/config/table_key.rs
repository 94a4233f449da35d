//! Identifier for a synced table.

use ferry_core::ComponentKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of one entry under `tables:`.
///
/// Labels logs and metrics, names the pipeline's sync records, and is the
/// `{table}` segment of the trigger route.
///
/// ```
/// use ferry::config::TableKey;
///
/// let key = TableKey::new("work_items");
/// assert_eq!(key.id(), "work_items");
/// assert!(key.validate().is_ok());
/// ```
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableKey(ComponentKey);

impl TableKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(ComponentKey::new(id))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn validate(&self) -> Result<(), String> {
        self.0.validate()
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TableKey {
    fn as_ref(&self) -> &str {
        self.0.id()
    }
}

impl std::borrow::Borrow<str> for TableKey {
    fn borrow(&self) -> &str {
        self.0.id()
    }
}
