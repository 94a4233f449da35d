//! Exclusive resource claims and conflict detection.
//!
//! Two components writing the same target table, or binding the same port,
//! would race each other at runtime. Declaring what each component owns lets
//! config validation reject that up front.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// A resource that cannot be shared between components.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Resource {
    /// A warehouse table, compared case-insensitively.
    Table(String),
    /// A listening port.
    Port(u16),
    /// A file path (database file, lock file).
    File(String),
}

impl Resource {
    /// Create a table resource.
    ///
    /// ```
    /// use ferry_core::config::Resource;
    ///
    /// assert_eq!(Resource::table("WORK_ITEMS"), Resource::table(" work_items "));
    /// ```
    pub fn table(name: &str) -> Self {
        Self::Table(name.trim().to_ascii_lowercase())
    }

    pub fn port(port: u16) -> Self {
        Self::Port(port)
    }

    pub fn file(path: &str) -> Self {
        Self::File(path.trim_end_matches('/').to_string())
    }

    /// Map each resource claimed by more than one component to its claimants.
    pub fn conflicts<K>(
        components: impl IntoIterator<Item = (K, Vec<Resource>)>,
    ) -> HashMap<Resource, HashSet<K>>
    where
        K: Eq + Hash + Clone,
    {
        let mut resource_to_keys: HashMap<Resource, HashSet<K>> = HashMap::new();

        for (key, resources) in components {
            for resource in resources {
                resource_to_keys
                    .entry(resource)
                    .or_default()
                    .insert(key.clone());
            }
        }

        resource_to_keys
            .into_iter()
            .filter(|(_, keys)| keys.len() > 1)
            .collect()
    }

    /// Render a conflict map as one line per resource, sorted for stable output.
    pub fn describe_conflicts<K: fmt::Display>(conflicts: &HashMap<Resource, HashSet<K>>) -> String {
        let mut lines: Vec<String> = conflicts
            .iter()
            .map(|(resource, keys)| {
                let mut keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
                keys.sort();
                format!("{resource} claimed by: {}", keys.join(", "))
            })
            .collect();
        lines.sort();
        lines.join("; ")
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(name) => write!(f, "table:{name}"),
            Self::Port(port) => write!(f, "port:{port}"),
            Self::File(path) => write!(f, "file:{path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_conflicts() {
        let components = vec![
            ("orders", vec![Resource::table("ORDERS_BQ")]),
            ("users", vec![Resource::table("USERS_BQ")]),
            ("trigger", vec![Resource::port(8080)]),
        ];
        assert!(Resource::conflicts(components).is_empty());
    }

    #[test]
    fn test_table_conflict_is_case_insensitive() {
        let components = vec![
            ("orders", vec![Resource::table("ORDERS_BQ")]),
            ("orders_backfill", vec![Resource::table("orders_bq")]),
        ];

        let conflicts = Resource::conflicts(components);
        assert_eq!(conflicts.len(), 1);
        let keys = conflicts.get(&Resource::table("ORDERS_BQ")).unwrap();
        assert!(keys.contains(&"orders"));
        assert!(keys.contains(&"orders_backfill"));
    }

    #[test]
    fn test_describe_conflicts() {
        let components = vec![
            ("b", vec![Resource::port(9090)]),
            ("a", vec![Resource::port(9090)]),
        ];
        let conflicts = Resource::conflicts(components);
        assert_eq!(
            Resource::describe_conflicts(&conflicts),
            "port:9090 claimed by: a, b"
        );
    }

    #[test]
    fn test_file_normalization() {
        assert_eq!(
            Resource::file("/var/lib/ferry/"),
            Resource::file("/var/lib/ferry")
        );
        assert_eq!(Resource::file("/tmp/x.db").to_string(), "file:/tmp/x.db");
    }
}
