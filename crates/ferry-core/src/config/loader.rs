//! Multi-file configuration loading.

use std::path::Path;

use indexmap::IndexMap;

use crate::config::{ConfigPath, GlobalConfig, LoggingConfig, MetricsConfig, interpolate};
use crate::error::ConfigError;

/// Trait for configs that can be assembled from multiple files.
///
/// Keyed components (`tables:`) are unioned and must not repeat across files.
/// Shared sections (`global`, `metrics`, `logging`) merge last-write-wins.
/// Singleton sections that have no sensible merge (connection settings, for
/// example) are handled by [`Mergeable::merge_sections`].
pub trait Mergeable: Sized + Default {
    type Key: Eq + std::hash::Hash + Clone + std::fmt::Display;
    type Component;

    fn components(&self) -> &IndexMap<Self::Key, Self::Component>;
    fn components_mut(&mut self) -> &mut IndexMap<Self::Key, Self::Component>;
    fn global(&self) -> &GlobalConfig;
    fn global_mut(&mut self) -> &mut GlobalConfig;
    fn metrics(&self) -> &MetricsConfig;
    fn metrics_mut(&mut self) -> &mut MetricsConfig;
    fn logging(&self) -> &LoggingConfig;
    fn logging_mut(&mut self) -> &mut LoggingConfig;
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError>;

    /// Merge config-specific singleton sections from `other`.
    fn merge_sections(&mut self, _other: &mut Self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn merge(&mut self, mut other: Self) -> Result<(), ConfigError> {
        let duplicates: Vec<String> = other
            .components()
            .keys()
            .filter(|key| self.components().contains_key(*key))
            .map(|key| key.to_string())
            .collect();

        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateComponents { keys: duplicates });
        }

        self.merge_sections(&mut other)?;

        for (key, component) in other.components_mut().drain(..) {
            self.components_mut().insert(key, component);
        }

        self.global_mut()
            .merge_from(std::mem::take(other.global_mut()));
        self.metrics_mut()
            .merge_from(std::mem::take(other.metrics_mut()));
        self.logging_mut()
            .merge_from(std::mem::take(other.logging_mut()));
        Ok(())
    }
}

/// Move a singleton section from `other` into `target`, rejecting a second definition.
pub fn merge_singleton<T>(
    target: &mut Option<T>,
    other: &mut Option<T>,
    section: &str,
) -> Result<(), ConfigError> {
    match (target.is_some(), other.take()) {
        (_, None) => Ok(()),
        (false, Some(value)) => {
            *target = Some(value);
            Ok(())
        }
        (true, Some(_)) => Err(ConfigError::DuplicateSection {
            section: section.to_string(),
        }),
    }
}

/// Load and merge every file named by `paths`, collecting all errors.
pub fn load_from_paths<C: Mergeable>(paths: &[ConfigPath]) -> Result<C, ConfigError> {
    let mut config = C::default();
    let mut errors = Vec::new();

    for source in paths {
        let files = match source.yaml_files() {
            Ok(files) => files,
            Err(e) => {
                errors.push(format!("{source}: {e}"));
                continue;
            }
        };
        for file in files {
            if let Err(e) = load_file::<C>(&file).and_then(|partial| config.merge(partial)) {
                errors.push(format!("{}: {e}", file.display()));
            }
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}

/// Interpolate environment variables and parse a single YAML document.
pub fn parse_str<C: Mergeable>(contents: &str) -> Result<C, ConfigError> {
    C::parse_yaml(&interpolate(contents)?)
}

fn load_file<C: Mergeable>(path: &Path) -> Result<C, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile { source })?;
    parse_str(&contents)
}
