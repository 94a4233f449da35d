//! Where configuration comes from: `-c` files and `-C` directories.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::{ArgGroup, Parser};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigPath {
    File(PathBuf),
    /// Every `.yaml`/`.yml` file directly inside, in name order.
    Dir(PathBuf),
}

impl ConfigPath {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self::Dir(path.into())
    }

    /// The YAML files this source stands for.
    ///
    /// A named file must be YAML. Other files in a directory are skipped.
    pub fn yaml_files(&self) -> Result<Vec<PathBuf>, ConfigError> {
        match self {
            ConfigPath::File(path) if is_yaml_file(path) => Ok(vec![path.clone()]),
            ConfigPath::File(path) => Err(ConfigError::UnsupportedFormat { path: path.clone() }),
            ConfigPath::Dir(dir) => {
                let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
                    .map_err(|source| ConfigError::ReadDir {
                        path: dir.clone(),
                        source,
                    })?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| path.is_file() && is_yaml_file(path))
                    .collect();
                files.sort();
                Ok(files)
            }
        }
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigPath::File(path) | ConfigPath::Dir(path) => write!(f, "{}", path.display()),
        }
    }
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Command line shared by `ferry` and `ferry-monitor`. At least one source
/// is required.
#[derive(Parser, Debug)]
#[command(version)]
#[command(group(ArgGroup::new("sources").required(true).multiple(true).args(["config", "config_dirs"])))]
pub struct CliArgs {
    /// Configuration file (repeatable)
    #[arg(short, long)]
    pub config: Vec<PathBuf>,

    /// Directory of configuration files (repeatable)
    #[arg(short = 'C', long = "config-dir")]
    pub config_dirs: Vec<PathBuf>,
}

impl CliArgs {
    /// Files first, then directories, each in the order given.
    pub fn config_paths(&self) -> Vec<ConfigPath> {
        self.config
            .iter()
            .map(ConfigPath::file)
            .chain(self.config_dirs.iter().map(ConfigPath::dir))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_args_order() {
        let args = CliArgs::parse_from([
            "ferry", "-C", "/etc/ferry/tables", "-c", "/etc/ferry/base.yaml",
        ]);
        assert_eq!(
            args.config_paths(),
            vec![
                ConfigPath::file("/etc/ferry/base.yaml"),
                ConfigPath::dir("/etc/ferry/tables"),
            ]
        );
    }

    #[test]
    fn test_a_source_is_required() {
        let err = CliArgs::try_parse_from(["ferry"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_directory_lists_yaml_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.yml", "a.yaml", "notes.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.yaml")).unwrap();

        let files = ConfigPath::dir(dir.path()).yaml_files().unwrap();
        assert_eq!(files, vec![dir.path().join("a.yaml"), dir.path().join("b.yml")]);
        assert!(matches!(
            ConfigPath::file("ferry.toml").yaml_files(),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }
}
