//! `${VAR}` references in config files.
//!
//! `${VAR}` must be set; `${VAR:-fallback}` uses the fallback when `VAR` is
//! unset or empty. `$$` writes a literal `$`. A lone `$` is left alone.

use std::env;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::ConfigError;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("static reference pattern compiles")
});

/// Resolve every reference in `input`.
///
/// All unresolvable references are reported together in one
/// [`ConfigError::EnvInterpolation`].
pub fn interpolate(input: &str) -> Result<String, ConfigError> {
    let mut problems = Vec::new();
    let text = REFERENCE.replace_all(input, |caps: &Captures| resolve(caps, &mut problems));
    if problems.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(ConfigError::EnvInterpolation {
            message: problems.join("\n"),
        })
    }
}

fn resolve(caps: &Captures, problems: &mut Vec<String>) -> String {
    let Some(name) = caps.get(1).map(|m| m.as_str()) else {
        return "$".to_string();
    };
    let fallback = caps.get(2).map(|m| m.as_str());

    match (env::var(name), fallback) {
        // A multi-line value could smuggle extra YAML keys into the document.
        (Ok(value), _) if value.contains(['\n', '\r']) => {
            problems.push(format!("${{{name}}} contains a newline"));
            String::new()
        }
        (Ok(value), Some(fallback)) if value.is_empty() => fallback.to_string(),
        (Ok(value), _) => value,
        (Err(_), Some(fallback)) => fallback.to_string(),
        (Err(_), None) => {
            problems.push(format!("${{{name}}} is not set"));
            String::new()
        }
    }
}
