#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("cannot read analysis config {path}: {source}")]
    #[diagnostic(code(usprache::config::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid analysis config: {0}")]
    #[diagnostic(code(usprache::config::parse))]
    Parse(#[from] toml::de::Error),
}

/// Knobs of the reference checker.
///
/// ```toml
/// parallel = true
/// check_loop_pollution = true
/// max_errors = 100
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Analyze function bodies on the rayon thread pool.
    pub parallel: bool,
    /// Report new references stored into outer variables by a loop body.
    pub check_loop_pollution: bool,
    /// Keep at most this many errors after sorting.
    pub max_errors: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            check_loop_pollution: true,
            max_errors: None,
        }
    }
}

impl AnalysisConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
