//! Engine configuration and the path filter built from it.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::{base_name, normalize_path};

/// Build artifacts that are never synchronized.
pub const DEFAULT_IGNORE: &[&str] = &[
    "*.aux",
    "*.bbl",
    "*.blg",
    "*.idx",
    "*.ind",
    "*.lof",
    "*.lot",
    "*.out",
    "*.toc",
    "*.acn",
    "*.acr",
    "*.alg",
    "*.glg",
    "*.glo",
    "*.gls",
    "*.fls",
    "*.log",
    "*.fdb_latexmk",
    "*.snm",
    "*.synctex",
    "*.synctex(busy)",
    "*.synctex.gz(busy)",
    "*.nav",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid ignore pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Quiet window used to coalesce sync requests.
    #[serde(with = "millis")]
    pub quiet_period: Duration,
    /// Glob patterns matched against the file name and the relative path.
    pub ignore: Vec<String>,
    /// Exact relative paths excluded from synchronization.
    pub exclude: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(5),
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
            exclude: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn path_filter(&self) -> Result<PathFilter, ConfigError> {
        PathFilter::new(&self.ignore, &self.exclude)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Decides which relative paths take part in synchronization.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    patterns: Vec<Pattern>,
    exclude: Vec<String>,
}

impl PathFilter {
    pub fn new(ignore: &[String], exclude: &[String]) -> Result<Self, ConfigError> {
        let patterns = ignore
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    message: e.msg.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = exclude
            .iter()
            .map(|p| normalize_path(p))
            .filter(|p| !p.is_empty())
            .collect();
        Ok(Self { patterns, exclude })
    }

    /// Filter that accepts everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn accepts(&self, relative_path: &str) -> bool {
        let path = normalize_path(relative_path);
        if path.is_empty() {
            return false;
        }
        if self
            .exclude
            .iter()
            .any(|ex| path == *ex || path.starts_with(&format!("{}/", ex)))
        {
            return false;
        }
        let name = base_name(&path);
        !self
            .patterns
            .iter()
            .any(|p| p.matches(name) || p.matches(&path))
    }
}
