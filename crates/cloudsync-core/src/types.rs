//! Shared value types for change tracking.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque string-or-number token used for remote ids and revisions.
///
/// Remote services disagree on whether keys are numeric or textual, so both
/// are accepted. Only equality is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Number(i64),
    Text(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{}", n),
            Key::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

/// Pending delta on one side since the last successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeState {
    #[default]
    No,
    Create,
    Update,
    Delete,
}

impl ChangeState {
    pub fn is_pending(self) -> bool {
        self != ChangeState::No
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeState::No => "no",
            ChangeState::Create => "create",
            ChangeState::Update => "update",
            ChangeState::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which replica(s) changed a record since the last session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeLocation {
    #[default]
    No,
    Local,
    Remote,
    Both,
}

impl ChangeLocation {
    /// Derive the location from the pair of change states.
    pub fn classify(local: ChangeState, remote: ChangeState) -> Self {
        match (local.is_pending(), remote.is_pending()) {
            (true, true) => ChangeLocation::Both,
            (false, true) => ChangeLocation::Remote,
            (true, false) => ChangeLocation::Local,
            (false, false) => ChangeLocation::No,
        }
    }
}

/// Session-wide direction applied to conflicting records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Upload,
    Download,
}

/// Outcome of one synchronization session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub canceled: bool,
    /// True if at least one non-folder task was planned.
    pub file_changed: bool,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn canceled(file_changed: bool) -> Self {
        Self {
            success: false,
            canceled: true,
            file_changed,
            errors: Vec::new(),
        }
    }

    pub fn failed(file_changed: bool, errors: Vec<String>) -> Self {
        Self {
            success: false,
            canceled: false,
            file_changed,
            errors,
        }
    }
}

/// Number of `/` separators in a relative path.
pub fn path_depth(relative_path: &str) -> usize {
    relative_path.matches('/').count()
}

/// Parent directory of a relative path, `None` at the root.
pub fn parent_path(relative_path: &str) -> Option<&str> {
    relative_path.rfind('/').map(|pos| &relative_path[..pos])
}

/// Last path component.
pub fn base_name(relative_path: &str) -> &str {
    match relative_path.rfind('/') {
        Some(pos) => &relative_path[pos + 1..],
        None => relative_path,
    }
}

/// Dot-prefixed last component. Such paths never travel local to remote.
pub fn is_hidden(relative_path: &str) -> bool {
    base_name(relative_path).starts_with('.')
}

/// Normalize to posix separators without leading or trailing slashes.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}
