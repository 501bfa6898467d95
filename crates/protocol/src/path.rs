//! Normalized virtual folder paths.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Path separator for virtual folders.
pub const SEPARATOR: char = '/';

/// Errors produced while parsing a folder path or a child name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path must be absolute: {0:?}")]
    NotAbsolute(String),

    #[error("invalid path segment {0:?}")]
    InvalidSegment(String),

    #[error("invalid name {0:?}")]
    InvalidName(String),
}

/// Checks that `name` is usable as a single folder or file name.
///
/// Rejects blank names, `.`, `..` and names holding `/`, `\` or NUL.
pub fn validate_name(name: &str) -> Result<(), PathError> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains([SEPARATOR, '\\', '\0']);
    if invalid {
        return Err(PathError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A normalized, slash-delimited virtual directory path.
///
/// Root is `"/"`. Every other path starts with `/`, has no trailing slash
/// and no empty, `.` or `..` segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FolderPath(String);

impl FolderPath {
    /// The root folder.
    pub fn root() -> Self {
        Self(SEPARATOR.to_string())
    }

    /// Parses and normalizes a path.
    ///
    /// Repeated and trailing separators are collapsed (`"//a//b/"` becomes
    /// `"/a/b"`); relative paths and dot segments are rejected.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let raw = raw.trim();
        if !raw.starts_with(SEPARATOR) {
            return Err(PathError::NotAbsolute(raw.to_string()));
        }

        let mut normalized = String::with_capacity(raw.len());
        for segment in raw.split(SEPARATOR).filter(|s| !s.is_empty()) {
            if segment == "."
                || segment == ".."
                || segment.trim().is_empty()
                || segment.contains(['\\', '\0'])
            {
                return Err(PathError::InvalidSegment(segment.to_string()));
            }
            normalized.push(SEPARATOR);
            normalized.push_str(segment);
        }

        if normalized.is_empty() {
            return Ok(Self::root());
        }
        Ok(Self(normalized))
    }

    /// Returns the child path `self/name`.
    ///
    /// `name` must be non-empty after trimming and must not contain the
    /// separator.
    pub fn join(&self, name: &str) -> Result<Self, PathError> {
        let name = name.trim();
        validate_name(name)?;
        if self.is_root() {
            Ok(Self(format!("{SEPARATOR}{name}")))
        } else {
            Ok(Self(format!("{}{SEPARATOR}{name}", self.0)))
        }
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment of the path (empty for root).
    pub fn name(&self) -> &str {
        self.0
            .rsplit_once(SEPARATOR)
            .map(|(_, name)| name)
            .unwrap_or_default()
    }

    /// Parent folder, or `None` for root.
    pub fn parent(&self) -> Option<FolderPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rsplit_once(SEPARATOR) {
            Some(("", _)) | None => Some(Self::root()),
            Some((parent, _)) => Some(Self(parent.to_string())),
        }
    }

    /// All strict ancestors, nearest first, ending with root.
    pub fn ancestors(&self) -> Vec<FolderPath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            current = p.parent();
            out.push(p);
        }
        out
    }

    /// Number of segments (root is 0).
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches(SEPARATOR).count()
        }
    }

    /// Returns `true` if `self` is nested (at any depth) under `other`.
    pub fn is_descendant_of(&self, other: &FolderPath) -> bool {
        if self == other {
            return false;
        }
        if other.is_root() {
            return true;
        }
        self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/')
    }

    /// Returns `true` if `self` equals `other` or is nested under it.
    pub fn is_within(&self, other: &FolderPath) -> bool {
        self == other || self.is_descendant_of(other)
    }

    /// The prefix every strict descendant of this folder starts with.
    pub fn descendant_prefix(&self) -> String {
        if self.is_root() {
            self.0.clone()
        } else {
            format!("{}{SEPARATOR}", self.0)
        }
    }
}

impl Default for FolderPath {
    fn default() -> Self {
        Self::root()
    }
}

impl Borrow<str> for FolderPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FolderPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FolderPath> for String {
    fn from(value: FolderPath) -> Self {
        value.0
    }
}

impl std::str::FromStr for FolderPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
