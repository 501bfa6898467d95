//! Opaque handles returned by the remote object store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a handle string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed blob handle {0:?}, expected \"<container>:<id>\"")]
pub struct HandleParseError(pub String);

/// Identifies one immutable blob in a remote container.
///
/// Ids are assigned by the backend and increase monotonically within a
/// container, so a higher id means a more recent blob. Serialized as
/// `"<container>:<id>"`; the container part may itself contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobHandle {
    pub container: String,
    pub id: u64,
}

impl BlobHandle {
    pub fn new(container: impl Into<String>, id: u64) -> Self {
        Self {
            container: container.into(),
            id,
        }
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.id)
    }
}

impl FromStr for BlobHandle {
    type Err = HandleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (container, id) = s
            .rsplit_once(':')
            .ok_or_else(|| HandleParseError(s.to_string()))?;
        if container.is_empty() {
            return Err(HandleParseError(s.to_string()));
        }
        let id = id.parse().map_err(|_| HandleParseError(s.to_string()))?;
        Ok(Self::new(container, id))
    }
}

impl TryFrom<String> for BlobHandle {
    type Error = HandleParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlobHandle> for String {
    fn from(value: BlobHandle) -> Self {
        value.to_string()
    }
}
