//! The persisted metadata document and its file records.
//!
//! The document is JSON. `version` selects the parse strategy:
//! - `"1.x"`: the current format, unknown fields preserved.
//! - missing: the legacy desktop format, upgraded on read.
//! - anything else: rejected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::handle::BlobHandle;
use crate::path::{FolderPath, validate_name};

/// Version written by this implementation.
pub const CURRENT_VERSION: &str = "1.0";

/// Errors produced while parsing a metadata document.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported metadata version {0:?}")]
    UnsupportedVersion(String),

    #[error("malformed legacy document: {0}")]
    Legacy(String),

    #[error("file {id}: invalid name {name:?}")]
    InvalidFileName { id: String, name: String },
}

/// A file stored as an ordered sequence of chunk blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub folder: FolderPath,
    #[serde(default = "default_mime")]
    pub mime_type: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub chunks: Vec<BlobHandle>,
    #[serde(default)]
    pub encrypted: bool,
    /// Bumped each time a move re-uploads the chunks. When a rebuild finds
    /// several complete copies of a file, the highest revision wins.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub revision: u32,
    /// Fields written by newer versions, kept so they survive a rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub(crate) fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn default_mime() -> String {
    "application/octet-stream".into()
}

impl FileRecord {
    /// Container holding this file's chunks, if it has any.
    pub fn container(&self) -> Option<&str> {
        self.chunks.first().map(|h| h.container.as_str())
    }
}

/// Root of the persisted metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub version: String,
    #[serde(default)]
    pub folders: Vec<FolderPath>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MetadataDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION.into(),
            folders: vec![FolderPath::root()],
            files: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl MetadataDocument {
    /// Parses a document, choosing the strategy from its `version` field.
    ///
    /// `default_container` is where legacy single-message files live.
    pub fn parse(bytes: &[u8], default_container: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(bytes)?;

        match value.get("version") {
            Some(Value::String(v)) if v == "1" || v.starts_with("1.") => {
                let mut doc: MetadataDocument = serde_json::from_value(value)?;
                if !doc.folders.iter().any(FolderPath::is_root) {
                    doc.folders.insert(0, FolderPath::root());
                }
                check_file_names(&doc.files)?;
                Ok(doc)
            }
            Some(Value::String(v)) => Err(DocumentError::UnsupportedVersion(v.clone())),
            Some(other) => Err(DocumentError::UnsupportedVersion(other.to_string())),
            None => {
                let doc = upgrade_legacy(value, default_container)?;
                check_file_names(&doc.files)?;
                Ok(doc)
            }
        }
    }

    /// Serializes the document as pretty JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, DocumentError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Keys of a legacy file entry that map onto `FileRecord` fields.
const LEGACY_KNOWN_KEYS: &[&str] = &[
    "id",
    "name",
    "size",
    "mime_type",
    "created_at",
    "folder",
    "is_folder",
    "message_id",
    "encrypted",
];

/// Upgrades the unversioned format: folders appear as `is_folder` entries
/// and each file is a single message referenced by `message_id`.
fn upgrade_legacy(value: Value, default_container: &str) -> Result<MetadataDocument, DocumentError> {
    let Value::Object(mut root) = value else {
        return Err(DocumentError::Legacy("document is not an object".into()));
    };

    let mut doc = MetadataDocument::default();

    if let Some(Value::Array(folders)) = root.remove("folders") {
        for f in folders {
            let Value::String(raw) = f else { continue };
            let path = FolderPath::parse(&raw)
                .map_err(|e| DocumentError::Legacy(format!("folder {raw:?}: {e}")))?;
            if !doc.folders.contains(&path) {
                doc.folders.push(path);
            }
        }
    }

    let entries = match root.remove("files") {
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(DocumentError::Legacy("`files` is not an array".into())),
        None => Vec::new(),
    };

    for entry in entries {
        let Value::Object(mut obj) = entry else {
            return Err(DocumentError::Legacy("file entry is not an object".into()));
        };

        let name = str_field(&obj, "name")?;
        let folder_raw = obj
            .get("folder")
            .and_then(Value::as_str)
            .unwrap_or("/")
            .to_string();
        let folder = FolderPath::parse(&folder_raw)
            .map_err(|e| DocumentError::Legacy(format!("folder {folder_raw:?}: {e}")))?;

        if obj.get("is_folder").and_then(Value::as_bool).unwrap_or(false) {
            let path = folder
                .join(&name)
                .map_err(|e| DocumentError::Legacy(format!("folder entry {name:?}: {e}")))?;
            if !doc.folders.contains(&path) {
                doc.folders.push(path);
            }
            continue;
        }

        let chunks = match obj.get("message_id").and_then(Value::as_u64) {
            Some(id) => vec![BlobHandle::new(default_container, id)],
            None => Vec::new(),
        };

        let record = FileRecord {
            id: str_field(&obj, "id")?,
            name,
            size: obj.get("size").and_then(Value::as_u64).unwrap_or(0),
            folder,
            mime_type: obj
                .get("mime_type")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(default_mime),
            created_at: obj.get("created_at").and_then(Value::as_i64).unwrap_or(0),
            chunks,
            encrypted: obj.get("encrypted").and_then(Value::as_bool).unwrap_or(false),
            revision: 0,
            extra: Map::new(),
        };

        obj.retain(|k, v| !LEGACY_KNOWN_KEYS.contains(&k.as_str()) && !v.is_null());
        doc.files.push(FileRecord { extra: obj, ..record });
    }

    // Anything else at the top level is carried forward untouched.
    doc.extra = root;
    Ok(doc)
}

fn check_file_names(files: &[FileRecord]) -> Result<(), DocumentError> {
    match files.iter().find(|f| validate_name(&f.name).is_err()) {
        Some(f) => Err(DocumentError::InvalidFileName {
            id: f.id.clone(),
            name: f.name.clone(),
        }),
        None => Ok(()),
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Result<String, DocumentError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DocumentError::Legacy(format!("file entry missing {key:?}")))
}
