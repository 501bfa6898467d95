//! File descriptors embedded in blob captions.
//!
//! Every chunk blob is stored with a caption describing which logical file
//! it belongs to and where it sits in that file. Reconciliation rebuilds the
//! metadata document from these captions alone.

use serde::{Deserialize, Serialize};

use crate::path::FolderPath;

/// Caption prefix of a chunk blob.
pub const CHUNK_TAG: &str = "#TVAULT_CHUNK_V1";

/// Caption of the metadata document blob.
pub const METADATA_TAG: &str = "#TVAULT_METADATA_V1";

/// Describes one chunk of a logical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub file_id: String,
    pub name: String,
    /// Declared size of the whole file in bytes.
    pub size: u64,
    /// Zero-based chunk sequence number.
    pub index: u32,
    /// Total number of chunks of the file.
    pub total: u32,
    pub mime_type: String,
    pub folder: FolderPath,
    pub created_at: i64,
    #[serde(default)]
    pub encrypted: bool,
    /// Generation of the stored copy; see [`FileRecord::revision`](crate::FileRecord::revision).
    #[serde(default, skip_serializing_if = "crate::document::is_zero")]
    pub revision: u32,
}

impl ChunkDescriptor {
    /// Renders the caption stored next to the chunk blob.
    pub fn to_caption(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{CHUNK_TAG} {}", serde_json::to_string(self)?))
    }

    /// Parses a caption. Returns `None` for anything that is not a chunk
    /// descriptor (foreign content, older captions, corrupt JSON).
    pub fn parse(caption: &str) -> Option<Self> {
        let body = caption.trim().strip_prefix(CHUNK_TAG)?;
        if !body.starts_with(char::is_whitespace) {
            return None;
        }
        serde_json::from_str(body.trim()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkDescriptor {
        ChunkDescriptor {
            file_id: "abc".into(),
            name: "movie.mkv".into(),
            size: 5_000,
            index: 1,
            total: 3,
            mime_type: "video/x-matroska".into(),
            folder: FolderPath::parse("/Videos").unwrap(),
            created_at: 1_700_000_000,
            encrypted: false,
            revision: 0,
        }
    }

    #[test]
    fn caption_starts_with_tag() {
        let caption = sample().to_caption().unwrap();
        assert!(caption.starts_with("#TVAULT_CHUNK_V1 {"));
        assert_eq!(ChunkDescriptor::parse(&caption), Some(sample()));
    }

    #[test]
    fn revision_is_written_only_when_set() {
        assert!(!sample().to_caption().unwrap().contains("revision"));

        let moved = ChunkDescriptor {
            revision: 2,
            ..sample()
        };
        let caption = moved.to_caption().unwrap();
        assert!(caption.contains(r#""revision":2"#));
        assert_eq!(ChunkDescriptor::parse(&caption).unwrap().revision, 2);
    }

    #[test]
    fn foreign_captions_are_ignored() {
        assert_eq!(ChunkDescriptor::parse("📁 holiday.jpg"), None);
        assert_eq!(ChunkDescriptor::parse(""), None);
        assert_eq!(ChunkDescriptor::parse(METADATA_TAG), None);
        assert_eq!(ChunkDescriptor::parse("#TVAULT_CHUNK_V1 {broken"), None);
        assert_eq!(ChunkDescriptor::parse("#TVAULT_CHUNK_V10 {}"), None);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let caption = r#"#TVAULT_CHUNK_V1 {"file_id":"x","name":"n","size":1,"index":0,"total":1,"mime_type":"a/b","folder":"/","created_at":0,"extra":1}"#;
        let d = ChunkDescriptor::parse(caption).unwrap();
        assert_eq!(d.file_id, "x");
        assert!(!d.encrypted);
    }
}
