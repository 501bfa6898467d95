fn main() {
    println!("Run `cargo test -p metadata-compat` to execute metadata compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;

    use tvault_blob_store::{BlobStore, MemoryStore};
    use tvault_metadata::{MetadataConfig, MetadataStore};
    use tvault_protocol::{
        BlobHandle, ChunkDescriptor, DocumentError, FolderPath, METADATA_TAG, MetadataDocument,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> Vec<u8> {
        let path = fixtures_dir().join(name);
        fs::read(&path).unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    fn as_json(bytes: &[u8]) -> serde_json::Value {
        serde_json::from_slice(bytes).expect("fixture is valid JSON")
    }

    fn path(s: &str) -> FolderPath {
        FolderPath::parse(s).unwrap()
    }

    #[test]
    fn current_format_roundtrips_unchanged() {
        let raw = load_fixture("metadata_v1.json");
        let doc = MetadataDocument::parse(&raw, "inbox").unwrap();

        assert_eq!(doc.files.len(), 2);
        assert_eq!(
            doc.files[0].chunks,
            vec![BlobHandle::new("folder:/Photos/2024", 41)]
        );
        assert_eq!(doc.files[1].size, 5_000_000_000);

        let written = doc.to_json().unwrap();
        assert_eq!(
            as_json(&written),
            as_json(&raw),
            "re-serialized document differs from fixture"
        );
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let doc = MetadataDocument::parse(&load_fixture("metadata_v1.json"), "inbox").unwrap();
        let written = as_json(&doc.to_json().unwrap());

        assert_eq!(written["settings"]["theme"], "dark");
        assert_eq!(written["files"][0]["checksum"], "sha256:9f86d081884c7d65");
        assert!(written["files"][1].get("checksum").is_none());
    }

    #[test]
    fn legacy_document_is_upgraded() {
        let doc = MetadataDocument::parse(&load_fixture("metadata_legacy.json"), "inbox").unwrap();

        assert_eq!(doc.version, "1.0");
        assert!(doc.folders.contains(&path("/Music/Albums")));
        assert_eq!(doc.files.len(), 2, "folder entries are not files");

        let song = &doc.files[0];
        assert_eq!(song.name, "song.mp3");
        assert_eq!(song.folder, path("/Music/Albums"));
        assert_eq!(song.chunks, vec![BlobHandle::new("inbox", 1337)]);
        assert_eq!(song.container(), Some("inbox"));
        assert_eq!(song.extra["thumbnail"], "AAEC");

        let readme = &doc.files[1];
        assert_eq!(readme.folder, FolderPath::root());
        assert_eq!(readme.mime_type, "application/octet-stream");

        assert_eq!(doc.extra["last_sync"], 1_700_000_100);
    }

    #[test]
    fn unsupported_major_version_is_rejected() {
        let err = MetadataDocument::parse(&load_fixture("metadata_v2.json"), "inbox").unwrap_err();
        assert!(matches!(err, DocumentError::UnsupportedVersion(v) if v == "2.0"));
    }

    #[test]
    fn caption_with_extra_keys_parses() {
        let raw = load_fixture("chunk_caption.txt");
        let caption = String::from_utf8(raw).unwrap();
        let descriptor = ChunkDescriptor::parse(&caption).expect("caption is a descriptor");

        assert_eq!(descriptor.index, 1);
        assert_eq!(descriptor.total, 3);
        assert_eq!(descriptor.size, 5_000_000_000);
        assert_eq!(descriptor.folder, path("/Documents"));
        assert!(descriptor.encrypted);
    }

    #[tokio::test]
    async fn store_keeps_unknown_fields_across_writes() {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw("metadata", load_fixture("metadata_v1.json"), METADATA_TAG);

        let metadata = MetadataStore::new(store.clone(), MetadataConfig::default());
        metadata.load().await.unwrap();
        metadata
            .create_folder(&FolderPath::root(), "Music")
            .await
            .unwrap();

        let entries = store.list("metadata").await.unwrap();
        assert_eq!(entries.len(), 1);
        let written = as_json(&store.get(&entries[0].handle).await.unwrap());

        assert_eq!(written["settings"]["theme"], "dark");
        assert_eq!(written["files"][0]["checksum"], "sha256:9f86d081884c7d65");
        assert!(
            written["folders"]
                .as_array()
                .unwrap()
                .contains(&serde_json::json!("/Music"))
        );
    }

    #[tokio::test]
    async fn store_loads_legacy_document() {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw("metadata", load_fixture("metadata_legacy.json"), METADATA_TAG);

        let metadata = MetadataStore::new(store.clone(), MetadataConfig::default());
        metadata.load().await.unwrap();

        let listing = metadata.list(&path("/Music"), true).await.unwrap();
        assert_eq!(listing.folders, vec![path("/Music/Albums")]);
        assert_eq!(listing.files.len(), 1);
        assert_eq!(metadata.storage_stats().await.total_files, 2);
    }
}
