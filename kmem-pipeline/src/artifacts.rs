//! Per-document artifact storage.
//!
//! Layout: `{root}/{index}/{document_id}/{name}`. Every document directory
//! holds the uploaded files, the derived artifacts and the pipeline status
//! document.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kmem_core::pipeline::{DataPipeline, STATUS_FILE};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{PipelineError, PipelineResult};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn create_document_directory(&self, index: &str, document_id: &str)
    -> PipelineResult<()>;

    /// Remove every file of the document except the status document.
    async fn empty_document_directory(&self, index: &str, document_id: &str)
    -> PipelineResult<()>;

    async fn delete_document_directory(&self, index: &str, document_id: &str)
    -> PipelineResult<()>;

    /// Remove all documents of an index. When `keep_document` is set, that
    /// document's status file survives.
    async fn delete_index_directory(
        &self,
        index: &str,
        keep_document: Option<&str>,
    ) -> PipelineResult<()>;

    async fn write_file(
        &self,
        index: &str,
        document_id: &str,
        name: &str,
        content: &[u8],
    ) -> PipelineResult<()>;

    /// Fails with `ArtifactNotFound` when the file does not exist.
    async fn read_file(&self, index: &str, document_id: &str, name: &str)
    -> PipelineResult<Vec<u8>>;

    /// Deleting a missing file is a no-op.
    async fn delete_file(&self, index: &str, document_id: &str, name: &str) -> PipelineResult<()>;

    async fn list_files(&self, index: &str, document_id: &str) -> PipelineResult<Vec<String>>;

    /// Indexes with at least a directory in the store, sorted.
    async fn list_indexes(&self) -> PipelineResult<Vec<String>>;

    async fn list_documents(&self, index: &str) -> PipelineResult<Vec<String>>;
}

/// Artifact names end up as file names, so path separators and dot
/// segments are rejected.
pub fn validate_artifact_name(name: &str) -> PipelineResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.starts_with('.');
    if invalid {
        Err(PipelineError::InvalidArtifactName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Load the status document, if the pipeline was ever persisted.
pub async fn read_status(
    store: &dyn ArtifactStore,
    index: &str,
    document_id: &str,
) -> PipelineResult<Option<DataPipeline>> {
    match store.read_file(index, document_id, STATUS_FILE).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(PipelineError::ArtifactNotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn write_status(store: &dyn ArtifactStore, pipeline: &DataPipeline) -> PipelineResult<()> {
    let json = serde_json::to_vec_pretty(pipeline)?;
    store
        .write_file(&pipeline.index, &pipeline.document_id, STATUS_FILE, &json)
        .await
}

#[derive(Debug, Clone)]
pub struct FileSystemArtifactStore {
    root: PathBuf,
}

impl FileSystemArtifactStore {
    pub async fn open(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_dir(&self, index: &str, document_id: &str) -> PipelineResult<PathBuf> {
        validate_artifact_name(index)?;
        validate_artifact_name(document_id)?;
        Ok(self.root.join(index).join(document_id))
    }

    fn file_path(&self, index: &str, document_id: &str, name: &str) -> PipelineResult<PathBuf> {
        validate_artifact_name(name)?;
        Ok(self.document_dir(index, document_id)?.join(name))
    }
}

async fn remove_dir_if_exists(path: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn remove_file_if_exists(path: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Sorted names of the visible files, or subdirectories, of `dir`.
async fn list_entries(dir: &Path, directories: bool) -> PipelineResult<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let file_type = entry.file_type().await?;
        let wanted = if directories {
            file_type.is_dir()
        } else {
            file_type.is_file()
        };
        if !name.starts_with('.') && wanted {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Delete every entry of `dir` except the file named `keep`.
async fn empty_dir_except(dir: &Path, keep: Option<&str>) -> PipelineResult<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if keep.is_some_and(|name| entry.file_name() == name) {
            continue;
        }
        if entry.file_type().await?.is_dir() {
            remove_dir_if_exists(&entry.path()).await?;
        } else {
            remove_file_if_exists(&entry.path()).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl ArtifactStore for FileSystemArtifactStore {
    async fn create_document_directory(
        &self,
        index: &str,
        document_id: &str,
    ) -> PipelineResult<()> {
        tokio::fs::create_dir_all(self.document_dir(index, document_id)?).await?;
        Ok(())
    }

    async fn empty_document_directory(
        &self,
        index: &str,
        document_id: &str,
    ) -> PipelineResult<()> {
        let dir = self.document_dir(index, document_id)?;
        empty_dir_except(&dir, Some(STATUS_FILE)).await?;
        debug!(index, document_id, "emptied document directory");
        Ok(())
    }

    async fn delete_document_directory(
        &self,
        index: &str,
        document_id: &str,
    ) -> PipelineResult<()> {
        remove_dir_if_exists(&self.document_dir(index, document_id)?).await
    }

    async fn delete_index_directory(
        &self,
        index: &str,
        keep_document: Option<&str>,
    ) -> PipelineResult<()> {
        validate_artifact_name(index)?;
        let index_dir = self.root.join(index);
        let Some(keep) = keep_document else {
            return remove_dir_if_exists(&index_dir).await;
        };

        empty_dir_except(&index_dir, Some(keep)).await?;
        empty_dir_except(&index_dir.join(keep), Some(STATUS_FILE)).await?;
        debug!(index, "emptied index directory");
        Ok(())
    }

    async fn write_file(
        &self,
        index: &str,
        document_id: &str,
        name: &str,
        content: &[u8],
    ) -> PipelineResult<()> {
        let path = self.file_path(index, document_id, name)?;
        let dir = self.document_dir(index, document_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        // Readers never observe a partially written file.
        let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn read_file(
        &self,
        index: &str,
        document_id: &str,
        name: &str,
    ) -> PipelineResult<Vec<u8>> {
        let path = self.file_path(index, document_id, name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(
                PipelineError::ArtifactNotFound(format!("{index}/{document_id}/{name}")),
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_file(&self, index: &str, document_id: &str, name: &str) -> PipelineResult<()> {
        remove_file_if_exists(&self.file_path(index, document_id, name)?).await
    }

    async fn list_files(&self, index: &str, document_id: &str) -> PipelineResult<Vec<String>> {
        list_entries(&self.document_dir(index, document_id)?, false).await
    }

    async fn list_indexes(&self) -> PipelineResult<Vec<String>> {
        list_entries(&self.root, true).await
    }

    async fn list_documents(&self, index: &str) -> PipelineResult<Vec<String>> {
        validate_artifact_name(index)?;
        list_entries(&self.root.join(index), true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, FileSystemArtifactStore) {
        let dir = TempDir::new().unwrap();
        let store = FileSystemArtifactStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn write_read_delete() {
        let (_dir, store) = store().await;
        store.write_file("idx", "doc", "a.txt", b"hello").await.unwrap();
        assert_eq!(store.read_file("idx", "doc", "a.txt").await.unwrap(), b"hello");
        assert_eq!(store.list_files("idx", "doc").await.unwrap(), vec!["a.txt"]);

        store.delete_file("idx", "doc", "a.txt").await.unwrap();
        store.delete_file("idx", "doc", "a.txt").await.unwrap();
        assert!(matches!(
            store.read_file("idx", "doc", "a.txt").await,
            Err(PipelineError::ArtifactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_keeps_status_document() {
        let (_dir, store) = store().await;
        store.write_file("idx", "doc", "a.txt", b"a").await.unwrap();
        store.write_file("idx", "doc", "a.txt.extract.json", b"{}").await.unwrap();
        store.write_file("idx", "doc", STATUS_FILE, b"{}").await.unwrap();

        store.empty_document_directory("idx", "doc").await.unwrap();
        assert_eq!(store.list_files("idx", "doc").await.unwrap(), vec![STATUS_FILE]);

        // Emptying twice, or emptying a missing directory, is fine.
        store.empty_document_directory("idx", "doc").await.unwrap();
        store.empty_document_directory("idx", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn delete_index_keeps_requested_tombstone() {
        let (_dir, store) = store().await;
        store.write_file("idx", "doc1", "a.txt", b"a").await.unwrap();
        store.write_file("idx", "__index", STATUS_FILE, b"{}").await.unwrap();
        store.write_file("idx", "__index", "stray", b"x").await.unwrap();

        store.delete_index_directory("idx", Some("__index")).await.unwrap();
        assert!(store.list_files("idx", "doc1").await.unwrap().is_empty());
        assert_eq!(store.list_files("idx", "__index").await.unwrap(), vec![STATUS_FILE]);

        store.delete_index_directory("idx", None).await.unwrap();
        assert!(store.list_files("idx", "__index").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lists_indexes_and_documents() {
        let (_dir, store) = store().await;
        assert!(store.list_indexes().await.unwrap().is_empty());

        store.write_file("notes", "b", STATUS_FILE, b"{}").await.unwrap();
        store.write_file("notes", "a", "a.txt", b"a").await.unwrap();
        store.write_file("default", "doc", "a.txt", b"a").await.unwrap();
        store.create_document_directory("empty", "doc").await.unwrap();

        assert_eq!(
            store.list_indexes().await.unwrap(),
            vec!["default", "empty", "notes"]
        );
        assert_eq!(store.list_documents("notes").await.unwrap(), vec!["a", "b"]);
        assert!(store.list_documents("missing").await.unwrap().is_empty());
        assert!(store.list_documents("..").await.is_err());
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.write_file("idx", "doc", "../escape", b"x").await,
            Err(PipelineError::InvalidArtifactName(_))
        ));
        assert!(store.read_file("..", "doc", "a").await.is_err());
    }
}
