//! Texture group backed by a directory tree.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{BoxFuture, SourceError, TextureSource, TilePayload};
use crate::coord::NodeId;

/// Reads tiles from `<root>/<group>/<level>/<x>_<y>.<ext>`.
#[derive(Debug, Clone)]
pub struct DirectoryTextureGroup {
    root: PathBuf,
    group: String,
    extension: String,
}

impl DirectoryTextureGroup {
    /// Creates a source reading `png` tiles.
    pub fn new(root: impl Into<PathBuf>, group: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            group: group.into(),
            extension: "png".to_string(),
        }
    }

    /// Uses a different file extension (e.g. `jpg`).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `node`'s texture.
    pub fn tile_path(&self, node: NodeId) -> PathBuf {
        self.root
            .join(&self.group)
            .join(node.level.to_string())
            .join(format!("{}_{}.{}", node.x, node.y, self.extension))
    }
}

impl TextureSource for DirectoryTextureGroup {
    fn name(&self) -> &str {
        &self.group
    }

    fn fetch(&self, node: NodeId) -> BoxFuture<'_, Result<TilePayload, SourceError>> {
        let path = self.tile_path(node);
        Box::pin(async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(TilePayload::new(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => Err(SourceError::NotFound(node)),
                Err(e) => Err(SourceError::Transient(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tile_path_layout() {
        let source = DirectoryTextureGroup::new("/data", "bluemarble").with_extension("jpg");
        assert_eq!(
            source.tile_path(NodeId::new(3, 2, 5)),
            PathBuf::from("/data/bluemarble/3/2_5.jpg")
        );
    }

    #[tokio::test]
    async fn test_fetch_existing_tile() {
        let temp = TempDir::new().unwrap();
        let source = DirectoryTextureGroup::new(temp.path(), "group");
        let node = NodeId::new(1, 3, 0);
        let path = source.tile_path(node);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"tile-bytes").unwrap();

        let payload = source.fetch(node).await.unwrap();
        assert_eq!(&payload.texture[..], b"tile-bytes");
    }

    #[tokio::test]
    async fn test_fetch_missing_tile_is_not_found() {
        let temp = TempDir::new().unwrap();
        let source = DirectoryTextureGroup::new(temp.path(), "group");
        let node = NodeId::new(2, 0, 0);
        assert_eq!(source.fetch(node).await, Err(SourceError::NotFound(node)));
    }

    #[tokio::test]
    async fn test_fetch_directory_is_transient() {
        let temp = TempDir::new().unwrap();
        let source = DirectoryTextureGroup::new(temp.path(), "group");
        let node = NodeId::new(0, 0, 0);
        // A directory where the file should be fails with a non-NotFound error.
        std::fs::create_dir_all(source.tile_path(node)).unwrap();
        assert!(matches!(
            source.fetch(node).await,
            Err(SourceError::Transient(_))
        ));
    }
}
