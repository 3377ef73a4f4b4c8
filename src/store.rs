//! Filesystem storage for posts
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<post-id>/index.html
//! <root>/<post-id>/metadata.json
//! <root>/<post-id>/media/...
//! ```

use crate::post::{ImagePost, Metadata, PostInfo};
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Storage capability used by the post service and the exporter
pub trait PostStore {
    fn post_dir(&self, id: &str) -> PathBuf;
    fn html_path(&self, id: &str) -> PathBuf;
    fn post_exists(&self, id: &str) -> bool;
    fn create_post(&self, post: &ImagePost) -> Result<()>;
    fn update_post(&self, post: &ImagePost) -> Result<()>;
    fn get_post(&self, id: &str) -> Result<ImagePost>;
    fn list_posts(&self) -> Result<Vec<PostInfo>>;
    /// Copy `source` into the post's `media/` directory, returning the
    /// relative reference to use from `index.html`
    fn copy_media(&self, id: &str, source: &Path) -> Result<String>;
    fn delete_post(&self, id: &str) -> Result<()>;
}

/// [`PostStore`] backed by one directory per post
#[derive(Debug, Clone)]
pub struct FsPostStore {
    root: PathBuf,
}

impl FsPostStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::io(format!("failed to create root directory {}", root.display()), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.post_dir(id).join("metadata.json")
    }

    fn media_dir(&self, id: &str) -> PathBuf {
        self.post_dir(id).join("media")
    }

    fn write_post_files(&self, post: &ImagePost) -> Result<()> {
        fs::write(self.html_path(&post.id), &post.html_content)
            .map_err(|e| Error::io("failed to write HTML file", e))?;
        self.write_metadata(&post.id, &Metadata::from(post))
    }

    fn write_metadata(&self, id: &str, metadata: &Metadata) -> Result<()> {
        let data = serde_json::to_string_pretty(metadata)
            .map_err(|e| Error::Store(format!("failed to marshal metadata: {}", e)))?;
        fs::write(self.metadata_path(id), data).map_err(|e| Error::io("failed to write metadata file", e))
    }

    fn read_metadata(&self, id: &str) -> Result<Metadata> {
        let data = fs::read_to_string(self.metadata_path(id))
            .map_err(|e| Error::io("failed to read metadata file", e))?;
        serde_json::from_str(&data).map_err(|e| Error::Store(format!("failed to unmarshal metadata: {}", e)))
    }

    fn require(&self, id: &str) -> Result<()> {
        if self.post_exists(id) {
            Ok(())
        } else {
            Err(Error::PostNotFound(id.to_string()))
        }
    }
}

impl PostStore for FsPostStore {
    fn post_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn html_path(&self, id: &str) -> PathBuf {
        self.post_dir(id).join("index.html")
    }

    fn post_exists(&self, id: &str) -> bool {
        self.html_path(id).is_file()
    }

    fn create_post(&self, post: &ImagePost) -> Result<()> {
        fs::create_dir_all(self.media_dir(&post.id))
            .map_err(|e| Error::io("failed to create post directory", e))?;
        self.write_post_files(post)
    }

    fn update_post(&self, post: &ImagePost) -> Result<()> {
        self.require(&post.id)?;
        self.write_post_files(post)
    }

    fn get_post(&self, id: &str) -> Result<ImagePost> {
        self.require(id)?;
        let html_content = fs::read_to_string(self.html_path(id))
            .map_err(|e| Error::io("failed to read HTML file", e))?;
        let meta = self.read_metadata(id)?;
        Ok(ImagePost {
            id: id.to_string(),
            name: meta.name,
            html_content,
            width: meta.width,
            height: meta.height,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        })
    }

    fn list_posts(&self) -> Result<Vec<PostInfo>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::io("failed to read root directory", e))?;

        let mut posts = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if !self.post_exists(&id) {
                continue;
            }
            let meta = match self.read_metadata(&id) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("skipping post {}: {}", id, e);
                    continue;
                }
            };
            posts.push(PostInfo {
                file_path: format!("{}/index.html", id),
                id,
                name: meta.name,
                width: meta.width,
                height: meta.height,
                created_at: meta.created_at,
                updated_at: meta.updated_at,
            });
        }
        posts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(posts)
    }

    fn copy_media(&self, id: &str, source: &Path) -> Result<String> {
        self.require(id)?;
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Store(format!("{} has no file name", source.display())))?;

        let media_dir = self.media_dir(id);
        fs::create_dir_all(&media_dir).map_err(|e| Error::io("failed to create media directory", e))?;
        fs::copy(source, media_dir.join(&file_name))
            .map_err(|e| Error::io(format!("failed to copy {}", source.display()), e))?;

        Ok(format!("media/{}", file_name))
    }

    fn delete_post(&self, id: &str) -> Result<()> {
        self.require(id)?;
        fs::remove_dir_all(self.post_dir(id)).map_err(|e| Error::io("failed to delete post directory", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn post(id: &str, created: time::OffsetDateTime) -> ImagePost {
        ImagePost {
            id: id.to_string(),
            name: format!("Post {}", id),
            html_content: "<html><body>Hi</body></html>".to_string(),
            width: 200,
            height: 100,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn create_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPostStore::open(dir.path().join("posts")).unwrap();
        let p = post("card-0001", datetime!(2024-01-01 0:00 UTC));
        store.create_post(&p).unwrap();

        assert!(store.post_exists("card-0001"));
        assert!(store.post_dir("card-0001").join("media").is_dir());
        assert_eq!(store.get_post("card-0001").unwrap(), p);
    }

    #[test]
    fn list_is_ordered_and_skips_broken_posts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPostStore::open(dir.path()).unwrap();
        store.create_post(&post("late-0002", datetime!(2024-02-01 0:00 UTC))).unwrap();
        store.create_post(&post("early-0001", datetime!(2024-01-01 0:00 UTC))).unwrap();

        // No index.html
        fs::create_dir(dir.path().join("empty-0003")).unwrap();
        // Corrupt metadata
        store.create_post(&post("bad-0004", datetime!(2024-03-01 0:00 UTC))).unwrap();
        fs::write(dir.path().join("bad-0004").join("metadata.json"), "{").unwrap();

        let ids: Vec<_> = store.list_posts().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["early-0001", "late-0002"]);
    }

    #[test]
    fn missing_posts_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPostStore::open(dir.path()).unwrap();
        assert!(matches!(store.get_post("nope-0000"), Err(Error::PostNotFound(_))));
        assert!(matches!(store.delete_post("nope-0000"), Err(Error::PostNotFound(_))));
        let p = post("nope-0000", datetime!(2024-01-01 0:00 UTC));
        assert!(matches!(store.update_post(&p), Err(Error::PostNotFound(_))));
    }

    #[test]
    fn media_is_copied_with_relative_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPostStore::open(dir.path().join("posts")).unwrap();
        store.create_post(&post("card-0001", datetime!(2024-01-01 0:00 UTC))).unwrap();

        let src = dir.path().join("photo.jpg");
        fs::write(&src, b"jpeg").unwrap();
        let rel = store.copy_media("card-0001", &src).unwrap();
        assert_eq!(rel, "media/photo.jpg");
        assert_eq!(fs::read(store.post_dir("card-0001").join(&rel)).unwrap(), b"jpeg");
    }

    #[test]
    fn delete_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPostStore::open(dir.path()).unwrap();
        store.create_post(&post("card-0001", datetime!(2024-01-01 0:00 UTC))).unwrap();
        store.delete_post("card-0001").unwrap();
        assert!(!store.post_dir("card-0001").exists());
    }
}
