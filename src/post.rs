//! Image posts: data types, ids and the validating service layer

use crate::store::PostStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Longest slug kept from a post name
pub const MAX_SLUG_LENGTH: usize = 30;
/// Random hex characters appended to the slug
pub const SUFFIX_LENGTH: usize = 4;

// Attempts with a short suffix before switching to a long one
const ID_ATTEMPTS: usize = 100;

/// An HTML post with a fixed canvas size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePost {
    pub id: String,
    pub name: String,
    pub html_content: String,
    pub width: u32,
    pub height: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Contents of a post's `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&ImagePost> for Metadata {
    fn from(post: &ImagePost) -> Self {
        Self {
            name: post.name.clone(),
            width: post.width,
            height: post.height,
            created_at: post.created_at,
            updated_at: post.updated_at,
        }
    }
}

/// Listing entry for a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostInfo {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// `index.html` relative to the store root
    pub file_path: String,
}

/// Build an id like `summer-sale-banner-3f9a` from a post name.
///
/// `exists` is consulted so a fresh id never collides with a stored post.
pub fn generate_post_id(name: &str, exists: impl Fn(&str) -> bool) -> String {
    let mut slug = slug::slugify(name);
    if slug.len() > MAX_SLUG_LENGTH {
        slug.truncate(MAX_SLUG_LENGTH);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    if slug.is_empty() {
        slug = "post".to_string();
    }

    for _ in 0..ID_ATTEMPTS {
        let id = format!("{}-{}", slug, random_hex(SUFFIX_LENGTH));
        if !exists(&id) {
            return id;
        }
    }
    format!("{}-{}", slug, random_hex(SUFFIX_LENGTH * 2))
}

fn random_hex(len: usize) -> String {
    let mut hex = uuid::Uuid::new_v4().simple().to_string();
    hex.truncate(len);
    hex
}

/// Whether `id` could have come from [`generate_post_id`].
///
/// Ids double as directory names, so anything beyond `[a-z0-9-]` is refused.
pub fn validate_post_id(id: &str) -> bool {
    !id.is_empty()
        && id.contains('-')
        && id.len() <= MAX_SLUG_LENGTH + SUFFIX_LENGTH * 2 + 1
        && !id.starts_with('-')
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn check_id(id: &str) -> Result<()> {
    if validate_post_id(id) {
        Ok(())
    } else {
        Err(Error::InvalidPostId(id.to_string()))
    }
}

/// Post operations with input validation on top of a [`PostStore`]
pub struct PostService<S: PostStore> {
    store: S,
}

impl<S: PostStore> PostService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn create_post(&self, name: &str, html_content: &str, width: u32, height: u32) -> Result<ImagePost> {
        if name.trim().is_empty() {
            return Err(Error::Tool("post name cannot be empty".into()));
        }
        if html_content.is_empty() {
            return Err(Error::Tool("HTML content cannot be empty".into()));
        }
        if width == 0 || height == 0 {
            return Err(Error::Tool("width and height must be positive integers".into()));
        }

        let id = generate_post_id(name, |candidate| self.store.post_exists(candidate));
        let now = OffsetDateTime::now_utc();
        let post = ImagePost {
            id,
            name: name.to_string(),
            html_content: html_content.to_string(),
            width,
            height,
            created_at: now,
            updated_at: now,
        };
        self.store.create_post(&post)?;
        log::info!("created post {} ({}x{})", post.id, width, height);
        Ok(post)
    }

    /// Replace a post's HTML. Canvas dimensions never change after creation.
    pub fn update_post(&self, id: &str, html_content: &str) -> Result<ImagePost> {
        check_id(id)?;
        if html_content.is_empty() {
            return Err(Error::Tool("HTML content cannot be empty".into()));
        }
        let mut post = self.store.get_post(id)?;
        post.html_content = html_content.to_string();
        post.updated_at = OffsetDateTime::now_utc();
        self.store.update_post(&post)?;
        Ok(post)
    }

    pub fn get_post(&self, id: &str) -> Result<ImagePost> {
        check_id(id)?;
        self.store.get_post(id)
    }

    pub fn list_posts(&self) -> Result<Vec<PostInfo>> {
        self.store.list_posts()
    }

    /// Copy a media file into the post; returns the path to use in HTML
    pub fn add_media(&self, id: &str, source: &Path) -> Result<String> {
        check_id(id)?;
        if source.as_os_str().is_empty() {
            return Err(Error::Tool("source path cannot be empty".into()));
        }
        self.store.copy_media(id, source)
    }

    pub fn delete_post(&self, id: &str) -> Result<()> {
        check_id(id)?;
        self.store.delete_post(id)
    }

    pub fn post_dir(&self, id: &str) -> Result<PathBuf> {
        check_id(id)?;
        Ok(self.store.post_dir(id))
    }

    pub fn html_path(&self, id: &str) -> Result<PathBuf> {
        check_id(id)?;
        Ok(self.store.html_path(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_slug_plus_suffix() {
        let id = generate_post_id("Summer Sale: 50% OFF!", |_| false);
        let (slug, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(slug, "summer-sale-50-off");
        assert_eq!(suffix.len(), SUFFIX_LENGTH);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(validate_post_id(&id));
    }

    #[test]
    fn long_names_are_truncated_without_trailing_dash() {
        let id = generate_post_id("an extremely long post name that keeps going on", |_| false);
        let (slug, _) = id.rsplit_once('-').unwrap();
        assert!(slug.len() <= MAX_SLUG_LENGTH);
        assert!(!slug.ends_with('-'));
        assert!(validate_post_id(&id));
    }

    #[test]
    fn empty_slug_becomes_post() {
        let id = generate_post_id("!!!", |_| false);
        assert!(id.starts_with("post-"));
    }

    #[test]
    fn collisions_eventually_use_long_suffix() {
        let id = generate_post_id("x", |_| true);
        let (_, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(suffix.len(), SUFFIX_LENGTH * 2);
    }

    #[test]
    fn rejects_ids_that_could_escape_the_store() {
        assert!(!validate_post_id(""));
        assert!(!validate_post_id("nodash"));
        assert!(!validate_post_id("../etc-1234"));
        assert!(!validate_post_id("a/b-1234"));
        assert!(!validate_post_id("Upper-1234"));
        assert!(!validate_post_id("-abcd"));
        assert!(validate_post_id("card-1a2b"));
    }

    #[test]
    fn metadata_round_trips_rfc3339() {
        let now = time::macros::datetime!(2024-05-01 12:30:00 UTC);
        let meta = Metadata {
            name: "Card".into(),
            width: 1080,
            height: 1350,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"created_at\":\"2024-05-01T12:30:00Z\""));
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
