//! Export a stored post to PNG

use crate::lifecycle::{self, RenderReport};
use crate::post::validate_post_id;
use crate::store::PostStore;
use crate::{CancelToken, Error, RenderJob, RenderSettings, Renderer, Result};
use std::path::Path;

/// Result of exporting one post
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub post_id: String,
    /// Logical canvas size from the post metadata
    pub width: u32,
    pub height: u32,
    pub render: RenderReport,
}

/// Render the post `post_id` from `store` into `output_path`.
///
/// The canvas size comes from the post's metadata; the PNG is twice that in
/// each dimension.
pub fn export_image<S: PostStore + ?Sized>(
    store: &S,
    renderer: &dyn Renderer,
    settings: &RenderSettings,
    post_id: &str,
    output_path: &Path,
) -> Result<ExportReport> {
    export_image_with_cancel(store, renderer, settings, post_id, output_path, None)
}

/// [`export_image`] with a cancel token that may be triggered from another thread
pub fn export_image_with_cancel<S: PostStore + ?Sized>(
    store: &S,
    renderer: &dyn Renderer,
    settings: &RenderSettings,
    post_id: &str,
    output_path: &Path,
    cancel: Option<CancelToken>,
) -> Result<ExportReport> {
    if !validate_post_id(post_id) {
        return Err(Error::InvalidPostId(post_id.to_string()));
    }
    let post = store.get_post(post_id)?;
    let job = RenderJob::new(store.post_dir(post_id), post.width, post.height, output_path)?;

    log::info!("exporting {} at {}x{}", post_id, post.width, post.height);
    let render = lifecycle::run_job(&job, renderer, settings, cancel)?;
    Ok(ExportReport {
        post_id: post.id,
        width: post.width,
        height: post.height,
        render,
    })
}
