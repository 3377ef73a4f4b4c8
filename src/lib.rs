//! RFox Canvas
//!
//! Renders author-supplied HTML/CSS posts into pixel-exact PNG images at a
//! fixed canvas size, for programmatic image generation (social media cards,
//! thumbnails, stories).
//!
//! # Pipeline
//!
//! - **Preparer** ([`prepare`]): injects a CSS reset so the canvas has no
//!   default margins or scrollbars
//! - **Origin server** ([`origin`]): serves the post directory on a private
//!   loopback port so `media/...` references resolve
//! - **Renderer** ([`Renderer`], [`cdp`]): drives headless Chrome at the exact
//!   viewport with a device scale factor of 2 and captures the canvas
//! - **Lifecycle** ([`lifecycle`]): runs the above under one deadline and
//!   releases every transient resource on every exit path
//!
//! # Example
//!
//! ```no_run
//! use rfcanvas::{cdp::CdpRenderer, lifecycle, RenderJob, RenderSettings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let job = RenderJob::new("/posts/launch-card-1a2b", 1080, 1080, "/tmp/launch-card.png")?;
//! let renderer = CdpRenderer::with_defaults();
//! let report = lifecycle::run_job(&job, &renderer, &RenderSettings::default(), None)?;
//! println!("{}x{} -> {}", report.pixel_width, report.pixel_height, report.output_path.display());
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod deadline;
pub use deadline::{CancelToken, Deadline, Phase};

pub mod discovery;
pub mod export;
pub mod lifecycle;
pub mod origin;
pub mod post;
pub mod prepare;
pub mod store;
pub mod tools;

// CDP backend (headless Chrome)
#[cfg(feature = "cdp")]
pub mod cdp;

pub use lifecycle::{JobState, JobTracker, RenderReport};

/// Device pixels per CSS pixel in every capture
pub const DEVICE_SCALE_FACTOR: u32 = 2;

/// Settings shared by every render job
///
/// The defaults mirror what the pipeline was designed around: a 30 second
/// overall deadline and a loopback-only origin server.
///
/// # Examples
///
/// ```
/// let s = rfcanvas::RenderSettings::default();
/// assert_eq!(s.timeout.as_secs(), 30);
/// assert!(s.bind_host.is_loopback());
/// ```
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Overall deadline covering every blocking step of a job
    pub timeout: Duration,
    /// Address the per-job origin server binds (port is always OS-assigned)
    pub bind_host: IpAddr,
    /// File name prefix of the prepared document written into the post directory
    pub temp_prefix: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            temp_prefix: ".rfcanvas-".to_string(),
        }
    }
}

/// Logical canvas size plus the fixed capture scale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,
    pub scale: u32,
}

impl ViewportSpec {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidJob(format!(
                "canvas must be at least 1x1, got {}x{}",
                width, height
            )));
        }
        Ok(Self {
            width,
            height,
            scale: DEVICE_SCALE_FACTOR,
        })
    }

    /// Width of the captured PNG in device pixels
    pub fn pixel_width(&self) -> u32 {
        self.width.saturating_mul(self.scale)
    }

    /// Height of the captured PNG in device pixels
    pub fn pixel_height(&self) -> u32 {
        self.height.saturating_mul(self.scale)
    }
}

/// One request to turn a post directory into a PNG
#[derive(Debug, Clone)]
pub struct RenderJob {
    /// Directory holding `index.html` and its `media/` assets
    pub post_dir: PathBuf,
    pub viewport: ViewportSpec,
    /// Absolute path of the PNG to write
    pub output_path: PathBuf,
}

impl RenderJob {
    pub fn new(
        post_dir: impl Into<PathBuf>,
        width: u32,
        height: u32,
        output_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let output_path = output_path.into();
        if !output_path.is_absolute() {
            return Err(Error::InvalidJob(format!(
                "output path must be absolute: {}",
                output_path.display()
            )));
        }
        if output_path.file_name().is_none() {
            return Err(Error::InvalidJob(format!(
                "output path has no file name: {}",
                output_path.display()
            )));
        }
        Ok(Self {
            post_dir: post_dir.into(),
            viewport: ViewportSpec::new(width, height)?,
            output_path,
        })
    }

    pub fn html_path(&self) -> PathBuf {
        self.post_dir.join("index.html")
    }
}

/// Everything a renderer needs for one capture
pub struct RenderTarget<'a> {
    /// URL of the prepared document on the job's origin server
    pub url: &'a url::Url,
    pub viewport: ViewportSpec,
    pub deadline: &'a Deadline,
    /// Renderers report `EngineConnected`, `ViewportSet`, `Loaded` and
    /// `Captured` here as they reach them
    pub tracker: &'a JobTracker,
}

/// Capability that turns a served document into PNG bytes.
///
/// Implementations own their engine connection for the duration of the call
/// and must have released it by the time `render` returns, on success and
/// on failure alike.
pub trait Renderer {
    fn render(&self, target: &RenderTarget<'_>) -> Result<Vec<u8>>;
}

impl<F> Renderer for F
where
    F: Fn(&RenderTarget<'_>) -> Result<Vec<u8>>,
{
    fn render(&self, target: &RenderTarget<'_>) -> Result<Vec<u8>> {
        self(target)
    }
}
