//! Render job lifecycle
//!
//! Sequences preparation, the origin server and the renderer for one job and
//! guarantees that every transient resource is released on every exit path:
//! the engine (inside the renderer), then the origin server, then the
//! prepared document. The output file is only written after a successful
//! capture, through a temp file in the destination directory that is renamed
//! into place.
//!
//! Job states:
//!
//! ```text
//! Idle -> Prepared -> ServerRunning -> EngineConnected -> ViewportSet
//!      -> Loaded -> Captured -> Written -> Idle
//! ```
//!
//! with `Cleanup` reachable from any state on error, timeout, cancellation or
//! panic, always followed by `Idle`.

use crate::origin::OriginServer;
use crate::{prepare, CancelToken, Deadline, Error, Phase, RenderJob, RenderSettings, RenderTarget, Renderer, Result};
use sha2::{Digest, Sha256};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// First eight bytes of every PNG stream
pub const PNG_SIGNATURE: [u8; 8] = *b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Prepared,
    ServerRunning,
    EngineConnected,
    ViewportSet,
    Loaded,
    Captured,
    Written,
    Cleanup,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Records the state transitions of one job.
///
/// Dropping the tracker moves the job back to `Idle`; it is created before
/// any resource so it is dropped after all of them.
pub struct JobTracker {
    label: String,
    state: Cell<JobState>,
    history: RefCell<Vec<JobState>>,
}

impl JobTracker {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Cell::new(JobState::Idle),
            history: RefCell::new(Vec::new()),
        }
    }

    pub fn state(&self) -> JobState {
        self.state.get()
    }

    /// States entered so far, in order (the initial `Idle` is not recorded)
    pub fn history(&self) -> Vec<JobState> {
        self.history.borrow().clone()
    }

    pub fn advance(&self, next: JobState) {
        let prev = self.state.replace(next);
        if prev == next {
            return;
        }
        log::debug!("{}: {} -> {}", self.label, prev, next);
        self.history.borrow_mut().push(next);
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        if std::thread::panicking() && self.state() != JobState::Cleanup {
            log::warn!("{}: panicked in state {}", self.label, self.state());
            self.advance(JobState::Cleanup);
        }
        self.advance(JobState::Idle);
    }
}

/// The reset-injected document, written next to the post's assets so
/// relative references keep working. Removed when dropped.
pub struct PreparedDocument {
    file: NamedTempFile,
    file_name: String,
}

impl PreparedDocument {
    pub fn create(dir: &Path, prefix: &str, contents: &str) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".html")
            .tempfile_in(dir)
            .map_err(|e| Error::io("failed to create temp HTML file", e))?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| Error::io("failed to write temp HTML file", e))?;

        let file_name = file
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidJob("temp HTML file has no name".into()))?;

        Ok(Self { file, file_name })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Delete the file now, reporting failures instead of ignoring them
    pub fn remove(self) -> Result<()> {
        self.file
            .close()
            .map_err(|e| Error::io("failed to remove temp HTML file", e))
    }
}

/// Transient resources acquired by a job, released in reverse order of
/// acquisition. Either slot may be empty if the job failed before reaching it.
#[derive(Default)]
struct Acquired {
    document: Option<PreparedDocument>,
    server: Option<OriginServer>,
}

impl Acquired {
    fn release(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
        if let Some(document) = self.document.take() {
            let path = document.path().to_path_buf();
            if let Err(e) = document.remove() {
                log::warn!("leaving {} behind: {}", path.display(), e);
            }
        }
    }
}

impl Drop for Acquired {
    fn drop(&mut self) {
        self.release();
    }
}

/// What a successful job produced
#[derive(Debug, Clone)]
pub struct RenderReport {
    pub output_path: PathBuf,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub bytes: usize,
    /// Hex SHA-256 of the PNG; identical for repeated renders of static content
    pub sha256: String,
    pub elapsed_ms: u64,
    pub transitions: Vec<JobState>,
}

/// Run one job to completion.
///
/// `cancel` may be triggered from another thread; the job then stops at its
/// next suspension point with [`Error::Cancelled`] and cleans up like any
/// other failure.
pub fn run_job(
    job: &RenderJob,
    renderer: &dyn Renderer,
    settings: &RenderSettings,
    cancel: Option<CancelToken>,
) -> Result<RenderReport> {
    let tracker = JobTracker::new(format!("render {}", job.post_dir.display()));
    let mut deadline = Deadline::new(settings.timeout);
    if let Some(token) = cancel {
        deadline = deadline.with_cancel(token);
    }

    let mut acquired = Acquired::default();
    let captured = capture(job, renderer, settings, &deadline, &tracker, &mut acquired);
    if let Err(e) = &captured {
        log::warn!("render of {} failed: {}", job.post_dir.display(), e);
        tracker.advance(JobState::Cleanup);
    }
    acquired.release();
    let png = captured?;

    if let Err(e) = write_output(&job.output_path, &png) {
        tracker.advance(JobState::Cleanup);
        return Err(e);
    }
    tracker.advance(JobState::Written);

    let report = RenderReport {
        output_path: job.output_path.clone(),
        pixel_width: job.viewport.pixel_width(),
        pixel_height: job.viewport.pixel_height(),
        bytes: png.len(),
        sha256: hex::encode(Sha256::digest(&png)),
        elapsed_ms: deadline.elapsed().as_millis() as u64,
        transitions: tracker.history(),
    };
    log::info!(
        "rendered {} ({}x{}, {} bytes) in {}ms",
        report.output_path.display(),
        report.pixel_width,
        report.pixel_height,
        report.bytes,
        report.elapsed_ms
    );
    Ok(report)
}

fn capture(
    job: &RenderJob,
    renderer: &dyn Renderer,
    settings: &RenderSettings,
    deadline: &Deadline,
    tracker: &JobTracker,
    acquired: &mut Acquired,
) -> Result<Vec<u8>> {
    let html_path = job.html_path();
    let source = fs::read_to_string(&html_path)
        .map_err(|e| Error::io(format!("failed to read HTML file {}", html_path.display()), e))?;

    let document = acquired.document.insert(PreparedDocument::create(
        &job.post_dir,
        &settings.temp_prefix,
        &prepare::inject_reset(&source),
    )?);
    tracker.advance(JobState::Prepared);

    deadline.check(Phase::Serve)?;
    let file_name = document.file_name().to_string();
    let server = acquired
        .server
        .insert(OriginServer::bind(&job.post_dir, settings.bind_host)?);
    let url = server.endpoint().url_for(&file_name)?;
    tracker.advance(JobState::ServerRunning);

    let png = renderer.render(&RenderTarget {
        url: &url,
        viewport: job.viewport,
        deadline,
        tracker,
    })?;

    match png_dimensions(&png) {
        None => Err(Error::Capture("engine returned data that is not a PNG".into())),
        Some((w, h)) if (w, h) != (job.viewport.pixel_width(), job.viewport.pixel_height()) => {
            Err(Error::Capture(format!(
                "captured {}x{} pixels, expected {}x{}",
                w,
                h,
                job.viewport.pixel_width(),
                job.viewport.pixel_height()
            )))
        }
        Some(_) => {
            tracker.advance(JobState::Captured);
            Ok(png)
        }
    }
}

/// Pixel size from a PNG's IHDR chunk
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 24 || bytes[..8] != PNG_SIGNATURE || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    Some((width, height))
}

/// Write `png` to `path` so readers never observe a partial file.
fn write_output(path: &Path, png: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidJob(format!("output path has no parent: {}", path.display())))?;
    fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("failed to create output directory {}", dir.display()), e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".rfcanvas-out-")
        .suffix(".png")
        .tempfile_in(dir)
        .map_err(|e| Error::io("failed to create output temp file", e))?;
    tmp.write_all(png)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io("failed to write screenshot", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(|e| Error::io("failed to set screenshot permissions", e))?;
    }

    tmp.persist(path)
        .map_err(|e| Error::io(format!("failed to write screenshot {}", path.display()), e.error))?;
    Ok(())
}
