//! Chrome DevTools Protocol renderer (uses the `headless_chrome` crate)

use crate::discovery::{self, EngineDescriptor, SearchPolicy};
use crate::{Deadline, Error, JobState, Phase, RenderTarget, Renderer, Result, ViewportSpec};
use headless_chrome::protocol::cdp::{Emulation, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Interval between document.readyState polls
const LOAD_POLL: Duration = Duration::from_millis(25);
// How often a pending DevTools call checks the cancel token
const CANCEL_POLL: Duration = Duration::from_millis(50);
// Extra wait for the font script to report its own timer firing
const FONT_SLACK: Duration = Duration::from_millis(500);

/// Launch configuration for [`CdpRenderer`]
#[derive(Debug, Clone)]
pub struct CdpConfig {
    /// How to locate the browser binary
    pub search: SearchPolicy,
    /// Keep Chrome's sandbox on; containers running as root usually need it off
    pub sandbox: bool,
    /// Upper bound for the best-effort web font wait
    pub font_timeout: Duration,
    /// Extra command line switches passed to Chrome
    pub args: Vec<String>,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            search: SearchPolicy::system(),
            sandbox: true,
            font_timeout: Duration::from_secs(10),
            args: vec![
                "--hide-scrollbars".to_string(),
                "--disable-extensions".to_string(),
                "--disable-background-networking".to_string(),
                "--disable-sync".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--mute-audio".to_string(),
            ],
        }
    }
}

/// Renders by launching a fresh headless Chrome per job.
///
/// Nothing is shared between jobs: each call discovers, launches, drives and
/// finally kills its own browser process.
pub struct CdpRenderer {
    config: CdpConfig,
}

impl CdpRenderer {
    pub fn new(config: CdpConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(CdpConfig::default())
    }

    pub fn config(&self) -> &CdpConfig {
        &self.config
    }

    fn launch(&self, viewport: ViewportSpec, deadline: &Deadline) -> Result<EngineSession> {
        let remaining = deadline.check(Phase::Launch)?;
        let descriptor = discovery::discover(&self.config.search, discovery::is_executable)?;
        let path = match &descriptor {
            EngineDescriptor::Installed(path) => Some(path.clone()),
            EngineDescriptor::Managed => None,
        };
        log::debug!("launching {:?}", descriptor);

        let args: Vec<&OsStr> = self.config.args.iter().map(OsStr::new).collect();
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(self.config.sandbox)
            .path(path)
            .window_size(Some((viewport.width, viewport.height)))
            .idle_browser_timeout(remaining)
            .args(args)
            .build()
            .map_err(|e| Error::EngineUnavailable(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::EngineUnavailable(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| Error::EngineUnavailable(format!("Failed to create tab: {}", e)))?;

        let session = EngineSession { tab, browser };
        // Launch itself is not interruptible; if it overran, the session is
        // dropped (and the browser killed) on the way out.
        deadline.check(Phase::Launch)?;
        Ok(session)
    }
}

impl Renderer for CdpRenderer {
    fn render(&self, target: &RenderTarget<'_>) -> Result<Vec<u8>> {
        let session = self.launch(target.viewport, target.deadline)?;
        target.tracker.advance(JobState::EngineConnected);

        session.set_viewport(target.viewport, target.deadline)?;
        target.tracker.advance(JobState::ViewportSet);

        session.navigate(target.url.as_str(), target.deadline)?;
        session.wait_for_load(target.deadline)?;
        target.tracker.advance(JobState::Loaded);

        session.wait_for_fonts(target.deadline, self.config.font_timeout);

        let png = session.capture(target.viewport, target.deadline)?;
        target.tracker.advance(JobState::Captured);

        // Close the browser before the origin server goes away.
        drop(session);
        Ok(png)
    }
}

/// A launched browser and the tab driving the capture.
///
/// Dropping the session closes the tab and kills the browser process.
struct EngineSession {
    tab: Arc<Tab>,
    browser: Browser,
}

impl EngineSession {
    /// Bound the next DevTools call by the time left for `phase`
    fn arm(&self, deadline: &Deadline, phase: Phase) -> Result<Duration> {
        let remaining = deadline.check(phase)?;
        self.tab.set_default_timeout(remaining);
        Ok(remaining)
    }

    /// Run `request` against the tab without waiting past the job deadline.
    ///
    /// The tab's default timeout only covers the `wait_*` helpers; plain
    /// protocol calls block for the transport's own timeout, so they run on
    /// a helper thread instead.
    fn call<T, F>(&self, deadline: &Deadline, phase: Phase, kind: fn(String) -> Error, request: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        let remaining = self.arm(deadline, phase)?;
        let tab = Arc::clone(&self.tab);
        match run_with_limit(deadline, remaining, move || request(&tab)) {
            Bounded::Done(result) => result.map_err(|e| failure(deadline, phase, e, kind)),
            Bounded::TimedOut => Err(deadline.expired(phase)),
            Bounded::Cancelled => Err(Error::Cancelled(phase)),
        }
    }

    fn set_viewport(&self, viewport: ViewportSpec, deadline: &Deadline) -> Result<()> {
        // Built through serde so optional protocol fields stay unset.
        let metrics: Emulation::SetDeviceMetricsOverride = serde_json::from_value(serde_json::json!({
            "width": viewport.width,
            "height": viewport.height,
            "deviceScaleFactor": viewport.scale,
            "mobile": false,
        }))
        .map_err(|e| Error::Viewport(format!("Failed to encode device metrics: {}", e)))?;

        self.call(deadline, Phase::Viewport, Error::Viewport, move |tab| {
            tab.call_method(metrics).map(|_| ())
        })
    }

    fn navigate(&self, url: &str, deadline: &Deadline) -> Result<()> {
        let target = url.to_string();
        self.call(deadline, Phase::Navigation, Error::Navigation, move |tab| {
            tab.navigate_to(&target)?;
            tab.wait_until_navigated()?;
            Ok(())
        })?;

        // responseStatus is 0 when the engine does not report it.
        let status = self
            .call(deadline, Phase::Navigation, Error::Navigation, |tab| {
                tab.evaluate(
                    r#"(function() {
                        const nav = performance.getEntriesByType('navigation')[0];
                        return nav && typeof nav.responseStatus === 'number' ? nav.responseStatus : 0;
                    })()"#,
                    false,
                )
                .map(|o| o.value)
            })?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if status != 0 && !(200..300).contains(&status) {
            return Err(Error::Navigation(format!("{} answered with HTTP {}", url, status)));
        }
        Ok(())
    }

    fn wait_for_load(&self, deadline: &Deadline) -> Result<()> {
        loop {
            let state = self.call(deadline, Phase::Load, Error::Navigation, |tab| {
                tab.evaluate("document.readyState", false).map(|o| o.value)
            })?;
            if state.as_ref().and_then(|v| v.as_str()) == Some("complete") {
                return Ok(());
            }
            std::thread::sleep(LOAD_POLL.min(deadline.remaining()));
        }
    }

    /// Wait for `document.fonts.ready`. Never fails the job: engines without
    /// the Font Loading API, or a font that never settles, only get a warning
    /// and the capture proceeds, possibly with fallback fonts.
    ///
    /// The wait is raced against a page-side timer of at most `cap`, and never
    /// more than half the remaining deadline so the capture keeps its share.
    fn wait_for_fonts(&self, deadline: &Deadline, cap: Duration) {
        let remaining = match deadline.check(Phase::Fonts) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("fonts.ready check skipped: {}", e);
                return;
            }
        };
        let budget = font_budget(remaining, cap);
        let limit = (budget + FONT_SLACK).min(remaining);
        let script = font_wait_script(budget);
        let tab = Arc::clone(&self.tab);
        self.tab.set_default_timeout(limit);

        match run_with_limit(deadline, limit, move || tab.evaluate(&script, true).map(|o| o.value)) {
            Bounded::Done(Ok(value)) => match value.as_ref().and_then(|v| v.as_str()) {
                Some("timeout") => log::warn!(
                    "fonts not ready after {}ms, capturing with whatever has loaded",
                    budget.as_millis()
                ),
                Some("unsupported") => log::warn!("engine has no Font Loading API, skipping font wait"),
                _ => log::debug!("fonts ready"),
            },
            Bounded::Done(Err(e)) => log::warn!("fonts.ready check failed: {}", e),
            Bounded::TimedOut => log::warn!("fonts.ready check did not answer within {}ms", limit.as_millis()),
            Bounded::Cancelled => log::debug!("fonts.ready check abandoned, job cancelled"),
        }
    }

    fn capture(&self, viewport: ViewportSpec, deadline: &Deadline) -> Result<Vec<u8>> {
        let clip = Page::Viewport {
            x: 0.0,
            y: 0.0,
            width: f64::from(viewport.width),
            height: f64::from(viewport.height),
            scale: 1.0,
        };
        self.call(deadline, Phase::Capture, Error::Capture, move |tab| {
            tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, Some(clip), true)
        })
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if let Err(e) = self.tab.close(false) {
            log::debug!("tab close failed (browser is killed anyway): {}", e);
        }
        // `browser` drops after this, terminating the Chrome process.
        log::debug!("closing browser process {:?}", self.browser.get_process_id());
    }
}

/// Outcome of a call made through [`run_with_limit`]
#[derive(Debug)]
enum Bounded<T> {
    Done(anyhow::Result<T>),
    TimedOut,
    Cancelled,
}

/// Run `call` on a helper thread and wait at most `limit` for it.
///
/// A call still in flight when the limit passes is abandoned; it returns
/// with an error once the session is dropped and the browser killed.
fn run_with_limit<T, F>(deadline: &Deadline, limit: Duration, call: F) -> Bounded<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name("rfcanvas-devtools".to_string())
        .spawn(move || {
            // The receiver is gone if the caller already gave up.
            let _ = tx.send(call());
        });
    if let Err(e) = spawned {
        return Bounded::Done(Err(anyhow::anyhow!("failed to spawn DevTools call: {}", e)));
    }

    let until = Instant::now() + limit;
    loop {
        if deadline.is_cancelled() {
            return Bounded::Cancelled;
        }
        let left = until.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Bounded::TimedOut;
        }
        match rx.recv_timeout(left.min(CANCEL_POLL)) {
            Ok(result) => return Bounded::Done(result),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Bounded::Done(Err(anyhow::anyhow!("DevTools call ended without a result")))
            }
        }
    }
}

fn font_budget(remaining: Duration, cap: Duration) -> Duration {
    cap.min(remaining / 2)
}

/// Page script resolving to `"loaded"`, `"timeout"` or `"unsupported"`
fn font_wait_script(budget: Duration) -> String {
    format!(
        r#"(function() {{
            if (!document.fonts || !document.fonts.ready) {{
                return Promise.resolve('unsupported');
            }}
            return Promise.race([
                Promise.resolve(document.fonts.ready).then(function() {{ return 'loaded'; }}),
                new Promise(function(resolve) {{ setTimeout(function() {{ resolve('timeout'); }}, {}); }})
            ]);
        }})()"#,
        budget.as_millis()
    )
}

/// Classify a DevTools failure: an expired deadline or cancellation takes
/// precedence over the phase-specific error.
fn failure(
    deadline: &Deadline,
    phase: Phase,
    err: impl std::fmt::Display,
    kind: fn(String) -> Error,
) -> Error {
    if deadline.is_cancelled() {
        Error::Cancelled(phase)
    } else if deadline.remaining().is_zero() {
        deadline.expired(phase)
    } else {
        kind(format!("{}: {}", phase, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobTracker;

    #[test]
    fn missing_browser_is_engine_unavailable() {
        let renderer = CdpRenderer::new(CdpConfig {
            search: SearchPolicy::explicit("/nonexistent/rfcanvas/chrome"),
            ..Default::default()
        });
        let deadline = Deadline::new(Duration::from_secs(5));
        let tracker = JobTracker::new("test");
        let url = url::Url::parse("http://127.0.0.1:9/index.html").unwrap();
        let target = RenderTarget {
            url: &url,
            viewport: ViewportSpec::new(10, 10).unwrap(),
            deadline: &deadline,
            tracker: &tracker,
        };
        let err = renderer.render(&target).unwrap_err();
        assert!(matches!(err, Error::EngineUnavailable(_)), "got {:?}", err);
        assert_eq!(tracker.state(), JobState::Idle);
    }

    #[test]
    fn expired_deadline_stops_before_launch() {
        let renderer = CdpRenderer::with_defaults();
        let deadline = Deadline::new(Duration::ZERO);
        let tracker = JobTracker::new("test");
        let url = url::Url::parse("http://127.0.0.1:9/index.html").unwrap();
        let target = RenderTarget {
            url: &url,
            viewport: ViewportSpec::new(10, 10).unwrap(),
            deadline: &deadline,
            tracker: &tracker,
        };
        let err = renderer.render(&target).unwrap_err();
        assert!(matches!(err, Error::Timeout { phase: Phase::Launch, .. }));
    }

    #[test]
    fn failure_prefers_deadline_classification() {
        let live = Deadline::new(Duration::from_secs(5));
        let e = failure(&live, Phase::Capture, "boom", Error::Capture);
        assert!(matches!(e, Error::Capture(ref m) if m.contains("boom")));

        let expired = Deadline::new(Duration::ZERO);
        let e = failure(&expired, Phase::Load, "boom", Error::Navigation);
        assert!(e.is_timeout());
    }

    #[test]
    fn slow_calls_are_abandoned_at_the_limit() {
        let deadline = Deadline::new(Duration::from_secs(30));
        let started = Instant::now();
        let outcome = run_with_limit(&deadline, Duration::from_millis(100), || {
            std::thread::sleep(Duration::from_secs(5));
            Ok(())
        });
        assert!(matches!(outcome, Bounded::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn fast_calls_return_their_result() {
        let deadline = Deadline::new(Duration::from_secs(30));
        let outcome = run_with_limit(&deadline, Duration::from_secs(5), || Ok(7));
        assert!(matches!(outcome, Bounded::Done(Ok(7))));

        let outcome: Bounded<()> =
            run_with_limit(&deadline, Duration::from_secs(5), || Err(anyhow::anyhow!("protocol error")));
        assert!(matches!(outcome, Bounded::Done(Err(ref e)) if e.to_string() == "protocol error"));
    }

    #[test]
    fn cancellation_interrupts_a_pending_call() {
        let token = crate::CancelToken::new();
        let deadline = Deadline::new(Duration::from_secs(30)).with_cancel(token.clone());
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            token.cancel();
        });
        let started = Instant::now();
        let outcome = run_with_limit(&deadline, Duration::from_secs(10), || {
            std::thread::sleep(Duration::from_secs(5));
            Ok(())
        });
        canceller.join().unwrap();
        assert!(matches!(outcome, Bounded::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn font_wait_leaves_time_for_capture() {
        assert_eq!(
            font_budget(Duration::from_secs(30), Duration::from_secs(10)),
            Duration::from_secs(10)
        );
        assert_eq!(
            font_budget(Duration::from_secs(4), Duration::from_secs(10)),
            Duration::from_secs(2)
        );

        let script = font_wait_script(Duration::from_millis(1500));
        assert!(script.contains("Promise.race"));
        assert!(script.contains("}, 1500);"));
        assert!(script.contains("'unsupported'"));
    }
}
