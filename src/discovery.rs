//! Locating a rendering engine binary
//!
//! Discovery is a pure function of a [`SearchPolicy`] and a probe that says
//! whether a path is a usable executable. Nothing here caches results or
//! touches global state, so tests can drive it with a fake probe.

use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Binary names looked up in every `PATH` directory, in preference order
pub const BINARY_NAMES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome",
    "chromium",
    "chromium-browser",
    "chrome",
    "headless_shell",
];

/// Environment variables that may name a browser binary explicitly
pub const ENV_VARS: &[&str] = &["RFCANVAS_CHROME", "CHROME"];

/// Where to look for a rendering engine
#[derive(Debug, Clone, Default)]
pub struct SearchPolicy {
    /// A binary the caller insists on; no fallback if it is unusable
    pub explicit: Option<PathBuf>,
    /// Paths tried in order when no explicit binary is given
    pub candidates: Vec<PathBuf>,
    /// Whether a managed (downloaded) browser is acceptable as a last resort
    pub allow_managed: bool,
}

/// The engine a job will launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineDescriptor {
    /// A browser binary already present on this machine
    Installed(PathBuf),
    /// A browser fetched and managed by the CDP client library
    Managed,
}

impl SearchPolicy {
    /// Policy for the current machine: environment overrides, then `PATH`,
    /// then the platform's usual install locations.
    pub fn system() -> Self {
        let explicit = ENV_VARS
            .iter()
            .filter_map(|var| std::env::var_os(var))
            .find(|v| !v.is_empty())
            .map(PathBuf::from);

        let mut candidates = Vec::new();
        if let Some(path) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&path) {
                for name in BINARY_NAMES {
                    candidates.push(dir.join(exe_name(name)));
                }
            }
        }
        candidates.extend(platform_locations());

        Self {
            explicit,
            candidates,
            allow_managed: cfg!(feature = "fetch"),
        }
    }

    /// Policy that only accepts `path`
    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(path.into()),
            candidates: Vec::new(),
            allow_managed: false,
        }
    }
}

/// Resolve `policy` to an engine using `probe` to test candidate paths.
pub fn discover<P>(policy: &SearchPolicy, probe: P) -> Result<EngineDescriptor>
where
    P: Fn(&Path) -> bool,
{
    if let Some(path) = &policy.explicit {
        return if probe(path) {
            Ok(EngineDescriptor::Installed(path.clone()))
        } else {
            Err(Error::EngineUnavailable(format!(
                "configured browser {} is not an executable file",
                path.display()
            )))
        };
    }

    if let Some(found) = policy.candidates.iter().find(|p| probe(p)) {
        return Ok(EngineDescriptor::Installed(found.clone()));
    }

    if policy.allow_managed {
        return Ok(EngineDescriptor::Managed);
    }

    Err(Error::EngineUnavailable(format!(
        "no Chrome/Chromium binary found ({} locations checked); install one or set RFCANVAS_CHROME",
        policy.candidates.len()
    )))
}

/// Default probe: a regular file that is executable by someone
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn exe_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

fn platform_locations() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if cfg!(target_os = "macos") {
        for app in [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ] {
            out.push(PathBuf::from(app));
        }
    } else if cfg!(windows) {
        for var in ["ProgramFiles", "ProgramFiles(x86)", "LocalAppData"] {
            if let Some(base) = std::env::var_os(var) {
                out.push(PathBuf::from(base).join(r"Google\Chrome\Application\chrome.exe"));
            }
        }
    } else {
        for p in [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ] {
            out.push(PathBuf::from(p));
        }
    }
    out
}
