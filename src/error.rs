//! Error types for the rendering pipeline

use crate::deadline::Phase;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing, serving, rendering or writing a post
#[derive(Error, Debug)]
pub enum Error {
    /// The origin server could not bind a loopback port
    #[error("Failed to start origin server: {0}")]
    Bind(String),

    /// No rendering engine could be located or launched
    #[error("Rendering engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The engine could not open the prepared document
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// The engine rejected the device metrics override
    #[error("Failed to set viewport: {0}")]
    Viewport(String),

    /// The job deadline elapsed while waiting in `phase`
    #[error("{phase} timed out after {timeout_ms}ms")]
    Timeout { phase: Phase, timeout_ms: u64 },

    /// The job was cancelled through its cancel token
    #[error("Render cancelled during {0}")]
    Cancelled(Phase),

    /// Screenshot capture failed or produced something that is not a PNG
    #[error("Capture failed: {0}")]
    Capture(String),

    /// Filesystem failure (source HTML, temp document, output file, store)
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Job parameters violate an invariant
    #[error("Invalid render job: {0}")]
    InvalidJob(String),

    /// Post id is malformed
    #[error("Invalid post ID: {0}")]
    InvalidPostId(String),

    /// No post with this id exists in the store
    #[error("Post {0} does not exist")]
    PostNotFound(String),

    /// Post metadata could not be encoded or decoded
    #[error("Post store error: {0}")]
    Store(String),

    /// Malformed tool call
    #[error("{0}")]
    Tool(String),
}

impl Error {
    /// Wrap an I/O error with a short description of what was being done
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this failure came from the job deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failed_phase() {
        let e = Error::Timeout {
            phase: Phase::Load,
            timeout_ms: 30000,
        };
        assert_eq!(e.to_string(), "page load timed out after 30000ms");
        assert!(e.is_timeout());

        let e = Error::io(
            "failed to read HTML file",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(e.to_string().starts_with("failed to read HTML file"));
        assert!(!e.is_timeout());
    }
}
