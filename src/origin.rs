//! Ephemeral loopback origin serving a post directory
//!
//! Each render job gets its own server bound to port 0 on a loopback address,
//! so relative asset references like `media/photo.jpg` resolve against the
//! post directory and no two jobs ever share a port.

use crate::{Error, Result};
use percent_encoding::percent_decode_str;
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tiny_http::{Header, Method, Request, Response, Server};
use url::Url;

// Placeholder authority used only to normalise request paths.
const NORMALISE_BASE: &str = "http://origin.invalid/";

/// Address and document root of a running origin server
#[derive(Debug, Clone)]
pub struct OriginEndpoint {
    pub addr: SocketAddr,
    pub root: PathBuf,
}

impl OriginEndpoint {
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&format!("http://{}/", self.addr))
            .map_err(|e| Error::Navigation(format!("Invalid origin address {}: {}", self.addr, e)))
    }

    /// Absolute URL of `file_name` inside the served root
    pub fn url_for(&self, file_name: &str) -> Result<Url> {
        self.base_url()?
            .join(file_name)
            .map_err(|e| Error::Navigation(format!("Invalid document name {}: {}", file_name, e)))
    }
}

/// A static file server running on a background thread.
///
/// Dropping the server stops it; [`OriginServer::stop`] may also be called
/// explicitly any number of times.
pub struct OriginServer {
    endpoint: OriginEndpoint,
    server: Option<Arc<Server>>,
    worker: Option<JoinHandle<()>>,
}

impl OriginServer {
    /// Serve `root` on `127.0.0.1` with an OS-assigned port
    pub fn start(root: &Path) -> Result<Self> {
        Self::bind(root, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Serve `root` on `host` with an OS-assigned port
    pub fn bind(root: &Path, host: IpAddr) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| Error::io(format!("failed to resolve serving root {}", root.display()), e))?;

        let server = Server::http(SocketAddr::new(host, 0))
            .map_err(|e| Error::Bind(format!("cannot listen on {}:0: {}", host, e)))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| Error::Bind("listener has no IP address".into()))?;

        let server = Arc::new(server);
        let worker_server = Arc::clone(&server);
        let worker_root = root.clone();
        let worker = std::thread::Builder::new()
            .name(format!("rfcanvas-origin-{}", addr.port()))
            .spawn(move || {
                for request in worker_server.incoming_requests() {
                    handle_request(&worker_root, request);
                }
            })
            .map_err(|e| Error::Bind(format!("failed to spawn server thread: {}", e)))?;

        log::debug!("origin server for {} listening on {}", root.display(), addr);

        Ok(Self {
            endpoint: OriginEndpoint { addr, root },
            server: Some(server),
            worker: Some(worker),
        })
    }

    pub fn endpoint(&self) -> &OriginEndpoint {
        &self.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    /// Stop serving and release the port. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        server.unblock();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("origin server thread for {} panicked", self.endpoint.addr);
            }
        }
        // Last reference: dropping it closes the listening socket.
        drop(server);
        log::debug!("origin server on {} stopped", self.endpoint.addr);
    }
}

impl Drop for OriginServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of mapping a request path onto the served root
#[derive(Debug, PartialEq)]
pub(crate) enum Resolved {
    File(PathBuf),
    NotFound,
    Forbidden,
}

/// Map a raw request target onto a file below `root` (which must be canonical).
pub(crate) fn resolve(root: &Path, raw: &str) -> Resolved {
    let Ok(base) = Url::parse(NORMALISE_BASE) else {
        return Resolved::NotFound;
    };
    // Joining resolves `.`/`..` segments; a scheme-relative target would
    // change the host, which is refused below.
    let Ok(url) = base.join(raw) else {
        return Resolved::NotFound;
    };
    if url.host_str() != base.host_str() {
        return Resolved::Forbidden;
    }

    let mut path = root.to_path_buf();
    if let Some(segments) = url.path_segments() {
        for segment in segments.filter(|s| !s.is_empty()) {
            let Ok(decoded) = percent_decode_str(segment).decode_utf8() else {
                return Resolved::NotFound;
            };
            if decoded == "."
                || decoded == ".."
                || decoded.contains(['/', '\\', '\0'])
            {
                return Resolved::Forbidden;
            }
            path.push(decoded.as_ref());
        }
    }

    if path.is_dir() {
        path.push("index.html");
    }

    // Canonicalising follows symlinks, so links pointing out of the root are caught too.
    match path.canonicalize() {
        Ok(real) if !real.starts_with(root) => Resolved::Forbidden,
        Ok(real) if real.is_file() => Resolved::File(real),
        _ => Resolved::NotFound,
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn content_type(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    }
}

fn respond_status(request: Request, status: u16, body: &str) {
    let url = request.url().to_string();
    if let Err(e) = request.respond(Response::from_string(body).with_status_code(status)) {
        log::debug!("origin failed to answer {} with {}: {}", url, status, e);
    }
}

fn handle_request(root: &Path, request: Request) {
    if !matches!(request.method(), Method::Get | Method::Head) {
        respond_status(request, 405, "Method Not Allowed");
        return;
    }

    let path = match resolve(root, request.url()) {
        Resolved::File(path) => path,
        Resolved::NotFound => {
            log::debug!("origin 404 {}", request.url());
            respond_status(request, 404, "Not Found");
            return;
        }
        Resolved::Forbidden => {
            log::warn!("origin refused path outside root: {}", request.url());
            respond_status(request, 403, "Forbidden");
            return;
        }
    };

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            log::warn!("origin failed to open {}: {}", path.display(), e);
            respond_status(request, 404, "Not Found");
            return;
        }
    };

    let mut response = Response::from_file(file);
    if let Some(h) = header("Content-Type", &content_type(&path)) {
        response = response.with_header(h);
    }
    if let Some(h) = header("Cache-Control", "no-store") {
        response = response.with_header(h);
    }
    log::debug!("origin 200 {}", request.url());
    if let Err(e) = request.respond(response) {
        log::debug!("origin failed to send {}: {}", path.display(), e);
    }
}
