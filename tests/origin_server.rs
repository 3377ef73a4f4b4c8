//! Integration tests for the loopback origin server

use rfcanvas::origin::OriginServer;
use std::fs;
use std::net::TcpStream;
use std::time::Duration;

fn post_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("secret.txt"), "outside").expect("write secret");
    let post = dir.path().join("post");
    fs::create_dir_all(post.join("media")).expect("media dir");
    fs::write(post.join("index.html"), "<html><body>hi</body></html>").expect("write index");
    fs::write(post.join("style.css"), "body{}").expect("write css");
    fs::write(post.join("media").join("a b.png"), [0x89, b'P', b'N', b'G']).expect("write media");
    dir
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("client")
}

#[test]
fn test_serves_post_files_with_types() {
    let tree = post_tree();
    let server = OriginServer::start(&tree.path().join("post")).expect("start");
    let base = server.endpoint().base_url().expect("base url");
    let http = client();

    let resp = http.get(base.join("index.html").unwrap()).send().expect("index");
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/html; charset=utf-8"
    );
    assert_eq!(resp.headers()["cache-control"].to_str().unwrap(), "no-store");
    assert_eq!(resp.text().unwrap(), "<html><body>hi</body></html>");

    let resp = http.get(base.join("style.css").unwrap()).send().expect("css");
    assert_eq!(resp.headers()["content-type"].to_str().unwrap(), "text/css; charset=utf-8");

    let resp = http.get(base.join("media/a%20b.png").unwrap()).send().expect("media");
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["content-type"].to_str().unwrap(), "image/png");
    assert_eq!(resp.bytes().unwrap().len(), 4);

    // Directory requests fall back to index.html
    let resp = http.get(base.clone()).send().expect("root");
    assert_eq!(resp.status().as_u16(), 200);
}

#[test]
fn test_rejects_missing_escaping_and_non_get() {
    let tree = post_tree();
    let server = OriginServer::start(&tree.path().join("post")).expect("start");
    let base = format!("http://{}", server.endpoint().addr);
    let http = client();

    let resp = http.get(format!("{}/nope.html", base)).send().expect("missing");
    assert_eq!(resp.status().as_u16(), 404);

    let resp = http.get(format!("{}/..%2fsecret.txt", base)).send().expect("escape");
    assert_eq!(resp.status().as_u16(), 403);

    let resp = http.post(format!("{}/index.html", base)).send().expect("post");
    assert_eq!(resp.status().as_u16(), 405);

    let resp = http.head(format!("{}/index.html", base)).send().expect("head");
    assert_eq!(resp.status().as_u16(), 200);
}

#[test]
fn test_drop_releases_port() {
    let tree = post_tree();
    let server = OriginServer::start(&tree.path().join("post")).expect("start");
    let addr = server.endpoint().addr;
    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);
    TcpStream::connect(addr).expect("server is listening");
    drop(server);

    let released = (0..100).any(|_| {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(50)).is_err() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
        false
    });
    assert!(released, "port {} still open after drop", addr.port());
}

#[test]
fn test_missing_root_is_an_io_error() {
    let tree = tempfile::tempdir().expect("tempdir");
    let err = OriginServer::start(&tree.path().join("absent")).err().expect("should fail");
    assert!(matches!(err, rfcanvas::Error::Io { .. }));
}
