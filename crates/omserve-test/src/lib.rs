//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function
//!    (e.g. `let dir = omserve_test::tempdir()`).
//!
//!  - When using [`Server`] or [`OriginServer`], hold on to the server until all requests have
//!    been made. The server stops serving when it is dropped.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the omserve crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("omserve=trace,omserve_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

#[derive(Debug, Clone)]
struct OriginFile {
    data: Bytes,
    etag: String,
    last_modified: SystemTime,
}

#[derive(Debug, Default)]
struct OriginState {
    files: Mutex<BTreeMap<String, OriginFile>>,
    delay: Mutex<Duration>,
    heads: AtomicUsize,
    gets: AtomicUsize,
}

/// A web server running a [`Router`] on a random port on localhost.
///
/// Requires a `tokio` runtime. The server stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    pub async fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.socket, path).parse().unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An HTTP origin serving mutable in-memory files.
///
/// Files are served with `ETag` and `Last-Modified` headers, and support single `Range`
/// requests as well as `If-Match`.
#[derive(Debug)]
pub struct OriginServer {
    server: Server,
    state: Arc<OriginState>,
}

impl OriginServer {
    pub async fn new() -> Self {
        let state = Arc::new(OriginState::default());
        // `get` routes also answer `HEAD` requests, without the body
        let router = Router::new()
            .route("/{*path}", get(serve_file))
            .with_state(Arc::clone(&state));

        Self {
            server: Server::with_router(router).await,
            state,
        }
    }

    /// Creates or replaces the file at `path`, served with the quoted `etag`.
    pub fn put(&self, path: &str, data: impl Into<Bytes>, etag: &str) {
        self.put_modified(path, data, etag, SystemTime::now());
    }

    /// Like [`put`](Self::put), with an explicit modification time.
    pub fn put_modified(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        etag: &str,
        last_modified: SystemTime,
    ) {
        let file = OriginFile {
            data: data.into(),
            etag: format!("\"{etag}\""),
            last_modified,
        };
        let path = path.trim_start_matches('/').to_owned();
        self.state.files.lock().unwrap().insert(path, file);
    }

    pub fn remove(&self, path: &str) {
        let path = path.trim_start_matches('/');
        self.state.files.lock().unwrap().remove(path);
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.server.addr()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// Returns the root URL of the server, with a trailing slash.
    pub fn base_url(&self) -> Url {
        self.url("")
    }

    /// The number of `HEAD` requests received so far.
    pub fn heads(&self) -> usize {
        self.state.heads.load(Ordering::SeqCst)
    }

    /// The number of `GET` requests received so far.
    pub fn gets(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }
}

/// Parses a `bytes=<start>-[<end>]` range header.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

async fn serve_file(
    State(state): State<Arc<OriginState>>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    if method == Method::HEAD {
        state.heads.fetch_add(1, Ordering::SeqCst);
    } else {
        state.gets.fetch_add(1, Ordering::SeqCst);
    }

    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let Some(file) = state.files.lock().unwrap().get(&path).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(if_match) = headers.get(header::IF_MATCH) {
        if if_match.as_bytes() != file.etag.as_bytes() && if_match.as_bytes() != b"*" {
            return StatusCode::PRECONDITION_FAILED.into_response();
        }
    }

    let mut response_headers = HeaderMap::new();
    if let Ok(etag) = HeaderValue::from_str(&file.etag) {
        response_headers.insert(header::ETAG, etag);
    }
    if let Ok(modified) = HeaderValue::from_str(&http_date(file.last_modified)) {
        response_headers.insert(header::LAST_MODIFIED, modified);
    }
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let len = file.data.len() as u64;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(parse_range);

    match range {
        None => (StatusCode::OK, response_headers, file.data).into_response(),
        Some(Some((start, end))) if start < len && end.is_none_or(|end| start <= end) => {
            let end = end.map_or(len - 1, |end| end.min(len - 1));
            let content_range = format!("bytes {start}-{end}/{len}");
            if let Ok(content_range) = HeaderValue::from_str(&content_range) {
                response_headers.insert(header::CONTENT_RANGE, content_range);
            }
            let body = file.data.slice(start as usize..end as usize + 1);
            (StatusCode::PARTIAL_CONTENT, response_headers, body).into_response()
        }
        Some(_) => {
            if let Ok(content_range) = HeaderValue::from_str(&format!("bytes */{len}")) {
                response_headers.insert(header::CONTENT_RANGE, content_range);
            }
            (StatusCode::RANGE_NOT_SATISFIABLE, response_headers).into_response()
        }
    }
}
