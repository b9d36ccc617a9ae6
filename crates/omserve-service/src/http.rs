//! Access to the remote origin over HTTP.
//!
//! The origin is any HTTP server that answers `HEAD` requests with the size of a file, and honors
//! `Range` requests for its contents.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use reqwest::{Client, Response, StatusCode, header};
use url::Url;

use crate::caching::{CacheContents, CacheError, RemoteVersion};
use crate::config::HttpTimeouts;

const USER_AGENT: &str = concat!("omserve/", env!("CARGO_PKG_VERSION"));

/// Creates the [`Client`] used to talk to the origin.
///
/// Responses are never decompressed, as byte ranges refer to the stored representation.
fn create_client(timeouts: &HttpTimeouts) -> reqwest::Result<Client> {
    reqwest::ClientBuilder::new()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(USER_AGENT)
        .build()
}

/// A client for the remote origin.
#[derive(Clone)]
pub struct HttpOrigin {
    client: Client,
    timeouts: HttpTimeouts,
}

impl fmt::Debug for HttpOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpOrigin")
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl HttpOrigin {
    pub fn new(timeouts: HttpTimeouts) -> anyhow::Result<Self> {
        Ok(Self {
            client: create_client(&timeouts)?,
            timeouts,
        })
    }

    /// Asks the origin for the current version of the file at `url`.
    ///
    /// Returns `None` if the origin reports the file as not existing. Any other failure is an
    /// error, and says nothing about the existence of the file.
    pub async fn head(&self, url: &Url) -> CacheContents<Option<RemoteVersion>> {
        tracing::trace!("Checking remote file `{}`", url);
        let start = Instant::now();

        let response = self
            .client
            .head(url.clone())
            .timeout(self.timeouts.head)
            .send()
            .await
            .map_err(|e| self.map_error(e, self.timeouts.head))?;

        let status = response.status();
        metric!(timer("origin.head") = start.elapsed(), "status" => status.as_str());

        if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
            tracing::debug!("Remote file `{}` does not exist", url);
            return Ok(None);
        }
        if !status.is_success() {
            tracing::debug!("Unexpected status {} for `{}`", status, url);
            return Err(unexpected_status(status));
        }

        // `Response::content_length` describes the body, which is always empty for `HEAD`.
        let size = header_str(&response, header::CONTENT_LENGTH)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| CacheError::DownloadError("missing content length".into()))?;

        Ok(Some(RemoteVersion {
            size,
            last_modified: header_str(&response, header::LAST_MODIFIED).and_then(parse_http_date),
            etag: header_str(&response, header::ETAG).map(str::to_owned),
        }))
    }

    /// Fetches `range` of the file at `url`, as long as it is still at `version`.
    ///
    /// Fails with [`CacheError::ModifiedDuringRead`] if the origin serves a different version of
    /// the file, or no longer has it at all.
    pub async fn get_range(
        &self,
        url: &Url,
        version: &RemoteVersion,
        range: Range<u64>,
    ) -> CacheContents<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        tracing::trace!("Fetching bytes {:?} of `{}`", range, url);
        let start = Instant::now();

        let mut request = self
            .client
            .get(url.clone())
            .header(header::RANGE, format!("bytes={}-{}", range.start, range.end - 1));
        // weak tags cannot be used for `If-Match`
        if let Some(etag) = version.etag.as_deref().filter(|etag| !etag.starts_with("W/")) {
            request = request.header(header::IF_MATCH, etag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_error(e, self.timeouts.max_download))?;

        let status = response.status();
        metric!(timer("origin.range") = start.elapsed(), "status" => status.as_str());

        match status {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => {}
            StatusCode::PRECONDITION_FAILED
            | StatusCode::NOT_FOUND
            | StatusCode::GONE
            | StatusCode::RANGE_NOT_SATISFIABLE => {
                tracing::debug!("Remote file `{}` changed ({})", url, status);
                return Err(CacheError::ModifiedDuringRead);
            }
            _ => return Err(unexpected_status(status)),
        }

        if let (Some(expected), Some(actual)) =
            (version.etag.as_deref(), header_str(&response, header::ETAG))
        {
            if expected != actual {
                tracing::debug!("Remote file `{}` changed its etag", url);
                return Err(CacheError::ModifiedDuringRead);
            }
        }

        let content_range = if status == StatusCode::PARTIAL_CONTENT {
            let content_range: ContentRange = header_str(&response, header::CONTENT_RANGE)
                .and_then(|value| value.parse().ok())
                .ok_or_else(|| CacheError::DownloadError("invalid content range".into()))?;
            if content_range.total_size != version.size {
                tracing::debug!("Remote file `{}` changed its size", url);
                return Err(CacheError::ModifiedDuringRead);
            }
            if content_range.range() != range {
                return Err(CacheError::DownloadError(format!(
                    "requested bytes {range:?}, received {content_range}"
                )));
            }
            Some(content_range)
        } else {
            None
        };

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_error(e, self.timeouts.max_download))?;
        metric!(time_raw("origin.range.size") = body.len() as u64);

        match content_range {
            Some(_) if body.len() as u64 == range.end - range.start => Ok(body),
            Some(_) => Err(CacheError::DownloadError(format!(
                "expected {} bytes, received {}",
                range.end - range.start,
                body.len()
            ))),
            // The origin ignored the range and sent the entire file.
            None if body.len() as u64 == version.size && range.end <= version.size => {
                Ok(body.slice(range.start as usize..range.end as usize))
            }
            None => Err(CacheError::ModifiedDuringRead),
        }
    }

    fn map_error(&self, error: reqwest::Error, timeout: Duration) -> CacheError {
        if error.is_timeout() {
            CacheError::Timeout(timeout)
        } else {
            error.into()
        }
    }
}

fn unexpected_status(status: StatusCode) -> CacheError {
    let details = match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    };
    CacheError::DownloadError(details)
}

fn header_str(response: &Response, name: header::HeaderName) -> Option<&str> {
    response.headers().get(name)?.to_str().ok()
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(SystemTime::from)
}

/// A parsed `Content-Range` header of the form `bytes <start>-<end>/<size>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    /// Offset of the first returned byte.
    start: u64,
    /// Offset of the last returned byte, inclusive.
    end: u64,
    total_size: u64,
}

impl ContentRange {
    fn range(self) -> Range<u64> {
        self.start..self.end + 1
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total_size)
    }
}

impl FromStr for ContentRange {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(("bytes", s)) = s.trim().split_once(' ') else {
            return Err(());
        };
        let (range, total_size) = s.trim().split_once('/').ok_or(())?;
        let (start, end) = range.split_once('-').ok_or(())?;

        let start: u64 = start.trim().parse().map_err(|_| ())?;
        let end: u64 = end.trim().parse().map_err(|_| ())?;
        let total_size: u64 = total_size.trim().parse().map_err(|_| ())?;
        if end < start || end >= total_size {
            return Err(());
        }

        Ok(Self {
            start,
            end,
            total_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use omserve_test::OriginServer;

    use super::*;

    fn origin() -> HttpOrigin {
        HttpOrigin::new(HttpTimeouts::default()).unwrap()
    }

    fn version_of(server_version: Option<RemoteVersion>) -> RemoteVersion {
        server_version.expect("file should exist")
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            "bytes 0-9/100".parse(),
            Ok(ContentRange {
                start: 0,
                end: 9,
                total_size: 100
            })
        );
        assert_eq!(
            "bytes 0-9/100".parse::<ContentRange>().unwrap().range(),
            0..10
        );
        assert!("bytes */100".parse::<ContentRange>().is_err());
        assert!("bytes 0-9/*".parse::<ContentRange>().is_err());
        assert!("bytes 9-0/100".parse::<ContentRange>().is_err());
        assert!("items 0-9/100".parse::<ContentRange>().is_err());
    }

    #[test]
    fn test_parse_http_date() {
        let date = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(
            date.duration_since(SystemTime::UNIX_EPOCH).unwrap(),
            Duration::from_secs(784111777)
        );
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[tokio::test]
    async fn test_head() {
        omserve_test::setup();
        let server = OriginServer::new().await;
        server.put("a.om", &b"OM\x03hello world"[..], "v1");

        let version = version_of(origin().head(&server.url("a.om")).await.unwrap());
        assert_eq!(version.size, 14);
        assert_eq!(version.etag.as_deref(), Some("\"v1\""));
        assert!(version.last_modified.is_some());

        assert_eq!(origin().head(&server.url("missing.om")).await, Ok(None));
    }

    #[tokio::test]
    async fn test_get_range() {
        omserve_test::setup();
        let server = OriginServer::new().await;
        server.put("a.om", &b"OM\x03hello world"[..], "v1");
        let origin = origin();
        let url = server.url("a.om");

        let version = version_of(origin.head(&url).await.unwrap());
        let bytes = origin.get_range(&url, &version, 3..8).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(server.gets(), 1);

        assert_eq!(origin.get_range(&url, &version, 5..5).await, Ok(Bytes::new()));
        assert_eq!(server.gets(), 1);
    }

    #[tokio::test]
    async fn test_get_range_modified() {
        omserve_test::setup();
        let server = OriginServer::new().await;
        server.put("a.om", &b"OM\x03hello world"[..], "v1");
        let origin = origin();
        let url = server.url("a.om");

        let version = version_of(origin.head(&url).await.unwrap());
        server.put("a.om", &b"OM\x03goodbye world"[..], "v2");
        assert_eq!(
            origin.get_range(&url, &version, 3..8).await,
            Err(CacheError::ModifiedDuringRead)
        );

        server.remove("a.om");
        assert_eq!(
            origin.get_range(&url, &version, 3..8).await,
            Err(CacheError::ModifiedDuringRead)
        );
    }

    #[tokio::test]
    async fn test_head_timeout() {
        omserve_test::setup();
        let server = OriginServer::new().await;
        server.put("a.om", &b"OM\x03hello world"[..], "v1");
        server.set_delay(Duration::from_millis(500));

        let timeouts = HttpTimeouts {
            head: Duration::from_millis(50),
            ..Default::default()
        };
        let origin = HttpOrigin::new(timeouts).unwrap();
        assert_eq!(
            origin.head(&server.url("a.om")).await,
            Err(CacheError::Timeout(Duration::from_millis(50)))
        );
    }

    #[tokio::test]
    async fn test_unreachable_origin() {
        omserve_test::setup();
        // nothing listens on the discard port
        let url = Url::parse("http://127.0.0.1:9/a.om").unwrap();
        let result = origin().head(&url).await;
        assert!(matches!(result, Err(CacheError::DownloadError(_))));
    }
}
