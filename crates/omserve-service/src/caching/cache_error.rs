use std::time::Duration;

use thiserror::Error;

/// An error that happens when resolving or reading an array file.
///
/// Only [`NotFound`](Self::NotFound) and [`NotAValidFile`](Self::NotAValidFile) are ever
/// folded into a cached "no value" verdict. All other variants are delivered to the caller
/// and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The file does not exist, neither locally nor on the remote origin.
    #[error("not found")]
    NotFound,
    /// The file exists, but is not a readable array file.
    ///
    /// The attached string describes what is wrong with it.
    #[error("not a valid file: {0}")]
    NotAValidFile(String),
    /// The remote file was replaced while it was being read.
    ///
    /// Reads spanning multiple blocks would otherwise mix data of two different files.
    #[error("remote file was modified during read")]
    ModifiedDuringRead,
    /// The remote origin could not be reached, or responded with an unexpected status.
    ///
    /// The attached string contains the origin's response or the transport error.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// A request to the remote origin timed out.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// An unexpected error in omserve itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    fn download_error(mut error: &dyn std::error::Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::DownloadError(error_string)
    }

    /// Whether this error means "there is no such file".
    ///
    /// These errors resolve to an absent value instead of failing the caller.
    pub fn is_absence(&self) -> bool {
        matches!(self, Self::NotFound | Self::NotAValidFile(_))
    }

    /// A short tag to attach to metrics.
    pub fn metric_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::NotAValidFile(_) => "invalid",
            Self::ModifiedDuringRead => "modified",
            Self::DownloadError(_) => "downloaderror",
            Self::Timeout(_) => "timeout",
            Self::InternalError => "internalerror",
        }
    }
}

/// Either the requested item, or the [`CacheError`] describing why it is unavailable.
pub type CacheContents<T = ()> = Result<T, CacheError>;
