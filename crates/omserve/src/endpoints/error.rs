use axum::Json;
use axum::http::{Error as HttpError, StatusCode};
use axum::response::{IntoResponse, Response};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

use omserve_service::caching::CacheError;
use omserve_service::service::InvalidRange;

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<CacheError> for ResponseError {
    fn from(err: CacheError) -> Self {
        let status = match err {
            CacheError::NotFound => StatusCode::NOT_FOUND,
            CacheError::ModifiedDuringRead
            | CacheError::DownloadError(_)
            | CacheError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::NotAValidFile(_) | CacheError::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            err: anyhow::Error::new(err).context("failed to read file"),
        }
    }
}

impl From<InvalidRange> for ResponseError {
    fn from(err: InvalidRange) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            err: anyhow::Error::new(err).context("invalid range header"),
        }
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((code, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status: code,
            err: anyhow::anyhow!(msg),
        }
    }
}

impl From<anyhow::Error> for ResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl From<HttpError> for ResponseError {
    fn from(err: HttpError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse { detail, causes }
    }
}
