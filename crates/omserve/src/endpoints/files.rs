use std::ops::Range;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, Response, StatusCode, header};

use omserve_service::files::DataFileKey;
use omserve_service::service::{ByteRange, FileService, FileSlice, ReadOutcome};

use super::ResponseError;

fn requested_range(headers: &HeaderMap) -> Result<ByteRange, ResponseError> {
    match headers.get(header::RANGE) {
        None => Ok(ByteRange::Full),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| (StatusCode::BAD_REQUEST, "range header is not valid ASCII"))?;
            Ok(value.parse()?)
        }
    }
}

fn content_range(range: &Range<u64>, total: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end - 1, total)
}

fn not_found() -> Result<Response<Body>, ResponseError> {
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())?)
}

fn unsatisfiable(total: u64) -> Result<Response<Body>, ResponseError> {
    Ok(Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::CONTENT_RANGE, format!("bytes */{total}"))
        .header(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"))
        .body(Body::empty())?)
}

fn slice_response(
    range: &Range<u64>,
    total: u64,
    partial: bool,
    body: Body,
) -> Result<Response<Body>, ResponseError> {
    let mut response = Response::builder()
        .header(header::CONTENT_LENGTH, range.end - range.start)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    response = if partial {
        response
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, content_range(range, total))
    } else {
        response.status(StatusCode::OK)
    };

    Ok(response.body(body)?)
}

/// Answers `HEAD` requests from the file size, without reading any contents.
async fn head_file(
    service: &FileService,
    key: &DataFileKey,
    range: ByteRange,
) -> Result<Response<Body>, ResponseError> {
    let Some(total) = service.stat(key).await? else {
        return not_found();
    };
    match range.resolve(total) {
        Some(resolved) => slice_response(&resolved, total, range != ByteRange::Full, Body::empty()),
        None => unsatisfiable(total),
    }
}

pub async fn serve_file(
    State(service): State<Arc<FileService>>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response<Body>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /files"));
    });

    let range = requested_range(&headers)?;
    let key = service
        .key(&path)
        .ok_or((StatusCode::BAD_REQUEST, "invalid file path"))?;

    if method == Method::HEAD {
        return head_file(&service, &key, range).await;
    }

    tracing::trace!(path = key.path(), ?range, "Reading file");
    match service.read(&key, range).await? {
        ReadOutcome::Missing => not_found(),
        ReadOutcome::Unsatisfiable { total } => unsatisfiable(total),
        ReadOutcome::Slice(FileSlice {
            total,
            range,
            data,
            partial,
        }) => slice_response(&range, total, partial, Body::from(data)),
    }
}
