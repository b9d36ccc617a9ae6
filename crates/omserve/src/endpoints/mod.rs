use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use omserve_service::metric;
use omserve_service::service::FileService;

mod error;
mod files;
mod metrics;

pub use error::ResponseError;

use files::serve_file;
use metrics::record_metrics;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: Arc<FileService>) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(middleware::from_fn(record_metrics));
    Router::new()
        .route("/files/{*path}", get(serve_file).head(serve_file))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use omserve_service::config::Config;
    use omserve_test::{OriginServer, Server, TempDir};
    use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
    use reqwest::{Client, StatusCode};

    use super::error::ApiErrorResponse;
    use super::*;

    async fn local_server() -> (TempDir, Server) {
        let dir = omserve_test::tempdir();
        fs::write(dir.path().join("a.om"), b"OM\x03hello world").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let config = Config {
            data_dir: dir.path().to_owned(),
            ..Default::default()
        };
        let service = FileService::create(&config).unwrap();
        let server = Server::with_router(create_app(Arc::new(service))).await;
        (dir, server)
    }

    async fn get_range(server: &Server, path: &str, range: &str) -> reqwest::Response {
        Client::new()
            .get(server.url(path))
            .header(RANGE, range)
            .send()
            .await
            .unwrap()
    }

    async fn error_body(response: reqwest::Response) -> ApiErrorResponse {
        serde_json::from_str(&response.text().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        omserve_test::setup();
        let (_dir, server) = local_server().await;

        let response = reqwest::get(server.url("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_get_file() {
        omserve_test::setup();
        let (_dir, server) = local_server().await;

        let response = reqwest::get(server.url("/files/a.om")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ACCEPT_RANGES], "bytes");
        assert_eq!(response.headers()[CONTENT_LENGTH], "14");
        assert!(response.headers().get(CONTENT_RANGE).is_none());
        assert_eq!(&response.bytes().await.unwrap()[..], b"OM\x03hello world");
    }

    #[tokio::test]
    async fn test_get_range() {
        omserve_test::setup();
        let (_dir, server) = local_server().await;

        let response = get_range(&server, "/files/a.om", "bytes=3-7").await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 3-7/14");
        assert_eq!(response.headers()[CONTENT_LENGTH], "5");
        assert_eq!(response.text().await.unwrap(), "hello");

        let response = get_range(&server, "/files/a.om", "bytes=-5").await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 9-13/14");
        assert_eq!(response.text().await.unwrap(), "world");

        let response = get_range(&server, "/files/a.om", "bytes=9-100").await;
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 9-13/14");
        assert_eq!(response.text().await.unwrap(), "world");

        let response = get_range(&server, "/files/a.om", "bytes=20-").await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */14");
    }

    #[tokio::test]
    async fn test_head_file() {
        omserve_test::setup();
        let (_dir, server) = local_server().await;
        let client = Client::new();

        let response = client.head(server.url("/files/a.om")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_LENGTH], "14");
        assert!(response.bytes().await.unwrap().is_empty());

        let response = client
            .head(server.url("/files/a.om"))
            .header(RANGE, "bytes=0-1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_LENGTH], "2");
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 0-1/14");

        let response = client.head(server.url("/files/b.om")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_file() {
        omserve_test::setup();
        let (_dir, server) = local_server().await;

        let response = reqwest::get(server.url("/files/b.om")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = reqwest::get(server.url("/files/sub/a.om")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        omserve_test::setup();
        let (_dir, server) = local_server().await;

        let response = get_range(&server, "/files/a.om", "items=0-1").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = error_body(response).await;
        assert_eq!(body.detail.as_deref(), Some("invalid range header"));

        let response = get_range(&server, "/files/a.om", "bytes=0-1,4-5").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // the encoded slash survives the client, and is decoded by the router
        let response = reqwest::get(server.url("/files/sub/..%2Fa.om")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = reqwest::get(server.url("/files/http:evil.example/x.om")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_remote_file() {
        omserve_test::setup();
        let dir = omserve_test::tempdir();
        let origin = OriginServer::new().await;
        origin.put("model/a.om", &b"OM\x03remote contents"[..], "v1");

        let config = Config {
            data_dir: dir.path().to_owned(),
            remote_url: Some(origin.url("model")),
            ..Default::default()
        };
        let service = FileService::create(&config).unwrap();
        let server = Server::with_router(create_app(Arc::new(service))).await;

        let response = get_range(&server, "/files/a.om", "bytes=3-8").await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 3-8/18");
        assert_eq!(response.text().await.unwrap(), "remote");

        let response = reqwest::get(server.url("/files/b.om")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_origin_unavailable() {
        omserve_test::setup();
        let dir = omserve_test::tempdir();

        // nothing listens on the discard port
        let config = Config {
            data_dir: dir.path().to_owned(),
            remote_url: Some("http://127.0.0.1:9/model/".parse().unwrap()),
            ..Default::default()
        };
        let service = FileService::create(&config).unwrap();
        let server = Server::with_router(create_app(Arc::new(service))).await;

        let response = reqwest::get(server.url("/files/a.om")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = error_body(response).await;
        assert_eq!(body.detail.as_deref(), Some("failed to read file"));
    }
}
