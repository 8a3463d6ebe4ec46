//! Bundle transfer endpoint: serves one bundle file over plain HTTP to peer nodes.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Router answering every path with the bundle file.
pub fn router(bundle_file: PathBuf) -> Router {
    Router::new()
        .fallback(serve_bundle)
        .with_state(Arc::new(bundle_file))
}

async fn serve_bundle(State(bundle_file): State<Arc<PathBuf>>, method: Method) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let file = match tokio::fs::File::open(bundle_file.as_path()).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %bundle_file.display(), "Bundle file not present");
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            warn!(path = %bundle_file.display(), "Failed to open bundle file: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let length = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            warn!(path = %bundle_file.display(), "Failed to stat bundle file: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_LENGTH, length.to_string()),
    ];
    if method == Method::HEAD {
        return (StatusCode::OK, headers).into_response();
    }
    let body = Body::from_stream(ReaderStream::new(file));
    (StatusCode::OK, headers, body).into_response()
}

/// Serve the bundle until `shutdown` is cancelled.
pub async fn serve(port: u16, bundle_file: PathBuf, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(path = %bundle_file.display(), "Bundle server listening on port {}", port);
    axum::serve(listener, router(bundle_file))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn call(router: Router, method: Method, path: &str) -> Response {
        router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_streams_file_on_any_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar");
        std::fs::write(&path, b"bundle-bytes").unwrap();

        for uri in ["/", "/bundle", "/any/other/path"] {
            let response = call(router(path.clone()), Method::GET, uri).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[header::CONTENT_LENGTH], "12");
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"bundle-bytes");
        }
    }

    #[tokio::test]
    async fn test_head_has_length_and_no_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar");
        std::fs::write(&path, b"bundle-bytes").unwrap();

        let response = call(router(path), Method::HEAD, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "12");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let response = call(router(dir.path().join("absent.tar")), Method::HEAD, "/").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_follows_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar");
        let app = router(path.clone());

        let response = call(app.clone(), Method::GET, "/bundle.tar").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let data: Vec<u8> = (0..=255u8).cycle().take(64 * 1024 + 7).collect();
        std::fs::write(&path, &data).unwrap();

        let response = call(app, Method::GET, "/bundle.tar").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], &data[..]);
    }

    #[tokio::test]
    async fn test_other_methods_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar");
        std::fs::write(&path, b"x").unwrap();
        let response = call(router(path), Method::POST, "/").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
