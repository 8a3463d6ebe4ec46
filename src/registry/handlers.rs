//! Registry v2 HTTP API over [`Storage`].

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::storage::{Digest, Storage, valid_repository};

const MANIFESTS_SEGMENT: &str = "/manifests/";
const BLOBS_SEGMENT: &str = "/blobs/";
const TAGS_LIST_SUFFIX: &str = "/tags/list";
const CATALOG_LIMIT: usize = 100;
const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const DEFAULT_MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const OCI_MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX_TYPE: &str = "application/vnd.oci.image.index.v1+json";

pub fn router(storage: Storage) -> Router {
    Router::new()
        .route(
            "/v2/",
            get(api_version).head(api_version).fallback(unsupported),
        )
        .route("/v2/_catalog", get(catalog).fallback(unsupported))
        .route(
            "/v2/{*path}",
            get(dispatch).head(dispatch).fallback(unsupported),
        )
        .with_state(Arc::new(storage))
}

fn registry_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "errors": [{ "code": code, "message": message }] })),
    )
        .into_response()
}

async fn unsupported() -> Response {
    registry_error(
        StatusCode::METHOD_NOT_ALLOWED,
        "UNSUPPORTED",
        "the registry is read-only",
    )
}

async fn api_version() -> Response {
    (
        StatusCode::OK,
        [(API_VERSION_HEADER, "registry/2.0")],
        Json(json!({})),
    )
        .into_response()
}

async fn catalog(State(storage): State<Arc<Storage>>) -> Response {
    match storage.repositories(CATALOG_LIMIT).await {
        Ok(repositories) => Json(json!({ "repositories": repositories })).into_response(),
        Err(e) => internal(&e),
    }
}

fn internal(err: &crate::error::KbuError) -> Response {
    warn!("Registry storage error: {}", err);
    registry_error(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", &err.to_string())
}

/// Split `<name>/manifests/<ref>`, `<name>/blobs/<digest>` and `<name>/tags/list`.
async fn dispatch(
    State(storage): State<Arc<Storage>>,
    method: Method,
    Path(path): Path<String>,
) -> Response {
    debug!(%method, %path, "Registry request");
    if let Some(name) = path.strip_suffix(TAGS_LIST_SUFFIX) {
        return tags_list(&storage, name).await;
    }
    if let Some(idx) = path.rfind(MANIFESTS_SEGMENT) {
        let (name, reference) = (&path[..idx], &path[idx + MANIFESTS_SEGMENT.len()..]);
        return manifest(&storage, &method, name, reference).await;
    }
    if let Some(idx) = path.rfind(BLOBS_SEGMENT) {
        let (name, digest) = (&path[..idx], &path[idx + BLOBS_SEGMENT.len()..]);
        return blob(&storage, &method, name, digest).await;
    }
    registry_error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "unknown endpoint")
}

async fn tags_list(storage: &Storage, name: &str) -> Response {
    if !valid_repository(name) {
        return registry_error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "repository name not known");
    }
    match storage.tags(name).await {
        Ok(Some(tags)) => Json(json!({ "name": name, "tags": tags })).into_response(),
        Ok(None) => {
            registry_error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "repository name not known")
        }
        Err(e) => internal(&e),
    }
}

async fn manifest(storage: &Storage, method: &Method, name: &str, reference: &str) -> Response {
    if !valid_repository(name) {
        return registry_error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "repository name not known");
    }
    let digest = match storage.resolve_manifest(name, reference).await {
        Ok(Some(digest)) => digest,
        Ok(None) => {
            return registry_error(
                StatusCode::NOT_FOUND,
                "MANIFEST_UNKNOWN",
                "manifest unknown",
            );
        }
        Err(e) => return internal(&e),
    };

    let path = storage.blob_path(&digest);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %path.display(), "Manifest blob unreadable: {}", e);
            return registry_error(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", "manifest unknown");
        }
    };
    let media_type = manifest_media_type(&data);
    let headers = [
        (header::CONTENT_TYPE, media_type),
        (header::CONTENT_LENGTH, data.len().to_string()),
        (
            header::HeaderName::from_static("docker-content-digest"),
            digest.to_string(),
        ),
    ];
    if method == Method::HEAD {
        return (StatusCode::OK, headers).into_response();
    }
    (StatusCode::OK, headers, data).into_response()
}

/// `mediaType` field of the manifest, otherwise guessed from its shape.
fn manifest_media_type(data: &[u8]) -> String {
    let Ok(manifest) = serde_json::from_slice::<serde_json::Value>(data) else {
        return DEFAULT_MANIFEST_TYPE.to_string();
    };
    if let Some(media_type) = manifest.get("mediaType").and_then(|v| v.as_str()) {
        return media_type.to_string();
    }
    let media_type = if manifest.get("manifests").is_some() {
        OCI_INDEX_TYPE
    } else if manifest.get("config").is_some() && manifest.get("layers").is_some() {
        OCI_MANIFEST_TYPE
    } else {
        DEFAULT_MANIFEST_TYPE
    };
    media_type.to_string()
}

async fn blob(storage: &Storage, method: &Method, name: &str, digest: &str) -> Response {
    if !valid_repository(name) {
        return registry_error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "repository name not known");
    }
    let Some(digest) = Digest::parse(digest) else {
        return registry_error(StatusCode::BAD_REQUEST, "DIGEST_INVALID", "invalid digest");
    };
    if !storage.has_blob(name, &digest).await {
        return registry_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", "blob unknown to registry");
    }

    let path = storage.blob_path(&digest);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => {
            return registry_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", "blob unknown to registry");
        }
    };
    let length = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(e) => return internal(&crate::error::KbuError::io(path.display().to_string(), e)),
    };

    let mut response = if method == Method::HEAD {
        StatusCode::OK.into_response()
    } else {
        Response::new(Body::from_stream(ReaderStream::new(file)))
    };
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&digest.to_string()) {
        headers.insert(DOCKER_CONTENT_DIGEST, value);
    }
    response
}
