//! Serving finished artifacts. Bodies are streamed from disk, never buffered.

use crate::{errors::AppError, models::artifact::Artifact, services::upload_service::UploadService};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

/// `GET /artifacts/{kind}/{name}`
pub async fn get_artifact(
    State(service): State<UploadService>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (artifact, file) = service.open_artifact(&kind, &name).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_artifact_headers(response.headers_mut(), &artifact);
    Ok(response)
}

/// `HEAD /artifacts/{kind}/{name}`: same headers as GET but no body.
pub async fn head_artifact(
    State(service): State<UploadService>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let artifact = service.find_artifact(&kind, &name).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_artifact_headers(response.headers_mut(), &artifact);
    Ok(response)
}

fn set_artifact_headers(headers: &mut HeaderMap, artifact: &Artifact) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&artifact.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", artifact.etag)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&artifact.completed_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    // Clients save under the name they uploaded, not the uuid-prefixed one.
    let disposition = format!(
        "attachment; filename=\"{}\"",
        artifact.original_name.replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
