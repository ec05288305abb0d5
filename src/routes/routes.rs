//! Defines routes for chunk ingestion and artifact retrieval.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `PUT    /uploads/{upload_id}/chunks/{index}`: raw chunk body
//!   - `POST   /uploads/chunks`: multipart chunk
//!   - `GET    /uploads/{upload_id}`: session status
//!   - `DELETE /uploads/{upload_id}`: abandon session
//!
//! - **Artifact endpoints**
//!   - `GET    /artifacts/{kind}/{name}`: download artifact
//!   - `HEAD   /artifacts/{kind}/{name}`: headers only

use crate::{
    handlers::{
        artifact_handlers::{get_artifact, head_artifact},
        health_handlers::{healthz, readyz},
        upload_handlers::{abandon_upload, get_status, post_chunk_multipart, put_chunk},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router. `body_limit` caps buffered (multipart) request bodies;
/// raw chunk bodies are capped while streaming.
pub fn routes(body_limit: usize) -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload routes
        .route("/uploads/chunks", post(post_chunk_multipart))
        .route("/uploads/{upload_id}", get(get_status).delete(abandon_upload))
        .route("/uploads/{upload_id}/chunks/{index}", put(put_chunk))
        // Artifact routes
        .route("/artifacts/{kind}/{name}", get(get_artifact).head(head_artifact))
        .layer(DefaultBodyLimit::max(body_limit))
}
