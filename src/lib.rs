//! Chunked upload ingestion: clients send a file as numbered chunks, in any
//! order and with retries; once every index has arrived the chunks are
//! assembled into one artifact and handed to the artifact registry.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::upload_service::UploadService;

/// Room for multipart boundaries and the small text fields next to a chunk.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the application router around `service`.
pub fn app(service: UploadService) -> Router {
    let body_limit = usize::try_from(service.limits().max_chunk_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);
    routes::routes::routes(body_limit).with_state(service)
}
