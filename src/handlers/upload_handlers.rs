//! HTTP handlers for chunk submission and session management.
//!
//! Raw `PUT` bodies are streamed straight into staging. Multipart bodies are
//! buffered first, since the form fields may arrive after the chunk bytes.

use crate::{
    errors::AppError,
    models::session::TransferKind,
    services::upload_service::{ChunkAck, ChunkSubmission, UploadService},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde::Deserialize;
use std::io;

/// Query params of `PUT /uploads/{upload_id}/chunks/{index}`.
#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub total_chunks: u32,
    pub file_name: String,
    pub kind: Option<String>,
}

fn parse_kind(raw: Option<&str>) -> Result<TransferKind, AppError> {
    match raw {
        None | Some("") => Ok(TransferKind::default()),
        Some(raw) => Ok(raw.parse::<TransferKind>()?),
    }
}

/// 201 once the artifact exists, 202 while chunks are still outstanding.
fn ack_response(ack: ChunkAck) -> Response {
    let status = if ack.artifact.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(ack)).into_response()
}

/// `PUT /uploads/{upload_id}/chunks/{index}`: stream one chunk to staging.
pub async fn put_chunk(
    State(service): State<UploadService>,
    Path((upload_id, index)): Path<(String, u32)>,
    Query(q): Query<ChunkQuery>,
    body: Body,
) -> Result<Response, AppError> {
    let kind = parse_kind(q.kind.as_deref())?;
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    let ack = service
        .submit_chunk(
            ChunkSubmission {
                upload_id,
                index,
                total_chunks: q.total_chunks,
                file_name: q.file_name,
                kind,
            },
            stream,
        )
        .await?;
    Ok(ack_response(ack))
}

/// `POST /uploads/chunks`: multipart form with `uploadId`, `chunkIndex`,
/// `totalChunks`, `fileName`, `kind` and the `chunk` file part.
pub async fn post_chunk_multipart(
    State(service): State<UploadService>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut upload_id = None;
    let mut index = None;
    let mut total_chunks = None;
    let mut file_name = None;
    let mut kind = None;
    let mut chunk: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" => {
                if file_name.is_none() {
                    file_name = field.file_name().map(str::to_string);
                }
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(format!("reading chunk field: {err}")))?;
                chunk = Some(data);
            }
            "uploadId" => upload_id = Some(text(field).await?),
            "chunkIndex" => index = Some(number(&name, text(field).await?)?),
            "totalChunks" => total_chunks = Some(number(&name, text(field).await?)?),
            "fileName" => file_name = Some(text(field).await?),
            "kind" => kind = Some(text(field).await?),
            other => tracing::debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let missing = |field: &str| AppError::bad_request(format!("missing multipart field `{field}`"));
    let submission = ChunkSubmission {
        upload_id: upload_id.ok_or_else(|| missing("uploadId"))?,
        index: index.ok_or_else(|| missing("chunkIndex"))?,
        total_chunks: total_chunks.ok_or_else(|| missing("totalChunks"))?,
        file_name: file_name.ok_or_else(|| missing("fileName"))?,
        kind: parse_kind(kind.as_deref())?,
    };
    let chunk = chunk.ok_or_else(|| missing("chunk"))?;

    let ack = service
        .submit_chunk(submission, stream::iter([Ok::<_, io::Error>(chunk)]))
        .await?;
    Ok(ack_response(ack))
}

async fn text(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map(|value| value.trim().to_string())
        .map_err(|err| AppError::bad_request(format!("reading multipart field: {err}")))
}

fn number(field: &str, raw: String) -> Result<u32, AppError> {
    raw.parse().map_err(|_| {
        AppError::bad_request(format!(
            "`{field}` must be a non-negative integer, got `{raw}`"
        ))
    })
}

/// `GET /uploads/{upload_id}`: session progress.
pub async fn get_status(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let status = service.status(&upload_id).await?;
    Ok(Json(status))
}

/// `DELETE /uploads/{upload_id}`: abandon the session and free its staging.
pub async fn abandon_upload(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<StatusCode, AppError> {
    service.abandon(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
