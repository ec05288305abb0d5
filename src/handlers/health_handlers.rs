//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness: registry connectivity, staging disk I/O and
//!   staging headroom

use crate::services::upload_service::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness only; performs no I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 1. Pings the artifact registry.
/// 2. Writes, reads back and deletes a probe file under the storage dir.
/// 3. Reports whether the staging budget still has room.
///
/// HTTP 200 when all checks pass, 503 otherwise.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let registry_check = match service.registry().ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("error: {e}")),
    };

    let probe = service.base_path().join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&probe, b"readyz").await {
        Ok(()) => {
            let read_back = fs::read(&probe).await;
            let removed = fs::remove_file(&probe).await;
            match (read_back, removed) {
                (Ok(bytes), _) if bytes != b"readyz" => {
                    CheckStatus::failed("file content mismatch".into())
                }
                (Ok(_), Ok(())) => CheckStatus::ok(),
                (Ok(_), Err(e)) => CheckStatus {
                    ok: true,
                    error: Some(format!("could not remove probe file: {e}")),
                },
                (Err(e), _) => CheckStatus::failed(format!("could not read probe file: {e}")),
            }
        }
        Err(e) => CheckStatus::failed(format!("could not write probe file: {e}")),
    };

    let budget = service.budget();
    let staging_check = if budget.is_full() {
        CheckStatus::failed(format!(
            "staging full: {} of {} bytes used",
            budget.used(),
            budget.capacity()
        ))
    } else {
        CheckStatus::ok()
    };

    let overall_ok = registry_check.ok && disk_check.ok && staging_check.ok;
    let checks = HashMap::from([
        ("registry", registry_check),
        ("disk", disk_check),
        ("staging", staging_check),
    ]);

    let body = ReadyResponse {
        status: if overall_ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
