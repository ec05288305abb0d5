//! Core data models for the chunked upload service.
//!
//! Sessions and chunk records live in memory for the lifetime of a transfer.
//! Artifacts outlive them: they map to the `artifacts` table via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod artifact;
pub mod chunk;
pub mod session;
