//! Storage-side services: staging, tracking, assembly and cleanup.

pub mod artifact_registry;
pub mod assembler;
pub mod chunk_store;
pub mod staging_budget;
pub mod staging_janitor;
pub mod transfer_tracker;
pub mod upload_service;
