//! Axum route handlers.
//!
//! - [`upload`]: `POST /upload` multipart ingestion plus the upload
//!   service's health route
//! - [`notifications`]: `POST /onDocumentCreated` push endpoint plus the
//!   worker's health route

pub mod notifications;
pub mod upload;
