//! Multipart file upload into blob storage.
//!
//! `POST /upload` accepts a `multipart/form-data` body with a `file` field,
//! writes the file to the local uploads directory, then uploads it to the
//! configured blob container (overwriting any existing blob of the same
//! name). The local copy is a scratch artifact and is kept after the upload.

use crate::AppState;
use crate::errors::{Error, Result};
use axum::extract::{Multipart, State};
use bytes::Bytes;
use tracing::info;

/// Health check for the upload service.
pub async fn health() -> &'static str {
    "Upload service is running!"
}

/// Handle `POST /upload`.
///
/// Request validation happens before any storage call: a missing `file`
/// field is `400 No file part`, a file field with an empty filename is
/// `400 No selected file`. Storage failures surface as 500 with the error
/// text in the body.
pub async fn upload_file(State(state): State<AppState>, mut multipart: Multipart) -> Result<String> {
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| Error::BadRequest {
        message: format!("Failed to parse multipart data: {}", e),
    })? {
        if field.name() != Some("file") {
            // Ignore unknown fields
            continue;
        }

        let filename = field.file_name().unwrap_or("").to_string();
        if filename.is_empty() {
            return Err(Error::BadRequest {
                message: "No selected file".to_string(),
            });
        }

        let data = field.bytes().await.map_err(|e| Error::BadRequest {
            message: format!("Failed to read file data: {}", e),
        })?;
        file = Some((filename, data));
    }

    let Some((filename, data)) = file else {
        return Err(Error::BadRequest {
            message: "No file part".to_string(),
        });
    };

    info!(filename, size = data.len(), "Received file upload");

    // Local scratch copy first, then the blob upload reads it back. Keeps
    // the on-disk file authoritative for what was sent to storage.
    let local_path = state.config.uploads_dir.join(&filename);
    tokio::fs::write(&local_path, &data)
        .await
        .map_err(|e| Error::Storage(anyhow::Error::new(e).context("Error uploading to Azure")))?;

    let contents = tokio::fs::read(&local_path)
        .await
        .map_err(|e| Error::Storage(anyhow::Error::new(e).context("Error uploading to Azure")))?;

    state
        .store
        .put_object(&filename, Bytes::from(contents))
        .await
        .map_err(|e| Error::Storage(e.context("Error uploading to Azure")))?;

    info!(filename, "File uploaded to blob storage");
    Ok(format!("File '{}' uploaded to Azure Blob Storage successfully!", filename))
}
