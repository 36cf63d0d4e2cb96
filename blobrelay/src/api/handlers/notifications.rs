//! Push-delivered blob-created notifications.
//!
//! Some deployments deliver events over HTTP instead of a storage queue.
//! `POST /onDocumentCreated` accepts the raw event body, logs it, and
//! acknowledges with a small JSON status. The body arrives already decoded,
//! so unlike the queue path there is no base64 step here.

use axum::Json;
use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::{error, info};

/// Health check for the notification worker.
pub async fn health() -> &'static str {
    "Background service is running!"
}

/// Handle `POST /onDocumentCreated`.
///
/// Any JSON body is accepted and echoed to stdout; a body that is not JSON
/// is a 500 with the parse error. Stricter than the queue path, which
/// tolerates unparseable content: here the sender is still on the line, so
/// the failure can be reported instead of swallowed.
pub async fn on_document_created(body: Bytes) -> (StatusCode, Json<Value>) {
    match serde_json::from_slice::<Value>(&body) {
        Ok(event) => {
            info!("Received push notification");
            println!("Received event: {}", serde_json::to_string_pretty(&event).unwrap_or_default());
            (StatusCode::OK, Json(json!({"status": "processed"})))
        }
        Err(e) => {
            error!("Error processing push notification: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::{get, post};
    use axum_test::TestServer;

    fn test_server() -> TestServer {
        let router = Router::new()
            .route("/", get(health))
            .route("/onDocumentCreated", post(on_document_created));
        TestServer::new(router).unwrap()
    }

    #[tokio::test]
    async fn valid_event_is_processed() {
        let server = test_server();
        let response = server
            .post("/onDocumentCreated")
            .json(&serde_json::json!({
                "subject": "/blobServices/default/containers/docs/blobs/report.pdf"
            }))
            .await;

        response.assert_status_ok();
        response.assert_json(&serde_json::json!({"status": "processed"}));
    }

    #[tokio::test]
    async fn non_json_body_is_500_with_error() {
        let server = test_server();
        let response = server.post("/onDocumentCreated").text("not json").await;

        response.assert_status_internal_server_error();
        let body: serde_json::Value = response.json();
        assert!(body.get("error").and_then(|e| e.as_str()).is_some());
    }

    #[tokio::test]
    async fn health_route_reports_running() {
        let server = test_server();
        let response = server.get("/").await;
        response.assert_status_ok();
        response.assert_text("Background service is running!");
    }
}
