//! Azure Storage upload and notification services.
//!
//! Two binaries share this crate:
//!
//! - **`blobrelay-upload`**: an HTTP service that accepts multipart file
//!   uploads, stages them in a local directory, and writes them to an Azure
//!   blob container. The container is created at startup if it does not
//!   exist.
//! - **`blobrelay-worker`**: drains a storage queue of blob-created
//!   notifications, logging each event and deleting the message. It also
//!   exposes an HTTP push endpoint (`POST /onDocumentCreated`) for
//!   deployments that deliver events over HTTP instead of a queue.
//!
//! Azure access goes through the [`azure::ObjectStore`] and
//! [`azure::MessageQueue`] traits; the REST clients in [`azure`] implement
//! them against the Blob and Queue services with SharedKey auth, and tests
//! substitute in-memory mocks.
//!
//! # Quick Start
//!
//! ```ignore
//! let args = blobrelay::config::Args::parse();
//! let config = blobrelay::Config::load(&args)?;
//! blobrelay::UploadService::new(config).await?.serve(shutdown_signal()).await
//! ```

use crate::azure::blobs::BlobContainerClient;
use crate::azure::queues::QueueClient;
use crate::azure::{MessageQueue, ObjectStore, StorageAccount};
use crate::worker::QueuePoller;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use bon::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

pub mod api;
pub mod azure;
pub mod config;
pub mod errors;
pub mod telemetry;
pub mod worker;

pub use config::Config;
pub use errors::Error;

/// Shared state for the upload service's HTTP handlers.
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ObjectStore>,
}

/// Build the upload service router.
pub fn build_upload_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::handlers::upload::health))
        // Uploads are buffered in memory; no axum-level size cap, matching
        // a reverse-proxy-fronted deployment.
        .route("/upload", post(api::handlers::upload::upload_file).layer(DefaultBodyLimit::disable()))
        .with_state(state)
        .layer(trace_layer())
}

/// Build the notification worker's router (health + push endpoint).
pub fn build_worker_router() -> Router {
    Router::new()
        .route("/", get(api::handlers::notifications::health))
        .route("/onDocumentCreated", post(api::handlers::notifications::on_document_created))
        .layer(trace_layer())
}

fn trace_layer() -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
}

/// The upload service: HTTP server plus its blob container dependency.
///
/// Lifecycle: [`new`](UploadService::new) connects to storage, ensures the
/// target container exists and creates the uploads directory;
/// [`serve`](UploadService::serve) runs the HTTP server until the shutdown
/// future resolves.
pub struct UploadService {
    router: Router,
    config: Config,
}

impl UploadService {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let connection_string = config
            .connection_string
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("AZURE_STORAGE_CONNECTION_STRING is not set"))?;
        let container_name = config
            .container_name
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("CONTAINER_NAME is not set"))?;

        let account = StorageAccount::from_connection_string(connection_string)?;
        let container = BlobContainerClient::new(account, container_name);

        // One-time probe-or-create; handlers assume the container exists.
        container.ensure_container().await?;

        tokio::fs::create_dir_all(&config.uploads_dir).await?;

        let state = AppState::builder()
            .config(config.clone())
            .store(Arc::new(container) as Arc<dyn ObjectStore>)
            .build();
        let router = build_upload_router(state);

        Ok(Self { router, config })
    }

    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("Upload service listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

/// The notification worker: queue poll loop plus a small HTTP surface.
///
/// Without a connection string the worker still serves its HTTP routes (so
/// push-delivered events keep working) but never starts the poll loop.
pub struct NotificationService {
    router: Router,
    config: Config,
    poller: Option<Arc<QueuePoller>>,
}

impl NotificationService {
    pub fn new(config: Config) -> Self {
        let poller = match config.connection_string.as_deref() {
            Some(connection_string) => match StorageAccount::from_connection_string(connection_string) {
                Ok(account) => {
                    let queue = QueueClient::new(account, config.queue_name.clone());
                    Some(QueuePoller::new(Arc::new(queue) as Arc<dyn MessageQueue>, config.worker.clone()))
                }
                Err(e) => {
                    error!("Invalid storage connection string, queue polling disabled: {e:#}");
                    None
                }
            },
            None => {
                error!("AZURE_STORAGE_CONNECTION_STRING is not set, queue polling disabled");
                None
            }
        };

        Self {
            router: build_worker_router(),
            config,
            poller,
        }
    }

    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let poller_handle = self
            .poller
            .as_ref()
            .and_then(|poller| poller.spawn(shutdown_token.clone()));

        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("Notification worker listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // Stop the poll loop and wait for the in-flight batch to finish.
        shutdown_token.cancel();
        if let Some(handle) = poller_handle
            && let Err(e) = handle.await
        {
            warn!("Queue poller task panicked: {e}");
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
