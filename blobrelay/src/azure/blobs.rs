//! Blob container client: container bootstrap and Put Blob uploads.

use super::{AZURE_API_VERSION, ObjectStore, StorageAccount, encode_path, map_azure_error};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Client for a single blob container.
///
/// Covers exactly what the upload service needs: an existence check, a create
/// call for first boot, and unconditional Put Blob uploads (Put Blob always
/// replaces an existing blob of the same name, which gives the
/// overwrite-on-collision semantics the upload endpoint promises).
pub struct BlobContainerClient {
    account: Arc<StorageAccount>,
    container: String,
}

impl BlobContainerClient {
    pub fn new(account: Arc<StorageAccount>, container: impl Into<String>) -> Self {
        Self {
            account,
            container: container.into(),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    fn container_url(&self) -> String {
        format!("{}/{}", self.account.blob_endpoint(), encode_path(&self.container))
    }

    fn blob_url(&self, blob_name: &str) -> String {
        format!("{}/{}", self.container_url(), encode_path(blob_name))
    }

    /// Fetch container properties (GET `?restype=container`).
    ///
    /// Used purely as an existence probe at startup.
    pub async fn get_container_properties(&self) -> anyhow::Result<()> {
        let url = format!("{}?restype=container", self.container_url());
        let date = StorageAccount::rfc1123_date();
        let auth = self.account.sign_request(
            "GET",
            &self.container,
            None,
            "",
            &date,
            &[],
            &[("restype".to_string(), "container".to_string())],
        )?;

        let resp = self
            .account
            .http()
            .get(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure container properties request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_azure_error("container properties", status, &body));
        }

        Ok(())
    }

    /// Create the container (PUT `?restype=container`).
    pub async fn create_container(&self) -> anyhow::Result<()> {
        let url = format!("{}?restype=container", self.container_url());
        let date = StorageAccount::rfc1123_date();
        let auth = self.account.sign_request(
            "PUT",
            &self.container,
            None,
            "",
            &date,
            &[],
            &[("restype".to_string(), "container".to_string())],
        )?;

        let resp = self
            .account
            .http()
            .put(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure create container request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_azure_error("create container", status, &body));
        }

        info!(container = %self.container, "Created blob container");
        Ok(())
    }

    /// Upload a blob (Put Blob), overwriting any existing object of that name.
    pub async fn put_blob(&self, blob_name: &str, data: Bytes) -> anyhow::Result<()> {
        let url = self.blob_url(blob_name);
        let date = StorageAccount::rfc1123_date();
        let content_type = "application/octet-stream";
        let resource_path = format!("{}/{}", self.container, blob_name);

        let auth = self.account.sign_request(
            "PUT",
            &resource_path,
            Some(data.len()),
            content_type,
            &date,
            &[("x-ms-blob-type".to_string(), "BlockBlob".to_string())],
            &[],
        )?;

        let resp = self
            .account
            .http()
            .put(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", content_type)
            .header("Authorization", auth)
            .body(data)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure upload request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_azure_error("upload", status, &body));
        }

        debug!(blob_name, "Blob uploaded");
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for BlobContainerClient {
    /// Probe the container, and create it on any failure.
    ///
    /// Single attempt, no retry, no synchronization against concurrent
    /// starters; a race between two booting instances resolves at the
    /// create call.
    async fn ensure_container(&self) -> anyhow::Result<()> {
        match self.get_container_properties().await {
            Ok(()) => {
                debug!(container = %self.container, "Blob container already exists");
                Ok(())
            }
            Err(e) => {
                warn!(container = %self.container, "Container properties check failed ({e:#}), attempting to create");
                self.create_container().await
            }
        }
    }

    async fn put_object(&self, name: &str, data: Bytes) -> anyhow::Result<()> {
        self.put_blob(name, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> BlobContainerClient {
        let key = BASE64_STANDARD.encode(b"unit-test-account-key");
        let conn = format!(
            "AccountName=testacct;AccountKey={};BlobEndpoint={};QueueEndpoint={}",
            key,
            server.uri(),
            server.uri()
        );
        let account = StorageAccount::from_connection_string(&conn).unwrap();
        BlobContainerClient::new(account, "docs")
    }

    #[tokio::test]
    async fn put_blob_sends_signed_block_blob_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/docs/report.pdf"))
            .and(wiremock::matchers::header("x-ms-blob-type", "BlockBlob"))
            .and(header_exists("authorization"))
            .and(header_exists("x-ms-date"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.put_blob("report.pdf", Bytes::from_static(b"pdf bytes")).await.unwrap();
    }

    #[tokio::test]
    async fn put_blob_surfaces_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/docs/report.pdf"))
            .respond_with(ResponseTemplate::new(403).set_body_string("AuthenticationFailed"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.put_blob("report.pdf", Bytes::from_static(b"x")).await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("403"));
        assert!(msg.contains("AuthenticationFailed"));
    }

    #[tokio::test]
    async fn ensure_container_creates_when_probe_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs"))
            .and(query_param("restype", "container"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/docs"))
            .and(query_param("restype", "container"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.ensure_container().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_container_skips_create_when_container_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs"))
            .and(query_param("restype", "container"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/docs"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.ensure_container().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_container_propagates_create_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/docs"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.ensure_container().await.unwrap_err();
        assert!(format!("{err:#}").contains("create container"));
    }

    #[tokio::test]
    async fn blob_names_with_spaces_are_percent_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/docs/my%20report.pdf"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.put_blob("my report.pdf", Bytes::from_static(b"x")).await.unwrap();
    }
}
