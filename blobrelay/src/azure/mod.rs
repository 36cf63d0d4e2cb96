//! Azure Storage REST clients.
//!
//! Talks to the Blob and Queue services directly over HTTPS using `reqwest`,
//! authenticating with Shared Key signatures derived from the storage account
//! connection string. No vendor SDK is involved; the two operations this
//! application needs per service (container ensure + Put Blob, Get Messages +
//! Delete Message) are small enough to speak on the wire.
//!
//! Credentials come from a standard connection string of the form:
//!
//! ```text
//! DefaultEndpointsProtocol=https;AccountName=...;AccountKey=<base64>;EndpointSuffix=core.windows.net
//! ```
//!
//! Explicit `BlobEndpoint=` / `QueueEndpoint=` entries override the derived
//! endpoints (Azurite-style), which is also how the tests point the clients at
//! a local mock server.

pub mod blobs;
pub mod queues;

pub use blobs::BlobContainerClient;
pub use queues::QueueClient;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use std::sync::Arc;

/// Azure Storage REST API version sent with every request.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Encode set for blob names inside a URL path. Azure expects `/` unencoded
/// in blob paths; unreserved characters stay as-is.
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Encode set for query parameter values (pop receipts contain `+` and `=`).
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A unit of work delivered by the storage queue.
///
/// `pop_receipt` is the lease token required to delete the message; until the
/// delete happens the message stays invisible for the provider's default
/// visibility timeout and then reappears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub pop_receipt: String,
    pub content: String,
}

/// Destination for uploaded files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Make sure the target container exists. Called once at startup.
    async fn ensure_container(&self) -> anyhow::Result<()>;

    /// Store `data` under `name`, overwriting any existing object.
    async fn put_object(&self, name: &str, data: Bytes) -> anyhow::Result<()>;
}

/// Source of blob-created notifications.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Fetch up to `max_messages` leased messages in one call.
    async fn receive_messages(&self, max_messages: u32) -> anyhow::Result<Vec<QueueMessage>>;

    /// Delete a message using its id and lease token.
    async fn delete_message(&self, message_id: &str, pop_receipt: &str) -> anyhow::Result<()>;
}

/// Parsed storage account credentials plus the shared HTTP client.
///
/// Shared between the blob and queue clients; both sign requests with the
/// same account key.
#[derive(Debug)]
pub struct StorageAccount {
    client: reqwest::Client,
    account: String,
    key: Vec<u8>,
    blob_endpoint: String,
    queue_endpoint: String,
}

impl StorageAccount {
    /// Parse an Azure Storage connection string.
    ///
    /// `AccountName` and `AccountKey` are required. `EndpointSuffix` defaults
    /// to `core.windows.net`; `BlobEndpoint`/`QueueEndpoint` override the
    /// derived service URLs when present.
    pub fn from_connection_string(connection_string: &str) -> anyhow::Result<Arc<Self>> {
        let mut account: Option<String> = None;
        let mut key: Option<Vec<u8>> = None;
        let mut protocol = "https".to_string();
        let mut suffix = "core.windows.net".to_string();
        let mut blob_endpoint: Option<String> = None;
        let mut queue_endpoint: Option<String> = None;

        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            match name {
                "AccountName" => account = Some(value.to_string()),
                "AccountKey" => {
                    // AccountKey is base64 and may itself contain '=' padding;
                    // split_once above keeps everything after the first '='.
                    let decoded = BASE64_STANDARD
                        .decode(value)
                        .map_err(|e| anyhow::anyhow!("Invalid AccountKey in connection string (not valid base64): {}", e))?;
                    key = Some(decoded);
                }
                "DefaultEndpointsProtocol" => protocol = value.to_string(),
                "EndpointSuffix" => suffix = value.to_string(),
                "BlobEndpoint" => blob_endpoint = Some(value.trim_end_matches('/').to_string()),
                "QueueEndpoint" => queue_endpoint = Some(value.trim_end_matches('/').to_string()),
                _ => {}
            }
        }

        let account = account.ok_or_else(|| anyhow::anyhow!("Connection string is missing AccountName"))?;
        let key = key.ok_or_else(|| anyhow::anyhow!("Connection string is missing AccountKey"))?;

        let blob_endpoint = blob_endpoint.unwrap_or_else(|| format!("{}://{}.blob.{}", protocol, account, suffix));
        let queue_endpoint = queue_endpoint.unwrap_or_else(|| format!("{}://{}.queue.{}", protocol, account, suffix));

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Arc::new(Self {
            client,
            account,
            key,
            blob_endpoint,
            queue_endpoint,
        }))
    }

    pub fn account_name(&self) -> &str {
        &self.account
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn blob_endpoint(&self) -> &str {
        &self.blob_endpoint
    }

    pub(crate) fn queue_endpoint(&self) -> &str {
        &self.queue_endpoint
    }

    /// Current UTC time in the RFC 1123 form Azure requires for `x-ms-date`.
    pub(crate) fn rfc1123_date() -> String {
        chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    /// Sign a request with Shared Key authentication and return the
    /// `Authorization` header value (`SharedKey {account}:{signature}`).
    ///
    /// `resource_path` is the un-encoded service path (e.g. `container/name`
    /// or `queue/messages`); `query_params` must list every query parameter
    /// on the request so the canonicalized resource matches what the service
    /// recomputes.
    pub(crate) fn sign_request(
        &self,
        method: &str,
        resource_path: &str,
        content_length: Option<usize>,
        content_type: &str,
        date: &str,
        extra_headers: &[(String, String)],
        query_params: &[(String, String)],
    ) -> anyhow::Result<String> {
        let string_to_sign = self.string_to_sign(
            method,
            resource_path,
            content_length,
            content_type,
            date,
            extra_headers,
            query_params,
        );

        type HmacSha256 = Hmac<Sha256>;
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    /// Build the Shared Key string-to-sign.
    ///
    /// Format (empty lines for headers this client never sends):
    /// ```text
    /// VERB\n
    /// Content-Encoding\nContent-Language\nContent-Length\nContent-MD5\n
    /// Content-Type\nDate\nIf-Modified-Since\nIf-Match\nIf-None-Match\n
    /// If-Unmodified-Since\nRange\nCanonicalizedHeaders\nCanonicalizedResource
    /// ```
    fn string_to_sign(
        &self,
        method: &str,
        resource_path: &str,
        content_length: Option<usize>,
        content_type: &str,
        date: &str,
        extra_headers: &[(String, String)],
        query_params: &[(String, String)],
    ) -> String {
        // Content-Length is signed as empty for 0 or absent (GET/DELETE).
        let content_length_str = match content_length {
            Some(0) | None => String::new(),
            Some(len) => len.to_string(),
        };

        // Canonicalized headers: all x-ms-* headers, lowercased and sorted.
        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date.to_string()),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        for (k, v) in extra_headers {
            let lk = k.to_lowercase();
            if lk.starts_with("x-ms-") && lk != "x-ms-date" && lk != "x-ms-version" {
                ms_headers.push((lk, v.clone()));
            }
        }
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonicalized_headers: String = ms_headers
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join("\n");

        // Canonicalized resource: un-encoded path plus sorted query params.
        let mut canonicalized_resource = format!("/{}/{}", self.account, resource_path);
        if !query_params.is_empty() {
            let mut sorted_params = query_params.to_vec();
            sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
            for (k, v) in &sorted_params {
                canonicalized_resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
            }
        }

        format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}\n{}",
            method, content_length_str, content_type, canonicalized_headers, canonicalized_resource
        )
    }
}

/// Percent-encode a blob or queue path segment for use in a request URL.
pub(crate) fn encode_path(path: &str) -> String {
    percent_encoding::utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

/// Percent-encode a query parameter value.
pub(crate) fn encode_query(value: &str) -> String {
    percent_encoding::utf8_percent_encode(value, QUERY_ENCODE_SET).to_string()
}

/// Map an Azure HTTP error response to an error with context.
pub(crate) fn map_azure_error(context: &str, status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    anyhow::anyhow!("Azure {}: HTTP {} - {}", context, status, body)
}
