//! Queue client: Get Messages and Delete Message.
//!
//! The Queue service replies to Get Messages with a small XML document:
//!
//! ```text
//! <QueueMessagesList>
//!   <QueueMessage>
//!     <MessageId>...</MessageId>
//!     <PopReceipt>...</PopReceipt>
//!     <MessageText>...</MessageText>
//!     ...
//!   </QueueMessage>
//! </QueueMessagesList>
//! ```
//!
//! The handful of elements we need are extracted with plain substring
//! scanning rather than an XML crate; the document is machine-generated and
//! flat, so a full parser buys nothing here.

use super::{AZURE_API_VERSION, MessageQueue, QueueMessage, StorageAccount, encode_path, encode_query, map_azure_error};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Client for a single storage queue.
pub struct QueueClient {
    account: Arc<StorageAccount>,
    queue: String,
}

impl QueueClient {
    pub fn new(account: Arc<StorageAccount>, queue: impl Into<String>) -> Self {
        Self {
            account,
            queue: queue.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.account.queue_endpoint(), encode_path(&self.queue))
    }
}

#[async_trait]
impl MessageQueue for QueueClient {
    /// Get Messages. No explicit visibility timeout is sent; fetched
    /// messages are leased for the queue's default window.
    async fn receive_messages(&self, max_messages: u32) -> anyhow::Result<Vec<QueueMessage>> {
        let url = format!("{}?numofmessages={}", self.messages_url(), max_messages);
        let date = StorageAccount::rfc1123_date();
        let resource_path = format!("{}/messages", self.queue);
        let auth = self.account.sign_request(
            "GET",
            &resource_path,
            None,
            "",
            &date,
            &[],
            &[("numofmessages".to_string(), max_messages.to_string())],
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
            .map_err(|e| anyhow::anyhow!("Azure receive messages request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_azure_error("receive messages", status, &body));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Azure receive messages body read failed: {}", e))?;

        let messages = parse_queue_messages(&body);
        debug!(queue = %self.queue, count = messages.len(), "Fetched queue messages");
        Ok(messages)
    }

    /// Delete Message using the id and pop receipt from the fetch.
    async fn delete_message(&self, message_id: &str, pop_receipt: &str) -> anyhow::Result<()> {
        let url = format!(
            "{}/{}?popreceipt={}",
            self.messages_url(),
            encode_path(message_id),
            encode_query(pop_receipt)
        );
        let date = StorageAccount::rfc1123_date();
        let resource_path = format!("{}/messages/{}", self.queue, message_id);
        let auth = self.account.sign_request(
            "DELETE",
            &resource_path,
            None,
            "",
            &date,
            &[],
            &[("popreceipt".to_string(), pop_receipt.to_string())],
        )?;

        let resp = self
            .account
            .http()
            .delete(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure delete message request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_azure_error("delete message", status, &body));
        }

        debug!(queue = %self.queue, message_id, "Deleted queue message");
        Ok(())
    }
}

/// Parse a `QueueMessagesList` response body.
///
/// Entries missing an id or pop receipt are dropped: without both the
/// message can never be deleted, so surfacing it would only wedge the loop.
fn parse_queue_messages(body: &str) -> Vec<QueueMessage> {
    let mut messages = Vec::new();
    let mut search_from = 0;

    while let Some(start) = body[search_from..].find("<QueueMessage>") {
        let start = search_from + start;
        let Some(end) = body[start..].find("</QueueMessage>") else {
            break;
        };
        let entry = &body[start..start + end];
        search_from = start + end + "</QueueMessage>".len();

        let id = extract_element(entry, "MessageId");
        let pop_receipt = extract_element(entry, "PopReceipt");
        let content = extract_element(entry, "MessageText").unwrap_or_default();

        match (id, pop_receipt) {
            (Some(id), Some(pop_receipt)) => messages.push(QueueMessage { id, pop_receipt, content }),
            _ => debug!("Skipping queue entry without MessageId/PopReceipt"),
        }
    }

    messages
}

/// Extract the unescaped text of `<{name}>...</{name}>` from an XML fragment.
fn extract_element(xml: &str, name: &str) -> Option<String> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml_unescape(&xml[start..start + end]))
}

/// Decode the five predefined XML entities.
fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<QueueMessagesList>
  <QueueMessage>
    <MessageId>msg-1</MessageId>
    <InsertionTime>Mon, 01 Jan 2024 00:00:00 GMT</InsertionTime>
    <ExpirationTime>Mon, 08 Jan 2024 00:00:00 GMT</ExpirationTime>
    <PopReceipt>AgAAAAMAAAAAAAAA+cEB</PopReceipt>
    <TimeNextVisible>Mon, 01 Jan 2024 00:00:30 GMT</TimeNextVisible>
    <DequeueCount>1</DequeueCount>
    <MessageText>eyJzdWJqZWN0IjoiL2Jsb2JzL3gucGRmIn0=</MessageText>
  </QueueMessage>
  <QueueMessage>
    <MessageId>msg-2</MessageId>
    <PopReceipt>BQAAAA==</PopReceipt>
    <MessageText>plain &amp; &lt;unencoded&gt;</MessageText>
  </QueueMessage>
</QueueMessagesList>"#;

    #[test]
    fn parses_message_list() {
        let messages = parse_queue_messages(SAMPLE_BODY);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "msg-1");
        assert_eq!(messages[0].pop_receipt, "AgAAAAMAAAAAAAAA+cEB");
        assert_eq!(messages[0].content, "eyJzdWJqZWN0IjoiL2Jsb2JzL3gucGRmIn0=");
        assert_eq!(messages[1].content, "plain & <unencoded>");
    }

    #[test]
    fn empty_list_parses_to_no_messages() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?><QueueMessagesList></QueueMessagesList>"#;
        assert!(parse_queue_messages(body).is_empty());
    }

    #[test]
    fn entries_without_pop_receipt_are_dropped() {
        let body = "<QueueMessagesList><QueueMessage><MessageId>a</MessageId></QueueMessage></QueueMessagesList>";
        assert!(parse_queue_messages(body).is_empty());
    }

    #[test]
    fn message_without_text_gets_empty_content() {
        let body = "<QueueMessagesList><QueueMessage><MessageId>a</MessageId><PopReceipt>r</PopReceipt></QueueMessage></QueueMessagesList>";
        let messages = parse_queue_messages(body);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "");
    }

    async fn client_for(server: &MockServer) -> QueueClient {
        let key = BASE64_STANDARD.encode(b"unit-test-account-key");
        let conn = format!(
            "AccountName=testacct;AccountKey={};BlobEndpoint={};QueueEndpoint={}",
            key,
            server.uri(),
            server.uri()
        );
        let account = StorageAccount::from_connection_string(&conn).unwrap();
        QueueClient::new(account, "documentcreated")
    }

    #[tokio::test]
    async fn receive_messages_fetches_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documentcreated/messages"))
            .and(query_param("numofmessages", "10"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_BODY))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let messages = client.receive_messages(10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "msg-1");
    }

    #[tokio::test]
    async fn receive_messages_surfaces_queue_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documentcreated/messages"))
            .respond_with(ResponseTemplate::new(404).set_body_string("QueueNotFound"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.receive_messages(10).await.unwrap_err();
        assert!(format!("{err:#}").contains("QueueNotFound"));
    }

    #[tokio::test]
    async fn delete_message_sends_pop_receipt() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/documentcreated/messages/msg-1"))
            .and(query_param("popreceipt", "AgAAAA+/=="))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.delete_message("msg-1", "AgAAAA+/==").await.unwrap();
    }

    #[tokio::test]
    async fn delete_message_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/documentcreated/messages/msg-1"))
            .respond_with(ResponseTemplate::new(404).set_body_string("MessageNotFound"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.delete_message("msg-1", "r").await.unwrap_err();
        assert!(format!("{err:#}").contains("delete message"));
    }
}
