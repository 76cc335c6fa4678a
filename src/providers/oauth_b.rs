use crate::models::{
    AttachmentMeta, Credentials, FetchBatch, FetchedMessage, MailAddress, MessageBody,
    RemoteFolder, SyncCursor,
};
use crate::providers::{AdapterConfig, MailProvider, ProviderError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://gateway.webmail-b.example/rest";

/// OAuth webmail B: a nonstandard REST API. Two quirks are handled here
/// and must never leak past this module: message IDs arrive as unquoted
/// integers wider than an f64 mantissa, and folder discovery has to match
/// "inbox" case-insensitively because the API reports it with arbitrary
/// casing.
pub struct OauthBProvider {
    account: String,
    base_url: String,
    access_token: String,
    http: reqwest::Client,
    config: AdapterConfig,
}

impl OauthBProvider {
    pub fn new(
        account: String,
        credentials: Credentials,
        config: AdapterConfig,
    ) -> Result<Self, ProviderError> {
        let access_token = match credentials {
            Credentials::OAuth { access_token, .. } => access_token,
            Credentials::Password { .. } => {
                return Err(ProviderError::Authentication(
                    "oauth adapter requires oauth credentials".into(),
                ))
            }
        };
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let base_url = config
            .oauth_b_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            account,
            base_url,
            access_token,
            http,
            config,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ProviderError::Authentication(
                "provider rejected access token".into(),
            ));
        }
        let response = response
            .error_for_status()
            .map_err(|err| ProviderError::Network(err.to_string()))?;
        Ok(response.json::<T>().await?)
    }

    async fn inbox_folder_id(&self) -> Result<String, ProviderError> {
        let url = format!("{}/mailboxes", self.base_url);
        let payload: MailboxPayload = self.get_json(&url, &[]).await?;
        payload
            .mailboxes
            .into_iter()
            .find(|mailbox| mailbox.name.eq_ignore_ascii_case("inbox"))
            .map(|mailbox| mailbox.id)
            .ok_or_else(|| ProviderError::Payload("provider reported no inbox mailbox".into()))
    }
}

/// Accepts an ID emitted either as a JSON string or as a bare integer.
/// Integers are captured from serde's raw u64/i64 paths so an 18-digit ID
/// never transits a lossy float.
fn opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct IdVisitor;

    impl<'de> serde::de::Visitor<'de> for IdVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer id")
        }

        fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<String, E> {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

#[derive(Deserialize)]
struct MailboxPayload {
    mailboxes: Vec<ApiMailbox>,
}

#[derive(Deserialize)]
struct ApiMailbox {
    #[serde(deserialize_with = "opaque_id")]
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct MessagePayload {
    /// Items stay raw JSON so one malformed element can be skipped
    /// without rejecting the rest of the batch.
    items: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(deserialize_with = "opaque_id")]
    id: String,
    #[serde(default)]
    subject: String,
    sender: ApiAddress,
    #[serde(default)]
    recipients: Vec<ApiAddress>,
    #[serde(default)]
    copied: Vec<ApiAddress>,
    time: DateTime<Utc>,
    #[serde(default)]
    preview: Option<String>,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    files: Vec<ApiFile>,
    #[serde(default)]
    seen: bool,
    #[serde(default)]
    rfc_message_id: Option<String>,
    #[serde(default)]
    reference_ids: Vec<String>,
}

#[derive(Deserialize)]
struct ApiAddress {
    #[serde(default)]
    display: Option<String>,
    address: String,
}

#[derive(Deserialize)]
struct ApiFile {
    name: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    bytes: u64,
}

#[derive(Deserialize)]
struct BodyPayload {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    html: Option<String>,
}

impl From<ApiAddress> for MailAddress {
    fn from(value: ApiAddress) -> Self {
        MailAddress {
            display_name: value.display.filter(|name| !name.is_empty()),
            email: value.address,
        }
    }
}

/// Converts batch items one by one, drops anything older than the cursor
/// floor and sorts by receive time. A malformed element is logged and
/// skipped so the rest of the batch still lands. The floor check is
/// inclusive: a message stamped exactly at the cursor would otherwise be
/// lost, and the per-account provider-id uniqueness makes the occasional
/// re-delivery a no-op anyway.
fn select_batch(
    account: &str,
    items: Vec<serde_json::Value>,
    floor: Option<DateTime<Utc>>,
) -> Vec<FetchedMessage> {
    let mut messages: Vec<FetchedMessage> = items
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<ApiMessage>(raw) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(account, error = %err, "skipping malformed message payload");
                None
            }
        })
        .filter(|item| floor.map_or(true, |at| item.time >= at))
        .map(convert_message)
        .collect();
    messages.sort_by_key(|message| message.date_received);
    messages
}

fn convert_message(raw: ApiMessage) -> FetchedMessage {
    FetchedMessage {
        provider_message_id: raw.id,
        folder_path: "INBOX".to_string(),
        subject: raw.subject,
        from: raw.sender.into(),
        to: raw.recipients.into_iter().map(MailAddress::from).collect(),
        cc: raw.copied.into_iter().map(MailAddress::from).collect(),
        date_received: raw.time,
        body_text: raw.preview,
        body_html: raw.html,
        attachments: raw
            .files
            .into_iter()
            .map(|file| AttachmentMeta {
                filename: file.name,
                mime_type: file.content_type,
                size_bytes: file.bytes,
            })
            .collect(),
        is_read: raw.seen,
        message_id_header: raw.rfc_message_id,
        references: raw.reference_ids,
        watermark: SyncCursor::Timestamp { at: raw.time },
    }
}

#[async_trait]
impl MailProvider for OauthBProvider {
    async fn list_folders(&self) -> Result<Vec<RemoteFolder>, ProviderError> {
        let url = format!("{}/mailboxes", self.base_url);
        let payload: MailboxPayload = self.get_json(&url, &[]).await?;
        Ok(payload
            .mailboxes
            .into_iter()
            .map(|mailbox| RemoteFolder::from_path(mailbox.name))
            .collect())
    }

    async fn fetch_since(&self, cursor: Option<&SyncCursor>) -> Result<FetchBatch, ProviderError> {
        let floor = match cursor {
            Some(SyncCursor::Timestamp { at }) => Some(*at),
            Some(other) => {
                warn!(account = %self.account, cursor = ?other, "foreign cursor variant, starting first-sync window");
                None
            }
            None => None,
        };
        let since = floor
            .unwrap_or_else(|| Utc::now() - Duration::days(self.config.first_sync_lookback_days));

        let inbox_id = self.inbox_folder_id().await?;
        let url = format!("{}/mailboxes/{}/messages", self.base_url, inbox_id);
        let query = [("after", since.to_rfc3339())];
        let query: Vec<(&str, String)> = query
            .iter()
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        let payload: MessagePayload = self.get_json(&url, &query).await?;

        let messages = select_batch(&self.account, payload.items, floor);

        let next_cursor = messages
            .last()
            .map(|message| SyncCursor::Timestamp {
                at: message.date_received,
            })
            .or_else(|| cursor.cloned());

        debug!(account = %self.account, count = messages.len(), "oauth-b fetch complete");
        Ok(FetchBatch {
            messages,
            next_cursor,
        })
    }

    async fn fetch_body(&self, provider_message_id: &str) -> Result<MessageBody, ProviderError> {
        let url = format!("{}/messages/{}/content", self.base_url, provider_message_id);
        let payload: BodyPayload = self.get_json(&url, &[]).await?;
        Ok(MessageBody {
            text: payload.text,
            html: payload.html,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eighteen_digit_id_survives_parsing() {
        let raw = r#"{
            "id": 123456789012345678,
            "subject": "Invoice",
            "sender": { "address": "billing@vendor.example" },
            "time": "2026-08-20T10:00:00Z"
        }"#;
        let parsed: ApiMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.id, "123456789012345678");

        let message = convert_message(parsed);
        assert_eq!(message.provider_message_id, "123456789012345678");
    }

    #[test]
    fn quoted_ids_parse_unchanged() {
        let raw = r#"{
            "id": "AAMkAGI2TG93AAA=",
            "subject": "hello",
            "sender": { "address": "a@b.example" },
            "time": "2026-08-20T10:00:00Z"
        }"#;
        let parsed: ApiMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.id, "AAMkAGI2TG93AAA=");
    }

    #[test]
    fn malformed_item_is_skipped_not_fatal() {
        let raw = r#"{
            "items": [
                {
                    "id": 11,
                    "subject": "ok",
                    "sender": { "address": "a@b.example" },
                    "time": "2026-08-20T10:00:00Z"
                },
                { "id": 12, "subject": "address lost in transit" },
                {
                    "id": 13,
                    "sender": { "address": "c@d.example" },
                    "time": "2026-08-20T11:00:00Z"
                }
            ]
        }"#;
        let payload: MessagePayload = serde_json::from_str(raw).unwrap();
        let messages = select_batch("box@webmail-b.example", payload.items, None);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].provider_message_id, "11");
        assert_eq!(messages[1].provider_message_id, "13");
    }

    #[test]
    fn boundary_timestamp_message_is_kept() {
        let floor = "2026-08-20T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let raw = r#"{
            "items": [
                {
                    "id": 21,
                    "sender": { "address": "a@b.example" },
                    "time": "2026-08-20T09:59:59Z"
                },
                {
                    "id": 22,
                    "sender": { "address": "a@b.example" },
                    "time": "2026-08-20T10:00:00Z"
                },
                {
                    "id": 23,
                    "sender": { "address": "a@b.example" },
                    "time": "2026-08-20T10:00:01Z"
                }
            ]
        }"#;
        let payload: MessagePayload = serde_json::from_str(raw).unwrap();
        let messages = select_batch("box@webmail-b.example", payload.items, Some(floor));

        // Exactly-at-cursor stays; ingest dedup absorbs the re-delivery.
        let ids: Vec<&str> = messages
            .iter()
            .map(|message| message.provider_message_id.as_str())
            .collect();
        assert_eq!(ids, vec!["22", "23"]);
    }

    #[test]
    fn inbox_match_ignores_casing() {
        let raw = r#"{"mailboxes": [
            {"id": 1, "name": "Archive"},
            {"id": 991726354410028374, "name": "InBoX"}
        ]}"#;
        let payload: MailboxPayload = serde_json::from_str(raw).unwrap();
        let inbox = payload
            .mailboxes
            .into_iter()
            .find(|mailbox| mailbox.name.eq_ignore_ascii_case("inbox"))
            .unwrap();
        assert_eq!(inbox.id, "991726354410028374");
    }
}
