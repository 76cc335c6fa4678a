use crate::models::{
    AttachmentMeta, Credentials, FetchBatch, FetchedMessage, MailAddress, MessageBody,
    RemoteFolder, SyncCursor,
};
use crate::providers::{AdapterConfig, MailProvider, ProviderError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::{basic::BasicClient, AuthUrl, ClientId, RefreshToken, TokenResponse, TokenUrl};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://mail.webmail-a.example/api/v1";
const AUTH_URL: &str = "https://auth.webmail-a.example/oauth2/authorize";
const TOKEN_URL: &str = "https://auth.webmail-a.example/oauth2/token";
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 50;

/// OAuth webmail A: well-behaved REST JSON with stable opaque string IDs
/// and an opaque per-item cursor, which makes partial-batch cursor
/// advances exact.
pub struct OauthAProvider {
    account: String,
    base_url: String,
    http: reqwest::Client,
    tokens: Mutex<TokenState>,
    config: AdapterConfig,
}

struct TokenState {
    access_token: String,
    refresh_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl OauthAProvider {
    pub fn new(
        account: String,
        credentials: Credentials,
        config: AdapterConfig,
    ) -> Result<Self, ProviderError> {
        let (access_token, refresh_token, expires_at) = match credentials {
            Credentials::OAuth {
                access_token,
                refresh_token,
                expires_at,
            } => (access_token, refresh_token, expires_at),
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
            .oauth_a_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            account,
            base_url,
            http,
            tokens: Mutex::new(TokenState {
                access_token,
                refresh_token,
                expires_at,
            }),
            config,
        })
    }

    /// Returns a bearer token, refreshing through the standard grant when
    /// the cached one is expired or about to expire.
    async fn bearer(&self) -> Result<String, ProviderError> {
        let mut tokens = self.tokens.lock().await;
        let expired = tokens
            .expires_at
            .map(|at| at - Duration::seconds(60) <= Utc::now())
            .unwrap_or(false);
        if !expired {
            return Ok(tokens.access_token.clone());
        }

        let client_id = self.config.oauth_client_id.clone().ok_or_else(|| {
            ProviderError::Authentication("token expired and no oauth client id configured".into())
        })?;
        debug!(account = %self.account, "refreshing oauth access token");

        let client = BasicClient::new(
            ClientId::new(client_id),
            None,
            AuthUrl::new(AUTH_URL.to_string())
                .map_err(|err| ProviderError::Other(err.to_string()))?,
            Some(
                TokenUrl::new(TOKEN_URL.to_string())
                    .map_err(|err| ProviderError::Other(err.to_string()))?,
            ),
        );
        let response = client
            .exchange_refresh_token(&RefreshToken::new(tokens.refresh_token.clone()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|err| ProviderError::Authentication(format!("token refresh failed: {err}")))?;

        tokens.access_token = response.access_token().secret().clone();
        if let Some(refresh) = response.refresh_token() {
            tokens.refresh_token = refresh.secret().clone();
        }
        tokens.expires_at = response
            .expires_in()
            .and_then(|ttl| Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        Ok(tokens.access_token.clone())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Authentication(
                "provider rejected access token".into(),
            ));
        }
        let response = response
            .error_for_status()
            .map_err(|err| ProviderError::Network(err.to_string()))?;
        Ok(response.json::<T>().await?)
    }
}

#[derive(Deserialize)]
struct FolderPayload {
    folders: Vec<ApiFolder>,
}

#[derive(Deserialize)]
struct ApiFolder {
    name: String,
}

#[derive(Deserialize)]
struct MessagePage {
    /// Items stay raw JSON so one malformed element can be skipped
    /// without rejecting the rest of the page.
    messages: Vec<serde_json::Value>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    id: String,
    /// Opaque per-item resume point.
    cursor: String,
    #[serde(default)]
    subject: String,
    from: ApiAddress,
    #[serde(default)]
    to: Vec<ApiAddress>,
    #[serde(default)]
    cc: Vec<ApiAddress>,
    received_at: DateTime<Utc>,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    body_text: Option<String>,
    #[serde(default)]
    body_html: Option<String>,
    #[serde(default)]
    attachments: Vec<ApiAttachment>,
    #[serde(default)]
    unread: bool,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    references: Vec<String>,
}

#[derive(Deserialize)]
struct ApiAddress {
    #[serde(default)]
    name: Option<String>,
    email: String,
}

#[derive(Deserialize)]
struct ApiAttachment {
    filename: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct BodyPayload {
    #[serde(default)]
    body_text: Option<String>,
    #[serde(default)]
    body_html: Option<String>,
}

impl From<ApiAddress> for MailAddress {
    fn from(value: ApiAddress) -> Self {
        MailAddress {
            display_name: value.name.filter(|name| !name.is_empty()),
            email: value.email,
        }
    }
}

/// Converts page items one by one. A malformed element is logged and
/// skipped; the batch and its watermarks keep the rest, so the cursor
/// still advances past the good items.
fn convert_items(
    account: &str,
    items: Vec<serde_json::Value>,
) -> (Vec<FetchedMessage>, Option<String>) {
    let mut messages = Vec::with_capacity(items.len());
    let mut last_cursor = None;
    for raw in items {
        match serde_json::from_value::<ApiMessage>(raw) {
            Ok(item) => {
                last_cursor = Some(item.cursor.clone());
                messages.push(convert_message(item));
            }
            Err(err) => {
                warn!(account, error = %err, "skipping malformed message payload");
            }
        }
    }
    (messages, last_cursor)
}

fn convert_message(raw: ApiMessage) -> FetchedMessage {
    let watermark = SyncCursor::PageToken {
        token: raw.cursor.clone(),
    };
    FetchedMessage {
        provider_message_id: raw.id,
        folder_path: raw.folder.unwrap_or_else(|| "INBOX".to_string()),
        subject: raw.subject,
        from: raw.from.into(),
        to: raw.to.into_iter().map(MailAddress::from).collect(),
        cc: raw.cc.into_iter().map(MailAddress::from).collect(),
        date_received: raw.received_at,
        body_text: raw.body_text,
        body_html: raw.body_html,
        attachments: raw
            .attachments
            .into_iter()
            .map(|attachment| AttachmentMeta {
                filename: attachment.filename,
                mime_type: attachment.mime_type,
                size_bytes: attachment.size,
            })
            .collect(),
        is_read: !raw.unread,
        message_id_header: raw.message_id,
        references: raw.references,
        watermark,
    }
}

#[async_trait]
impl MailProvider for OauthAProvider {
    async fn list_folders(&self) -> Result<Vec<RemoteFolder>, ProviderError> {
        let url = format!("{}/folders", self.base_url);
        let payload: FolderPayload = self.get_json(&url, &[]).await?;
        Ok(payload
            .folders
            .into_iter()
            .map(|folder| RemoteFolder::from_path(folder.name))
            .collect())
    }

    async fn fetch_since(&self, cursor: Option<&SyncCursor>) -> Result<FetchBatch, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let mut resume = match cursor {
            Some(SyncCursor::PageToken { token }) => Some(token.clone()),
            Some(other) => {
                warn!(account = %self.account, cursor = ?other, "foreign cursor variant, starting first-sync window");
                None
            }
            None => None,
        };
        let first_sync = resume.is_none();

        let mut messages = Vec::new();
        let mut last_cursor = resume.clone();
        for _ in 0..MAX_PAGES {
            let mut query: Vec<(&str, String)> = vec![("limit", PAGE_SIZE.to_string())];
            if let Some(token) = &resume {
                query.push(("cursor", token.clone()));
            } else {
                let since = Utc::now() - Duration::days(self.config.first_sync_lookback_days);
                query.push(("since", since.to_rfc3339()));
            }

            let page: MessagePage = self.get_json(&url, &query).await?;
            let done = page.next_cursor.is_none() || page.messages.is_empty();
            let (converted, cursor_mark) = convert_items(&self.account, page.messages);
            messages.extend(converted);
            if cursor_mark.is_some() {
                last_cursor = cursor_mark;
            }
            if done {
                break;
            }
            resume = page.next_cursor;
        }

        debug!(account = %self.account, count = messages.len(), first_sync, "oauth-a fetch complete");
        Ok(FetchBatch {
            messages,
            next_cursor: last_cursor.map(|token| SyncCursor::PageToken { token }),
        })
    }

    async fn fetch_body(&self, provider_message_id: &str) -> Result<MessageBody, ProviderError> {
        let url = format!("{}/messages/{}/body", self.base_url, provider_message_id);
        let payload: BodyPayload = self.get_json(&url, &[]).await?;
        Ok(MessageBody {
            text: payload.body_text,
            html: payload.body_html,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_item_is_skipped_not_fatal() {
        let raw = r#"{
            "messages": [
                {
                    "id": "m-1",
                    "cursor": "c-1",
                    "subject": "ok",
                    "from": { "email": "a@b.example" },
                    "received_at": "2026-08-20T10:00:00Z"
                },
                { "id": "m-2", "cursor": "c-2", "subject": "no sender here" },
                {
                    "id": "m-3",
                    "cursor": "c-3",
                    "from": { "email": "c@d.example" },
                    "received_at": "2026-08-20T11:00:00Z"
                }
            ]
        }"#;
        let page: MessagePage = serde_json::from_str(raw).unwrap();
        let (messages, last_cursor) = convert_items("box@webmail-a.example", page.messages);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].provider_message_id, "m-1");
        assert_eq!(messages[1].provider_message_id, "m-3");
        // The cursor mark tracks the last item that actually parsed.
        assert_eq!(last_cursor.as_deref(), Some("c-3"));
    }

    #[test]
    fn cursor_mark_stops_at_last_good_item() {
        let raw = r#"{
            "messages": [
                {
                    "id": "m-1",
                    "cursor": "c-1",
                    "from": { "email": "a@b.example" },
                    "received_at": "2026-08-20T10:00:00Z"
                },
                { "cursor": "c-2" }
            ]
        }"#;
        let page: MessagePage = serde_json::from_str(raw).unwrap();
        let (messages, last_cursor) = convert_items("box@webmail-a.example", page.messages);

        assert_eq!(messages.len(), 1);
        assert_eq!(last_cursor.as_deref(), Some("c-1"));
    }
}
