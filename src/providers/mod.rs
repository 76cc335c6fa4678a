use crate::error::Retryability;
use crate::models::{
    Account, Credentials, FetchBatch, MessageBody, Provider, RemoteFolder, SyncCursor,
};
use ::imap::Error as ImapError;
use async_trait::async_trait;
use native_tls::Error as TlsError;
use thiserror::Error;

pub mod bridge;
pub mod imap;
pub mod oauth_a;
pub mod oauth_b;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("imap error: {0}")]
    Imap(String),
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("unexpected provider error: {0}")]
    Other(String),
}

impl ProviderError {
    pub fn retryability(&self) -> Retryability {
        match self {
            ProviderError::Authentication(_) => Retryability::AccountFatal,
            ProviderError::Network(_) | ProviderError::Imap(_) | ProviderError::Other(_) => {
                Retryability::Transient
            }
            ProviderError::Payload(_) => Retryability::PerMessage,
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(value: std::io::Error) -> Self {
        Self::Network(value.to_string())
    }
}

impl From<TlsError> for ProviderError {
    fn from(value: TlsError) -> Self {
        Self::Network(value.to_string())
    }
}

impl From<ImapError> for ProviderError {
    fn from(value: ImapError) -> Self {
        Self::Imap(value.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() || value.is_connect() {
            Self::Network(value.to_string())
        } else if value.is_decode() {
            Self::Payload(value.to_string())
        } else {
            Self::Other(value.to_string())
        }
    }
}

/// The capability surface every provider implements. Adding a provider
/// means adding an implementation, never branching on a provider name in
/// shared logic.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_folders(&self) -> Result<Vec<RemoteFolder>, ProviderError>;

    /// Fetches messages observed after `cursor`. With no cursor, returns
    /// the bounded first-sync lookback window rather than full history.
    /// The returned cursor only becomes durable once the orchestrator has
    /// ingested the batch.
    async fn fetch_since(&self, cursor: Option<&SyncCursor>) -> Result<FetchBatch, ProviderError>;

    async fn fetch_body(&self, provider_message_id: &str) -> Result<MessageBody, ProviderError>;
}

/// Tuning shared by every adapter.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub first_sync_lookback_days: i64,
    pub http_timeout_secs: u64,
    pub bridge_port: u16,
    /// OAuth client id used for refresh-token grants.
    pub oauth_client_id: Option<String>,
    /// Base URL overrides, used by tests against a local stub.
    pub oauth_a_base_url: Option<String>,
    pub oauth_b_base_url: Option<String>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            first_sync_lookback_days: 14,
            http_timeout_secs: 30,
            bridge_port: 1143,
            oauth_client_id: None,
            oauth_a_base_url: None,
            oauth_b_base_url: None,
        }
    }
}

/// Builds the adapter matching the account's provider type.
pub fn adapter_for(
    account: &Account,
    credentials: Credentials,
    config: &AdapterConfig,
) -> Result<Box<dyn MailProvider>, ProviderError> {
    match account.provider {
        Provider::OauthA => Ok(Box::new(oauth_a::OauthAProvider::new(
            account.email.clone(),
            credentials,
            config.clone(),
        )?)),
        Provider::OauthB => Ok(Box::new(oauth_b::OauthBProvider::new(
            account.email.clone(),
            credentials,
            config.clone(),
        )?)),
        Provider::BridgeImap => Ok(Box::new(bridge::BridgeImapProvider::new(
            credentials,
            config.clone(),
        )?)),
        Provider::GenericImap => {
            let host = account.imap_host.clone().ok_or_else(|| {
                ProviderError::Other("imap account is missing a host".into())
            })?;
            let port = account.imap_port.unwrap_or(993);
            Ok(Box::new(imap::ImapProvider::new(
                host,
                port,
                credentials,
                config.clone(),
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imap_adapter_requires_a_host() {
        let account = Account {
            id: 1,
            provider: Provider::GenericImap,
            email: "user@example.com".into(),
            credentials_encrypted: String::new(),
            imap_host: None,
            imap_port: None,
            sync_cursor: None,
            sync_interval_minutes: 15,
            privacy: crate::models::PrivacyLevel::Full,
            last_synced_at: None,
            consecutive_failures: 0,
            needs_attention: false,
            auth_failed: false,
        };
        let credentials = Credentials::Password {
            username: "user@example.com".into(),
            password: "secret".into(),
        };
        let result = adapter_for(&account, credentials, &AdapterConfig::default());
        assert!(matches!(result, Err(ProviderError::Other(_))));
    }
}
