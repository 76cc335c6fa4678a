use crate::models::{Credentials, FetchBatch, MessageBody, RemoteFolder, SyncCursor};
use crate::providers::imap::{
    fetch_body_blocking, fetch_since_blocking, list_folders_blocking, password_credentials,
};
use crate::providers::{AdapterConfig, MailProvider, ProviderError};
use ::imap::{Client, Session};
use async_trait::async_trait;
use std::net::TcpStream;
use tokio::task;

/// Adapter for the local bridge companion: plaintext IMAP on a fixed
/// loopback port. The credentials are bridge-local, never the provider's
/// real account secrets, which is why TLS is not required here.
pub struct BridgeImapProvider {
    username: String,
    password: String,
    config: AdapterConfig,
}

impl BridgeImapProvider {
    pub fn new(credentials: Credentials, config: AdapterConfig) -> Result<Self, ProviderError> {
        let (username, password) = password_credentials(credentials)?;
        Ok(Self {
            username,
            password,
            config,
        })
    }

    fn connect(&self) -> Result<Session<TcpStream>, ProviderError> {
        let stream = TcpStream::connect(("127.0.0.1", self.config.bridge_port))
            .map_err(|err| ProviderError::Network(format!("bridge unreachable: {err}")))?;
        let client = Client::new(stream);
        match client.login(&self.username, &self.password) {
            Ok(session) => Ok(session),
            Err((err, _client)) => Err(ProviderError::Authentication(err.to_string())),
        }
    }

    fn clone_parts(&self) -> BridgeImapProvider {
        BridgeImapProvider {
            username: self.username.clone(),
            password: self.password.clone(),
            config: self.config.clone(),
        }
    }
}

#[async_trait]
impl MailProvider for BridgeImapProvider {
    async fn list_folders(&self) -> Result<Vec<RemoteFolder>, ProviderError> {
        let this = self.clone_parts();
        task::spawn_blocking(move || {
            let mut session = this.connect()?;
            let folders = list_folders_blocking(&mut session);
            let _ = session.logout();
            folders
        })
        .await
        .map_err(|err| ProviderError::Other(format!("background task failure: {err}")))?
    }

    async fn fetch_since(&self, cursor: Option<&SyncCursor>) -> Result<FetchBatch, ProviderError> {
        let this = self.clone_parts();
        let cursor = cursor.cloned();
        let lookback = self.config.first_sync_lookback_days;
        task::spawn_blocking(move || {
            let mut session = this.connect()?;
            let batch = fetch_since_blocking(&mut session, cursor.as_ref(), lookback, &this.username);
            let _ = session.logout();
            batch
        })
        .await
        .map_err(|err| ProviderError::Other(format!("background task failure: {err}")))?
    }

    async fn fetch_body(&self, provider_message_id: &str) -> Result<MessageBody, ProviderError> {
        let this = self.clone_parts();
        let uid = provider_message_id.to_string();
        task::spawn_blocking(move || {
            let mut session = this.connect()?;
            let body = fetch_body_blocking(&mut session, &uid);
            let _ = session.logout();
            body
        })
        .await
        .map_err(|err| ProviderError::Other(format!("background task failure: {err}")))?
    }
}
