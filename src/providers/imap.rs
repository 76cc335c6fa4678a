use crate::models::{
    AttachmentMeta, Credentials, FetchBatch, FetchedMessage, MailAddress, MessageBody,
    RemoteFolder, SyncCursor,
};
use crate::providers::{AdapterConfig, MailProvider, ProviderError};
use ::imap::types::{Fetch, Flag};
use ::imap::Session;
use ::imap_proto::types::Address;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use native_tls::TlsConnector;
use std::io::{Read, Write};
use tokio::task;
use tracing::{info, warn};

const FETCH_CHUNK_SIZE: usize = 200;
const BODY_PEEK: &str = "(ENVELOPE INTERNALDATE FLAGS BODY.PEEK[TEXT]<0.4096>)";

/// Direct TLS IMAP adapter. Sessions are blocking (`imap` crate) and run
/// under `spawn_blocking`; one connection per call, logged out on every
/// path.
pub struct ImapProvider {
    host: String,
    port: u16,
    username: String,
    password: String,
    config: AdapterConfig,
}

impl ImapProvider {
    pub fn new(
        host: String,
        port: u16,
        credentials: Credentials,
        config: AdapterConfig,
    ) -> Result<Self, ProviderError> {
        let (username, password) = password_credentials(credentials)?;
        Ok(Self {
            host,
            port,
            username,
            password,
            config,
        })
    }

    fn connect(&self) -> Result<Session<native_tls::TlsStream<std::net::TcpStream>>, ProviderError> {
        let tls = TlsConnector::builder()
            .build()
            .map_err(|err| ProviderError::Network(err.to_string()))?;
        let client = ::imap::connect((self.host.as_str(), self.port), self.host.as_str(), &tls)
            .map_err(|err| ProviderError::Network(err.to_string()))?;
        match client.login(&self.username, &self.password) {
            Ok(session) => Ok(session),
            Err((err, _client)) => Err(ProviderError::Authentication(err.to_string())),
        }
    }
}

pub(crate) fn password_credentials(
    credentials: Credentials,
) -> Result<(String, String), ProviderError> {
    match credentials {
        Credentials::Password { username, password } => Ok((username, password)),
        Credentials::OAuth { .. } => Err(ProviderError::Authentication(
            "imap adapters require password credentials".into(),
        )),
    }
}

#[async_trait]
impl MailProvider for ImapProvider {
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

impl ImapProvider {
    fn clone_parts(&self) -> ImapProvider {
        ImapProvider {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            config: self.config.clone(),
        }
    }
}

pub(crate) fn list_folders_blocking<T: Read + Write>(
    session: &mut Session<T>,
) -> Result<Vec<RemoteFolder>, ProviderError> {
    let names = session.list(None, Some("*"))?;
    Ok(names
        .iter()
        .map(|name| RemoteFolder {
            path: name.name().to_string(),
            folder_type: crate::models::FolderType::parse(name.name()),
        })
        .collect())
}

/// Incremental fetch keyed on a UID high-water mark. A cursor from a
/// different provider family is treated as absent and triggers the
/// bounded first-sync window instead of corrupting the UID sequence.
pub(crate) fn fetch_since_blocking<T: Read + Write>(
    session: &mut Session<T>,
    cursor: Option<&SyncCursor>,
    lookback_days: i64,
    account: &str,
) -> Result<FetchBatch, ProviderError> {
    session.select("INBOX")?;

    let since_uid = match cursor {
        Some(SyncCursor::UidHighWater { uid }) => Some(*uid),
        Some(other) => {
            warn!(account, cursor = ?other, "foreign cursor variant, falling back to first-sync window");
            None
        }
        None => None,
    };

    let mut uids: Vec<u32> = match since_uid {
        Some(uid) => {
            let query = format!("UID {}:*", uid.saturating_add(1));
            session
                .uid_search(&query)?
                .into_iter()
                .filter(|candidate| *candidate > uid)
                .collect()
        }
        None => {
            let since = (Utc::now() - Duration::days(lookback_days)).date_naive();
            let query = format!("SINCE {}", since.format("%d-%b-%Y"));
            session.uid_search(&query)?.into_iter().collect()
        }
    };

    uids.sort_unstable();
    uids.dedup();

    if uids.is_empty() {
        return Ok(FetchBatch {
            messages: Vec::new(),
            next_cursor: since_uid.map(|uid| SyncCursor::UidHighWater { uid }),
        });
    }

    info!(account, total_uids = uids.len(), since_uid, "imap fetch set ready");

    let mut messages = Vec::with_capacity(uids.len());
    for chunk in uids.chunks(FETCH_CHUNK_SIZE) {
        let query = chunk
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetches = session.uid_fetch(&query, BODY_PEEK)?;
        for item in fetches.iter() {
            match message_from_fetch(item) {
                Some(message) => messages.push(message),
                // A message that cannot be summarized is skipped, never
                // the whole batch.
                None => warn!(account, uid = ?item.uid, "skipping unparseable imap fetch item"),
            }
        }
    }

    messages.sort_by_key(|message| match message.watermark {
        SyncCursor::UidHighWater { uid } => uid,
        _ => 0,
    });

    let next_cursor = uids.last().map(|uid| SyncCursor::UidHighWater { uid: *uid });
    Ok(FetchBatch {
        messages,
        next_cursor,
    })
}

pub(crate) fn fetch_body_blocking<T: Read + Write>(
    session: &mut Session<T>,
    uid: &str,
) -> Result<MessageBody, ProviderError> {
    session.select("INBOX")?;
    let fetches = session.uid_fetch(uid, "(BODY.PEEK[TEXT])")?;
    let text = fetches
        .iter()
        .next()
        .and_then(|fetch| fetch.body())
        .map(|bytes| String::from_utf8_lossy(bytes).to_string());
    Ok(MessageBody { text, html: None })
}

fn message_from_fetch(fetch: &Fetch) -> Option<FetchedMessage> {
    let envelope = fetch.envelope()?;
    let uid = fetch.uid?;

    let subject = decode_bytes(envelope.subject.as_ref().map(|cow| cow.as_ref()));
    let from = primary_address(envelope.from.as_ref().map(|addresses| addresses.as_slice()));
    let to = address_list(envelope.to.as_ref().map(|addresses| addresses.as_slice()));
    let cc = address_list(envelope.cc.as_ref().map(|addresses| addresses.as_slice()));

    let date_received = fetch
        .internal_date()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let message_id_header = envelope
        .message_id
        .as_ref()
        .map(|cow| decode_bytes(Some(cow.as_ref())))
        .filter(|value| !value.is_empty());
    let references = envelope
        .in_reply_to
        .as_ref()
        .map(|cow| decode_bytes(Some(cow.as_ref())))
        .filter(|value| !value.is_empty())
        .map(|value| vec![value])
        .unwrap_or_default();

    let body_text = fetch
        .body()
        .map(|bytes| String::from_utf8_lossy(bytes).to_string())
        .filter(|text| !text.trim().is_empty());

    let is_read = fetch.flags().iter().any(|flag| matches!(flag, Flag::Seen));

    Some(FetchedMessage {
        provider_message_id: uid.to_string(),
        folder_path: "INBOX".to_string(),
        subject,
        from,
        to,
        cc,
        date_received,
        body_text,
        body_html: None,
        attachments: Vec::<AttachmentMeta>::new(),
        is_read,
        message_id_header,
        references,
        watermark: SyncCursor::UidHighWater { uid },
    })
}

fn address_list(addresses: Option<&[Address]>) -> Vec<MailAddress> {
    addresses
        .map(|list| list.iter().map(convert_address).collect())
        .unwrap_or_default()
}

fn primary_address(addresses: Option<&[Address]>) -> MailAddress {
    addresses
        .and_then(|list| list.first())
        .map(convert_address)
        .unwrap_or_else(|| MailAddress::bare(""))
}

fn convert_address(address: &Address) -> MailAddress {
    let name = decode_bytes(address.name.as_ref().map(|cow| cow.as_ref()));
    let mailbox = decode_bytes(address.mailbox.as_ref().map(|cow| cow.as_ref()));
    let host = decode_bytes(address.host.as_ref().map(|cow| cow.as_ref()));

    let email = match (!mailbox.is_empty(), !host.is_empty()) {
        (true, true) => format!("{}@{}", mailbox, host),
        (true, false) => mailbox,
        (false, true) => host,
        _ => String::new(),
    };

    MailAddress {
        display_name: if name.is_empty() { None } else { Some(name) },
        email,
    }
}

fn decode_bytes(data: Option<&[u8]>) -> String {
    data.map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_default()
}
