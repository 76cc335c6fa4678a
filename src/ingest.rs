use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::models::{FetchedMessage, FolderType, PrivacyLevel, SyncCursor};
use crate::storage::{IngestOutcome, MessageRecord, Storage, StorageError};

static SUBJECT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(re|fw|fwd)\s*:\s*").expect("static regex"));

/// Outcome of ingesting one fetched batch. `last_watermark` always points
/// at the last message that made it to disk, so the cursor can advance
/// past a partial batch without losing the remainder.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub inserted: Vec<i64>,
    pub duplicates: usize,
    pub last_watermark: Option<SyncCursor>,
    pub failure: Option<StorageError>,
}

impl IngestReport {
    pub fn is_partial(&self) -> bool {
        self.failure.is_some()
    }
}

/// Normalized subject used for thread grouping: reply/forward prefixes
/// stripped repeatedly, whitespace collapsed, case folded.
pub fn thread_key(subject: &str) -> String {
    let mut current = subject.trim();
    while let Some(found) = SUBJECT_PREFIX.find(current) {
        current = &current[found.end()..];
    }
    let collapsed = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        "(no subject)".to_string()
    } else {
        collapsed.to_lowercase()
    }
}

/// Decodes RFC 2047 encoded words in a header value; raw values pass
/// through untouched.
pub fn decode_header_value(raw: &str) -> String {
    let framed = format!("X: {raw}");
    match mailparse::parse_header(framed.as_bytes()) {
        Ok((header, _)) => header.get_value().trim().to_string(),
        Err(_) => raw.trim().to_string(),
    }
}

/// Converts one fetched message into a storable record, applying the
/// account's privacy level to the body columns.
pub fn normalize(message: FetchedMessage, privacy: PrivacyLevel) -> MessageRecord {
    let subject = decode_header_value(&message.subject);
    let (body_text, body_html) = match privacy {
        PrivacyLevel::HeadersOnly => (None, None),
        PrivacyLevel::Full | PrivacyLevel::BodyLocalOnly => (message.body_text, message.body_html),
    };
    MessageRecord {
        provider_message_id: message.provider_message_id,
        folder_path: message.folder_path.clone(),
        folder_type: FolderType::parse(&message.folder_path),
        thread_key: thread_key(&subject),
        subject,
        from: message.from,
        to: message.to,
        cc: message.cc,
        date_received: message.date_received,
        body_text,
        body_html,
        attachments: message.attachments,
        is_read: message.is_read,
        message_id_header: message.message_id_header,
        references: message.references,
    }
}

/// Writes a batch in watermark order. A storage failure stops the batch
/// but keeps everything already durable, and the report says how far the
/// cursor may advance.
pub async fn ingest_batch(
    storage: &Storage,
    account_id: i64,
    privacy: PrivacyLevel,
    messages: Vec<FetchedMessage>,
) -> IngestReport {
    let mut report = IngestReport::default();
    for message in messages {
        let watermark = message.watermark.clone();
        let record = normalize(message, privacy);
        match storage.ingest_message(account_id, record).await {
            Ok(IngestOutcome::Inserted { message_id, .. }) => {
                report.inserted.push(message_id);
                report.last_watermark = Some(watermark);
            }
            Ok(IngestOutcome::Duplicate) => {
                report.duplicates += 1;
                report.last_watermark = Some(watermark);
            }
            Err(err) => {
                warn!(account_id, error = %err, "ingest stopped mid-batch");
                report.failure = Some(err);
                break;
            }
        }
    }
    debug!(
        account_id,
        inserted = report.inserted.len(),
        duplicates = report.duplicates,
        partial = report.is_partial(),
        "batch ingested"
    );
    report
}
