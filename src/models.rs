use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OauthA,
    OauthB,
    BridgeImap,
    GenericImap,
}

impl Provider {
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::OauthA => "OAuth Webmail A",
            Provider::OauthB => "OAuth Webmail B",
            Provider::BridgeImap => "Bridged IMAP",
            Provider::GenericImap => "IMAP",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OauthA => "oauth_a",
            Provider::OauthB => "oauth_b",
            Provider::BridgeImap => "bridge_imap",
            Provider::GenericImap => "generic_imap",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "oauth_a" => Some(Provider::OauthA),
            "oauth_b" => Some(Provider::OauthB),
            "bridge_imap" => Some(Provider::BridgeImap),
            "generic_imap" => Some(Provider::GenericImap),
            _ => None,
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// How much of an account's mail the engine is allowed to persist and
/// forward to the AI scorer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Full,
    HeadersOnly,
    BodyLocalOnly,
}

impl PrivacyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyLevel::Full => "full",
            PrivacyLevel::HeadersOnly => "headers_only",
            PrivacyLevel::BodyLocalOnly => "body_local_only",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "headers_only" => PrivacyLevel::HeadersOnly,
            "body_local_only" => PrivacyLevel::BodyLocalOnly,
            _ => PrivacyLevel::Full,
        }
    }
}

/// Canonical folder kind. Parsed case-insensitively and persisted in its
/// canonical lowercase form so read sites never compare raw strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FolderType {
    Inbox,
    Sent,
    Trash,
    Archive,
    Spam,
    Other,
}

impl FolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderType::Inbox => "inbox",
            FolderType::Sent => "sent",
            FolderType::Trash => "trash",
            FolderType::Archive => "archive",
            FolderType::Spam => "spam",
            FolderType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "inbox" => FolderType::Inbox,
            "sent" | "sent items" | "sent mail" => FolderType::Sent,
            "trash" | "deleted" | "deleted items" | "bin" => FolderType::Trash,
            "archive" | "all mail" => FolderType::Archive,
            "spam" | "junk" | "junk email" | "bulk" => FolderType::Spam,
            _ => FolderType::Other,
        }
    }
}

/// Opaque incremental-sync watermark. Only the adapter that produced a
/// cursor ever looks inside it; everything else round-trips the encoded
/// string through the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncCursor {
    Timestamp { at: DateTime<Utc> },
    UidHighWater { uid: u32 },
    PageToken { token: String },
}

impl SyncCursor {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Decrypted account credentials. Serialized to JSON and stored only as
/// a vault-encrypted blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    OAuth {
        access_token: String,
        refresh_token: String,
        expires_at: Option<DateTime<Utc>>,
    },
    Password {
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub provider: Provider,
    pub email: String,
    pub credentials_encrypted: String,
    pub imap_host: Option<String>,
    pub imap_port: Option<u16>,
    pub sync_cursor: Option<String>,
    pub sync_interval_minutes: i64,
    pub privacy: PrivacyLevel,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    pub needs_attention: bool,
    pub auth_failed: bool,
}

impl Account {
    pub fn cursor(&self) -> Option<SyncCursor> {
        self.sync_cursor.as_deref().and_then(SyncCursor::decode)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.auth_failed {
            return false;
        }
        match self.last_synced_at {
            None => true,
            Some(last) => {
                now.signed_duration_since(last).num_minutes() >= self.sync_interval_minutes
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Folder {
    pub id: i64,
    pub account_id: i64,
    pub path: String,
    pub folder_type: FolderType,
    pub unread_count: i64,
}

/// A folder as reported by a provider, before it has a row.
#[derive(Debug, Clone)]
pub struct RemoteFolder {
    pub path: String,
    pub folder_type: FolderType,
}

impl RemoteFolder {
    pub fn from_path(path: String) -> Self {
        let folder_type = FolderType::parse(&path);
        Self { path, folder_type }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailAddress {
    pub display_name: Option<String>,
    pub email: String,
}

impl MailAddress {
    pub fn bare(email: impl Into<String>) -> Self {
        Self {
            display_name: None,
            email: email.into(),
        }
    }

    pub fn domain(&self) -> Option<&str> {
        self.email.rsplit_once('@').map(|(_, domain)| domain)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// One message as fetched from a provider, normalized far enough for the
/// ingestion pipeline. `provider_message_id` is always an opaque string;
/// some providers emit IDs wider than an f64 mantissa and they must never
/// pass through a lossy numeric type.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub provider_message_id: String,
    pub folder_path: String,
    pub subject: String,
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub date_received: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub is_read: bool,
    pub message_id_header: Option<String>,
    pub references: Vec<String>,
    /// Watermark covering this message alone, so a partially ingested
    /// batch can advance the cursor to the last durable message.
    pub watermark: SyncCursor,
}

#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub messages: Vec<FetchedMessage>,
    pub next_cursor: Option<SyncCursor>,
}

#[derive(Debug, Clone)]
pub struct MessageBody {
    pub text: Option<String>,
    pub html: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub account_id: i64,
    pub folder_id: i64,
    pub thread_id: i64,
    pub provider_message_id: String,
    pub subject: String,
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub date_received: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub ai_category_id: Option<i64>,
    pub ai_confidence: Option<f64>,
    pub is_read: bool,
    pub is_hidden: bool,
    pub never_show: bool,
    pub manual_category: bool,
}

#[derive(Debug, Clone)]
pub struct Thread {
    pub id: i64,
    pub account_id: i64,
    pub subject_key: String,
    pub last_message_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Category {
    pub id: i64,
    pub user_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub name: String,
    /// Lower is more specific/urgent; the tie-break when signals disagree
    /// within the confidence epsilon.
    pub priority: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatchType {
    SenderExact,
    SenderDomain,
    SubjectContains,
}

impl RuleMatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleMatchType::SenderExact => "sender_exact",
            RuleMatchType::SenderDomain => "sender_domain",
            RuleMatchType::SubjectContains => "subject_contains",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "sender_exact" => Some(RuleMatchType::SenderExact),
            "sender_domain" => Some(RuleMatchType::SenderDomain),
            "subject_contains" => Some(RuleMatchType::SubjectContains),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Route,
    Archive,
    Trash,
    Quarantine,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Route => "route",
            RuleAction::Archive => "archive",
            RuleAction::Trash => "trash",
            RuleAction::Quarantine => "quarantine",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "archive" => RuleAction::Archive,
            "trash" => RuleAction::Trash,
            "quarantine" => RuleAction::Quarantine,
            _ => RuleAction::Route,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LearnedRule {
    pub id: i64,
    pub user_id: Option<i64>,
    pub account_id: Option<i64>,
    pub match_type: RuleMatchType,
    pub match_value: String,
    pub target_category_id: Option<i64>,
    pub target_folder_id: Option<i64>,
    pub action: RuleAction,
    pub priority: i64,
    pub confidence_boost: f64,
}

impl LearnedRule {
    pub fn matches(&self, sender_email: &str, subject: &str) -> bool {
        let value = self.match_value.to_lowercase();
        match self.match_type {
            RuleMatchType::SenderExact => sender_email.to_lowercase() == value,
            RuleMatchType::SenderDomain => sender_email
                .to_lowercase()
                .rsplit_once('@')
                .map(|(_, domain)| domain == value)
                .unwrap_or(false),
            RuleMatchType::SubjectContains => subject.to_lowercase().contains(&value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationFactor {
    pub label: String,
    pub weight: f64,
}

/// Final merged judgment for one message. Transient: its fields are
/// flattened onto the message row, never stored verbatim.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub category_id: Option<i64>,
    pub confidence: f64,
    pub explanation: String,
    pub factors: Vec<ClassificationFactor>,
    pub suggested_action: RuleAction,
    pub needs_human_review: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderHistoryEntry {
    pub category_id: i64,
    pub manual: bool,
}

/// Everything the AI scorer is allowed to see for one message.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationInput {
    pub subject: String,
    pub sender: MailAddress,
    pub recipients: Vec<String>,
    pub body_preview: Option<String>,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub is_reply: bool,
    pub sender_history: Vec<SenderHistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_type_parses_any_casing() {
        assert_eq!(FolderType::parse("inbox"), FolderType::Inbox);
        assert_eq!(FolderType::parse("INBOX"), FolderType::Inbox);
        assert_eq!(FolderType::parse("Inbox"), FolderType::Inbox);
        assert_eq!(FolderType::parse(" Junk "), FolderType::Spam);
        assert_eq!(FolderType::parse("Projects/2025"), FolderType::Other);
    }

    #[test]
    fn cursor_round_trips_through_opaque_string() {
        let cursor = SyncCursor::UidHighWater { uid: 4312 };
        let encoded = cursor.encode();
        assert_eq!(SyncCursor::decode(&encoded), Some(cursor));

        let token = SyncCursor::PageToken {
            token: "abc==".into(),
        };
        assert_eq!(SyncCursor::decode(&token.encode()), Some(token));
        assert_eq!(SyncCursor::decode("not json"), None);
    }

    #[test]
    fn rule_matching_is_case_insensitive() {
        let rule = LearnedRule {
            id: 1,
            user_id: None,
            account_id: None,
            match_type: RuleMatchType::SenderDomain,
            match_value: "Bank.example".into(),
            target_category_id: Some(7),
            target_folder_id: None,
            action: RuleAction::Route,
            priority: 10,
            confidence_boost: 0.2,
        };
        assert!(rule.matches("alerts@BANK.example", "statement"));
        assert!(!rule.matches("alerts@other.example", "statement"));
    }

    #[test]
    fn account_due_check_uses_interval() {
        let mut account = Account {
            id: 1,
            provider: Provider::GenericImap,
            email: "a@example.com".into(),
            credentials_encrypted: String::new(),
            imap_host: None,
            imap_port: None,
            sync_cursor: None,
            sync_interval_minutes: 15,
            privacy: PrivacyLevel::Full,
            last_synced_at: None,
            consecutive_failures: 0,
            needs_attention: false,
            auth_failed: false,
        };
        let now = Utc::now();
        assert!(account.is_due(now));

        account.last_synced_at = Some(now - chrono::Duration::minutes(14));
        assert!(!account.is_due(now));
        account.last_synced_at = Some(now - chrono::Duration::minutes(15));
        assert!(account.is_due(now));

        account.auth_failed = true;
        assert!(!account.is_due(now));
    }
}
