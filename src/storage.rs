use std::{path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::models::{
    Account, AttachmentMeta, Category, ClassificationResult, Folder, FolderType, LearnedRule,
    MailAddress, Message, PrivacyLevel, Provider, RuleAction, RuleMatchType, SenderHistoryEntry,
    Thread,
};
use crate::vault::Vault;

type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("vault error: {0}")]
    Vault(#[from] crate::vault::VaultError),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fields for a not-yet-persisted account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub provider: Provider,
    pub email: String,
    pub credentials_encrypted: String,
    pub imap_host: Option<String>,
    pub imap_port: Option<u16>,
    pub sync_interval_minutes: i64,
    pub privacy: PrivacyLevel,
}

/// A fully normalized message ready for the transactional ingest write.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub provider_message_id: String,
    pub folder_path: String,
    pub folder_type: FolderType,
    pub thread_key: String,
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
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted { message_id: i64, thread_id: i64 },
    /// Same (account, provider message id) already present; the write was
    /// a no-op, which is what makes at-least-once redelivery safe.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct NewRule {
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

/// Persistent store. One sqlite connection guarded by a blocking mutex;
/// every public method hops to the blocking pool, the teacher pattern for
/// mixing rusqlite with tokio.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<parking_lot::Mutex<Connection>>,
    vault: Arc<Vault>,
}

fn map_join_error(err: tokio::task::JoinError) -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Interrupted,
        format!("storage worker panicked: {err}"),
    ))
}

impl Storage {
    pub fn open(path: &Path, vault: Arc<Vault>) -> Result<Self> {
        let mut connection = Connection::open(path)?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;
        connection.pragma_update(None, "foreign_keys", "ON")?;
        Self::apply_migrations(&mut connection)?;
        Ok(Self {
            conn: Arc::new(parking_lot::Mutex::new(connection)),
            vault,
        })
    }

    pub fn open_in_memory(vault: Arc<Vault>) -> Result<Self> {
        let mut connection = Connection::open_in_memory()?;
        connection.pragma_update(None, "foreign_keys", "ON")?;
        Self::apply_migrations(&mut connection)?;
        Ok(Self {
            conn: Arc::new(parking_lot::Mutex::new(connection)),
            vault,
        })
    }

    fn apply_migrations(conn: &mut Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                credentials_encrypted TEXT NOT NULL,
                imap_host TEXT,
                imap_port INTEGER,
                sync_cursor TEXT,
                sync_interval_minutes INTEGER NOT NULL DEFAULT 15,
                privacy TEXT NOT NULL DEFAULT 'full',
                last_synced_at TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                needs_attention INTEGER NOT NULL DEFAULT 0,
                auth_failed INTEGER NOT NULL DEFAULT 0,
                last_failure_reason TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                folder_type TEXT NOT NULL,
                unread_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(account_id, path)
            );

            CREATE TABLE IF NOT EXISTS threads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                subject_key TEXT NOT NULL,
                last_message_date TEXT NOT NULL,
                UNIQUE(account_id, subject_key)
            );

            CREATE TABLE IF NOT EXISTS thread_refs (
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                ref_id TEXT NOT NULL,
                thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                UNIQUE(account_id, ref_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                folder_id INTEGER NOT NULL REFERENCES folders(id),
                thread_id INTEGER NOT NULL REFERENCES threads(id),
                provider_message_id TEXT NOT NULL,
                subject_encrypted TEXT NOT NULL,
                from_json TEXT NOT NULL,
                to_json TEXT NOT NULL,
                cc_json TEXT NOT NULL,
                date_received TEXT NOT NULL,
                body_text_encrypted TEXT,
                body_html_encrypted TEXT,
                attachments_json TEXT NOT NULL,
                message_id_header TEXT,
                ai_category_id INTEGER REFERENCES categories(id),
                ai_confidence REAL,
                ai_explanation TEXT,
                needs_human_review INTEGER NOT NULL DEFAULT 0,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_hidden INTEGER NOT NULL DEFAULT 0,
                never_show INTEGER NOT NULL DEFAULT 0,
                manual_category INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(account_id, provider_message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_thread
                ON messages(thread_id);
            CREATE INDEX IF NOT EXISTS idx_messages_unclassified
                ON messages(account_id, ai_category_id);

            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                parent_id INTEGER REFERENCES categories(id),
                name TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 100
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_scope_name
                ON categories(COALESCE(user_id, 0), name);

            CREATE TABLE IF NOT EXISTS learned_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                account_id INTEGER REFERENCES accounts(id) ON DELETE CASCADE,
                match_type TEXT NOT NULL,
                match_value TEXT NOT NULL,
                target_category_id INTEGER REFERENCES categories(id),
                target_folder_id INTEGER REFERENCES folders(id),
                action TEXT NOT NULL DEFAULT 'route',
                priority INTEGER NOT NULL DEFAULT 100,
                confidence_boost REAL NOT NULL DEFAULT 0
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_scope_match
                ON learned_rules(COALESCE(user_id, 0), match_type, match_value);

            CREATE TABLE IF NOT EXISTS sender_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_email TEXT NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(id),
                manual INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sender_history_sender
                ON sender_history(sender_email, id DESC);
            "#,
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Vault) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let vault = self.vault.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            work(&mut conn, &vault)
        })
        .await
        .map_err(map_join_error)?
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &'static str) -> Result<()> {
        self.with_conn(move |conn, _vault| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .await
    }

    // ----- accounts -----

    pub async fn create_account(&self, new: NewAccount) -> Result<Account> {
        self.with_conn(move |conn, _vault| {
            let now = Utc::now();
            conn.execute(
                r#"
                INSERT INTO accounts (
                    provider, email, credentials_encrypted, imap_host, imap_port,
                    sync_interval_minutes, privacy, created_at
                ) VALUES (?,?,?,?,?,?,?,?)
                "#,
                params![
                    new.provider.as_str(),
                    new.email.trim().to_lowercase(),
                    new.credentials_encrypted,
                    new.imap_host,
                    new.imap_port,
                    new.sync_interval_minutes,
                    new.privacy.as_str(),
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            account_by_id(conn, id)?.ok_or_else(|| {
                StorageError::Database(rusqlite::Error::QueryReturnedNoRows)
            })
        })
        .await
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        self.with_conn(move |conn, _vault| account_by_id(conn, id)).await
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.with_conn(|conn, _vault| {
            let mut stmt = conn.prepare(&format!("{ACCOUNT_SELECT} ORDER BY id"))?;
            let mut rows = stmt.query([])?;
            let mut accounts = Vec::new();
            while let Some(row) = rows.next()? {
                accounts.push(account_from_row(row)?);
            }
            Ok(accounts)
        })
        .await
    }

    pub async fn delete_account(&self, id: i64) -> Result<()> {
        self.with_conn(move |conn, _vault| {
            conn.execute("DELETE FROM accounts WHERE id = ?", params![id])?;
            Ok(())
        })
        .await
    }

    /// Completed-sync bookkeeping: persist the new cursor (only ever
    /// called after the batch is durably ingested), stamp the sync time,
    /// clear the failure streak.
    pub async fn record_sync_success(
        &self,
        account_id: i64,
        cursor: Option<String>,
    ) -> Result<()> {
        self.with_conn(move |conn, _vault| {
            conn.execute(
                r#"
                UPDATE accounts SET
                    sync_cursor = COALESCE(?, sync_cursor),
                    last_synced_at = ?,
                    consecutive_failures = 0,
                    needs_attention = 0,
                    last_failure_reason = NULL
                WHERE id = ?
                "#,
                params![cursor, Utc::now(), account_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Failure bookkeeping. A partially ingested batch may still advance
    /// the cursor to its last durable watermark. `attention_threshold`
    /// flips the operator-visible flag once the streak crosses it.
    pub async fn record_sync_failure(
        &self,
        account_id: i64,
        cursor: Option<String>,
        reason: String,
        fatal: bool,
        attention_threshold: i64,
    ) -> Result<()> {
        self.with_conn(move |conn, _vault| {
            conn.execute(
                r#"
                UPDATE accounts SET
                    sync_cursor = COALESCE(?, sync_cursor),
                    consecutive_failures = consecutive_failures + 1,
                    needs_attention = CASE
                        WHEN ? OR consecutive_failures + 1 >= ? THEN 1
                        ELSE needs_attention
                    END,
                    auth_failed = CASE WHEN ? THEN 1 ELSE auth_failed END,
                    last_failure_reason = ?
                WHERE id = ?
                "#,
                params![cursor, fatal, attention_threshold, fatal, reason, account_id],
            )?;
            Ok(())
        })
        .await
    }

    // ----- folders -----

    pub async fn find_or_create_folder(
        &self,
        account_id: i64,
        path: String,
        folder_type: FolderType,
    ) -> Result<Folder> {
        self.with_conn(move |conn, _vault| find_or_create_folder(conn, account_id, &path, folder_type))
            .await
    }

    pub async fn get_folder(&self, id: i64) -> Result<Option<Folder>> {
        self.with_conn(move |conn, _vault| {
            conn.query_row(
                "SELECT id, account_id, path, folder_type, unread_count FROM folders WHERE id = ?",
                params![id],
                |row| Ok(folder_from_row(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    pub async fn list_folders(&self, account_id: i64) -> Result<Vec<Folder>> {
        self.with_conn(move |conn, _vault| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, path, folder_type, unread_count FROM folders WHERE account_id = ? ORDER BY path",
            )?;
            let mut rows = stmt.query(params![account_id])?;
            let mut folders = Vec::new();
            while let Some(row) = rows.next()? {
                folders.push(folder_from_row(row)?);
            }
            Ok(folders)
        })
        .await
    }

    // ----- ingest -----

    /// Transactional ingest of one normalized message: resolve the
    /// folder, link or create the thread (reference headers first, then
    /// subject key), insert the row, recompute the thread's last message
    /// date, bump the unread counter. Re-delivery of the same
    /// (account, provider id) is a clean no-op.
    pub async fn ingest_message(
        &self,
        account_id: i64,
        record: MessageRecord,
    ) -> Result<IngestOutcome> {
        self.with_conn(move |conn, vault| {
            let tx = conn.transaction()?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM messages WHERE account_id = ? AND provider_message_id = ?",
                    params![account_id, record.provider_message_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(IngestOutcome::Duplicate);
            }

            let folder =
                find_or_create_folder(&tx, account_id, &record.folder_path, record.folder_type)?;

            // Reference linkage wins over the subject key so a renamed
            // reply still lands in its thread.
            let mut thread_id: Option<i64> = None;
            for reference in &record.references {
                let found: Option<i64> = tx
                    .query_row(
                        "SELECT thread_id FROM thread_refs WHERE account_id = ? AND ref_id = ?",
                        params![account_id, reference],
                        |row| row.get(0),
                    )
                    .optional()?;
                if found.is_some() {
                    thread_id = found;
                    break;
                }
            }

            let thread_id = match thread_id {
                Some(id) => id,
                None => {
                    let found: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM threads WHERE account_id = ? AND subject_key = ?",
                            params![account_id, record.thread_key],
                            |row| row.get(0),
                        )
                        .optional()?;
                    match found {
                        Some(id) => id,
                        None => {
                            tx.execute(
                                "INSERT INTO threads (account_id, subject_key, last_message_date) VALUES (?,?,?)",
                                params![account_id, record.thread_key, record.date_received],
                            )?;
                            tx.last_insert_rowid()
                        }
                    }
                }
            };

            let now = Utc::now();
            let subject_enc = vault.encrypt_str(&record.subject)?;
            let body_text_enc = record
                .body_text
                .as_deref()
                .map(|text| vault.encrypt_str(text))
                .transpose()?;
            let body_html_enc = record
                .body_html
                .as_deref()
                .map(|html| vault.encrypt_str(html))
                .transpose()?;
            let from_json = to_json(&record.from)?;
            let to_json_value = to_json(&record.to)?;
            let cc_json = to_json(&record.cc)?;
            let attachments_json = to_json(&record.attachments)?;

            tx.execute(
                r#"
                INSERT INTO messages (
                    account_id, folder_id, thread_id, provider_message_id,
                    subject_encrypted, from_json, to_json, cc_json, date_received,
                    body_text_encrypted, body_html_encrypted, attachments_json,
                    message_id_header, is_read, created_at, updated_at
                ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
                "#,
                params![
                    account_id,
                    folder.id,
                    thread_id,
                    record.provider_message_id,
                    subject_enc,
                    from_json,
                    to_json_value,
                    cc_json,
                    record.date_received,
                    body_text_enc,
                    body_html_enc,
                    attachments_json,
                    record.message_id_header,
                    record.is_read,
                    now,
                    now,
                ],
            )?;
            let message_id = tx.last_insert_rowid();

            if let Some(header) = &record.message_id_header {
                tx.execute(
                    "INSERT OR IGNORE INTO thread_refs (account_id, ref_id, thread_id) VALUES (?,?,?)",
                    params![account_id, header, thread_id],
                )?;
            }
            for reference in &record.references {
                tx.execute(
                    "INSERT OR IGNORE INTO thread_refs (account_id, ref_id, thread_id) VALUES (?,?,?)",
                    params![account_id, reference, thread_id],
                )?;
            }

            // Invariant: a thread's last_message_date is the max
            // date_received of its messages, whatever the arrival order.
            tx.execute(
                r#"
                UPDATE threads SET last_message_date =
                    (SELECT MAX(date_received) FROM messages WHERE thread_id = ?)
                WHERE id = ?
                "#,
                params![thread_id, thread_id],
            )?;

            if !record.is_read {
                tx.execute(
                    "UPDATE folders SET unread_count = unread_count + 1 WHERE id = ?",
                    params![folder.id],
                )?;
            }

            tx.commit()?;
            debug!(account_id, message_id, thread_id, "message ingested");
            Ok(IngestOutcome::Inserted {
                message_id,
                thread_id,
            })
        })
        .await
    }

    // ----- messages -----

    pub async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.with_conn(move |conn, vault| {
            let mut stmt = conn.prepare(&format!("{MESSAGE_SELECT} WHERE id = ?"))?;
            stmt.query_row(params![id], row_to_raw_message)
                .optional()?
                .map(|raw| raw.decrypt(vault))
                .transpose()
        })
        .await
    }

    pub async fn unclassified_message_ids(&self, account_id: i64) -> Result<Vec<i64>> {
        self.with_conn(move |conn, _vault| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id FROM messages
                WHERE account_id = ? AND ai_category_id IS NULL AND manual_category = 0
                ORDER BY id
                "#,
            )?;
            let ids = stmt
                .query_map(params![account_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
        .await
    }

    /// Writes a classification onto a message unless the user has pinned
    /// a category manually; manual overrides are permanent.
    pub async fn apply_classification(
        &self,
        message_id: i64,
        result: ClassificationResult,
    ) -> Result<bool> {
        self.with_conn(move |conn, _vault| {
            let explanation = serde_json::json!({
                "explanation": result.explanation,
                "factors": result.factors,
                "suggested_action": result.suggested_action.as_str(),
            })
            .to_string();
            let changed = conn.execute(
                r#"
                UPDATE messages SET
                    ai_category_id = ?,
                    ai_confidence = ?,
                    ai_explanation = ?,
                    needs_human_review = ?,
                    updated_at = ?
                WHERE id = ? AND manual_category = 0
                "#,
                params![
                    result.category_id,
                    result.confidence,
                    explanation,
                    result.needs_human_review,
                    Utc::now(),
                    message_id,
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn set_manual_category(&self, message_id: i64, category_id: i64) -> Result<()> {
        self.with_conn(move |conn, _vault| {
            conn.execute(
                r#"
                UPDATE messages SET
                    ai_category_id = ?,
                    manual_category = 1,
                    needs_human_review = 0,
                    updated_at = ?
                WHERE id = ?
                "#,
                params![category_id, Utc::now(), message_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_thread(&self, id: i64) -> Result<Option<Thread>> {
        self.with_conn(move |conn, _vault| {
            conn.query_row(
                "SELECT id, account_id, subject_key, last_message_date FROM threads WHERE id = ?",
                params![id],
                |row| {
                    Ok(Thread {
                        id: row.get(0)?,
                        account_id: row.get(1)?,
                        subject_key: row.get(2)?,
                        last_message_date: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(StorageError::from)
        })
        .await
    }

    // ----- categories -----

    pub async fn find_or_create_category(
        &self,
        user_id: Option<i64>,
        name: String,
        priority: i64,
    ) -> Result<Category> {
        self.with_conn(move |conn, _vault| {
            let existing = conn
                .query_row(
                    "SELECT id, user_id, parent_id, name, priority FROM categories WHERE COALESCE(user_id, 0) = COALESCE(?, 0) AND name = ?",
                    params![user_id, name],
                    category_from_row,
                )
                .optional()?;
            if let Some(category) = existing {
                return Ok(category);
            }
            conn.execute(
                "INSERT INTO categories (user_id, name, priority) VALUES (?,?,?)",
                params![user_id, name, priority],
            )?;
            let id = conn.last_insert_rowid();
            Ok(Category {
                id,
                user_id,
                parent_id: None,
                name,
                priority,
            })
        })
        .await
    }

    pub async fn get_category(&self, id: i64) -> Result<Option<Category>> {
        self.with_conn(move |conn, _vault| {
            conn.query_row(
                "SELECT id, user_id, parent_id, name, priority FROM categories WHERE id = ?",
                params![id],
                category_from_row,
            )
            .optional()
            .map_err(StorageError::from)
        })
        .await
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        self.with_conn(|conn, _vault| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, parent_id, name, priority FROM categories ORDER BY priority, id",
            )?;
            let categories = stmt
                .query_map([], category_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(categories)
        })
        .await
    }

    // ----- rules -----

    /// At most one rule per (user, match type, match value); a second
    /// write replaces the target and weights.
    pub async fn upsert_rule(&self, new: NewRule) -> Result<LearnedRule> {
        self.with_conn(move |conn, _vault| {
            let match_value = new.match_value.trim().to_lowercase();
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM learned_rules WHERE COALESCE(user_id, 0) = COALESCE(?, 0) AND match_type = ? AND match_value = ?",
                    params![new.user_id, new.match_type.as_str(), match_value],
                    |row| row.get(0),
                )
                .optional()?;

            let id = match existing {
                Some(id) => {
                    conn.execute(
                        r#"
                        UPDATE learned_rules SET
                            account_id = ?,
                            target_category_id = ?,
                            target_folder_id = ?,
                            action = ?,
                            priority = ?,
                            confidence_boost = ?
                        WHERE id = ?
                        "#,
                        params![
                            new.account_id,
                            new.target_category_id,
                            new.target_folder_id,
                            new.action.as_str(),
                            new.priority,
                            new.confidence_boost,
                            id,
                        ],
                    )?;
                    id
                }
                None => {
                    conn.execute(
                        r#"
                        INSERT INTO learned_rules (
                            user_id, account_id, match_type, match_value,
                            target_category_id, target_folder_id, action, priority, confidence_boost
                        ) VALUES (?,?,?,?,?,?,?,?,?)
                        "#,
                        params![
                            new.user_id,
                            new.account_id,
                            new.match_type.as_str(),
                            match_value,
                            new.target_category_id,
                            new.target_folder_id,
                            new.action.as_str(),
                            new.priority,
                            new.confidence_boost,
                        ],
                    )?;
                    conn.last_insert_rowid()
                }
            };

            let rule = conn.query_row(
                &format!("{RULE_SELECT} WHERE id = ?"),
                params![id],
                rule_from_row,
            )?;
            Ok(rule)
        })
        .await
    }

    /// Rules scoped to the account plus the global ones, ascending
    /// priority so the first full match wins.
    pub async fn rules_for_account(&self, account_id: i64) -> Result<Vec<LearnedRule>> {
        self.with_conn(move |conn, _vault| {
            let mut stmt = conn.prepare(&format!(
                "{RULE_SELECT} WHERE account_id = ? OR account_id IS NULL ORDER BY priority, id"
            ))?;
            let rules = stmt
                .query_map(params![account_id], rule_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rules)
        })
        .await
    }

    // ----- sender history -----

    pub async fn record_sender_category(
        &self,
        sender_email: String,
        category_id: i64,
        manual: bool,
    ) -> Result<()> {
        self.with_conn(move |conn, _vault| {
            conn.execute(
                "INSERT INTO sender_history (sender_email, category_id, manual, created_at) VALUES (?,?,?,?)",
                params![sender_email.trim().to_lowercase(), category_id, manual, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn sender_history(
        &self,
        sender_email: String,
        limit: usize,
    ) -> Result<Vec<SenderHistoryEntry>> {
        self.with_conn(move |conn, _vault| {
            let mut stmt = conn.prepare(
                r#"
                SELECT category_id, manual FROM sender_history
                WHERE sender_email = ?
                ORDER BY id DESC
                LIMIT ?
                "#,
            )?;
            let entries = stmt
                .query_map(
                    params![sender_email.trim().to_lowercase(), limit as i64],
                    |row| {
                        Ok(SenderHistoryEntry {
                            category_id: row.get(0)?,
                            manual: row.get(1)?,
                        })
                    },
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}

const ACCOUNT_SELECT: &str = r#"
    SELECT id, provider, email, credentials_encrypted, imap_host, imap_port,
           sync_cursor, sync_interval_minutes, privacy, last_synced_at,
           consecutive_failures, needs_attention, auth_failed
    FROM accounts
"#;

const MESSAGE_SELECT: &str = r#"
    SELECT id, account_id, folder_id, thread_id, provider_message_id,
           subject_encrypted, from_json, to_json, cc_json, date_received,
           body_text_encrypted, body_html_encrypted, attachments_json,
           ai_category_id, ai_confidence, is_read, is_hidden, never_show,
           manual_category
    FROM messages
"#;

const RULE_SELECT: &str = r#"
    SELECT id, user_id, account_id, match_type, match_value,
           target_category_id, target_folder_id, action, priority, confidence_boost
    FROM learned_rules
"#;

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_str(value).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn account_by_id(conn: &Connection, id: i64) -> Result<Option<Account>> {
    let mut stmt = conn.prepare(&format!("{ACCOUNT_SELECT} WHERE id = ?"))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(account_from_row(row)?)),
        None => Ok(None),
    }
}

fn account_from_row(row: &rusqlite::Row<'_>) -> Result<Account> {
    let provider_raw: String = row.get(1)?;
    let provider = Provider::from_str(&provider_raw)
        .ok_or_else(|| StorageError::UnknownProvider(provider_raw.clone()))?;
    let privacy_raw: String = row.get(8)?;
    Ok(Account {
        id: row.get(0)?,
        provider,
        email: row.get(2)?,
        credentials_encrypted: row.get(3)?,
        imap_host: row.get(4)?,
        imap_port: row.get::<_, Option<i64>>(5)?.map(|port| port as u16),
        sync_cursor: row.get(6)?,
        sync_interval_minutes: row.get(7)?,
        privacy: PrivacyLevel::from_str(&privacy_raw),
        last_synced_at: row.get(9)?,
        consecutive_failures: row.get(10)?,
        needs_attention: row.get(11)?,
        auth_failed: row.get(12)?,
    })
}

fn folder_from_row(row: &rusqlite::Row<'_>) -> Result<Folder> {
    let folder_type_raw: String = row.get(3)?;
    Ok(Folder {
        id: row.get(0)?,
        account_id: row.get(1)?,
        path: row.get(2)?,
        folder_type: FolderType::parse(&folder_type_raw),
        unread_count: row.get(4)?,
    })
}

fn find_or_create_folder(
    conn: &Connection,
    account_id: i64,
    path: &str,
    folder_type: FolderType,
) -> Result<Folder> {
    let existing = conn
        .query_row(
            "SELECT id, account_id, path, folder_type, unread_count FROM folders WHERE account_id = ? AND path = ?",
            params![account_id, path],
            |row| Ok(folder_from_row(row)),
        )
        .optional()?;
    if let Some(folder) = existing {
        return folder;
    }
    conn.execute(
        "INSERT INTO folders (account_id, path, folder_type) VALUES (?,?,?)",
        params![account_id, path, folder_type.as_str()],
    )?;
    Ok(Folder {
        id: conn.last_insert_rowid(),
        account_id,
        path: path.to_string(),
        folder_type,
        unread_count: 0,
    })
}

fn category_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        user_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        priority: row.get(4)?,
    })
}

fn rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LearnedRule> {
    let match_type_raw: String = row.get(3)?;
    let action_raw: String = row.get(7)?;
    Ok(LearnedRule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        account_id: row.get(2)?,
        match_type: RuleMatchType::from_str(&match_type_raw).unwrap_or(RuleMatchType::SenderExact),
        match_value: row.get(4)?,
        target_category_id: row.get(5)?,
        target_folder_id: row.get(6)?,
        action: RuleAction::from_str(&action_raw),
        priority: row.get(8)?,
        confidence_boost: row.get(9)?,
    })
}

/// Message row before decryption; split out so row mapping stays inside
/// rusqlite's error type while decryption uses the storage error.
struct RawMessage {
    id: i64,
    account_id: i64,
    folder_id: i64,
    thread_id: i64,
    provider_message_id: String,
    subject_encrypted: String,
    from_json: String,
    to_json: String,
    cc_json: String,
    date_received: DateTime<Utc>,
    body_text_encrypted: Option<String>,
    body_html_encrypted: Option<String>,
    attachments_json: String,
    ai_category_id: Option<i64>,
    ai_confidence: Option<f64>,
    is_read: bool,
    is_hidden: bool,
    never_show: bool,
    manual_category: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest;
    use crate::models::{
        ClassificationFactor, ClassificationResult, FetchedMessage, MailAddress, RuleAction,
        SyncCursor,
    };
    use chrono::Duration;
    use std::sync::Arc;

    async fn setup() -> (Storage, i64) {
        let vault = Arc::new(Vault::from_bytes(vec![3u8; 32]).unwrap());
        let storage = Storage::open_in_memory(vault).unwrap();
        let account = storage
            .create_account(NewAccount {
                provider: Provider::GenericImap,
                email: "user@example.com".into(),
                credentials_encrypted: "blob".into(),
                imap_host: Some("imap.example.com".into()),
                imap_port: Some(993),
                sync_interval_minutes: 15,
                privacy: PrivacyLevel::Full,
            })
            .await
            .unwrap();
        (storage, account.id)
    }

    fn fetched(uid: u32, subject: &str, date: DateTime<Utc>) -> FetchedMessage {
        FetchedMessage {
            provider_message_id: uid.to_string(),
            folder_path: "INBOX".into(),
            subject: subject.into(),
            from: MailAddress::bare("sender@example.com"),
            to: vec![MailAddress::bare("user@example.com")],
            cc: Vec::new(),
            date_received: date,
            body_text: Some("hello".into()),
            body_html: None,
            attachments: Vec::new(),
            is_read: false,
            message_id_header: Some(format!("<{uid}@example.com>")),
            references: Vec::new(),
            watermark: SyncCursor::UidHighWater { uid },
        }
    }

    fn record(uid: u32, subject: &str, date: DateTime<Utc>) -> MessageRecord {
        ingest::normalize(fetched(uid, subject, date), PrivacyLevel::Full)
    }

    fn classification(category_id: i64, confidence: f64) -> ClassificationResult {
        ClassificationResult {
            category_id: Some(category_id),
            confidence,
            explanation: "test".into(),
            factors: vec![ClassificationFactor {
                label: "ai:test".into(),
                weight: confidence,
            }],
            suggested_action: RuleAction::Route,
            needs_human_review: false,
        }
    }

    #[tokio::test]
    async fn redelivery_of_same_provider_id_is_a_noop() {
        let (storage, account_id) = setup().await;
        let now = Utc::now();

        let first = storage
            .ingest_message(account_id, record(1, "Hello", now))
            .await
            .unwrap();
        assert!(matches!(first, IngestOutcome::Inserted { .. }));

        let second = storage
            .ingest_message(account_id, record(1, "Hello", now))
            .await
            .unwrap();
        assert!(matches!(second, IngestOutcome::Duplicate));

        // One row, one unread bump.
        let folders = storage.list_folders(account_id).await.unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].unread_count, 1);
        assert_eq!(
            storage.unclassified_message_ids(account_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn thread_date_is_max_regardless_of_arrival_order() {
        let (storage, account_id) = setup().await;
        let now = Utc::now();

        // Newest reply arrives first, the original afterwards.
        let newest = storage
            .ingest_message(account_id, record(2, "Re: Budget", now))
            .await
            .unwrap();
        let IngestOutcome::Inserted { thread_id, .. } = newest else {
            panic!("expected insert");
        };
        let old = storage
            .ingest_message(account_id, record(1, "Budget", now - Duration::hours(5)))
            .await
            .unwrap();
        let IngestOutcome::Inserted {
            thread_id: old_thread,
            ..
        } = old
        else {
            panic!("expected insert");
        };
        assert_eq!(thread_id, old_thread);

        let thread = storage.get_thread(thread_id).await.unwrap().unwrap();
        assert_eq!(
            thread.last_message_date.timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn renamed_reply_links_through_references() {
        let (storage, account_id) = setup().await;
        let now = Utc::now();

        let original = storage
            .ingest_message(account_id, record(1, "Planning", now))
            .await
            .unwrap();
        let IngestOutcome::Inserted { thread_id, .. } = original else {
            panic!("expected insert");
        };

        let mut reply = fetched(2, "Totally different subject", now + Duration::hours(1));
        reply.references = vec!["<1@example.com>".into()];
        let reply = ingest::normalize(reply, PrivacyLevel::Full);
        let outcome = storage.ingest_message(account_id, reply).await.unwrap();
        let IngestOutcome::Inserted {
            thread_id: reply_thread,
            ..
        } = outcome
        else {
            panic!("expected insert");
        };
        assert_eq!(thread_id, reply_thread);
    }

    #[tokio::test]
    async fn partial_batch_keeps_durable_prefix_and_watermark() {
        let (storage, account_id) = setup().await;
        // Abort the insert of uid 8 to model a mid-batch write failure.
        storage
            .with_conn(|conn, _vault| {
                conn.execute_batch(
                    r#"
                    CREATE TRIGGER poison BEFORE INSERT ON messages
                    WHEN NEW.provider_message_id = '8'
                    BEGIN SELECT RAISE(ABORT, 'disk full'); END;
                    "#,
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let now = Utc::now();
        let batch: Vec<FetchedMessage> = (1..=10)
            .map(|uid| fetched(uid, &format!("msg {uid}"), now))
            .collect();
        let report =
            ingest::ingest_batch(&storage, account_id, PrivacyLevel::Full, batch).await;

        assert!(report.is_partial());
        assert_eq!(report.inserted.len(), 7);
        assert_eq!(
            report.last_watermark,
            Some(SyncCursor::UidHighWater { uid: 7 })
        );

        // Retrying from the watermark refetches 8..10 only; the durable
        // prefix dedups cleanly even if the provider resends it.
        let retry: Vec<FetchedMessage> = (7..=10)
            .map(|uid| fetched(uid, &format!("msg {uid}"), now))
            .collect();
        storage
            .with_conn(|conn, _vault| {
                conn.execute_batch("DROP TRIGGER poison")?;
                Ok(())
            })
            .await
            .unwrap();
        let report = ingest::ingest_batch(&storage, account_id, PrivacyLevel::Full, retry).await;
        assert!(!report.is_partial());
        assert_eq!(report.inserted.len(), 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(
            storage.unclassified_message_ids(account_id).await.unwrap().len(),
            10
        );
    }

    #[tokio::test]
    async fn manual_category_is_never_overwritten() {
        let (storage, account_id) = setup().await;
        let category = storage
            .find_or_create_category(None, "Receipts".into(), 10)
            .await
            .unwrap();
        let pinned = storage
            .find_or_create_category(None, "Personal".into(), 5)
            .await
            .unwrap();

        let outcome = storage
            .ingest_message(account_id, record(1, "Order", Utc::now()))
            .await
            .unwrap();
        let IngestOutcome::Inserted { message_id, .. } = outcome else {
            panic!("expected insert");
        };

        storage
            .set_manual_category(message_id, pinned.id)
            .await
            .unwrap();
        let applied = storage
            .apply_classification(message_id, classification(category.id, 0.9))
            .await
            .unwrap();
        assert!(!applied);

        let message = storage.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(message.ai_category_id, Some(pinned.id));
        assert!(message.manual_category);
        assert!(storage
            .unclassified_message_ids(account_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn failure_streak_flags_attention_and_success_clears_it() {
        let (storage, account_id) = setup().await;
        for _ in 0..3 {
            storage
                .record_sync_failure(account_id, None, "timeout".into(), false, 3)
                .await
                .unwrap();
        }
        let account = storage.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.consecutive_failures, 3);
        assert!(account.needs_attention);
        assert!(!account.auth_failed);

        let cursor = SyncCursor::UidHighWater { uid: 42 }.encode();
        storage
            .record_sync_success(account_id, Some(cursor.clone()))
            .await
            .unwrap();
        let account = storage.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.consecutive_failures, 0);
        assert!(!account.needs_attention);
        assert_eq!(account.sync_cursor, Some(cursor));
        assert!(account.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn fatal_failure_sets_auth_failed_and_keeps_cursor() {
        let (storage, account_id) = setup().await;
        let cursor = SyncCursor::Timestamp { at: Utc::now() }.encode();
        storage
            .record_sync_success(account_id, Some(cursor.clone()))
            .await
            .unwrap();
        storage
            .record_sync_failure(account_id, None, "invalid_grant".into(), true, 3)
            .await
            .unwrap();
        let account = storage.get_account(account_id).await.unwrap().unwrap();
        assert!(account.auth_failed);
        assert!(account.needs_attention);
        assert_eq!(account.sync_cursor, Some(cursor));
    }

    #[tokio::test]
    async fn message_columns_are_encrypted_at_rest() {
        let (storage, account_id) = setup().await;
        let outcome = storage
            .ingest_message(account_id, record(1, "Very secret subject", Utc::now()))
            .await
            .unwrap();
        let IngestOutcome::Inserted { message_id, .. } = outcome else {
            panic!("expected insert");
        };
        let raw: (String, Option<String>) = storage
            .with_conn(move |conn, _vault| {
                conn.query_row(
                    "SELECT subject_encrypted, body_text_encrypted FROM messages WHERE id = ?",
                    params![message_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(StorageError::from)
            })
            .await
            .unwrap();
        assert!(!raw.0.contains("secret"));
        assert!(!raw.1.unwrap().contains("hello"));

        let message = storage.get_message(message_id).await.unwrap().unwrap();
        assert_eq!(message.subject, "Very secret subject");
        assert_eq!(message.body_text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn sender_history_is_capped_and_newest_first() {
        let (storage, _account_id) = setup().await;
        for n in 1..=30 {
            let category = storage
                .find_or_create_category(None, format!("cat-{n}"), n)
                .await
                .unwrap();
            storage
                .record_sender_category("Sender@Example.com".into(), category.id, false)
                .await
                .unwrap();
        }
        let history = storage
            .sender_history("sender@example.com".into(), 20)
            .await
            .unwrap();
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].category_id, 30);
    }
}

fn row_to_raw_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        account_id: row.get(1)?,
        folder_id: row.get(2)?,
        thread_id: row.get(3)?,
        provider_message_id: row.get(4)?,
        subject_encrypted: row.get(5)?,
        from_json: row.get(6)?,
        to_json: row.get(7)?,
        cc_json: row.get(8)?,
        date_received: row.get(9)?,
        body_text_encrypted: row.get(10)?,
        body_html_encrypted: row.get(11)?,
        attachments_json: row.get(12)?,
        ai_category_id: row.get(13)?,
        ai_confidence: row.get(14)?,
        is_read: row.get(15)?,
        is_hidden: row.get(16)?,
        never_show: row.get(17)?,
        manual_category: row.get(18)?,
    })
}

impl RawMessage {
    fn decrypt(self, vault: &Vault) -> Result<Message> {
        Ok(Message {
            id: self.id,
            account_id: self.account_id,
            folder_id: self.folder_id,
            thread_id: self.thread_id,
            provider_message_id: self.provider_message_id,
            subject: vault.decrypt_str(&self.subject_encrypted)?,
            from: from_json(&self.from_json)?,
            to: from_json(&self.to_json)?,
            cc: from_json(&self.cc_json)?,
            date_received: self.date_received,
            body_text: self
                .body_text_encrypted
                .as_deref()
                .map(|value| vault.decrypt_str(value))
                .transpose()?,
            body_html: self
                .body_html_encrypted
                .as_deref()
                .map(|value| vault.decrypt_str(value))
                .transpose()?,
            attachments: from_json(&self.attachments_json)?,
            ai_category_id: self.ai_category_id,
            ai_confidence: self.ai_confidence,
            is_read: self.is_read,
            is_hidden: self.is_hidden,
            never_show: self.never_show,
            manual_category: self.manual_category,
        })
    }
}
