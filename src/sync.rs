use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::error::{EngineError, Retryability};
use crate::ingest;
use crate::models::{Account, Credentials};
use crate::providers::{adapter_for, AdapterConfig, MailProvider, ProviderError};
use crate::storage::{Storage, StorageError};
use crate::vault::Vault;

/// What one completed sync pass produced. `new_message_ids` is what the
/// caller enqueues for classification, only ever after the rows are
/// durable. A pass that fails partway through surfaces as an error, with
/// the durable prefix recorded on the account row.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub new_message_ids: Vec<i64>,
    pub duplicates: usize,
}

/// A failed sync pass plus the cursor the account should resume from, if
/// part of the batch landed durably before the failure. Recorded exactly
/// once, at the `sync_account` boundary.
struct SyncFailure {
    error: EngineError,
    cursor: Option<String>,
}

impl From<EngineError> for SyncFailure {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            cursor: None,
        }
    }
}

impl From<ProviderError> for SyncFailure {
    fn from(error: ProviderError) -> Self {
        EngineError::from(error).into()
    }
}

impl From<StorageError> for SyncFailure {
    fn from(error: StorageError) -> Self {
        EngineError::from(error).into()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub adapter: AdapterConfig,
    /// Consecutive failures before the account is flagged for an
    /// operator.
    pub attention_threshold: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            attention_threshold: 3,
        }
    }
}

struct Inner {
    storage: Storage,
    vault: Arc<Vault>,
    config: SyncConfig,
    /// Account ids with a sync currently running. Guards the
    /// one-sync-per-account invariant across overlapping ticks and manual
    /// triggers.
    in_flight: parking_lot::Mutex<HashSet<i64>>,
}

/// Per-account sync driver. Stateless between runs except for the
/// in-flight registry; all durable state lives on the account row.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

/// Releases the account's in-flight slot when the sync ends, on every
/// exit path.
struct InFlightGuard {
    inner: Arc<Inner>,
    account_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.account_id);
    }
}

impl SyncOrchestrator {
    pub fn new(storage: Storage, vault: Arc<Vault>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                vault,
                config,
                in_flight: parking_lot::Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Accounts whose interval has elapsed and which are not already
    /// syncing. Auth-failed accounts stay out until reconnected.
    pub async fn due_accounts(&self) -> Result<Vec<Account>, EngineError> {
        let now = Utc::now();
        let in_flight = self.inner.in_flight.lock().clone();
        let accounts = self.inner.storage.list_accounts().await?;
        Ok(accounts
            .into_iter()
            .filter(|account| account.is_due(now) && !in_flight.contains(&account.id))
            .collect())
    }

    /// Runs one sync for the account. Concurrent calls for the same
    /// account collapse: the second caller gets an empty outcome.
    pub async fn sync_account(&self, account_id: i64) -> Result<SyncOutcome, EngineError> {
        let _guard = match self.try_begin(account_id) {
            Some(guard) => guard,
            None => {
                debug!(account_id, "sync already in flight, skipping");
                return Ok(SyncOutcome::default());
            }
        };

        let account = self
            .inner
            .storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| EngineError::Other(format!("account {account_id} not found")))?;

        let span = tracing::info_span!("sync", account_id, run_id = %Uuid::new_v4());
        let result = match self.build_adapter(&account) {
            Ok(adapter) => {
                self.run_sync(&account, adapter.as_ref())
                    .instrument(span)
                    .await
            }
            Err(err) => Err(SyncFailure::from(err)),
        };

        self.finish(account_id, result).await
    }

    /// The single place a failed pass touches the account row: streak,
    /// attention flag and resume cursor all land here exactly once.
    async fn finish(
        &self,
        account_id: i64,
        result: Result<SyncOutcome, SyncFailure>,
    ) -> Result<SyncOutcome, EngineError> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(failure) => {
                let fatal = failure.error.retryability() == Retryability::AccountFatal;
                warn!(account_id, fatal, error = %failure.error, "sync failed");
                self.inner
                    .storage
                    .record_sync_failure(
                        account_id,
                        failure.cursor,
                        failure.error.to_string(),
                        fatal,
                        self.inner.config.attention_threshold,
                    )
                    .await?;
                Err(failure.error)
            }
        }
    }

    fn build_adapter(&self, account: &Account) -> Result<Box<dyn MailProvider>, EngineError> {
        let credentials = self.decrypt_credentials(account)?;
        Ok(adapter_for(account, credentials, &self.inner.config.adapter)?)
    }

    fn try_begin(&self, account_id: i64) -> Option<InFlightGuard> {
        let mut in_flight = self.inner.in_flight.lock();
        if !in_flight.insert(account_id) {
            return None;
        }
        Some(InFlightGuard {
            inner: self.inner.clone(),
            account_id,
        })
    }

    async fn run_sync(
        &self,
        account: &Account,
        adapter: &dyn MailProvider,
    ) -> Result<SyncOutcome, SyncFailure> {
        for remote in adapter.list_folders().await? {
            self.inner
                .storage
                .find_or_create_folder(account.id, remote.path, remote.folder_type)
                .await?;
        }

        let cursor = account.cursor();
        let batch = adapter.fetch_since(cursor.as_ref()).await?;
        let fetched = batch.messages.len();
        let report =
            ingest::ingest_batch(&self.inner.storage, account.id, account.privacy, batch.messages)
                .await;

        if let Some(err) = report.failure {
            // Part of the batch is durable. Hand the last ingested
            // watermark up as the resume cursor so the retry starts there
            // instead of refetching from the old cursor.
            return Err(SyncFailure {
                error: EngineError::Storage(err),
                cursor: report.last_watermark.map(|cursor| cursor.encode()),
            });
        }

        let next_cursor = batch.next_cursor.or(cursor).map(|cursor| cursor.encode());
        self.inner
            .storage
            .record_sync_success(account.id, next_cursor)
            .await?;

        info!(
            account_id = account.id,
            provider = account.provider.as_str(),
            fetched,
            inserted = report.inserted.len(),
            duplicates = report.duplicates,
            "sync completed"
        );
        Ok(SyncOutcome {
            new_message_ids: report.inserted,
            duplicates: report.duplicates,
        })
    }

    fn decrypt_credentials(&self, account: &Account) -> Result<Credentials, EngineError> {
        let plain = self.inner.vault.decrypt_str(&account.credentials_encrypted)?;
        serde_json::from_str(&plain)
            .map_err(|err| EngineError::Other(format!("credential blob is not valid: {err}")))
    }
}
