use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::classify::ai::{scorer_from_config, AiScorer, DisabledScorer};
use crate::classify::Classifier;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::queue::{JobHandler, JobPayload, JobQueue, Lane};
use crate::storage::Storage;
use crate::sync::SyncOrchestrator;
use crate::vault::Vault;

/// Priority given to the system Quarantine category. High value: it only
/// wins when nothing else is confident enough.
const QUARANTINE_PRIORITY: i64 = 1000;

struct EngineCore {
    storage: Storage,
    orchestrator: SyncOrchestrator,
    classifier: Classifier,
    // Set once after the queue starts; the handler needs it to fan out
    // classify jobs for freshly ingested messages.
    queue: OnceCell<JobQueue>,
}

impl EngineCore {
    /// Enqueues a classify job for every message of the account that has
    /// no classification yet. Sweeping the store instead of carrying ids
    /// from the sync outcome means messages that landed durably before a
    /// mid-batch failure still get classified in this run.
    async fn enqueue_unclassified(&self, account_id: i64) -> Result<usize, EngineError> {
        let queue = match self.queue.get() {
            Some(queue) => queue,
            None => return Ok(0),
        };
        let message_ids = self.storage.unclassified_message_ids(account_id).await?;
        let enqueued = message_ids.len();
        for message_id in message_ids {
            queue.enqueue(
                Lane::Classify,
                JobPayload::ClassifyMessage {
                    account_id,
                    message_id,
                },
            );
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl JobHandler for EngineCore {
    async fn handle(&self, payload: &JobPayload) -> Result<(), EngineError> {
        match payload {
            JobPayload::SyncAccount { account_id } => {
                let result = self.orchestrator.sync_account(*account_id).await;
                // Sweep after the attempt regardless of how it ended: a
                // partial failure has already committed some rows and they
                // must not wait for the next successful sync.
                self.enqueue_unclassified(*account_id).await?;
                result.map(|_| ())
            }
            JobPayload::ClassifyMessage {
                account_id,
                message_id,
            } => {
                let account = self
                    .storage
                    .get_account(*account_id)
                    .await?
                    .ok_or_else(|| EngineError::Other(format!("account {account_id} gone")))?;
                let _ = self.classifier.classify_message(&account, *message_id).await?;
                Ok(())
            }
        }
    }
}

/// The running engine: scheduler tick, job queue, sync orchestrator and
/// classifier wired together over one store.
pub struct Engine {
    core: Arc<EngineCore>,
    queue: JobQueue,
    config: EngineConfig,
}

impl Engine {
    pub async fn start(
        config: EngineConfig,
        storage: Storage,
        vault: Arc<Vault>,
    ) -> Result<Self, EngineError> {
        let scorer: Arc<dyn AiScorer> = match &config.ai {
            Some(ai) => Arc::from(
                scorer_from_config(ai)
                    .map_err(|err| EngineError::Config(format!("ai scorer: {err}")))?,
            ),
            None => {
                info!("no ai provider configured, classification is rule-only");
                Arc::new(DisabledScorer)
            }
        };

        let quarantine = storage
            .find_or_create_category(None, "Quarantine".into(), QUARANTINE_PRIORITY)
            .await?;

        let orchestrator =
            SyncOrchestrator::new(storage.clone(), vault.clone(), config.sync_config());
        let classifier = Classifier::new(
            storage.clone(),
            scorer,
            config.classify.clone(),
            quarantine.id,
        );

        let core = Arc::new(EngineCore {
            storage,
            orchestrator,
            classifier,
            queue: OnceCell::new(),
        });

        let queue = JobQueue::start(config.queue.clone(), core.clone());
        let _ = core.queue.set(queue.clone());

        let engine = Self {
            core,
            queue,
            config,
        };
        engine.spawn_scheduler();
        Ok(engine)
    }

    fn spawn_scheduler(&self) {
        let core = self.core.clone();
        let queue = self.queue.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        self.queue
            .spawn_ticker(Duration::from_secs(self.config.tick_secs), move || {
                let _ = tx.send(());
            });
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                match core.orchestrator.due_accounts().await {
                    Ok(accounts) => {
                        for account in accounts {
                            queue.enqueue(
                                Lane::Sync,
                                JobPayload::SyncAccount {
                                    account_id: account.id,
                                },
                            );
                        }
                    }
                    Err(err) => warn!(error = %err, "due-check failed"),
                }
            }
        });
    }

    /// Manual sync trigger, same path as the scheduler. Collapses with
    /// any in-flight sync for the account.
    pub fn trigger_sync(&self, account_id: i64) {
        self.queue
            .enqueue(Lane::Sync, JobPayload::SyncAccount { account_id });
    }

    /// Enqueues classification for everything not yet classified, used
    /// at startup to pick up work a previous run left behind.
    pub async fn enqueue_backlog(&self) -> Result<usize, EngineError> {
        let mut enqueued = 0;
        for account in self.core.storage.list_accounts().await? {
            enqueued += self.core.enqueue_unclassified(account.id).await?;
        }
        Ok(enqueued)
    }

    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.queue
            .shutdown(Duration::from_secs(self.config.shutdown_drain_secs))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassifyConfig;
    use crate::ingest;
    use crate::models::{
        Credentials, FetchedMessage, MailAddress, PrivacyLevel, Provider, SyncCursor,
    };
    use crate::queue::QueueConfig;
    use crate::storage::NewAccount;
    use crate::sync::SyncConfig;
    use chrono::{TimeZone, Utc};

    async fn core_with_one_unclassified_message() -> (Arc<EngineCore>, Storage, i64, i64) {
        let vault = Arc::new(Vault::from_bytes(vec![9u8; 32]).unwrap());
        let storage = Storage::open_in_memory(vault.clone()).unwrap();
        let credentials = Credentials::Password {
            username: "user@example.com".into(),
            password: "secret".into(),
        };
        let blob = vault
            .encrypt_str(&serde_json::to_string(&credentials).unwrap())
            .unwrap();
        let account = storage
            .create_account(NewAccount {
                provider: Provider::GenericImap,
                email: "user@example.com".into(),
                credentials_encrypted: blob,
                imap_host: Some("imap.example.com".into()),
                imap_port: Some(993),
                sync_interval_minutes: 15,
                privacy: PrivacyLevel::Full,
            })
            .await
            .unwrap();

        let report = ingest::ingest_batch(
            &storage,
            account.id,
            PrivacyLevel::Full,
            vec![FetchedMessage {
                provider_message_id: "1".into(),
                folder_path: "INBOX".into(),
                subject: "newsletter".into(),
                from: MailAddress::bare("news@example.com"),
                to: vec![MailAddress::bare("user@example.com")],
                cc: Vec::new(),
                date_received: Utc.with_ymd_and_hms(2026, 8, 20, 10, 0, 0).unwrap(),
                body_text: Some("hello".into()),
                body_html: None,
                attachments: Vec::new(),
                is_read: false,
                message_id_header: None,
                references: Vec::new(),
                watermark: SyncCursor::UidHighWater { uid: 1 },
            }],
        )
        .await;
        assert!(report.failure.is_none());
        let message_id = report.inserted[0];

        let quarantine = storage
            .find_or_create_category(None, "Quarantine".into(), QUARANTINE_PRIORITY)
            .await
            .unwrap();
        let orchestrator =
            SyncOrchestrator::new(storage.clone(), vault.clone(), SyncConfig::default());
        let classifier = Classifier::new(
            storage.clone(),
            Arc::new(DisabledScorer),
            ClassifyConfig::default(),
            quarantine.id,
        );
        let core = Arc::new(EngineCore {
            storage: storage.clone(),
            orchestrator,
            classifier,
            queue: OnceCell::new(),
        });
        (core, storage, account.id, message_id)
    }

    fn test_queue_config() -> QueueConfig {
        QueueConfig {
            sync_concurrency: 1,
            classify_concurrency: 2,
            sync_rate_per_minute: 60_000,
            max_attempts: 2,
            backoff_base_secs: 0,
            backoff_max_secs: 0,
            job_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn unclassified_sweep_drains_messages_left_by_a_failed_sync() {
        let (core, storage, account_id, message_id) = core_with_one_unclassified_message().await;
        let queue = JobQueue::start(test_queue_config(), core.clone());
        let _ = core.queue.set(queue.clone());

        // The message is durable but no classify job was ever carried for
        // it; the sweep finds it from the store alone.
        let enqueued = core.enqueue_unclassified(account_id).await.unwrap();
        assert_eq!(enqueued, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let message = storage.get_message(message_id).await.unwrap().unwrap();
        assert!(message.ai_category_id.is_some());

        // Once classified the sweep has nothing left to pick up.
        let enqueued = core.enqueue_unclassified(account_id).await.unwrap();
        assert_eq!(enqueued, 0);
        queue.shutdown(Duration::from_secs(2)).await;
    }
}
