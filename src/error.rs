use crate::providers::ProviderError;
use crate::storage::StorageError;
use crate::vault::VaultError;
use thiserror::Error;

/// How a failed job should be treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Retried with backoff; the next scheduler tick will pick it up.
    Transient,
    /// The account cannot make progress until an operator intervenes
    /// (re-auth, new credentials). Never retried automatically.
    AccountFatal,
    /// Affects one message only; logged and skipped.
    PerMessage,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("classification provider error: {0}")]
    ClassificationProvider(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn retryability(&self) -> Retryability {
        match self {
            EngineError::Provider(err) => err.retryability(),
            // Credential blobs that no longer decrypt are unusable until
            // the account is reconnected.
            EngineError::Vault(VaultError::Decryption) => Retryability::AccountFatal,
            EngineError::Vault(_) => Retryability::Transient,
            EngineError::Storage(_) => Retryability::Transient,
            // The classifier falls back to rule-only filing, so a provider
            // outage never blocks the message.
            EngineError::ClassificationProvider(_) => Retryability::Transient,
            EngineError::Config(_) => Retryability::AccountFatal,
            EngineError::Other(_) => Retryability::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_failure_is_account_fatal() {
        let err = EngineError::Vault(VaultError::Decryption);
        assert_eq!(err.retryability(), Retryability::AccountFatal);
    }

    #[test]
    fn auth_failure_is_account_fatal() {
        let err = EngineError::Provider(ProviderError::Authentication("denied".into()));
        assert_eq!(err.retryability(), Retryability::AccountFatal);
    }

    #[test]
    fn network_failure_is_transient() {
        let err = EngineError::Provider(ProviderError::Network("timeout".into()));
        assert_eq!(err.retryability(), Retryability::Transient);
    }
}
