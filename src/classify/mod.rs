use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::models::{
    Account, Category, ClassificationFactor, ClassificationInput, ClassificationResult,
    LearnedRule, Message, PrivacyLevel, RuleAction,
};
use crate::storage::Storage;

pub mod ai;

use ai::{AiError, AiJudgment, AiScorer};

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ClassifyConfig {
    /// Below this final confidence the message goes to Quarantine with
    /// `needs_human_review` set.
    pub review_threshold: f64,
    /// Candidates within this band of the best confidence tie-break on
    /// category priority (lowest wins).
    pub tie_epsilon: f64,
    pub body_preview_chars: usize,
    pub sender_history_limit: usize,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.5,
            tie_epsilon: 0.05,
            body_preview_chars: 1200,
            sender_history_limit: 20,
        }
    }
}

/// Layered classifier: deterministic learned rules first, then the AI
/// scorer, then a merge that lets rules override category choice while
/// only adjusting (never replacing) AI confidence.
pub struct Classifier {
    storage: Storage,
    scorer: Arc<dyn AiScorer>,
    config: ClassifyConfig,
    quarantine_category_id: i64,
}

impl Classifier {
    pub fn new(
        storage: Storage,
        scorer: Arc<dyn AiScorer>,
        config: ClassifyConfig,
        quarantine_category_id: i64,
    ) -> Self {
        Self {
            storage,
            scorer,
            config,
            quarantine_category_id,
        }
    }

    pub async fn classify_message(
        &self,
        account: &Account,
        message_id: i64,
    ) -> Result<Option<ClassificationResult>, EngineError> {
        let message = match self.storage.get_message(message_id).await? {
            Some(message) => message,
            None => return Ok(None),
        };
        // A category the user set by hand is permanent.
        if message.manual_category {
            return Ok(None);
        }

        let rules = self.storage.rules_for_account(account.id).await?;
        let matched_rule = rules
            .iter()
            .find(|rule| rule.matches(&message.from.email, &message.subject))
            .cloned();

        let categories = self.storage.list_categories().await?;
        let input = self.build_input(account, &message).await?;

        let judgment = self.scorer.classify(&input, &categories).await;
        if let Err(err) = &judgment {
            warn!(message_id, error = %err, "ai scorer unavailable, degrading to rule-only");
        }

        let result = merge(
            matched_rule.as_ref(),
            judgment,
            &categories,
            &self.config,
            self.quarantine_category_id,
        );

        let applied = self.storage.apply_classification(message_id, result.clone()).await?;
        if applied {
            if let Some(category_id) = result.category_id {
                if category_id != self.quarantine_category_id {
                    self.storage
                        .record_sender_category(message.from.email.clone(), category_id, false)
                        .await?;
                }
            }
        }

        debug!(
            message_id,
            category = ?result.category_id,
            confidence = result.confidence,
            needs_review = result.needs_human_review,
            "message classified"
        );
        Ok(Some(result))
    }

    async fn build_input(
        &self,
        account: &Account,
        message: &Message,
    ) -> Result<ClassificationInput, EngineError> {
        let body_preview = match account.privacy {
            PrivacyLevel::Full => message.body_text.as_deref().map(|text| {
                text.chars()
                    .take(self.config.body_preview_chars)
                    .collect::<String>()
            }),
            PrivacyLevel::HeadersOnly | PrivacyLevel::BodyLocalOnly => None,
        };
        let sender_history = self
            .storage
            .sender_history(message.from.email.clone(), self.config.sender_history_limit)
            .await?;

        // Folder placement and read state are cheap signals the scorer
        // weighs: mail in spam reads differently from mail in inbox.
        let mut labels = Vec::new();
        if let Some(folder) = self.storage.get_folder(message.folder_id).await? {
            labels.push(folder.folder_type.as_str().to_string());
        }
        labels.push(if message.is_read { "read" } else { "unread" }.to_string());
        if message.is_hidden {
            labels.push("hidden".to_string());
        }

        Ok(ClassificationInput {
            subject: message.subject.clone(),
            sender: message.from.clone(),
            recipients: message
                .to
                .iter()
                .chain(message.cc.iter())
                .map(|address| address.email.clone())
                .collect(),
            body_preview,
            labels,
            has_attachments: !message.attachments.is_empty(),
            is_reply: message.subject.trim().to_lowercase().starts_with("re:"),
            sender_history,
        })
    }
}

/// Merges the rule pass and the AI judgment into the final result.
///
/// - A rule with a category target overrides the AI's category choice.
/// - A matching rule's boost adjusts the AI confidence, clamped to [0,1].
/// - AI failure degrades to rule-only filing with review flagged.
/// - Final confidence below the threshold routes to Quarantine.
pub fn merge(
    rule: Option<&LearnedRule>,
    judgment: Result<AiJudgment, AiError>,
    categories: &[Category],
    config: &ClassifyConfig,
    quarantine_category_id: i64,
) -> ClassificationResult {
    let boost = rule.map(|rule| rule.confidence_boost).unwrap_or(0.0);
    let mut factors = Vec::new();
    if let Some(rule) = rule {
        factors.push(ClassificationFactor {
            label: format!("rule:{}:{}", rule.match_type.as_str(), rule.match_value),
            weight: rule.confidence_boost,
        });
    }

    let mut needs_review = false;
    let (mut category_id, mut confidence, explanation) = match judgment {
        Ok(judgment) => {
            let picked = pick_candidate(&judgment, categories, config.tie_epsilon);
            for candidate in &judgment.candidates {
                factors.push(ClassificationFactor {
                    label: format!("ai:{}", candidate.category),
                    weight: candidate.confidence,
                });
            }
            let explanation = if judgment.explanation.is_empty() {
                "ai classification".to_string()
            } else {
                judgment.explanation.clone()
            };
            match picked {
                Some((category, ai_confidence)) => (Some(category.id), ai_confidence, explanation),
                None => {
                    needs_review = true;
                    (None, 0.0, explanation)
                }
            }
        }
        Err(err) => {
            needs_review = true;
            factors.push(ClassificationFactor {
                label: "ai_unavailable".to_string(),
                weight: 0.0,
            });
            let confidence = if rule.is_some() { 0.5 } else { 0.0 };
            (None, confidence, format!("rule-only (ai unavailable: {err})"))
        }
    };

    let mut suggested_action = RuleAction::Route;
    if let Some(rule) = rule {
        suggested_action = rule.action;
        // The deterministic target wins the category; the AI still
        // contributed the explanation and base confidence.
        if let Some(target) = rule.target_category_id {
            category_id = Some(target);
        }
    }

    confidence = (confidence + boost).clamp(0.0, 1.0);

    if confidence < config.review_threshold || category_id.is_none() {
        needs_review = true;
        category_id = Some(quarantine_category_id);
        suggested_action = RuleAction::Quarantine;
    }

    ClassificationResult {
        category_id,
        confidence,
        explanation,
        factors,
        suggested_action,
        needs_human_review: needs_review,
    }
}

/// Picks the winning candidate: best confidence, with category priority
/// breaking ties inside the epsilon band. Candidate names that match no
/// known category are ignored.
fn pick_candidate<'a>(
    judgment: &AiJudgment,
    categories: &'a [Category],
    epsilon: f64,
) -> Option<(&'a Category, f64)> {
    let mut known: Vec<(&Category, f64)> = judgment
        .candidates
        .iter()
        .filter_map(|candidate| {
            categories
                .iter()
                .find(|category| category.name.eq_ignore_ascii_case(&candidate.category))
                .map(|category| (category, candidate.confidence.clamp(0.0, 1.0)))
        })
        .collect();
    if known.is_empty() {
        return None;
    }
    let top = known
        .iter()
        .map(|(_, confidence)| *confidence)
        .fold(f64::MIN, f64::max);
    known.retain(|(_, confidence)| top - *confidence <= epsilon);
    known
        .into_iter()
        .min_by_key(|(category, _)| category.priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleMatchType;
    use ai::AiCandidate;

    fn category(id: i64, name: &str, priority: i64) -> Category {
        Category {
            id,
            user_id: None,
            parent_id: None,
            name: name.to_string(),
            priority,
        }
    }

    fn rule(target: Option<i64>, boost: f64) -> LearnedRule {
        LearnedRule {
            id: 1,
            user_id: None,
            account_id: None,
            match_type: RuleMatchType::SenderDomain,
            match_value: "bank.example".into(),
            target_category_id: target,
            target_folder_id: None,
            action: RuleAction::Route,
            priority: 10,
            confidence_boost: boost,
        }
    }

    fn judgment(candidates: Vec<(&str, f64)>) -> AiJudgment {
        AiJudgment {
            candidates: candidates
                .into_iter()
                .map(|(category, confidence)| AiCandidate {
                    category: category.to_string(),
                    confidence,
                })
                .collect(),
            explanation: "test".into(),
        }
    }

    const QUARANTINE: i64 = 99;

    fn config() -> ClassifyConfig {
        ClassifyConfig::default()
    }

    #[test]
    fn boost_adds_to_ai_confidence() {
        let categories = vec![category(7, "Banking", 10)];
        let result = merge(
            Some(&rule(Some(7), 0.3)),
            Ok(judgment(vec![("Banking", 0.6)])),
            &categories,
            &config(),
            QUARANTINE,
        );
        assert_eq!(result.category_id, Some(7));
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert!(!result.needs_human_review);
    }

    #[test]
    fn boosted_confidence_clamps_at_one() {
        let categories = vec![category(7, "Banking", 10)];
        let result = merge(
            Some(&rule(Some(7), 0.6)),
            Ok(judgment(vec![("Banking", 0.8)])),
            &categories,
            &config(),
            QUARANTINE,
        );
        assert!((result.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn low_confidence_routes_to_quarantine() {
        let categories = vec![category(3, "Newsletters", 50)];
        let result = merge(
            None,
            Ok(judgment(vec![("Newsletters", 0.2)])),
            &categories,
            &config(),
            QUARANTINE,
        );
        assert_eq!(result.category_id, Some(QUARANTINE));
        assert!(result.needs_human_review);
        assert_eq!(result.suggested_action, RuleAction::Quarantine);
    }

    #[test]
    fn ai_failure_degrades_to_rule_only_filing() {
        let categories = vec![category(7, "Banking", 10)];
        let result = merge(
            Some(&rule(Some(7), 0.2)),
            Err(AiError::Request("timeout".into())),
            &categories,
            &config(),
            QUARANTINE,
        );
        // Still filed, flagged for review, never left unclassified.
        assert_eq!(result.category_id, Some(7));
        assert!(result.needs_human_review);
        assert!((result.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn ai_failure_without_rule_quarantines() {
        let result = merge(
            None,
            Err(AiError::Request("timeout".into())),
            &[],
            &config(),
            QUARANTINE,
        );
        assert_eq!(result.category_id, Some(QUARANTINE));
        assert!(result.needs_human_review);
    }

    #[test]
    fn tie_breaks_on_category_priority_within_epsilon() {
        let categories = vec![category(1, "Tax", 5), category(2, "Banking", 20)];
        let result = merge(
            None,
            Ok(judgment(vec![("Banking", 0.82), ("Tax", 0.80)])),
            &categories,
            &config(),
            QUARANTINE,
        );
        // 0.02 apart, inside the 0.05 band: the lower priority value wins.
        assert_eq!(result.category_id, Some(1));
    }

    #[test]
    fn clear_winner_ignores_priority() {
        let categories = vec![category(1, "Tax", 5), category(2, "Banking", 20)];
        let result = merge(
            None,
            Ok(judgment(vec![("Banking", 0.9), ("Tax", 0.6)])),
            &categories,
            &config(),
            QUARANTINE,
        );
        assert_eq!(result.category_id, Some(2));
    }

    #[test]
    fn rule_target_overrides_ai_category() {
        let categories = vec![category(1, "Tax", 5), category(7, "Banking", 10)];
        let result = merge(
            Some(&rule(Some(7), 0.0)),
            Ok(judgment(vec![("Tax", 0.8)])),
            &categories,
            &config(),
            QUARANTINE,
        );
        assert_eq!(result.category_id, Some(7));
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn scorer_input_carries_folder_and_read_labels() {
        use crate::ingest;
        use crate::models::{FetchedMessage, MailAddress, PrivacyLevel, Provider, SyncCursor};
        use crate::storage::NewAccount;
        use crate::vault::Vault;
        use ai::DisabledScorer;
        use chrono::{TimeZone, Utc};

        let vault = Arc::new(Vault::from_bytes(vec![5u8; 32]).unwrap());
        let storage = Storage::open_in_memory(vault.clone()).unwrap();
        let account = storage
            .create_account(NewAccount {
                provider: Provider::GenericImap,
                email: "user@example.com".into(),
                credentials_encrypted: vault.encrypt_str("{}").unwrap(),
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
                subject: "statement ready".into(),
                from: MailAddress::bare("bank@example.com"),
                to: vec![MailAddress::bare("user@example.com")],
                cc: Vec::new(),
                date_received: Utc.with_ymd_and_hms(2026, 8, 20, 10, 0, 0).unwrap(),
                body_text: Some("your statement".into()),
                body_html: None,
                attachments: Vec::new(),
                is_read: false,
                message_id_header: None,
                references: Vec::new(),
                watermark: SyncCursor::UidHighWater { uid: 1 },
            }],
        )
        .await;
        let message = storage
            .get_message(report.inserted[0])
            .await
            .unwrap()
            .unwrap();

        let classifier = Classifier::new(
            storage,
            Arc::new(DisabledScorer),
            ClassifyConfig::default(),
            QUARANTINE,
        );
        let input = classifier.build_input(&account, &message).await.unwrap();

        assert!(input.labels.contains(&"inbox".to_string()));
        assert!(input.labels.contains(&"unread".to_string()));
        assert!(!input.labels.contains(&"hidden".to_string()));
    }

    #[test]
    fn unknown_candidate_names_quarantine() {
        let categories = vec![category(1, "Tax", 5)];
        let result = merge(
            None,
            Ok(judgment(vec![("Nonsense", 0.9)])),
            &categories,
            &config(),
            QUARANTINE,
        );
        assert_eq!(result.category_id, Some(QUARANTINE));
        assert!(result.needs_human_review);
    }
}
