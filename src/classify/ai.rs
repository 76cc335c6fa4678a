use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::models::{Category, ClassificationInput};

#[derive(Debug, Error)]
pub enum AiError {
    #[error("ai provider request failed: {0}")]
    Request(String),
    #[error("ai provider returned an unusable response: {0}")]
    Response(String),
}

impl From<reqwest::Error> for AiError {
    fn from(value: reqwest::Error) -> Self {
        AiError::Request(value.to_string())
    }
}

/// One scored category candidate from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiCandidate {
    pub category: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiJudgment {
    pub candidates: Vec<AiCandidate>,
    #[serde(default)]
    pub explanation: String,
}

/// External AI classification provider. Implementations are synchronous
/// request/response with a bounded timeout; everything above treats a
/// failure as degradable, never fatal to the message.
#[async_trait]
pub trait AiScorer: Send + Sync {
    async fn classify(
        &self,
        input: &ClassificationInput,
        categories: &[Category],
    ) -> Result<AiJudgment, AiError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AiProviderKind {
    OpenAi,
    Claude,
    Gemini,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    pub provider: AiProviderKind,
    pub model: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

const PROMPT_HEADER: &str = "You are an email triage engine. Given one email and a list of \
category names, score how well each plausible category fits. Respond with only a JSON object: \
{\"candidates\": [{\"category\": \"<name>\", \"confidence\": <0..1>}], \"explanation\": \"<one sentence>\"}. \
Include at most three candidates, best first. Use only the provided category names.";

fn build_prompt(input: &ClassificationInput, categories: &[Category]) -> String {
    let names: Vec<&str> = categories.iter().map(|category| category.name.as_str()).collect();
    let payload = json!({
        "categories": names,
        "email": input,
    });
    format!("{PROMPT_HEADER}\n\n{payload}")
}

/// Pulls the judgment JSON out of a model reply, tolerating surrounding
/// prose or code fences.
fn parse_judgment(text: &str) -> Result<AiJudgment, AiError> {
    let trimmed = text.trim();
    let candidate = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        let start = trimmed
            .find('{')
            .ok_or_else(|| AiError::Response("no JSON object in reply".into()))?;
        let end = trimmed
            .rfind('}')
            .ok_or_else(|| AiError::Response("no JSON object in reply".into()))?;
        trimmed[start..=end].to_string()
    };
    let judgment: AiJudgment = serde_json::from_str(&candidate)
        .map_err(|err| AiError::Response(format!("bad judgment JSON: {err}")))?;
    if judgment.candidates.is_empty() {
        return Err(AiError::Response("judgment had no candidates".into()));
    }
    Ok(judgment)
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, AiError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|err| AiError::Request(err.to_string()))
}

/// Stand-in when no AI provider is configured. Always reports the
/// scorer unavailable, so classification degrades to rule-only filing.
pub struct DisabledScorer;

#[async_trait]
impl AiScorer for DisabledScorer {
    async fn classify(
        &self,
        _input: &ClassificationInput,
        _categories: &[Category],
    ) -> Result<AiJudgment, AiError> {
        Err(AiError::Request("no ai provider configured".into()))
    }
}

pub fn scorer_from_config(config: &AiConfig) -> Result<Box<dyn AiScorer>, AiError> {
    Ok(match config.provider {
        AiProviderKind::OpenAi => Box::new(OpenAiScorer::new(config.clone())?),
        AiProviderKind::Claude => Box::new(ClaudeScorer::new(config.clone())?),
        AiProviderKind::Gemini => Box::new(GeminiScorer::new(config.clone())?),
    })
}

pub struct OpenAiScorer {
    config: AiConfig,
    http: reqwest::Client,
}

impl OpenAiScorer {
    pub fn new(config: AiConfig) -> Result<Self, AiError> {
        let http = http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl AiScorer for OpenAiScorer {
    async fn classify(
        &self,
        input: &ClassificationInput,
        categories: &[Category],
    ) -> Result<AiJudgment, AiError> {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": build_prompt(input, categories)}],
            "temperature": 0,
        });
        let response: serde_json::Value = self
            .http
            .post(format!("{base}/chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|err| AiError::Request(err.to_string()))?
            .json()
            .await?;
        let text = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AiError::Response("missing completion content".into()))?;
        debug!(provider = "openai", "ai judgment received");
        parse_judgment(text)
    }
}

pub struct ClaudeScorer {
    config: AiConfig,
    http: reqwest::Client,
}

impl ClaudeScorer {
    pub fn new(config: AiConfig) -> Result<Self, AiError> {
        let http = http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl AiScorer for ClaudeScorer {
    async fn classify(
        &self,
        input: &ClassificationInput,
        categories: &[Category],
    ) -> Result<AiJudgment, AiError> {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com/v1");
        let body = json!({
            "model": self.config.model,
            "max_tokens": 512,
            "messages": [{"role": "user", "content": build_prompt(input, categories)}],
        });
        let response: serde_json::Value = self
            .http
            .post(format!("{base}/messages"))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|err| AiError::Request(err.to_string()))?
            .json()
            .await?;
        let text = response["content"][0]["text"]
            .as_str()
            .ok_or_else(|| AiError::Response("missing completion content".into()))?;
        debug!(provider = "claude", "ai judgment received");
        parse_judgment(text)
    }
}

pub struct GeminiScorer {
    config: AiConfig,
    http: reqwest::Client,
}

impl GeminiScorer {
    pub fn new(config: AiConfig) -> Result<Self, AiError> {
        let http = http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl AiScorer for GeminiScorer {
    async fn classify(
        &self,
        input: &ClassificationInput,
        categories: &[Category],
    ) -> Result<AiJudgment, AiError> {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://generativelanguage.googleapis.com/v1beta");
        let url = format!(
            "{base}/models/{}:generateContent?key={}",
            self.config.model, self.config.api_key
        );
        let body = json!({
            "contents": [{"parts": [{"text": build_prompt(input, categories)}]}],
        });
        let response: serde_json::Value = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|err| AiError::Request(err.to_string()))?
            .json()
            .await?;
        let text = response["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| AiError::Response("missing completion content".into()))?;
        debug!(provider = "gemini", "ai judgment received");
        parse_judgment(text)
    }
}
