//! LLM client for message generation and reply analysis.
//!
//! OpenRouter chat-completions API. Callers wrap every use in a
//! circuit breaker and always carry a deterministic fallback; nothing
//! in the send path depends on this client being reachable.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Structured output of the reply-analysis prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct IntentAnalysis {
    pub intent: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub sentiment: String,
    #[serde(default)]
    pub action_needed: Option<String>,
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(http: reqwest::Client, api_key: String, model: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("LLM api key empty"));
        }
        Ok(Self {
            http,
            api_key,
            model,
        })
    }

    pub async fn chat_completion(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f64,
        timeout: Duration,
    ) -> Result<String> {
        let start = Instant::now();
        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
        };

        let resp = self
            .http
            .post(OPENROUTER_URL)
            .timeout(timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&req)
            .send()
            .await
            .context("llm request")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(anyhow!("llm {}: {}", status.as_u16(), snippet));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).context("llm json parse")?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        debug!(
            model = %self.model,
            latency_ms = start.elapsed().as_millis() as u64,
            "llm completion"
        );
        Ok(content)
    }

    /// Classify an inbound seller reply. Returns the structured
    /// analysis; the caller maps the intent string onto the enum.
    pub async fn classify_reply(&self, reply_text: &str, timeout: Duration) -> Result<IntentAnalysis> {
        let truncated: String = reply_text.chars().take(500).collect();
        let system = "You classify SMS replies from property sellers for a land-buying team. \
             Respond ONLY with a JSON object: {\"intent\": one of INTERESTED, NOT_INTERESTED, \
             ASKING_PRICE, NEGOTIATING, SCHEDULING, CONFUSED, STOP, WRONG_NUMBER, DECEASED, \
             SPAM, GREETING, QUESTION, \"confidence\": 0.0-1.0, \"sentiment\": positive|neutral|negative, \
             \"action_needed\": short string or null}.";
        let user = format!("Seller's reply:\n\"{truncated}\"");

        let raw = self
            .chat_completion(system, &user, 120, 0.1, timeout)
            .await?;
        parse_intent_json(&raw)
    }

    /// Generate one SMS body. The prompt forbids prices and enforces
    /// SMS length; the caller still clamps to 160 chars.
    pub async fn generate_sms(
        &self,
        context_label: &str,
        first_name: &str,
        parish: &str,
        acres: Option<f64>,
        timeout: Duration,
    ) -> Result<String> {
        let acres_text = acres
            .map(|a| format!("{a:.2} acres"))
            .unwrap_or_else(|| "unknown size".to_string());
        let system = "You write a single SMS for a local land buyer contacting a property owner. \
             Under 160 characters, friendly, no prices, no spam phrasing, no emojis. \
             Respond with the message text only.";
        let user = format!(
            "Context: {context_label} message.\nOwner first name: {first_name}\n\
             Parish/County: {parish}\nLot: {acres_text}"
        );

        let text = self
            .chat_completion(system, &user, 100, 0.7, timeout)
            .await?;
        let trimmed = text.trim().trim_matches('"').to_string();
        if trimmed.is_empty() {
            return Err(anyhow!("llm returned empty message"));
        }
        Ok(trimmed)
    }
}

/// Tolerant JSON extraction: models sometimes wrap the object in prose
/// or code fences.
fn parse_intent_json(raw: &str) -> Result<IntentAnalysis> {
    let trimmed = raw.trim();
    if let Ok(parsed) = serde_json::from_str::<IntentAnalysis>(trimmed) {
        return Ok(parsed);
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            let slice = &trimmed[start..=end];
            return serde_json::from_str::<IntentAnalysis>(slice)
                .with_context(|| format!("llm intent json: {slice}"));
        }
    }
    Err(anyhow!("no json object in llm reply: {trimmed}"))
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let analysis = parse_intent_json(
            r#"{"intent": "INTERESTED", "confidence": 0.9, "sentiment": "positive", "action_needed": "respond"}"#,
        )
        .unwrap();
        assert_eq!(analysis.intent, "INTERESTED");
        assert!(analysis.confidence > 0.8);
    }

    #[test]
    fn parses_fenced_json() {
        let analysis = parse_intent_json(
            "Here you go:\n```json\n{\"intent\": \"CONFUSED\", \"confidence\": 0.4, \"sentiment\": \"neutral\"}\n```",
        )
        .unwrap();
        assert_eq!(analysis.intent, "CONFUSED");
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_intent_json("the seller seems interested").is_err());
    }
}
