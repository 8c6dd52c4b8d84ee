//! Inbound reply classification: keyword-first, LLM fallback.
//!
//! Keyword priority order is a compliance requirement: STOP words win
//! over everything, then deceased, wrong-number, not-interested, and
//! only then positive-interest matching. The LLM path only sees
//! messages no keyword set claimed, and is fenced by a circuit
//! breaker; any failure degrades to CONFUSED.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::llm::LlmClient;
use crate::models::ConversationIntent;
use crate::resilience::CircuitBreaker;

const LLM_TIMEOUT: Duration = Duration::from_secs(30);

// STOP/DNC keywords. Matching one is an immediate opt-out.
const STOP_KEYWORDS: &[&str] = &[
    "stop",
    "unsubscribe",
    "remove",
    "opt out",
    "opt-out",
    "do not contact",
    "don't contact",
    "leave me alone",
    "take me off",
    "remove me",
    "no more",
];

const DECEASED_KEYWORDS: &[&str] = &[
    "deceased",
    "passed away",
    "died",
    "no longer with us",
    "passed on",
    "rest in peace",
];

const WRONG_NUMBER_KEYWORDS: &[&str] = &[
    "wrong number",
    "wrong person",
    "don't own",
    "not my property",
    "never owned",
    "already sold",
    "sold it",
    "not the owner",
];

const NOT_INTERESTED_KEYWORDS: &[&str] = &[
    "not interested",
    "no thanks",
    "no thank you",
    "not selling",
    "not for sale",
    "keeping it",
    "don't want",
];

const INTEREST_KEYWORDS: &[&str] = &[
    "interested",
    "tell me more",
    "how much",
    "what price",
    "make an offer",
    "send offer",
    "send me an offer",
    "cash offer",
    "let me know",
    "what can you offer",
    "yes",
    "sure",
];

const PRICE_KEYWORDS: &[&str] = &["how much", "what price", "price", "offer", "cash"];

const SPAM_KEYWORDS: &[&str] = &["spam", "scam", "lawsuit"];

/// One classification outcome.
#[derive(Debug, Clone)]
pub struct IntentDetection {
    pub intent: ConversationIntent,
    pub confidence: f64,
    pub sentiment: &'static str,
    pub keywords: Vec<String>,
}

impl IntentDetection {
    fn keyword(intent: ConversationIntent, confidence: f64, sentiment: &'static str, kw: &str) -> Self {
        Self {
            intent,
            confidence,
            sentiment,
            keywords: vec![kw.to_string()],
        }
    }

    fn fallback() -> Self {
        Self {
            intent: ConversationIntent::Confused,
            confidence: 0.3,
            sentiment: "neutral",
            keywords: Vec::new(),
        }
    }
}

/// Phrase keywords match as substrings; single words match whole
/// tokens only, so "no" does not fire inside "know".
fn matches_keyword(text: &str, keyword: &str) -> bool {
    if keyword.contains(' ') || keyword.contains('-') {
        return text.contains(keyword);
    }
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == keyword)
}

fn find_keyword<'a>(text: &str, keywords: &'a [&'a str]) -> Option<&'a str> {
    keywords.iter().copied().find(|kw| matches_keyword(text, kw))
}

/// Pure keyword pass. None means no set claimed the message.
pub fn classify_keywords(text: &str) -> Option<IntentDetection> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return Some(IntentDetection::fallback());
    }

    if let Some(kw) = find_keyword(&lower, STOP_KEYWORDS) {
        return Some(IntentDetection::keyword(
            ConversationIntent::Stop,
            1.0,
            "negative",
            kw,
        ));
    }
    if let Some(kw) = find_keyword(&lower, DECEASED_KEYWORDS) {
        return Some(IntentDetection::keyword(
            ConversationIntent::Deceased,
            0.95,
            "negative",
            kw,
        ));
    }
    if let Some(kw) = find_keyword(&lower, WRONG_NUMBER_KEYWORDS) {
        return Some(IntentDetection::keyword(
            ConversationIntent::WrongNumber,
            0.9,
            "neutral",
            kw,
        ));
    }
    if let Some(kw) = find_keyword(&lower, NOT_INTERESTED_KEYWORDS) {
        return Some(IntentDetection::keyword(
            ConversationIntent::NotInterested,
            0.85,
            "negative",
            kw,
        ));
    }
    if let Some(kw) = find_keyword(&lower, SPAM_KEYWORDS) {
        return Some(IntentDetection::keyword(
            ConversationIntent::Spam,
            0.85,
            "negative",
            kw,
        ));
    }
    if let Some(kw) = find_keyword(&lower, INTEREST_KEYWORDS) {
        let asking_price = find_keyword(&lower, PRICE_KEYWORDS).is_some();
        return Some(IntentDetection::keyword(
            if asking_price {
                ConversationIntent::AskingPrice
            } else {
                ConversationIntent::Interested
            },
            0.8,
            "positive",
            kw,
        ));
    }

    None
}

#[derive(Clone)]
pub struct ReplyClassifier {
    llm: Option<Arc<LlmClient>>,
    circuit: CircuitBreaker,
}

impl ReplyClassifier {
    pub fn new(llm: Option<Arc<LlmClient>>, circuit: CircuitBreaker) -> Self {
        Self { llm, circuit }
    }

    /// Classify a reply: keywords first, then LLM, then CONFUSED.
    pub async fn classify(&self, text: &str) -> IntentDetection {
        if let Some(detection) = classify_keywords(text) {
            debug!(
                intent = detection.intent.as_str(),
                keywords = ?detection.keywords,
                "keyword classification"
            );
            return detection;
        }
        self.classify_with_llm(text).await
    }

    async fn classify_with_llm(&self, text: &str) -> IntentDetection {
        let Some(llm) = self.llm.as_deref() else {
            return IntentDetection::fallback();
        };
        if !self.circuit.can_execute() {
            warn!("reply classifier circuit open, defaulting to CONFUSED");
            return IntentDetection::fallback();
        }

        match llm.classify_reply(text, LLM_TIMEOUT).await {
            Ok(analysis) => {
                self.circuit.record_success();
                let intent = ConversationIntent::parse(&analysis.intent)
                    .unwrap_or(ConversationIntent::Confused);
                let sentiment = match analysis.sentiment.as_str() {
                    "positive" => "positive",
                    "negative" => "negative",
                    _ => "neutral",
                };
                IntentDetection {
                    intent,
                    confidence: analysis.confidence.clamp(0.0, 1.0),
                    sentiment,
                    keywords: Vec::new(),
                }
            }
            Err(e) => {
                self.circuit.record_failure();
                warn!(error = %e, "llm classification failed");
                IntentDetection::fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent_of(text: &str) -> ConversationIntent {
        classify_keywords(text).map(|d| d.intent).unwrap()
    }

    #[test]
    fn stop_words_win() {
        assert_eq!(intent_of("STOP"), ConversationIntent::Stop);
        assert_eq!(intent_of("please remove me"), ConversationIntent::Stop);
        // STOP outranks interest wording in the same message.
        assert_eq!(
            intent_of("interested? no, stop texting me"),
            ConversationIntent::Stop
        );
    }

    #[test]
    fn compliance_priorities() {
        assert_eq!(intent_of("the owner passed away"), ConversationIntent::Deceased);
        assert_eq!(intent_of("you have the wrong number"), ConversationIntent::WrongNumber);
        assert_eq!(intent_of("not interested, thanks"), ConversationIntent::NotInterested);
        assert_eq!(intent_of("this is a scam"), ConversationIntent::Spam);
    }

    #[test]
    fn interest_and_price() {
        assert_eq!(intent_of("yes, tell me more"), ConversationIntent::Interested);
        assert_eq!(intent_of("how much are you offering?"), ConversationIntent::AskingPrice);
        assert_eq!(intent_of("what price did you have in mind"), ConversationIntent::AskingPrice);
    }

    #[test]
    fn single_words_need_word_boundaries() {
        // "stop" must not fire inside "stopped by the office".
        assert!(matches_keyword("stop texting", "stop"));
        assert!(!matches_keyword("i stopped by", "stop"));
        // "yes" inside "yesterday" must not read as interest.
        assert!(!matches_keyword("yesterday was fine", "yes"));
    }

    #[test]
    fn ambiguous_text_defers() {
        assert!(classify_keywords("who is this?").is_none());
        assert!(classify_keywords("maybe later this year").is_none());
    }

    #[test]
    fn empty_is_confused() {
        let detection = classify_keywords("   ").unwrap();
        assert_eq!(detection.intent, ConversationIntent::Confused);
        assert!((detection.confidence - 0.3).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn no_llm_defaults_to_confused() {
        let classifier = ReplyClassifier::new(
            None,
            CircuitBreaker::new("llm", 3, Duration::from_secs(60)),
        );
        let detection = classifier.classify("who is this?").await;
        assert_eq!(detection.intent, ConversationIntent::Confused);
        assert!((detection.confidence - 0.3).abs() < f64::EPSILON);
    }
}
