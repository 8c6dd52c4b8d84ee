//! Outbound message generation: LLM first, deterministic fallback.

use std::time::Duration;
use tracing::debug;

use crate::llm::LlmClient;
use crate::models::MessageContext;
use crate::resilience::CircuitBreaker;

const SMS_MAX_LEN: usize = 160;
const LLM_TIMEOUT: Duration = Duration::from_secs(30);

/// Deterministic template parameterized by first name, parish and
/// acreage. Always under 160 chars.
pub fn fallback_sms(
    context: MessageContext,
    first_name: &str,
    parish: &str,
    acres: Option<f64>,
) -> String {
    let lot = acres
        .map(|a| format!("{a:.1} acre lot"))
        .unwrap_or_else(|| "land".to_string());

    let message = match context {
        MessageContext::Intro => format!(
            "Hi {first_name}, I'm a local buyer interested in your {lot} in {parish}. \
             Would you consider a cash offer? Reply STOP to opt out."
        ),
        MessageContext::Followup => format!(
            "Hi {first_name}, following up about your {lot} in {parish}. \
             Still happy to make a cash offer if you're open to it."
        ),
        MessageContext::Final => format!(
            "Hi {first_name}, last note from me about your {lot} in {parish}. \
             If you ever want a no-obligation cash offer, just reply here."
        ),
        MessageContext::Ack => {
            "You have been unsubscribed and will not receive further messages.".to_string()
        }
    };

    clamp_sms(&message)
}

pub fn clamp_sms(message: &str) -> String {
    if message.chars().count() <= SMS_MAX_LEN {
        return message.to_string();
    }
    let truncated: String = message.chars().take(SMS_MAX_LEN - 3).collect();
    format!("{truncated}...")
}

/// Generate the message body: LLM behind its circuit breaker, template
/// on any failure. Never errors.
pub async fn generate_message(
    llm: Option<&LlmClient>,
    circuit: &CircuitBreaker,
    context: MessageContext,
    first_name: &str,
    parish: &str,
    acres: Option<f64>,
) -> String {
    let Some(client) = llm else {
        return fallback_sms(context, first_name, parish, acres);
    };
    if !circuit.can_execute() {
        debug!("llm circuit open, using template");
        return fallback_sms(context, first_name, parish, acres);
    }

    match client
        .generate_sms(context.as_str(), first_name, parish, acres, LLM_TIMEOUT)
        .await
    {
        Ok(text) => {
            circuit.record_success();
            clamp_sms(&text)
        }
        Err(e) => {
            circuit.record_failure();
            debug!(error = %e, "llm message generation failed, using template");
            fallback_sms(context, first_name, parish, acres)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_fit_sms_and_mention_details() {
        for context in [
            MessageContext::Intro,
            MessageContext::Followup,
            MessageContext::Final,
        ] {
            let msg = fallback_sms(context, "John", "East Baton Rouge", Some(2.0));
            assert!(msg.chars().count() <= 160, "{context:?}: {msg}");
            assert!(msg.contains("John"));
            assert!(msg.contains("East Baton Rouge"));
        }
    }

    #[test]
    fn intro_includes_opt_out_language() {
        let msg = fallback_sms(MessageContext::Intro, "John", "Ascension", None);
        assert!(msg.contains("STOP"));
        assert!(msg.contains("land"));
    }

    #[test]
    fn clamp_truncates_long_messages() {
        let long = "x".repeat(400);
        let clamped = clamp_sms(&long);
        assert_eq!(clamped.chars().count(), 160);
        assert!(clamped.ends_with("..."));
    }

    #[tokio::test]
    async fn no_llm_falls_back_to_template() {
        let circuit = CircuitBreaker::new("llm", 3, Duration::from_secs(60));
        let msg = generate_message(
            None,
            &circuit,
            MessageContext::Intro,
            "Jane",
            "Livingston",
            Some(1.2),
        )
        .await;
        assert!(msg.contains("Jane"));
        assert!(msg.contains("Livingston"));
    }
}
