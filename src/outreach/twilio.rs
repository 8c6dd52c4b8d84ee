//! Twilio REST client and webhook signature validation.
//!
//! The Messages API is a form-encoded POST with basic auth. Accepted
//! messages can still carry an error code; callers map the full
//! outcome table. Transport failures and 5xx are retried with the
//! general policy, HTTP 429 with the randomized rate-limit policy.

use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use std::time::Duration;
use tracing::{debug, warn};

use crate::resilience::RetryPolicy;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Twilio REST error codes the dispatcher maps.
pub const ERR_INVALID_NUMBER: i64 = 21211;
pub const ERR_GEO_RESTRICTED: i64 = 21408;
pub const ERR_BLACKLISTED: i64 = 21610;
pub const ERR_UNVERIFIED_RECIPIENT: i64 = 21608;
pub const ERR_INVALID_TO_NUMBER: i64 = 21614;
pub const ERR_AUTH: i64 = 20003;
pub const ERR_RATE_LIMITED: i64 = 20429;

/// Outcome of a send call that reached Twilio.
#[derive(Debug, Clone)]
pub enum SmsResult {
    /// Request accepted; `error_code` may still be set.
    Accepted {
        sid: String,
        status: String,
        error_code: Option<i64>,
        error_message: Option<String>,
    },
    /// Request rejected with a REST error.
    Rejected {
        code: Option<i64>,
        message: String,
        http_status: u16,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct MessageResponse {
    sid: String,
    status: String,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RestErrorResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct TwilioClient {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: Option<String>,
    messaging_service_sid: Option<String>,
    status_callback_url: Option<String>,
}

impl TwilioClient {
    pub fn new(
        http: reqwest::Client,
        account_sid: String,
        auth_token: String,
        from_number: Option<String>,
        messaging_service_sid: Option<String>,
        status_callback_url: Option<String>,
    ) -> Result<Self> {
        if account_sid.trim().is_empty() || auth_token.trim().is_empty() {
            anyhow::bail!("twilio credentials not configured");
        }
        if from_number.is_none() && messaging_service_sid.is_none() {
            anyhow::bail!("twilio needs a from number or messaging service sid");
        }
        Ok(Self {
            http,
            account_sid,
            auth_token,
            from_number,
            messaging_service_sid,
            status_callback_url,
        })
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    fn messages_url(&self) -> String {
        format!("{TWILIO_API_BASE}/Accounts/{}/Messages.json", self.account_sid)
    }

    /// Send one SMS. Transport errors and 5xx retry with backoff; 429
    /// retries with the randomized rate-limit policy before being
    /// surfaced as a rejection.
    pub async fn send_sms(&self, to: &str, body: &str) -> Result<SmsResult> {
        let general = RetryPolicy::general();
        let rate_limited = RetryPolicy::rate_limit();
        let mut transient_attempt: u32 = 0;
        let mut rate_attempt: u32 = 0;

        loop {
            match self.send_once(to, body).await {
                Ok(SmsResult::Rejected {
                    code: Some(ERR_RATE_LIMITED) | Some(429),
                    ..
                }) if rate_attempt + 1 < rate_limited.max_attempts => {
                    rate_attempt += 1;
                    let delay = rate_limited.delay_for(rate_attempt);
                    warn!(
                        attempt = rate_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "twilio rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(result) => return Ok(result),
                Err(e) if transient_attempt + 1 < general.max_attempts => {
                    transient_attempt += 1;
                    let delay = general.delay_for(transient_attempt);
                    warn!(
                        attempt = transient_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "twilio transport error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, to: &str, body: &str) -> Result<SmsResult> {
        let mut form: Vec<(&str, &str)> = vec![("To", to), ("Body", body)];
        if let Some(sid) = &self.messaging_service_sid {
            form.push(("MessagingServiceSid", sid));
        } else if let Some(from) = &self.from_number {
            form.push(("From", from));
        }
        if let Some(callback) = &self.status_callback_url {
            form.push(("StatusCallback", callback));
        }

        let resp = self
            .http
            .post(self.messages_url())
            .timeout(REQUEST_TIMEOUT)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .context("twilio request")?;

        let http_status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        // Retryable server-side failures surface as errors.
        if http_status.is_server_error() {
            anyhow::bail!("twilio {}: {}", http_status.as_u16(), truncate(&text, 200));
        }

        if http_status.is_success() {
            let parsed: MessageResponse =
                serde_json::from_str(&text).context("twilio message json")?;
            debug!(sid = %parsed.sid, status = %parsed.status, "twilio accepted");
            return Ok(SmsResult::Accepted {
                sid: parsed.sid,
                status: parsed.status,
                error_code: parsed.error_code,
                error_message: parsed.error_message,
            });
        }

        let parsed: RestErrorResponse = serde_json::from_str(&text).unwrap_or(RestErrorResponse {
            code: None,
            message: None,
        });
        let code = parsed.code.or_else(|| {
            (http_status.as_u16() == 429).then_some(ERR_RATE_LIMITED)
        });
        Ok(SmsResult::Rejected {
            code,
            message: parsed
                .message
                .unwrap_or_else(|| truncate(&text, 200).to_string()),
            http_status: http_status.as_u16(),
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

type HmacSha1 = Hmac<Sha1>;

/// Compute the webhook signature: HMAC-SHA1 over the full URL with the
/// sorted form parameters (key then value) appended, base64-encoded.
pub fn compute_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> Result<String> {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut data = url.to_string();
    for (key, value) in sorted {
        data.push_str(key);
        data.push_str(value);
    }

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes())
        .context("hmac key")?;
    mac.update(data.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Constant-time signature check.
pub fn validate_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
    provided: &str,
) -> bool {
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(provided) else {
        return false;
    };

    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    let mut data = url.to_string();
    for (key, value) in sorted {
        data.push_str(key);
        data.push_str(value);
    }

    let Ok(mut mac) = HmacSha1::new_from_slice(auth_token.as_bytes()) else {
        return false;
    };
    mac.update(data.as_bytes());
    mac.verify_slice(&decoded).is_ok()
}
