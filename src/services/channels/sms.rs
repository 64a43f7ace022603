use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{status_detail, transport_failure, ChannelAdapter, Outcome};
use crate::config::Config;
use crate::db::models::Channel;
use crate::services::request::{Content, Destination};

/// SMS through the Twilio Messages API.
#[derive(Clone)]
pub struct SmsAdapter {
    provider: Option<Twilio>,
}

#[derive(Clone)]
struct Twilio {
    client: reqwest::Client,
    api_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

/// The subset of Twilio's message resource we log.
#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: Option<String>,
    status: Option<String>,
}

impl SmsAdapter {
    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        if !config.sms_enabled() {
            return Self::disabled();
        }
        let sms = &config.sms;
        let provider = match (&sms.account_sid, &sms.auth_token, &sms.from_number) {
            (Some(sid), Some(token), Some(from)) => Some(Twilio {
                client,
                api_url: sms.api_url.trim_end_matches('/').to_string(),
                account_sid: sid.clone(),
                auth_token: token.clone(),
                from_number: from.clone(),
            }),
            _ => None,
        };
        Self { provider }
    }

    pub fn disabled() -> Self {
        Self { provider: None }
    }
}

impl Twilio {
    fn messages_url(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", self.api_url, self.account_sid)
    }
}

/// SMS text is the title and body on separate lines, or just the body when
/// the title adds nothing.
fn sms_text(content: &Content) -> String {
    if content.title.trim().is_empty() || content.body.starts_with(content.title.as_str()) {
        content.body.clone()
    } else {
        format!("{}\n{}", content.title, content.body)
    }
}

/// Twilio failures (including 4xx such as an unreachable number) are all retried.
fn classify(status: StatusCode, body: &str) -> Outcome {
    if status.is_success() {
        Outcome::success()
    } else {
        Outcome::transient(status_detail("Twilio", status, body))
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    async fn send(&self, destination: &Destination, content: &Content) -> Outcome {
        let Some(provider) = &self.provider else {
            tracing::warn!("SMS channel is disabled; skipping send for {}", content.record_id);
            return Outcome::disabled();
        };

        let Destination::Sms { phone_number } = destination else {
            return Outcome::permanent("sms adapter received a non-sms destination");
        };

        let text = sms_text(content);
        let form = [
            ("To", phone_number.as_str()),
            ("From", provider.from_number.as_str()),
            ("Body", text.as_str()),
        ];

        let response = match provider
            .client
            .post(provider.messages_url())
            .basic_auth(&provider.account_sid, Some(&provider.auth_token))
            .form(&form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return transport_failure("Twilio", &e),
        };

        let status = response.status();
        if status.is_success() {
            match response.json::<MessageResource>().await {
                Ok(message) => tracing::info!(
                    "SMS queued via Twilio for record {} (sid={}, status={})",
                    content.record_id,
                    message.sid.as_deref().unwrap_or("?"),
                    message.status.as_deref().unwrap_or("?")
                ),
                Err(e) => tracing::debug!("Twilio accepted SMS but body was unreadable: {}", e),
            }
            return Outcome::success();
        }

        let body = response.text().await.unwrap_or_default();
        classify(status, &body)
    }
}
