use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use super::{status_detail, transport_failure, ChannelAdapter, Outcome};
use crate::config::Config;
use crate::db::models::Channel;
use crate::services::request::{Content, Destination};

/// Email over the SendGrid v3 `mail/send` API.
///
/// Email has no permanent failure class: every provider error is retried up
/// to the record's budget.
#[derive(Clone)]
pub struct EmailAdapter {
    provider: Option<SendGrid>,
}

#[derive(Clone)]
struct SendGrid {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    default_from: String,
}

#[derive(Debug, Serialize)]
struct MailSend<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    subject: &'a str,
    content: Vec<MailContent<'a>>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct MailContent<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

impl EmailAdapter {
    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        if !config.email_enabled() {
            return Self::disabled();
        }
        let provider = config.email.sendgrid_api_key.clone().map(|api_key| SendGrid {
            client,
            api_url: config.email.api_url.clone(),
            api_key,
            default_from: config.email.default_from.clone(),
        });
        Self { provider }
    }

    pub fn disabled() -> Self {
        Self { provider: None }
    }
}

/// SendGrid answers `202 Accepted` on success. Everything else is retryable.
fn classify(status: StatusCode, body: &str) -> Outcome {
    if status.is_success() {
        Outcome::success()
    } else {
        Outcome::transient(status_detail("SendGrid", status, body))
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    async fn send(&self, destination: &Destination, content: &Content) -> Outcome {
        let Some(provider) = &self.provider else {
            tracing::warn!("Email channel is disabled; skipping send for {}", content.record_id);
            return Outcome::disabled();
        };

        let Destination::Email { address, html, from } = destination else {
            return Outcome::permanent("email adapter received a non-email destination");
        };

        let html = html.as_deref().unwrap_or(&content.body);
        let payload = MailSend {
            personalizations: vec![Personalization {
                to: vec![Address { email: address }],
            }],
            from: Address {
                email: from.as_deref().unwrap_or(&provider.default_from),
            },
            subject: &content.title,
            content: vec![
                MailContent {
                    content_type: "text/plain",
                    value: &content.body,
                },
                MailContent {
                    content_type: "text/html",
                    value: html,
                },
            ],
        };

        let response = match provider
            .client
            .post(&provider.api_url)
            .bearer_auth(&provider.api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return transport_failure("SendGrid", &e),
        };

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        let outcome = classify(status, &body);
        if outcome.succeeded {
            tracing::info!("Email sent via SendGrid for record {}", content.record_id);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Priority;

    fn content() -> Content {
        Content {
            record_id: "r1".to_string(),
            title: "Welcome".to_string(),
            body: "Hi".to_string(),
            priority: Priority::Medium,
        }
    }

    #[tokio::test]
    async fn disabled_adapter_fails_permanently_without_io() {
        let adapter = EmailAdapter::disabled();
        assert!(!adapter.is_enabled());
        let outcome = adapter
            .send(
                &Destination::Email {
                    address: "a@b.com".to_string(),
                    html: None,
                    from: None,
                },
                &content(),
            )
            .await;
        assert_eq!(outcome, Outcome::disabled());
    }

    #[test]
    fn every_provider_error_is_transient() {
        assert!(classify(StatusCode::ACCEPTED, "").succeeded);
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
        ] {
            let outcome = classify(status, "nope");
            assert!(!outcome.succeeded);
            assert!(!outcome.permanent_failure, "{} must be retryable", status);
        }
    }

    #[test]
    fn enabled_only_with_sendgrid_key() {
        let mut config = Config::default();
        let client = reqwest::Client::new();
        assert!(!EmailAdapter::from_config(client.clone(), &config).is_enabled());
        config.email.sendgrid_api_key = Some("SG.test".to_string());
        assert!(EmailAdapter::from_config(client, &config).is_enabled());
    }

    #[test]
    fn payload_shape_matches_sendgrid() {
        let payload = MailSend {
            personalizations: vec![Personalization {
                to: vec![Address { email: "a@b.com" }],
            }],
            from: Address { email: "no-reply@x.io" },
            subject: "Welcome",
            content: vec![MailContent {
                content_type: "text/plain",
                value: "Hi",
            }],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["personalizations"][0]["to"][0]["email"], "a@b.com");
        assert_eq!(json["content"][0]["type"], "text/plain");
    }
}
