//! Channel adapters: one uniform `send(destination, content) -> Outcome`
//! contract per delivery mechanism, collected in an `AdapterRegistry` that is
//! injected into the dispatcher.

pub mod email;
pub mod in_app;
pub mod push;
pub mod sms;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::Config;
use crate::db::models::Channel;
use crate::services::request::{Content, Destination};

pub use email::EmailAdapter;
pub use in_app::InAppAdapter;
pub use push::PushAdapter;
pub use sms::SmsAdapter;

pub const CHANNEL_DISABLED: &str = "channel disabled";

/// Result of one provider call, already translated into the dispatcher's terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub succeeded: bool,
    /// Must not be retried (disabled channel, expired subscription, hard rejection).
    pub permanent_failure: bool,
    pub error_detail: Option<String>,
    /// The push subscription is gone and the caller should discard it.
    pub discard_subscription: bool,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            permanent_failure: false,
            error_detail: None,
            discard_subscription: false,
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            permanent_failure: false,
            error_detail: Some(detail.into()),
            discard_subscription: false,
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            permanent_failure: true,
            error_detail: Some(detail.into()),
            discard_subscription: false,
        }
    }

    pub fn disabled() -> Self {
        Self::permanent(CHANNEL_DISABLED)
    }

    pub fn subscription_expired(detail: impl Into<String>) -> Self {
        Self {
            discard_subscription: true,
            ..Self::permanent(detail)
        }
    }
}

/// A delivery capability for one channel.
///
/// Adapters hold configuration only; a disabled adapter answers every call with
/// `Outcome::disabled()` without touching the network.
#[async_trait]
pub trait ChannelAdapter: Send + Sync + 'static {
    fn channel(&self) -> Channel;

    fn is_enabled(&self) -> bool;

    async fn send(&self, destination: &Destination, content: &Content) -> Outcome;
}

/// Channel -> adapter lookup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under the channel it reports, replacing any previous one.
    pub fn register(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    pub fn supports(&self, channel: Channel) -> bool {
        self.adapters.contains_key(&channel)
    }

    /// Build every adapter from configuration. Channels without credentials are
    /// registered disabled.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.dispatch.send_timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let registry = Self::new()
            .register(Arc::new(EmailAdapter::from_config(client.clone(), config)))
            .register(Arc::new(SmsAdapter::from_config(client.clone(), config)))
            .register(Arc::new(PushAdapter::from_config(client, config)))
            .register(Arc::new(InAppAdapter));

        for channel in Channel::ALL {
            if let Some(adapter) = registry.get(channel) {
                if adapter.is_enabled() {
                    tracing::info!("Channel {} enabled", channel);
                } else {
                    tracing::warn!(
                        "Channel {} disabled (missing provider credentials)",
                        channel
                    );
                }
            }
        }

        Ok(registry)
    }
}

/// Translate a transport-level error into a transient outcome.
pub(crate) fn transport_failure(provider: &str, err: &reqwest::Error) -> Outcome {
    if err.is_timeout() {
        Outcome::transient(format!("{} request timed out", provider))
    } else if err.is_connect() {
        Outcome::transient(format!("{} connection failed", provider))
    } else {
        Outcome::transient(format!("{} request failed: {}", provider, err))
    }
}

/// Short, log-safe error detail for a non-success provider response.
pub(crate) fn status_detail(provider: &str, status: StatusCode, body: &str) -> String {
    let snippet: String = body.chars().take(200).collect();
    if snippet.is_empty() {
        format!("{} error ({})", provider, status.as_u16())
    } else {
        format!("{} error ({}): {}", provider, status.as_u16(), snippet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_constructors() {
        let ok = Outcome::success();
        assert!(ok.succeeded && !ok.permanent_failure && ok.error_detail.is_none());

        let disabled = Outcome::disabled();
        assert!(!disabled.succeeded && disabled.permanent_failure);
        assert_eq!(disabled.error_detail.as_deref(), Some(CHANNEL_DISABLED));
        assert!(!disabled.discard_subscription);

        let gone = Outcome::subscription_expired("gone");
        assert!(gone.permanent_failure && gone.discard_subscription);

        let retry = Outcome::transient("rate limited");
        assert!(!retry.succeeded && !retry.permanent_failure);
    }

    #[test]
    fn registry_from_default_config_registers_every_channel() {
        let registry = AdapterRegistry::from_config(&Config::default()).unwrap();
        for channel in Channel::ALL {
            assert!(registry.supports(channel), "{} missing", channel);
        }
        assert!(!registry.get(Channel::Email).unwrap().is_enabled());
        assert!(!registry.get(Channel::Sms).unwrap().is_enabled());
        assert!(!registry.get(Channel::Push).unwrap().is_enabled());
        assert!(registry.get(Channel::InApp).unwrap().is_enabled());
    }

    #[test]
    fn register_replaces_by_channel() {
        let registry = AdapterRegistry::new()
            .register(Arc::new(InAppAdapter))
            .register(Arc::new(InAppAdapter));
        assert!(registry.supports(Channel::InApp));
        assert!(!registry.supports(Channel::Email));
    }

    #[test]
    fn status_detail_truncates_body() {
        let long = "x".repeat(500);
        let detail = status_detail("SendGrid", StatusCode::BAD_GATEWAY, &long);
        assert!(detail.starts_with("SendGrid error (502): "));
        assert!(detail.len() < 250);
        assert_eq!(
            status_detail("Twilio", StatusCode::TOO_MANY_REQUESTS, ""),
            "Twilio error (429)"
        );
    }
}
