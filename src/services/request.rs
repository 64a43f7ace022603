//! Inbound delivery requests and their channel-specific validation.
//!
//! A `DeliveryRequest` is what collaborators (auth, content, payment services)
//! hand to the dispatcher. It is never persisted verbatim: validation resolves
//! it into a `Destination`, and the normalized `ChannelMetadata` is stored on
//! the record so retries address the same destination.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::db::models::{Channel, Priority};
use crate::error::{AppError, AppResult};

/// Upper bound accepted for a per-request `maxRetries` override.
pub const MAX_RETRIES_LIMIT: u32 = 10;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();
    static ref PHONE_RE: Regex = Regex::new(r"^\+?[1-9][0-9]{7,14}$").unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    #[serde(alias = "type")]
    pub channel: Channel,
    #[serde(alias = "userId")]
    pub recipient_ref: String,
    pub title: String,
    #[serde(alias = "message")]
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, alias = "metadata")]
    pub channel_metadata: ChannelMetadata,
    /// Optional override of the configured retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Channel-specific addressing. Which fields are required depends on the channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// HTML body for email; the plain body is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// Sender override for email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<PushSubscription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<i64>,
    pub keys: PushKeys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Validated destination handed to a channel adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    Email {
        address: String,
        html: Option<String>,
        from: Option<String>,
    },
    Sms {
        phone_number: String,
    },
    Push {
        subscription: PushSubscription,
    },
    InApp,
}

/// What an adapter delivers.
#[derive(Debug, Clone)]
pub struct Content {
    pub record_id: String,
    pub title: String,
    pub body: String,
    pub priority: Priority,
}

impl Destination {
    /// Resolve and validate the addressing required by `channel`.
    pub fn resolve(channel: Channel, metadata: &ChannelMetadata) -> AppResult<Self> {
        match channel {
            Channel::Email => {
                let address = metadata
                    .email
                    .as_deref()
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| {
                        AppError::Validation("channelMetadata.email is required for email".into())
                    })?;
                if !EMAIL_RE.is_match(address) {
                    return Err(AppError::Validation(format!(
                        "invalid email address: {}",
                        address
                    )));
                }
                if let Some(from) = metadata.from.as_deref() {
                    if !EMAIL_RE.is_match(from.trim()) {
                        return Err(AppError::Validation(format!(
                            "invalid sender address: {}",
                            from
                        )));
                    }
                }
                Ok(Destination::Email {
                    address: address.to_string(),
                    html: metadata.html.clone().filter(|h| !h.trim().is_empty()),
                    from: metadata.from.as_deref().map(|f| f.trim().to_string()),
                })
            }
            Channel::Sms => {
                let raw = metadata.phone_number.as_deref().ok_or_else(|| {
                    AppError::Validation("channelMetadata.phoneNumber is required for sms".into())
                })?;
                let phone_number = normalize_phone(raw).ok_or_else(|| {
                    AppError::Validation(format!("invalid phone number: {}", raw))
                })?;
                Ok(Destination::Sms { phone_number })
            }
            Channel::Push => {
                let subscription = metadata.subscription.as_ref().ok_or_else(|| {
                    AppError::Validation("channelMetadata.subscription is required for push".into())
                })?;
                validate_subscription(subscription)?;
                Ok(Destination::Push {
                    subscription: subscription.clone(),
                })
            }
            Channel::InApp => Ok(Destination::InApp),
        }
    }
}

/// Strip common separators and check the E.164-like shape.
fn normalize_phone(raw: &str) -> Option<String> {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    PHONE_RE.is_match(&compact).then_some(compact)
}

fn validate_subscription(subscription: &PushSubscription) -> AppResult<()> {
    let endpoint = url::Url::parse(&subscription.endpoint).map_err(|_| {
        AppError::Validation("subscription.endpoint must be an absolute URL".into())
    })?;
    if endpoint.scheme() != "https" || endpoint.host_str().is_none() {
        return Err(AppError::Validation(
            "subscription.endpoint must be an https URL".into(),
        ));
    }
    if subscription.keys.p256dh.trim().is_empty() || subscription.keys.auth.trim().is_empty() {
        return Err(AppError::Validation(
            "subscription.keys.p256dh and subscription.keys.auth are required".into(),
        ));
    }
    Ok(())
}

impl DeliveryRequest {
    /// Channel-independent field checks plus destination resolution.
    ///
    /// Whether the channel has a registered adapter is the dispatcher's check.
    pub fn validate(&self) -> AppResult<Destination> {
        if self.recipient_ref.trim().is_empty() {
            return Err(AppError::Validation("recipientRef must not be empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(AppError::Validation("title must not be empty".into()));
        }
        if self.body.trim().is_empty() {
            return Err(AppError::Validation("body must not be empty".into()));
        }
        if let Some(max) = self.max_retries {
            if max == 0 || max > MAX_RETRIES_LIMIT {
                return Err(AppError::Validation(format!(
                    "maxRetries must be between 1 and {}",
                    MAX_RETRIES_LIMIT
                )));
            }
        }
        Destination::resolve(self.channel, &self.channel_metadata)
    }
}
