use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Sms, Channel::Push, Channel::InApp];

    /// Convert from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "push" => Some(Channel::Push),
            "in_app" => Some(Channel::InApp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::InApp => "in_app",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Channel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid channel: {}", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl TryFrom<String> for Priority {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid priority: {}", value))
    }
}

/// Delivery lifecycle state. `Sent` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl TryFrom<String> for DeliveryStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid delivery status: {}", value))
    }
}

/// Persisted state of one notification and its attempt history.
///
/// Delivery fields (`status`, `sent_at`, `last_error`, `retry_count`,
/// `next_attempt_at`, `lease_expires_at`, `version`) are only written by the
/// dispatcher through versioned conditional updates. `read`/`read_at` are
/// owned by the read API and never bump `version`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Primary key (UUID)
    pub id: String,

    /// Opaque recipient identity supplied by the caller.
    pub recipient_ref: String,

    #[sqlx(try_from = "String")]
    pub channel: Channel,

    pub title: String,
    pub body: String,

    #[sqlx(try_from = "String")]
    pub priority: Priority,

    /// JSON-serialized channel addressing (email address, phone number or push
    /// subscription). Kept so retries reach the same destination.
    pub channel_metadata: String,

    #[sqlx(try_from = "String")]
    pub status: DeliveryStatus,

    pub read: bool,
    pub read_at: Option<NaiveDateTime>,
    pub sent_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,

    /// When the record becomes eligible for its next attempt.
    pub next_attempt_at: NaiveDateTime,

    /// Set while an attempt is in flight; a claim is only granted when this is
    /// unset or in the past.
    pub lease_expires_at: Option<NaiveDateTime>,

    /// Optimistic concurrency counter for delivery transitions.
    pub version: i64,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data required to insert a new pending record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeliveryRecord {
    pub recipient_ref: String,
    pub channel: Channel,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub channel_metadata: String,
    pub max_retries: i32,
}

/// Optional filters for listing a recipient's records.
#[derive(Debug, Clone, Default)]
pub struct DeliveryRecordFilter {
    pub channel: Option<Channel>,
    pub status: Option<DeliveryStatus>,
    pub read: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips_through_strings() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_str(channel.as_str()), Some(channel));
        }
        assert_eq!(Channel::from_str("IN_APP"), Some(Channel::InApp));
        assert!(Channel::try_from("fax".to_string()).is_err());
    }

    #[test]
    fn channel_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Channel::InApp).unwrap(),
            "\"in_app\""
        );
        let parsed: Channel = serde_json::from_str("\"sms\"").unwrap();
        assert_eq!(parsed, Channel::Sms);
    }

    #[test]
    fn priority_defaults_to_medium() {
        assert_eq!(Priority::default(), Priority::Medium);
        assert_eq!(Priority::from_str("HIGH"), Some(Priority::High));
        assert_eq!(Priority::from_str("urgent"), None);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(DeliveryStatus::Sent.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
    }
}
