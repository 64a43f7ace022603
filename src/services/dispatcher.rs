//! Delivery lifecycle: acceptance, attempts, retries with exponential backoff.
//!
//! A record moves `pending -> sent | failed`. Every lifecycle decision is made
//! by [`transition`]; the dispatcher only claims records, runs the adapter and
//! persists whatever `transition` returns with a versioned update.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::DispatchConfig;
use crate::db::models::{CreateDeliveryRecord, DeliveryRecord, DeliveryStatus};
use crate::db::repository::{DeliveryRecordRepository, DeliveryUpdate};
use crate::error::{AppError, AppResult};
use crate::services::channels::{AdapterRegistry, Outcome};
use crate::services::request::{ChannelMetadata, Content, DeliveryRequest, Destination};

pub const UNSUPPORTED_CHANNEL: &str = "unsupported channel";

/// How many orphaned records one sweep re-drives at most.
const SWEEP_BATCH: i64 = 100;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Delay before retry `n` (1-indexed): `min(base * 2^(n-1), max)`.
    pub fn backoff(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// What one attempt produced, before any lifecycle decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Delivered,
    Transient(String),
    Permanent(String),
    /// No adapter is registered for the record's channel. Consumes no attempt.
    Unsupported,
}

impl From<&Outcome> for AttemptResult {
    fn from(outcome: &Outcome) -> Self {
        let detail = || {
            outcome
                .error_detail
                .clone()
                .unwrap_or_else(|| "delivery failed".to_string())
        };
        if outcome.succeeded {
            AttemptResult::Delivered
        } else if outcome.permanent_failure {
            AttemptResult::Permanent(detail())
        } else {
            AttemptResult::Transient(detail())
        }
    }
}

/// The next state of a pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Sent {
        at: NaiveDateTime,
        retry_count: i32,
    },
    Retry {
        retry_count: i32,
        last_error: String,
        next_attempt_at: NaiveDateTime,
    },
    Failed {
        retry_count: i32,
        last_error: String,
        at: NaiveDateTime,
    },
}

/// Decide the next state of a pending record after one attempt.
pub fn transition(
    retry_count: i32,
    max_retries: i32,
    result: AttemptResult,
    policy: &RetryPolicy,
    now: NaiveDateTime,
) -> Transition {
    match result {
        AttemptResult::Delivered => Transition::Sent {
            at: now,
            retry_count,
        },
        AttemptResult::Unsupported => Transition::Failed {
            retry_count,
            last_error: UNSUPPORTED_CHANNEL.to_string(),
            at: now,
        },
        AttemptResult::Permanent(detail) => Transition::Failed {
            retry_count: (retry_count + 1).min(max_retries),
            last_error: detail,
            at: now,
        },
        AttemptResult::Transient(detail) => {
            let retry_count = retry_count + 1;
            if retry_count >= max_retries {
                Transition::Failed {
                    retry_count: max_retries,
                    last_error: detail,
                    at: now,
                }
            } else {
                let delay = policy.backoff(retry_count as u32);
                Transition::Retry {
                    retry_count,
                    last_error: detail,
                    next_attempt_at: now + chrono_duration(delay),
                }
            }
        }
    }
}

impl Transition {
    pub fn into_update(self) -> DeliveryUpdate {
        match self {
            Transition::Sent { at, retry_count } => DeliveryUpdate {
                status: DeliveryStatus::Sent,
                retry_count,
                last_error: None,
                sent_at: Some(at),
                next_attempt_at: at,
            },
            Transition::Retry {
                retry_count,
                last_error,
                next_attempt_at,
            } => DeliveryUpdate {
                status: DeliveryStatus::Pending,
                retry_count,
                last_error: Some(last_error),
                sent_at: None,
                next_attempt_at,
            },
            Transition::Failed {
                retry_count,
                last_error,
                at,
            } => DeliveryUpdate {
                status: DeliveryStatus::Failed,
                retry_count,
                last_error: Some(last_error),
                sent_at: None,
                next_attempt_at: at,
            },
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// The persisted result of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub record: DeliveryRecord,
    /// The push subscription used for this attempt is gone and should be dropped.
    pub discard_subscription: bool,
}

/// Accepts delivery requests and drives records to a terminal state.
#[derive(Clone)]
pub struct Dispatcher {
    pool: SqlitePool,
    registry: AdapterRegistry,
    policy: RetryPolicy,
    default_max_retries: u32,
    send_timeout: Duration,
    lease: Duration,
}

impl Dispatcher {
    pub fn new(pool: SqlitePool, registry: AdapterRegistry, config: &DispatchConfig) -> Self {
        Self {
            pool,
            registry,
            policy: RetryPolicy::from_config(config),
            default_max_retries: config.max_retries,
            send_timeout: config.send_timeout(),
            lease: Duration::from_secs(config.lease_seconds),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Validate a request and check a channel adapter exists for it.
    pub fn prepare(&self, request: &DeliveryRequest) -> AppResult<CreateDeliveryRecord> {
        request.validate()?;
        if !self.registry.supports(request.channel) {
            return Err(AppError::Validation(format!(
                "{}: {}",
                UNSUPPORTED_CHANNEL, request.channel
            )));
        }

        let channel_metadata = serde_json::to_string(&request.channel_metadata)
            .map_err(|e| AppError::Internal(e.into()))?;
        let max_retries = request.max_retries.unwrap_or(self.default_max_retries);

        Ok(CreateDeliveryRecord {
            recipient_ref: request.recipient_ref.trim().to_string(),
            channel: request.channel,
            title: request.title.clone(),
            body: request.body.clone(),
            priority: request.priority,
            channel_metadata,
            max_retries: max_retries as i32,
        })
    }

    /// Validate and persist a pending record without scheduling delivery.
    pub async fn create(&self, request: &DeliveryRequest) -> AppResult<DeliveryRecord> {
        let new_record = self.prepare(request)?;
        self.persist(new_record).await
    }

    /// Persist an already prepared record in `pending`.
    pub async fn persist(&self, new_record: CreateDeliveryRecord) -> AppResult<DeliveryRecord> {
        let record = DeliveryRecordRepository::create(&self.pool, new_record).await?;
        tracing::info!(
            "Accepted {} notification {} for recipient {}",
            record.channel,
            record.id,
            record.recipient_ref
        );
        Ok(record)
    }

    /// Accept a request: persist it as pending and schedule delivery in the
    /// background. Never waits for the first attempt.
    pub async fn accept(&self, request: &DeliveryRequest) -> AppResult<DeliveryRecord> {
        let record = self.create(request).await?;
        self.spawn_delivery(record.id.clone());
        Ok(record)
    }

    pub fn spawn_delivery(&self, record_id: String) -> JoinHandle<()> {
        self.spawn_bounded_delivery(record_id, None)
    }

    /// Like [`Dispatcher::spawn_delivery`], but every attempt first takes a
    /// permit from `slots` so retries stay inside the caller's bound.
    pub fn spawn_bounded_delivery(
        &self,
        record_id: String,
        slots: Option<Arc<Semaphore>>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.deliver_bounded(&record_id, slots).await {
                tracing::warn!("Delivery of {} interrupted: {:?}", record_id, e);
            }
        })
    }

    /// Drive a record until it is terminal or another worker holds it.
    pub async fn deliver(&self, record_id: &str) -> AppResult<()> {
        self.deliver_bounded(record_id, None).await
    }

    async fn deliver_bounded(
        &self,
        record_id: &str,
        slots: Option<Arc<Semaphore>>,
    ) -> AppResult<()> {
        loop {
            let Some(record) = DeliveryRecordRepository::find_by_id(&self.pool, record_id).await?
            else {
                tracing::debug!("Record {} deleted before delivery finished", record_id);
                return Ok(());
            };
            if record.status.is_terminal() {
                return Ok(());
            }

            let now = Utc::now().naive_utc();
            if matches!(record.lease_expires_at, Some(lease) if lease > now) {
                tracing::debug!("Record {} is leased by another worker", record_id);
                return Ok(());
            }
            if let Ok(wait) = (record.next_attempt_at - now).to_std() {
                tokio::time::sleep(wait).await;
            }

            let _permit = match &slots {
                Some(slots) => Some(
                    slots
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| AppError::Internal(e.into()))?,
                ),
                None => None,
            };
            match self.attempt_once(record_id).await? {
                Some(report) if report.record.status == DeliveryStatus::Pending => continue,
                _ => return Ok(()),
            }
        }
    }

    /// Claim the record and make one attempt. Returns `None` when the record
    /// could not be claimed or changed under us.
    pub async fn attempt_once(&self, record_id: &str) -> AppResult<Option<AttemptReport>> {
        let now = Utc::now().naive_utc();
        let lease_until = now + chrono_duration(self.lease);
        let Some(claimed) =
            DeliveryRecordRepository::claim(&self.pool, record_id, now, lease_until).await?
        else {
            return Ok(None);
        };

        let attempt = claimed.retry_count + 1;
        tracing::debug!(
            "Attempt {}/{} for {} notification {}",
            attempt,
            claimed.max_retries,
            claimed.channel,
            claimed.id
        );

        let (result, discard_subscription) = self.perform(&claimed).await;
        let next = transition(
            claimed.retry_count,
            claimed.max_retries,
            result,
            &self.policy,
            Utc::now().naive_utc(),
        );

        match &next {
            Transition::Sent { .. } => {
                tracing::info!("Notification {} sent via {}", claimed.id, claimed.channel)
            }
            Transition::Retry {
                last_error,
                next_attempt_at,
                ..
            } => tracing::warn!(
                "Notification {} attempt {} failed ({}); retrying at {}",
                claimed.id,
                attempt,
                last_error,
                next_attempt_at
            ),
            Transition::Failed { last_error, .. } => tracing::info!(
                "Notification {} failed permanently: {}",
                claimed.id,
                last_error
            ),
        }

        let updated = DeliveryRecordRepository::apply_transition(
            &self.pool,
            &claimed.id,
            claimed.version,
            next.into_update(),
        )
        .await?;

        match updated {
            Some(record) => Ok(Some(AttemptReport {
                record,
                discard_subscription,
            })),
            None => {
                tracing::warn!(
                    "Notification {} changed during attempt; result dropped",
                    claimed.id
                );
                Ok(None)
            }
        }
    }

    /// Run the adapter for a claimed record, bounded by the send timeout.
    async fn perform(&self, record: &DeliveryRecord) -> (AttemptResult, bool) {
        let Some(adapter) = self.registry.get(record.channel) else {
            return (AttemptResult::Unsupported, false);
        };

        let destination = match serde_json::from_str::<ChannelMetadata>(&record.channel_metadata)
            .map_err(|e| AppError::Validation(format!("stored channel metadata is unreadable: {}", e)))
            .and_then(|metadata| Destination::resolve(record.channel, &metadata))
        {
            Ok(destination) => destination,
            Err(e) => return (AttemptResult::Permanent(e.to_string()), false),
        };

        let content = Content {
            record_id: record.id.clone(),
            title: record.title.clone(),
            body: record.body.clone(),
            priority: record.priority,
        };

        match tokio::time::timeout(self.send_timeout, adapter.send(&destination, &content)).await {
            Ok(outcome) => (AttemptResult::from(&outcome), outcome.discard_subscription),
            Err(_) => (
                AttemptResult::Transient(format!(
                    "{} send timed out after {}ms",
                    record.channel,
                    self.send_timeout.as_millis()
                )),
                false,
            ),
        }
    }

    /// Re-drive pending records that are overdue by more than `grace` and not
    /// leased. These were orphaned by a restart or a dropped task.
    pub async fn sweep_once(&self, grace: Duration) -> AppResult<Vec<JoinHandle<()>>> {
        let now = Utc::now().naive_utc();
        let ids = DeliveryRecordRepository::find_orphaned_due(
            &self.pool,
            now,
            now - chrono_duration(grace),
            SWEEP_BATCH,
        )
        .await?;

        if !ids.is_empty() {
            tracing::info!("Re-driving {} orphaned notification(s)", ids.len());
        }
        Ok(ids.into_iter().map(|id| self.spawn_delivery(id)).collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::config::Config;
    use crate::db::models::Channel;
    use crate::services::channels::{ChannelAdapter, EmailAdapter, InAppAdapter, CHANNEL_DISABLED};
    use crate::services::init::test_pool;
    use crate::services::request::tests::{email_request, push_request, sms_request};

    /// Adapter double that replays scripted outcomes, then repeats the last one.
    pub(crate) struct ScriptedAdapter {
        channel: Channel,
        script: Mutex<VecDeque<Outcome>>,
        fallback: Outcome,
        delay: Duration,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl ScriptedAdapter {
        pub(crate) fn new(channel: Channel, script: Vec<Outcome>) -> Self {
            let fallback = script.last().cloned().unwrap_or_else(Outcome::success);
            Self {
                channel,
                script: Mutex::new(script.into()),
                fallback,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedAdapter {
        fn channel(&self) -> Channel {
            self.channel
        }

        fn is_enabled(&self) -> bool {
            true
        }

        async fn send(&self, _destination: &Destination, _content: &Content) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    pub(crate) fn fast_config() -> DispatchConfig {
        DispatchConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            send_timeout_seconds: 1,
            ..Config::default().dispatch
        }
    }

    pub(crate) fn dispatcher_with(pool: SqlitePool, registry: AdapterRegistry) -> Dispatcher {
        Dispatcher::new(pool, registry, &fast_config())
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        let delays: Vec<u64> = (1..=8).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.backoff(200), Duration::from_secs(60));
    }

    #[test]
    fn transition_rules() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        let now = Utc::now().naive_utc();

        assert!(matches!(
            transition(1, 3, AttemptResult::Delivered, &policy, now),
            Transition::Sent { retry_count: 1, .. }
        ));

        match transition(1, 3, AttemptResult::Transient("429".into()), &policy, now) {
            Transition::Retry {
                retry_count,
                next_attempt_at,
                ..
            } => {
                assert_eq!(retry_count, 2);
                assert_eq!(next_attempt_at, now + chrono::Duration::seconds(2));
            }
            other => panic!("expected retry, got {:?}", other),
        }

        assert!(matches!(
            transition(2, 3, AttemptResult::Transient("429".into()), &policy, now),
            Transition::Failed { retry_count: 3, .. }
        ));
        assert!(matches!(
            transition(0, 3, AttemptResult::Permanent("gone".into()), &policy, now),
            Transition::Failed { retry_count: 1, .. }
        ));
        assert!(matches!(
            transition(0, 3, AttemptResult::Unsupported, &policy, now),
            Transition::Failed { retry_count: 0, .. }
        ));
    }

    #[test]
    fn sent_update_sets_sent_at_only_on_success() {
        let now = Utc::now().naive_utc();
        let sent = Transition::Sent { at: now, retry_count: 0 }.into_update();
        assert_eq!(sent.sent_at, Some(now));
        assert!(sent.last_error.is_none());

        let failed = Transition::Failed {
            retry_count: 1,
            last_error: "x".into(),
            at: now,
        }
        .into_update();
        assert!(failed.sent_at.is_none());
        assert_eq!(failed.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn accept_returns_pending_with_zero_retries() {
        let pool = test_pool().await;
        let dispatcher = dispatcher_with(pool, AdapterRegistry::new().register(Arc::new(InAppAdapter)));
        let mut request = email_request("a@b.com");
        request.channel = Channel::InApp;

        let record = dispatcher.accept(&request).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.max_retries, 3);
    }

    #[tokio::test]
    async fn transient_twice_then_success_is_sent_with_two_retries() {
        let pool = test_pool().await;
        let adapter = Arc::new(ScriptedAdapter::new(
            Channel::Email,
            vec![
                Outcome::transient("rate limited"),
                Outcome::transient("rate limited"),
                Outcome::success(),
            ],
        ));
        let dispatcher = dispatcher_with(pool.clone(), AdapterRegistry::new().register(adapter.clone()));

        let mut request = email_request("a@b.com");
        request.max_retries = Some(3);
        let record = dispatcher.create(&request).await.unwrap();
        dispatcher.deliver(&record.id).await.unwrap();

        let done = DeliveryRecordRepository::find_by_id(&pool, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, DeliveryStatus::Sent);
        assert_eq!(done.retry_count, 2);
        assert!(done.sent_at.is_some());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn expired_push_subscription_fails_after_one_attempt() {
        let pool = test_pool().await;
        let adapter = Arc::new(ScriptedAdapter::new(
            Channel::Push,
            vec![Outcome::subscription_expired("push subscription expired (410)")],
        ));
        let dispatcher = dispatcher_with(pool.clone(), AdapterRegistry::new().register(adapter.clone()));

        let record = dispatcher.create(&push_request()).await.unwrap();
        let report = dispatcher.attempt_once(&record.id).await.unwrap().unwrap();

        assert!(report.discard_subscription);
        assert_eq!(report.record.status, DeliveryStatus::Failed);
        assert_eq!(report.record.retry_count, 1);
        assert!(report.record.last_error.as_deref().unwrap().contains("410"));

        dispatcher.deliver(&record.id).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_end_failed_at_max() {
        let pool = test_pool().await;
        let adapter = Arc::new(ScriptedAdapter::new(
            Channel::Sms,
            vec![Outcome::transient("Twilio error (503)")],
        ));
        let dispatcher = dispatcher_with(pool.clone(), AdapterRegistry::new().register(adapter.clone()));

        let record = dispatcher.create(&sms_request("+15551234567")).await.unwrap();
        dispatcher.deliver(&record.id).await.unwrap();

        let done = DeliveryRecordRepository::find_by_id(&pool, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, DeliveryStatus::Failed);
        assert_eq!(done.retry_count, done.max_retries);
        assert_eq!(done.last_error.as_deref(), Some("Twilio error (503)"));
        assert!(done.sent_at.is_none());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn disabled_channel_fails_without_retry() {
        let pool = test_pool().await;
        let dispatcher = dispatcher_with(
            pool.clone(),
            AdapterRegistry::new().register(Arc::new(EmailAdapter::disabled())),
        );

        let record = dispatcher.create(&email_request("a@b.com")).await.unwrap();
        dispatcher.deliver(&record.id).await.unwrap();

        let done = DeliveryRecordRepository::find_by_id(&pool, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, DeliveryStatus::Failed);
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.last_error.as_deref(), Some(CHANNEL_DISABLED));
    }

    #[tokio::test]
    async fn unsupported_channel_is_rejected_before_persisting() {
        let pool = test_pool().await;
        let dispatcher = dispatcher_with(pool.clone(), AdapterRegistry::new().register(Arc::new(InAppAdapter)));

        let err = dispatcher.accept(&sms_request("+15551234567")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.starts_with(UNSUPPORTED_CHANNEL)));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn adapter_removed_after_acceptance_consumes_no_attempt() {
        let pool = test_pool().await;
        let accepting = dispatcher_with(
            pool.clone(),
            AdapterRegistry::new().register(Arc::new(ScriptedAdapter::new(Channel::Email, vec![]))),
        );
        let record = accepting.create(&email_request("a@b.com")).await.unwrap();

        let without_email = dispatcher_with(pool.clone(), AdapterRegistry::new());
        let report = without_email.attempt_once(&record.id).await.unwrap().unwrap();
        assert_eq!(report.record.status, DeliveryStatus::Failed);
        assert_eq!(report.record.retry_count, 0);
        assert_eq!(report.record.last_error.as_deref(), Some(UNSUPPORTED_CHANNEL));
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_transient() {
        let pool = test_pool().await;
        let adapter = Arc::new(
            ScriptedAdapter::new(Channel::Email, vec![Outcome::success()])
                .with_delay(Duration::from_millis(1500)),
        );
        let dispatcher = dispatcher_with(pool.clone(), AdapterRegistry::new().register(adapter));

        let mut request = email_request("a@b.com");
        request.max_retries = Some(2);
        let record = dispatcher.create(&request).await.unwrap();
        let report = dispatcher.attempt_once(&record.id).await.unwrap().unwrap();

        assert_eq!(report.record.status, DeliveryStatus::Pending);
        assert_eq!(report.record.retry_count, 1);
        assert!(report.record.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn second_attempt_waits_for_lease_and_due_time() {
        let pool = test_pool().await;
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![Outcome::transient("busy")]));
        let dispatcher = Dispatcher::new(
            pool.clone(),
            AdapterRegistry::new().register(adapter),
            &DispatchConfig {
                base_delay_ms: 60_000,
                ..fast_config()
            },
        );

        let record = dispatcher.create(&email_request("a@b.com")).await.unwrap();
        assert!(dispatcher.attempt_once(&record.id).await.unwrap().is_some());
        // Backoff has not elapsed, so the record cannot be claimed yet.
        assert!(dispatcher.attempt_once(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweeper_redrives_orphaned_records() {
        let pool = test_pool().await;
        let dispatcher = dispatcher_with(pool.clone(), AdapterRegistry::new().register(Arc::new(InAppAdapter)));
        let mut request = email_request("a@b.com");
        request.channel = Channel::InApp;
        let record = dispatcher.create(&request).await.unwrap();

        let handles = dispatcher.sweep_once(Duration::ZERO).await.unwrap();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }

        let done = DeliveryRecordRepository::find_by_id(&pool, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, DeliveryStatus::Sent);
    }
}
