//! Bulk fan-out with bounded concurrency and cancellation.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::db::models::{DeliveryRecord, DeliveryStatus};
use crate::error::{AppError, AppResult};
use crate::services::dispatcher::Dispatcher;
use crate::services::request::DeliveryRequest;

/// Why one item of a bulk dispatch produced no delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum ItemError {
    Validation(String),
    Cancelled,
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct BulkItemResult {
    pub request: DeliveryRequest,
    pub record: Option<DeliveryRecord>,
    pub error: Option<ItemError>,
    pub discard_subscription: bool,
}

impl BulkItemResult {
    fn accepted(request: DeliveryRequest, record: DeliveryRecord, discard_subscription: bool) -> Self {
        Self {
            request,
            record: Some(record),
            error: None,
            discard_subscription,
        }
    }

    fn rejected(request: DeliveryRequest, error: ItemError) -> Self {
        Self {
            request,
            record: None,
            error: Some(error),
            discard_subscription: false,
        }
    }
}

/// Per-item results in input order.
#[derive(Debug, Clone)]
pub struct BulkReport {
    pub results: Vec<BulkItemResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSummary {
    pub total: usize,
    pub accepted: usize,
    pub sent: usize,
    pub failed: usize,
    pub pending: usize,
    pub rejected: usize,
    pub cancelled: usize,
    pub expired_subscriptions: usize,
}

impl BulkReport {
    pub fn summary(&self) -> BulkSummary {
        let mut summary = BulkSummary {
            total: self.results.len(),
            ..Default::default()
        };
        for item in &self.results {
            if let Some(record) = &item.record {
                summary.accepted += 1;
                match record.status {
                    DeliveryStatus::Sent => summary.sent += 1,
                    DeliveryStatus::Failed => summary.failed += 1,
                    DeliveryStatus::Pending => summary.pending += 1,
                }
            }
            match &item.error {
                Some(ItemError::Cancelled) => summary.cancelled += 1,
                Some(_) => summary.rejected += 1,
                None => {}
            }
            if item.discard_subscription {
                summary.expired_subscriptions += 1;
            }
        }
        summary
    }
}

/// Runs each request of a batch through the dispatcher, at most
/// `concurrency` provider calls at a time.
#[derive(Clone)]
pub struct BulkCoordinator {
    dispatcher: Dispatcher,
    concurrency: usize,
}

impl BulkCoordinator {
    pub fn new(dispatcher: Dispatcher, concurrency: usize) -> Self {
        Self {
            dispatcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Validate and dispatch every request independently.
    ///
    /// Items not yet started when `cancel` fires are reported as cancelled;
    /// items already holding a slot run to completion. An item's first attempt
    /// is made inside its slot. Retries continue in the background and take a
    /// slot from the same batch for every attempt.
    pub async fn dispatch(
        &self,
        requests: Vec<DeliveryRequest>,
        cancel: CancellationToken,
    ) -> AppResult<BulkReport> {
        if requests.is_empty() {
            return Err(AppError::Validation(
                "bulk dispatch requires at least one request".to_string(),
            ));
        }

        tracing::info!(
            "Bulk dispatch of {} notification(s), concurrency {}",
            requests.len(),
            self.concurrency
        );

        let slots = Arc::new(Semaphore::new(self.concurrency));
        let handles: Vec<_> = requests
            .iter()
            .cloned()
            .map(|request| {
                let dispatcher = self.dispatcher.clone();
                let slots = slots.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { run_item(dispatcher, slots, cancel, request).await })
            })
            .collect();

        let results = join_all(handles)
            .await
            .into_iter()
            .zip(requests)
            .map(|(joined, request)| match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Bulk item task failed: {}", e);
                    BulkItemResult::rejected(request, ItemError::Internal(e.to_string()))
                }
            })
            .collect();

        let report = BulkReport { results };
        let summary = report.summary();
        tracing::info!(
            "Bulk dispatch done: {} accepted, {} sent, {} rejected, {} cancelled",
            summary.accepted,
            summary.sent,
            summary.rejected,
            summary.cancelled
        );
        Ok(report)
    }
}

async fn run_item(
    dispatcher: Dispatcher,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    request: DeliveryRequest,
) -> BulkItemResult {
    let prepared = match dispatcher.prepare(&request) {
        Ok(prepared) => prepared,
        Err(AppError::Validation(message)) => {
            return BulkItemResult::rejected(request, ItemError::Validation(message))
        }
        Err(e) => return BulkItemResult::rejected(request, ItemError::Internal(e.to_string())),
    };

    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return BulkItemResult::rejected(request, ItemError::Cancelled);
        }
        permit = slots.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(e) => return BulkItemResult::rejected(request, ItemError::Internal(e.to_string())),
        },
    };

    let record = match dispatcher.persist(prepared).await {
        Ok(record) => record,
        Err(e) => {
            tracing::error!("Failed to persist bulk item: {:?}", e);
            return BulkItemResult::rejected(request, ItemError::Internal(e.to_string()));
        }
    };

    let attempt = dispatcher.attempt_once(&record.id).await;
    drop(permit);

    match attempt {
        Ok(Some(report)) => {
            if report.record.status == DeliveryStatus::Pending {
                dispatcher.spawn_bounded_delivery(report.record.id.clone(), Some(slots));
            }
            BulkItemResult::accepted(request, report.record, report.discard_subscription)
        }
        Ok(None) => {
            dispatcher.spawn_bounded_delivery(record.id.clone(), Some(slots));
            BulkItemResult::accepted(request, record, false)
        }
        Err(e) => {
            tracing::warn!("First attempt for {} failed to run: {:?}", record.id, e);
            dispatcher.spawn_bounded_delivery(record.id.clone(), Some(slots));
            BulkItemResult::accepted(request, record, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::db::models::Channel;
    use crate::services::channels::{AdapterRegistry, InAppAdapter, Outcome};
    use crate::services::dispatcher::tests::{dispatcher_with, ScriptedAdapter};
    use crate::services::init::test_pool;
    use crate::services::request::tests::{email_request, push_request, sms_request};

    fn in_app(title: &str) -> DeliveryRequest {
        let mut request = email_request("a@b.com");
        request.channel = Channel::InApp;
        request.title = title.to_string();
        request
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let pool = test_pool().await;
        let coordinator = BulkCoordinator::new(dispatcher_with(pool, AdapterRegistry::new()), 4);
        let err = coordinator
            .dispatch(Vec::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn one_invalid_item_does_not_affect_others() {
        let pool = test_pool().await;
        let registry = AdapterRegistry::new()
            .register(Arc::new(ScriptedAdapter::new(Channel::Email, vec![])))
            .register(Arc::new(ScriptedAdapter::new(Channel::Sms, vec![])))
            .register(Arc::new(InAppAdapter));
        let coordinator = BulkCoordinator::new(dispatcher_with(pool.clone(), registry), 2);

        let requests = vec![
            email_request("a@b.com"),
            sms_request("+15551234567"),
            sms_request("12-ab"),
            in_app("inbox"),
        ];
        let report = coordinator
            .dispatch(requests, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.results.len(), 4);
        assert!(matches!(
            report.results[2].error,
            Some(ItemError::Validation(ref m)) if m.contains("phone")
        ));
        assert!(report.results[2].record.is_none());
        for i in [0, 1, 3] {
            let record = report.results[i].record.as_ref().unwrap();
            assert_eq!(record.status, DeliveryStatus::Sent);
            assert_eq!(record.channel, report.results[i].request.channel);
        }

        let summary = report.summary();
        assert_eq!(summary.accepted, 3);
        assert_eq!(summary.rejected, 1);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_and_order_preserved() {
        let pool = test_pool().await;
        let adapter = Arc::new(
            ScriptedAdapter::new(Channel::InApp, vec![Outcome::success()])
                .with_delay(Duration::from_millis(20)),
        );
        let coordinator = BulkCoordinator::new(
            dispatcher_with(pool, AdapterRegistry::new().register(adapter.clone())),
            3,
        );

        let requests: Vec<_> = (0..10).map(|i| in_app(&format!("n{}", i))).collect();
        let report = coordinator
            .dispatch(requests, CancellationToken::new())
            .await
            .unwrap();

        let titles: Vec<_> = report
            .results
            .iter()
            .map(|r| r.record.as_ref().unwrap().title.clone())
            .collect();
        let expected: Vec<_> = (0..10).map(|i| format!("n{}", i)).collect();
        assert_eq!(titles, expected);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 10);
        assert!(adapter.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn retries_stay_within_the_batch_bound() {
        let pool = test_pool().await;
        let adapter = Arc::new(
            ScriptedAdapter::new(
                Channel::Email,
                (0..10)
                    .map(|_| Outcome::transient("provider unavailable"))
                    .chain([Outcome::success()])
                    .collect(),
            )
            .with_delay(Duration::from_millis(50)),
        );
        let coordinator = BulkCoordinator::new(
            dispatcher_with(pool.clone(), AdapterRegistry::new().register(adapter.clone())),
            2,
        );

        let requests: Vec<_> = (0..10)
            .map(|_| {
                let mut request = email_request("a@b.com");
                request.max_retries = Some(5);
                request
            })
            .collect();
        let report = coordinator
            .dispatch(requests, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.summary().accepted, 10);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let sent: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM delivery_records WHERE status = 'sent'")
                    .fetch_one(&pool)
                    .await
                    .unwrap();
            if sent == 10 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "only {} sent", sent);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 20);
        assert!(adapter.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancellation_skips_items_not_yet_started() {
        let pool = test_pool().await;
        let adapter = Arc::new(
            ScriptedAdapter::new(Channel::InApp, vec![Outcome::success()])
                .with_delay(Duration::from_millis(100)),
        );
        let coordinator = BulkCoordinator::new(
            dispatcher_with(pool, AdapterRegistry::new().register(adapter.clone())),
            1,
        );
        let cancel = CancellationToken::new();

        let requests: Vec<_> = (0..5).map(|i| in_app(&format!("n{}", i))).collect();
        let task = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.dispatch(requests, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let report = task.await.unwrap().unwrap();

        let summary = report.summary();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.cancelled, 4);
        assert_eq!(
            report.results[0].record.as_ref().unwrap().status,
            DeliveryStatus::Sent
        );
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_push_subscriptions_are_counted() {
        let pool = test_pool().await;
        let adapter = Arc::new(ScriptedAdapter::new(
            Channel::Push,
            vec![
                Outcome::subscription_expired("push subscription expired (410)"),
                Outcome::success(),
            ],
        ));
        let coordinator = BulkCoordinator::new(
            dispatcher_with(pool, AdapterRegistry::new().register(adapter)),
            1,
        );

        let report = coordinator
            .dispatch(vec![push_request(), push_request()], CancellationToken::new())
            .await
            .unwrap();
        let summary = report.summary();
        assert_eq!(summary.expired_subscriptions, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent, 1);
    }
}
