use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{Channel, DeliveryRecord, DeliveryRecordFilter, DeliveryStatus, Priority};
use crate::db::DeliveryRecordRepository;
use crate::error::{AppError, AppResult};
use crate::routes::auth::AuthUser;
use crate::services::bulk::{BulkItemResult, BulkSummary, ItemError};
use crate::services::request::DeliveryRequest;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_notifications).post(send_notification))
        .route("/send", post(send_notification))
        .route("/send-bulk", post(send_bulk))
        .route("/:id", get(get_notification).delete(delete_notification))
        .route("/:id/read", put(mark_as_read))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub channel: Option<Channel>,
    pub status: Option<DeliveryStatus>,
    pub read: Option<bool>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkSendRequest {
    #[serde(alias = "notifications")]
    pub requests: Vec<DeliveryRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsListResponse {
    pub items: Vec<NotificationResponse>,
    pub total: i64,
    pub pages: i64,
    pub current_page: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    pub id: String,
    pub recipient_ref: String,
    pub channel: Channel,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub status: DeliveryStatus,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn utc(t: NaiveDateTime) -> DateTime<Utc> {
    t.and_utc()
}

impl From<DeliveryRecord> for NotificationResponse {
    fn from(r: DeliveryRecord) -> Self {
        let next_attempt_at = (r.status == DeliveryStatus::Pending).then(|| utc(r.next_attempt_at));
        Self {
            id: r.id,
            recipient_ref: r.recipient_ref,
            channel: r.channel,
            title: r.title,
            body: r.body,
            priority: r.priority,
            status: r.status,
            read: r.read,
            read_at: r.read_at.map(utc),
            sent_at: r.sent_at.map(utc),
            last_error: r.last_error,
            retry_count: r.retry_count,
            max_retries: r.max_retries,
            next_attempt_at,
            created_at: utc(r.created_at),
            updated_at: utc(r.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResponse {
    pub index: usize,
    pub request: DeliveryRequest,
    pub record: Option<NotificationResponse>,
    pub error: Option<ItemError>,
    pub subscription_expired: bool,
}

#[derive(Debug, Serialize)]
pub struct BulkSendResponse {
    pub results: Vec<BulkItemResponse>,
    pub summary: BulkSummary,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: String,
    pub message: String,
}

fn not_found() -> AppError {
    AppError::NotFound("Notification not found".to_string())
}

// ============================================================================
// Handlers
// ============================================================================

/// Accept one delivery request. Returns as soon as the record is persisted.
async fn send_notification(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    payload: Result<Json<DeliveryRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<NotificationResponse>)> {
    let Json(request) = payload?;
    tracing::info!(
        "Send of {} notification requested by {}",
        request.channel,
        caller.id
    );
    let record = state.dispatcher.accept(&request).await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

/// Fan a batch out through the bulk coordinator.
///
/// The batch is cancelled if the client goes away or the server shuts down;
/// items that had not started are reported as cancelled.
async fn send_bulk(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    payload: Result<Json<BulkSendRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<BulkSendResponse>)> {
    let Json(body) = payload?;

    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();

    tracing::info!(
        "Bulk send of {} notification(s) requested by {}",
        body.requests.len(),
        caller.id
    );
    let report = state.bulk.dispatch(body.requests, cancel).await?;
    let summary = report.summary();

    let results = report
        .results
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let BulkItemResult {
                request,
                record,
                error,
                discard_subscription,
            } = item;
            BulkItemResponse {
                index,
                request,
                record: record.map(NotificationResponse::from),
                error,
                subscription_expired: discard_subscription,
            }
        })
        .collect();

    Ok((StatusCode::CREATED, Json(BulkSendResponse { results, summary })))
}

/// List the caller's notifications, newest first.
async fn list_notifications(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    query: Result<Query<ListNotificationsQuery>, QueryRejection>,
) -> AppResult<Json<NotificationsListResponse>> {
    let Query(query) = query?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1)
        .checked_mul(limit)
        .ok_or_else(|| AppError::Validation("page is out of range".to_string()))?;

    let filter = DeliveryRecordFilter {
        channel: query.channel,
        status: query.status,
        read: query.read,
    };

    let (records, total) = tokio::try_join!(
        DeliveryRecordRepository::list_for_recipient(&state.db, &caller.id, &filter, limit, offset),
        DeliveryRecordRepository::count_for_recipient(&state.db, &caller.id, &filter),
    )?;

    let pages = (total + limit - 1) / limit;

    Ok(Json(NotificationsListResponse {
        items: records.into_iter().map(NotificationResponse::from).collect(),
        total,
        pages,
        current_page: page,
    }))
}

async fn get_notification(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationResponse>> {
    let record = DeliveryRecordRepository::find_owned(&state.db, &id, &caller.id)
        .await?
        .ok_or_else(not_found)?;
    Ok(Json(record.into()))
}

/// Idempotent: `readAt` keeps the time of the first call.
async fn mark_as_read(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationResponse>> {
    let record = DeliveryRecordRepository::mark_read(&state.db, &id, &caller.id)
        .await?
        .ok_or_else(not_found)?;
    Ok(Json(record.into()))
}

async fn delete_notification(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<DeleteResponse>> {
    if !DeliveryRecordRepository::delete_owned(&state.db, &id, &caller.id).await? {
        return Err(not_found());
    }
    tracing::info!("Notification {} deleted by {}", id, caller.id);
    Ok(Json(DeleteResponse {
        id,
        message: "Notification deleted".to_string(),
    }))
}
