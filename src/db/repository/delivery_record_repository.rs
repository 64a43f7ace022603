use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    CreateDeliveryRecord, DeliveryRecord, DeliveryRecordFilter, DeliveryStatus,
};
use crate::error::{AppError, AppResult};

/// Column list shared by every query returning a full `DeliveryRecord`.
macro_rules! record_columns {
    () => {
        r#"
            id,
            recipient_ref,
            channel,
            title,
            body,
            priority,
            channel_metadata,
            status,
            read,
            read_at,
            sent_at,
            last_error,
            retry_count,
            max_retries,
            next_attempt_at,
            lease_expires_at,
            version,
            created_at,
            updated_at
        "#
    };
}

/// Delivery fields written by one lifecycle transition.
#[derive(Debug, Clone)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub sent_at: Option<NaiveDateTime>,
    pub next_attempt_at: NaiveDateTime,
}

/// Repository for delivery records.
///
/// Implementation notes:
/// - Every delivery transition is a single `UPDATE ... WHERE id = ? AND version = ?`
///   so a stale writer never overwrites a newer state.
/// - Attempt claiming sets a lease with one conditional `UPDATE`; at most one
///   worker holds a record at a time, which keeps attempts for the same record
///   strictly sequential.
/// - Read-flag updates do not touch `version`, so marking a record read never
///   conflicts with an in-flight delivery.
pub struct DeliveryRecordRepository;

impl DeliveryRecordRepository {
    /// Insert a new record in `pending`, immediately eligible for its first attempt.
    pub async fn create(
        pool: &SqlitePool,
        record: CreateDeliveryRecord,
    ) -> AppResult<DeliveryRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, DeliveryRecord>(concat!(
            r#"
            INSERT INTO delivery_records (
                id,
                recipient_ref,
                channel,
                title,
                body,
                priority,
                channel_metadata,
                status,
                read,
                read_at,
                sent_at,
                last_error,
                retry_count,
                max_retries,
                next_attempt_at,
                lease_expires_at,
                version,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, NULL, NULL, NULL, 0, ?, ?, NULL, 0, ?, ?)
            RETURNING
            "#,
            record_columns!()
        ))
        .bind(id)
        .bind(record.recipient_ref)
        .bind(record.channel.as_str())
        .bind(record.title)
        .bind(record.body)
        .bind(record.priority.as_str())
        .bind(record.channel_metadata)
        .bind(record.max_retries)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Fetch a record by id regardless of owner. Used by the dispatcher only.
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<DeliveryRecord>> {
        sqlx::query_as::<_, DeliveryRecord>(concat!(
            "SELECT",
            record_columns!(),
            "FROM delivery_records WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Fetch a record only if it belongs to `recipient_ref`.
    pub async fn find_owned(
        pool: &SqlitePool,
        id: &str,
        recipient_ref: &str,
    ) -> AppResult<Option<DeliveryRecord>> {
        sqlx::query_as::<_, DeliveryRecord>(concat!(
            "SELECT",
            record_columns!(),
            "FROM delivery_records WHERE id = ? AND recipient_ref = ?"
        ))
        .bind(id)
        .bind(recipient_ref)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// List a recipient's records with optional filters, newest first.
    pub async fn list_for_recipient(
        pool: &SqlitePool,
        recipient_ref: &str,
        filter: &DeliveryRecordFilter,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<DeliveryRecord>> {
        let channel = filter.channel.map(|c| c.as_str());
        let status = filter.status.map(|s| s.as_str());

        sqlx::query_as::<_, DeliveryRecord>(concat!(
            "SELECT",
            record_columns!(),
            r#"
            FROM delivery_records
            WHERE recipient_ref = ?
              AND (? IS NULL OR channel = ?)
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR read = ?)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            OFFSET ?
            "#
        ))
        .bind(recipient_ref)
        .bind(channel)
        .bind(channel)
        .bind(status)
        .bind(status)
        .bind(filter.read)
        .bind(filter.read)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Count a recipient's records with optional filters.
    pub async fn count_for_recipient(
        pool: &SqlitePool,
        recipient_ref: &str,
        filter: &DeliveryRecordFilter,
    ) -> AppResult<i64> {
        let channel = filter.channel.map(|c| c.as_str());
        let status = filter.status.map(|s| s.as_str());

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM delivery_records
            WHERE recipient_ref = ?
              AND (? IS NULL OR channel = ?)
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR read = ?)
            "#,
        )
        .bind(recipient_ref)
        .bind(channel)
        .bind(channel)
        .bind(status)
        .bind(status)
        .bind(filter.read)
        .bind(filter.read)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count)
    }

    /// Claim a pending, due, unleased record for one attempt.
    ///
    /// Returns `None` when the record is terminal, not yet due, already leased
    /// by another worker, or gone.
    pub async fn claim(
        pool: &SqlitePool,
        id: &str,
        now: NaiveDateTime,
        lease_until: NaiveDateTime,
    ) -> AppResult<Option<DeliveryRecord>> {
        sqlx::query_as::<_, DeliveryRecord>(concat!(
            r#"
            UPDATE delivery_records
            SET lease_expires_at = ?, version = version + 1, updated_at = ?
            WHERE id = ?
              AND status = 'pending'
              AND next_attempt_at <= ?
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
            RETURNING
            "#,
            record_columns!()
        ))
        .bind(lease_until)
        .bind(now)
        .bind(id)
        .bind(now)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Apply one lifecycle transition if the record is still at `expected_version`.
    ///
    /// Clears the attempt lease. Returns `None` when another writer got there
    /// first or the record was deleted.
    pub async fn apply_transition(
        pool: &SqlitePool,
        id: &str,
        expected_version: i64,
        update: DeliveryUpdate,
    ) -> AppResult<Option<DeliveryRecord>> {
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, DeliveryRecord>(concat!(
            r#"
            UPDATE delivery_records
            SET
                status = ?,
                retry_count = ?,
                last_error = ?,
                sent_at = ?,
                next_attempt_at = ?,
                lease_expires_at = NULL,
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND version = ?
            RETURNING
            "#,
            record_columns!()
        ))
        .bind(update.status.as_str())
        .bind(update.retry_count)
        .bind(update.last_error)
        .bind(update.sent_at)
        .bind(update.next_attempt_at)
        .bind(now)
        .bind(id)
        .bind(expected_version)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Ids of pending records that are overdue by more than the grace period and
    /// not held by a live lease. Higher priority first, then oldest due.
    pub async fn find_orphaned_due(
        pool: &SqlitePool,
        now: NaiveDateTime,
        due_before: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT id
            FROM delivery_records
            WHERE status = 'pending'
              AND next_attempt_at <= ?
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
            ORDER BY
                CASE priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END,
                next_attempt_at ASC
            LIMIT ?
            "#,
        )
        .bind(due_before)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Mark a record read. `read_at` is only set the first time.
    pub async fn mark_read(
        pool: &SqlitePool,
        id: &str,
        recipient_ref: &str,
    ) -> AppResult<Option<DeliveryRecord>> {
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, DeliveryRecord>(concat!(
            r#"
            UPDATE delivery_records
            SET
                read = 1,
                read_at = COALESCE(read_at, ?),
                updated_at = CASE WHEN read = 1 THEN updated_at ELSE ? END
            WHERE id = ? AND recipient_ref = ?
            RETURNING
            "#,
            record_columns!()
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(recipient_ref)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Permanently delete a record owned by `recipient_ref`. Returns whether a row was removed.
    pub async fn delete_owned(pool: &SqlitePool, id: &str, recipient_ref: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM delivery_records WHERE id = ? AND recipient_ref = ?")
            .bind(id)
            .bind(recipient_ref)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
