//! Accepting messages into the per-device queues.

use crate::accounts::ensure_active;
use crate::db::{self, AccountRecord, DeviceRecord, MessageRecord};
use crate::devices::owned_device;
use crate::error::{ApiError, ApiResult};
use crate::phone::normalize_recipient;
use crate::types::{DeviceStatus, MessageStatus};
use crate::AppState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const MAX_PRIORITY: i64 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub device_id: String,
    #[serde(alias = "to", alias = "phoneNumber")]
    pub recipient: String,
    #[serde(alias = "body")]
    pub message: Option<String>,
    pub attachment_url: Option<String>,
    pub priority: Option<i64>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
    pub device_id: String,
    pub status: MessageStatus,
    pub queue_position: i64,
    pub estimated_delivery: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// `None` on unlimited plans.
    pub remaining_messages: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItem {
    #[serde(alias = "to", alias = "phoneNumber")]
    pub recipient: String,
    #[serde(alias = "body")]
    pub message: Option<String>,
    pub attachment_url: Option<String>,
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    pub device_id: String,
    pub messages: Vec<BulkItem>,
    /// Milliseconds between consecutive messages of the batch.
    #[serde(default)]
    pub delay: u64,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemError {
    pub index: usize,
    pub recipient: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReceipt {
    pub batch_id: String,
    pub device_id: String,
    pub total_messages: i64,
    pub queued_messages: i64,
    pub failed_messages: i64,
    pub errors: Vec<BulkItemError>,
}

/// A message that passed validation and is ready to be queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub recipient: String,
    pub body: Option<String>,
    pub attachment_url: Option<String>,
    pub priority: i64,
}

pub fn validate_draft(
    recipient: &str,
    message: Option<&str>,
    attachment_url: Option<&str>,
    priority: Option<i64>,
) -> ApiResult<Draft> {
    let recipient = normalize_recipient(recipient)
        .map_err(|err| ApiError::validation(format!("invalid recipient: {err}")))?;

    let body = message
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);
    let attachment_url = attachment_url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string);
    if let Some(url) = attachment_url.as_deref() {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ApiError::validation("attachmentUrl must be an http(s) URL"));
        }
    }
    if body.is_none() && attachment_url.is_none() {
        return Err(ApiError::validation("message body or attachmentUrl is required"));
    }

    let priority = priority.unwrap_or(0);
    if !(0..=MAX_PRIORITY).contains(&priority) {
        return Err(ApiError::validation(format!(
            "priority must be between 0 and {MAX_PRIORITY}"
        )));
    }

    Ok(Draft {
        recipient,
        body,
        attachment_url,
        priority,
    })
}

/// Reserves a credit and writes one message row.
async fn enqueue(
    state: &AppState,
    account: &AccountRecord,
    device: &DeviceRecord,
    draft: Draft,
    available_at: DateTime<Utc>,
    scheduled_at: Option<DateTime<Utc>>,
    batch_id: Option<&str>,
) -> ApiResult<MessageRecord> {
    if !db::reserve_credit(&state.pool, state.db_kind, &account.id).await? {
        return Err(ApiError::Forbidden("message limit reached".to_string()));
    }

    let now = Utc::now();
    let seq = db::next_device_seq(&state.pool, state.db_kind, &device.id).await?;
    let ahead = db::count_messages_ahead(&state.pool, state.db_kind, &device.id, draft.priority).await?;
    let queue_position = ahead + 1;
    let per_message = Duration::milliseconds(state.config.queue.estimated_send_ms as i64);
    let estimated_delivery = available_at.max(now) + per_message * (queue_position - 1) as i32;
    let status = match scheduled_at {
        Some(at) if at > now => MessageStatus::Scheduled,
        _ => MessageStatus::Queued,
    };

    let record = MessageRecord {
        id: uuid::Uuid::new_v4().to_string(),
        account_id: account.id.clone(),
        device_id: device.id.clone(),
        batch_id: batch_id.map(str::to_string),
        recipient: draft.recipient,
        body: draft.body,
        attachment_url: draft.attachment_url,
        priority: draft.priority,
        seq,
        queue_position,
        status,
        scheduled_at,
        available_at,
        estimated_delivery,
        attempts: 0,
        last_error: None,
        provider_message_id: None,
        created_at: now,
        updated_at: now,
        sent_at: None,
    };
    if let Err(err) = db::insert_message(&state.pool, state.db_kind, &record).await {
        db::refund_credits(&state.pool, state.db_kind, &account.id, 1).await?;
        return Err(err.into());
    }
    state.delivery.context().publish(&record, status, None);
    Ok(record)
}

pub async fn send(
    state: &AppState,
    account: &AccountRecord,
    req: SendRequest,
) -> ApiResult<SendReceipt> {
    ensure_active(account)?;
    let device = owned_device(state, account, &req.device_id).await?;
    let draft = validate_draft(
        &req.recipient,
        req.message.as_deref(),
        req.attachment_url.as_deref(),
        req.priority,
    )?;

    let now = Utc::now();
    let scheduled_at = req.scheduled_at.filter(|at| *at > now);
    let available_at = scheduled_at.unwrap_or(now);
    let record = enqueue(state, account, &device, draft, available_at, scheduled_at, None).await?;

    if scheduled_at.is_none() && device.status == DeviceStatus::Connected {
        state.delivery.wake(&device.id);
    }
    debug!(message_id = %record.id, device_id = %device.id, position = record.queue_position, "message queued");

    let remaining_messages = db::get_account(&state.pool, state.db_kind, &account.id)
        .await?
        .and_then(|fresh| fresh.remaining_messages());

    Ok(SendReceipt {
        message_id: record.id,
        device_id: record.device_id,
        status: record.status,
        queue_position: record.queue_position,
        estimated_delivery: record.estimated_delivery,
        scheduled_at: record.scheduled_at,
        remaining_messages,
    })
}

/// Queues a batch in submission order. The k-th accepted message becomes
/// available `k * delay` after the batch start.
pub async fn send_bulk(
    state: &AppState,
    account: &AccountRecord,
    req: BulkRequest,
) -> ApiResult<BulkReceipt> {
    let limits = &state.config.queue;
    if req.messages.is_empty() {
        return Err(ApiError::validation("messages must not be empty"));
    }
    if req.messages.len() > limits.max_bulk {
        return Err(ApiError::validation(format!(
            "at most {} messages per batch",
            limits.max_bulk
        )));
    }
    if req.delay > limits.max_bulk_delay_ms {
        return Err(ApiError::validation(format!(
            "delay must not exceed {} ms",
            limits.max_bulk_delay_ms
        )));
    }
    ensure_active(account)?;
    let device = owned_device(state, account, &req.device_id).await?;

    let now = Utc::now();
    let scheduled_at = req.scheduled_at.filter(|at| *at > now);
    let start = scheduled_at.unwrap_or(now);
    let delay = Duration::milliseconds(req.delay as i64);
    let mut batch = db::BatchRecord {
        id: uuid::Uuid::new_v4().to_string(),
        account_id: account.id.clone(),
        device_id: device.id.clone(),
        delay_ms: req.delay as i64,
        total_messages: req.messages.len() as i64,
        queued_messages: 0,
        failed_messages: 0,
        created_at: now,
    };
    // Written first so every message carrying the batch id resolves to it.
    db::insert_batch(&state.pool, state.db_kind, &batch).await?;

    let mut queued: i64 = 0;
    let mut errors = Vec::new();
    for (index, item) in req.messages.iter().enumerate() {
        let draft = match validate_draft(
            &item.recipient,
            item.message.as_deref(),
            item.attachment_url.as_deref(),
            item.priority,
        ) {
            Ok(draft) => draft,
            Err(err) => {
                errors.push(BulkItemError {
                    index,
                    recipient: item.recipient.clone(),
                    error: err.to_string(),
                });
                continue;
            }
        };

        let available_at = start + delay * queued as i32;
        match enqueue(state, account, &device, draft, available_at, scheduled_at, Some(&batch.id)).await {
            Ok(_) => queued += 1,
            Err(err @ ApiError::Internal(_)) => {
                // Items not reached count as failed.
                let failed = batch.total_messages - queued;
                db::update_batch_counts(&state.pool, state.db_kind, &batch.id, queued, failed).await?;
                warn!(batch_id = %batch.id, queued, failed, "bulk batch aborted: {err}");
                return Err(err);
            }
            Err(err) => errors.push(BulkItemError {
                index,
                recipient: item.recipient.clone(),
                error: err.to_string(),
            }),
        }
    }

    batch.queued_messages = queued;
    batch.failed_messages = errors.len() as i64;
    db::update_batch_counts(
        &state.pool,
        state.db_kind,
        &batch.id,
        batch.queued_messages,
        batch.failed_messages,
    )
    .await?;

    if queued > 0 && scheduled_at.is_none() && device.status == DeviceStatus::Connected {
        state.delivery.wake(&device.id);
    }
    info!(
        batch_id = %batch.id,
        device_id = %device.id,
        queued = batch.queued_messages,
        failed = batch.failed_messages,
        "bulk batch accepted"
    );

    Ok(BulkReceipt {
        batch_id: batch.id,
        device_id: batch.device_id,
        total_messages: batch.total_messages,
        queued_messages: batch.queued_messages,
        failed_messages: batch.failed_messages,
        errors,
    })
}

/// Cancels a message that has not been picked up yet and returns its credit.
pub async fn cancel(
    state: &AppState,
    account: &AccountRecord,
    message_id: &str,
) -> ApiResult<MessageRecord> {
    let message = db::get_message(&state.pool, state.db_kind, message_id)
        .await?
        .filter(|m| m.account_id == account.id)
        .ok_or_else(|| ApiError::NotFound("message", message_id.to_string()))?;

    if !message.status.can_transition_to(MessageStatus::Cancelled)
        || !db::cancel_message(&state.pool, state.db_kind, &message.id, message.status).await?
    {
        let current = db::get_message(&state.pool, state.db_kind, message_id)
            .await?
            .map(|m| m.status)
            .unwrap_or(message.status);
        return Err(ApiError::Conflict(format!(
            "message is {current} and can no longer be cancelled"
        )));
    }

    db::refund_credits(&state.pool, state.db_kind, &account.id, 1).await?;
    let cancelled = db::get_message(&state.pool, state.db_kind, message_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("message", message_id.to_string()))?;
    state
        .delivery
        .context()
        .publish(&cancelled, MessageStatus::Cancelled, None);
    info!(message_id, "message cancelled");
    Ok(cancelled)
}
