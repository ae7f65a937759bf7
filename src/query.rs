//! Read side of the queue: history, live queue, single messages and batches.

use crate::db::{self, AccountRecord, BatchRecord, MessageFilter, MessageRecord};
use crate::error::{ApiError, ApiResult};
use crate::types::MessageStatus;
use crate::AppState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

/// Query string accepted by the history and queue listings. `status` may be a
/// comma separated list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub status: Option<String>,
    pub device_id: Option<String>,
    pub batch_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub total: i64,
    pub queued: i64,
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub scheduled: i64,
}

impl StatusSummary {
    pub fn from_counts(counts: &HashMap<MessageStatus, i64>) -> Self {
        let get = |status| counts.get(&status).copied().unwrap_or(0);
        Self {
            total: counts.values().sum(),
            queued: get(MessageStatus::Queued),
            pending: get(MessageStatus::Pending),
            processing: get(MessageStatus::Processing),
            sent: get(MessageStatus::Sent),
            failed: get(MessageStatus::Failed),
            cancelled: get(MessageStatus::Cancelled),
            scheduled: get(MessageStatus::Scheduled),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<MessageRecord>,
    pub summary: StatusSummary,
    pub pagination: PageInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchView {
    #[serde(flatten)]
    pub batch: BatchRecord,
    pub summary: StatusSummary,
}

pub fn parse_statuses(raw: Option<&str>) -> ApiResult<Vec<MessageStatus>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<MessageStatus>()
                .map_err(|err| ApiError::validation(err.to_string()))
        })
        .collect()
}

fn parse_instant(field: &str, raw: Option<&str>) -> ApiResult<Option<DateTime<Utc>>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| ApiError::validation(format!("{field} must be an RFC 3339 timestamp"))),
    }
}

pub fn build_filter(
    account_id: &str,
    query: &MessageQuery,
    default_statuses: &[MessageStatus],
) -> ApiResult<MessageFilter> {
    let mut statuses = parse_statuses(query.status.as_deref())?;
    if statuses.is_empty() {
        statuses = default_statuses.to_vec();
    }
    let from = parse_instant("from", query.from.as_deref())?;
    let to = parse_instant("to", query.to.as_deref())?;
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(ApiError::validation("from must not be after to"));
        }
    }
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if limit < 1 {
        return Err(ApiError::validation("limit must be positive"));
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::validation("offset must not be negative"));
    }

    Ok(MessageFilter {
        account_id: account_id.to_string(),
        statuses,
        device_id: query.device_id.clone().filter(|s| !s.is_empty()),
        batch_id: query.batch_id.clone().filter(|s| !s.is_empty()),
        from,
        to,
        limit: limit.min(MAX_PAGE_SIZE),
        offset,
    })
}

async fn page(state: &AppState, filter: MessageFilter) -> ApiResult<MessagePage> {
    let (messages, total) = db::list_messages(&state.pool, state.db_kind, &filter).await?;
    let counts = db::message_status_counts(&state.pool, state.db_kind, &filter).await?;
    Ok(MessagePage {
        pagination: PageInfo {
            limit: filter.limit,
            offset: filter.offset,
            total,
            has_more: filter.offset + (messages.len() as i64) < total,
        },
        messages,
        summary: StatusSummary::from_counts(&counts),
    })
}

pub async fn history(
    state: &AppState,
    account: &AccountRecord,
    query: &MessageQuery,
) -> ApiResult<MessagePage> {
    page(state, build_filter(&account.id, query, &[])?).await
}

/// Like `history` but limited to messages that are still in flight unless a
/// status is given.
pub async fn queue(
    state: &AppState,
    account: &AccountRecord,
    query: &MessageQuery,
) -> ApiResult<MessagePage> {
    page(state, build_filter(&account.id, query, &MessageStatus::ACTIVE)?).await
}

pub async fn message(
    state: &AppState,
    account: &AccountRecord,
    message_id: &str,
) -> ApiResult<MessageRecord> {
    db::get_message(&state.pool, state.db_kind, message_id)
        .await?
        .filter(|m| m.account_id == account.id)
        .ok_or_else(|| ApiError::NotFound("message", message_id.to_string()))
}

pub async fn batch(state: &AppState, account: &AccountRecord, batch_id: &str) -> ApiResult<BatchView> {
    let batch = db::get_batch(&state.pool, state.db_kind, batch_id)
        .await?
        .filter(|b| b.account_id == account.id)
        .ok_or_else(|| ApiError::NotFound("batch", batch_id.to_string()))?;
    let filter = MessageFilter {
        account_id: account.id.clone(),
        batch_id: Some(batch.id.clone()),
        ..MessageFilter::default()
    };
    let counts = db::message_status_counts(&state.pool, state.db_kind, &filter).await?;
    Ok(BatchView {
        batch,
        summary: StatusSummary::from_counts(&counts),
    })
}
