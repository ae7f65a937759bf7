//! Customer accounts: subscription limits, usage, and the admin surface
//! that manages them.

use crate::db::{self, AccountRecord};
use crate::error::{ApiError, ApiResult};
use crate::AppState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

pub fn ensure_active(account: &AccountRecord) -> ApiResult<()> {
    if account.is_expired(Utc::now()) {
        return Err(ApiError::Forbidden("subscription expired".to_string()));
    }
    Ok(())
}

pub fn generate_api_key() -> String {
    format!("wa_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub account_id: String,
    pub name: String,
    pub package_name: String,
    pub message_limit: i64,
    pub messages_used: i64,
    pub remaining_messages: Option<i64>,
    pub device_limit: i64,
    pub devices_used: i64,
    pub remaining_devices: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

pub async fn subscription(state: &AppState, account: &AccountRecord) -> ApiResult<SubscriptionView> {
    let account = db::get_account(&state.pool, state.db_kind, &account.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("account", account.id.clone()))?;
    let devices_used = db::count_devices(&state.pool, state.db_kind, &account.id).await?;
    let remaining_devices = if account.device_limit < 0 {
        None
    } else {
        Some((account.device_limit - devices_used).max(0))
    };
    Ok(SubscriptionView {
        remaining_messages: account.remaining_messages(),
        expired: account.is_expired(Utc::now()),
        account_id: account.id,
        name: account.name,
        package_name: account.package_name,
        message_limit: account.message_limit,
        messages_used: account.messages_used,
        device_limit: account.device_limit,
        devices_used,
        remaining_devices,
        expires_at: account.expires_at,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub name: String,
    pub package_name: Option<String>,
    pub message_limit: Option<i64>,
    pub device_limit: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountRequest {
    pub package_name: Option<String>,
    pub message_limit: Option<i64>,
    pub device_limit: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clear_expiry: bool,
    #[serde(default)]
    pub reset_usage: bool,
}

pub async fn create(state: &AppState, req: CreateAccountRequest) -> ApiResult<AccountRecord> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    let now = Utc::now();
    let record = AccountRecord {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        package_name: req.package_name.unwrap_or_else(|| "default".to_string()),
        api_key: generate_api_key(),
        message_limit: req.message_limit.unwrap_or(-1),
        messages_used: 0,
        device_limit: req.device_limit.unwrap_or(-1),
        expires_at: req.expires_at,
        created_at: now,
        updated_at: now,
    };
    db::insert_account(&state.pool, state.db_kind, &record).await?;
    info!(account_id = %record.id, package = %record.package_name, "account created");
    Ok(record)
}

pub async fn update(
    state: &AppState,
    id: &str,
    req: UpdateAccountRequest,
) -> ApiResult<AccountRecord> {
    let mut account = get(state, id).await?;
    if let Some(package_name) = req.package_name {
        account.package_name = package_name;
    }
    if let Some(limit) = req.message_limit {
        account.message_limit = limit;
    }
    if let Some(limit) = req.device_limit {
        account.device_limit = limit;
    }
    if req.clear_expiry {
        account.expires_at = None;
    } else if req.expires_at.is_some() {
        account.expires_at = req.expires_at;
    }
    db::update_account_plan(&state.pool, state.db_kind, &account).await?;
    if req.reset_usage {
        db::reset_account_usage(&state.pool, state.db_kind, id).await?;
    }
    info!(account_id = id, reset_usage = req.reset_usage, "account plan updated");
    get(state, id).await
}

pub async fn get(state: &AppState, id: &str) -> ApiResult<AccountRecord> {
    db::get_account(&state.pool, state.db_kind, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("account", id.to_string()))
}

pub async fn list(state: &AppState, limit: i64, offset: i64) -> ApiResult<Vec<AccountRecord>> {
    Ok(db::list_accounts(&state.pool, state.db_kind, limit, offset).await?)
}

pub async fn seed_accounts(state: &AppState) -> anyhow::Result<()> {
    let now = Utc::now();
    for seed in &state.config.accounts {
        let record = AccountRecord {
            id: seed.id.clone(),
            name: seed.name.clone(),
            package_name: seed.package_name.clone(),
            api_key: seed.api_key.clone(),
            message_limit: seed.message_limit,
            messages_used: 0,
            device_limit: seed.device_limit,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        db::upsert_account(&state.pool, state.db_kind, &record).await?;
    }
    Ok(())
}
