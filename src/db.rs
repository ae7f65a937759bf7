use crate::types::{DeviceStatus, MessageStatus, ServerStatus};
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

pub fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn opt_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(millis_to_datetime)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub id: String,
    pub name: String,
    pub package_name: String,
    pub api_key: String,
    pub message_limit: i64,
    pub messages_used: i64,
    pub device_limit: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountRecord {
    pub fn remaining_messages(&self) -> Option<i64> {
        if self.message_limit < 0 {
            None
        } else {
            Some((self.message_limit - self.messages_used).max(0))
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub url: String,
    pub max_capacity: i64,
    pub status: ServerStatus,
    pub ping_ms: Option<i64>,
    pub uptime_seconds: Option<i64>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    #[serde(skip)]
    pub account_id: String,
    pub name: String,
    pub phone_number: Option<String>,
    pub status: DeviceStatus,
    pub server_id: String,
    pub message_count: i64,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub qr_code: Option<String>,
    #[serde(skip)]
    pub qr_image: Option<String>,
    #[serde(skip)]
    pub qr_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    #[serde(skip)]
    pub account_id: String,
    pub device_id: String,
    pub batch_id: Option<String>,
    pub recipient: String,
    pub body: Option<String>,
    pub attachment_url: Option<String>,
    pub priority: i64,
    #[serde(skip)]
    pub seq: i64,
    pub queue_position: i64,
    pub status: MessageStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub available_at: DateTime<Utc>,
    pub estimated_delivery: DateTime<Utc>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub id: String,
    #[serde(skip)]
    pub account_id: String,
    pub device_id: String,
    pub delay_ms: i64,
    pub total_messages: i64,
    pub queued_messages: i64,
    pub failed_messages: i64,
    pub created_at: DateTime<Utc>,
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            package_name TEXT NOT NULL,
            api_key TEXT NOT NULL UNIQUE,
            message_limit BIGINT NOT NULL,
            messages_used BIGINT NOT NULL,
            device_limit BIGINT NOT NULL,
            expires_at BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS servers (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            max_capacity BIGINT NOT NULL,
            status TEXT NOT NULL,
            ping_ms BIGINT,
            uptime_seconds BIGINT,
            last_checked_at BIGINT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            phone_number TEXT,
            status TEXT NOT NULL,
            server_id TEXT NOT NULL,
            message_count BIGINT NOT NULL,
            last_activity BIGINT,
            last_error TEXT,
            qr_code TEXT,
            qr_image TEXT,
            qr_expires_at BIGINT,
            next_seq BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_devices_account ON devices(account_id, created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            batch_id TEXT,
            recipient TEXT NOT NULL,
            body TEXT,
            attachment_url TEXT,
            priority BIGINT NOT NULL,
            seq BIGINT NOT NULL,
            queue_position BIGINT NOT NULL,
            status TEXT NOT NULL,
            scheduled_at BIGINT,
            available_at BIGINT NOT NULL,
            estimated_delivery BIGINT NOT NULL,
            attempts BIGINT NOT NULL,
            last_error TEXT,
            provider_message_id TEXT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            sent_at BIGINT
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_device_due ON messages(device_id, status, available_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_account ON messages(account_id, created_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_batch ON messages(batch_id)"#,
        r#"CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            delay_ms BIGINT NOT NULL,
            total_messages BIGINT NOT NULL,
            queued_messages BIGINT NOT NULL,
            failed_messages BIGINT NOT NULL,
            created_at BIGINT NOT NULL
        )"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

// Accounts

const ACCOUNT_COLUMNS: &str = "id, name, package_name, api_key, message_limit, messages_used, device_limit, expires_at, created_at, updated_at";

fn account_from_row(row: &AnyRow) -> Result<AccountRecord> {
    Ok(AccountRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        package_name: row.try_get("package_name")?,
        api_key: row.try_get("api_key")?,
        message_limit: row.try_get("message_limit")?,
        messages_used: row.try_get("messages_used")?,
        device_limit: row.try_get("device_limit")?,
        expires_at: opt_datetime(row.try_get("expires_at")?),
        created_at: millis_to_datetime(row.try_get("created_at")?),
        updated_at: millis_to_datetime(row.try_get("updated_at")?),
    })
}

pub async fn insert_account(pool: &AnyPool, kind: DbKind, record: &AccountRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO accounts (
            id, name, package_name, api_key, message_limit, messages_used, device_limit, expires_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.package_name)
        .bind(&record.api_key)
        .bind(record.message_limit)
        .bind(record.messages_used)
        .bind(record.device_limit)
        .bind(record.expires_at.map(datetime_to_millis))
        .bind(datetime_to_millis(record.created_at))
        .bind(datetime_to_millis(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

/// Seeds keep their usage counter across restarts.
pub async fn upsert_account(pool: &AnyPool, kind: DbKind, record: &AccountRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO accounts (
            id, name, package_name, api_key, message_limit, messages_used, device_limit, expires_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name=excluded.name,
            package_name=excluded.package_name,
            api_key=excluded.api_key,
            message_limit=excluded.message_limit,
            device_limit=excluded.device_limit,
            updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.package_name)
        .bind(&record.api_key)
        .bind(record.message_limit)
        .bind(record.messages_used)
        .bind(record.device_limit)
        .bind(record.expires_at.map(datetime_to_millis))
        .bind(datetime_to_millis(record.created_at))
        .bind(datetime_to_millis(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_account(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<AccountRecord>> {
    let sql = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(account_from_row).transpose()
}

pub async fn get_account_by_key(
    pool: &AnyPool,
    kind: DbKind,
    api_key: &str,
) -> Result<Option<AccountRecord>> {
    let sql = format!("SELECT {} FROM accounts WHERE api_key = ?", ACCOUNT_COLUMNS);
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(api_key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(account_from_row).transpose()
}

pub async fn list_accounts(
    pool: &AnyPool,
    kind: DbKind,
    limit: i64,
    offset: i64,
) -> Result<Vec<AccountRecord>> {
    let sql = format!(
        "SELECT {} FROM accounts ORDER BY created_at DESC LIMIT ? OFFSET ?",
        ACCOUNT_COLUMNS
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(account_from_row).collect()
}

pub async fn update_account_plan(
    pool: &AnyPool,
    kind: DbKind,
    record: &AccountRecord,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE accounts SET package_name=?, message_limit=?, device_limit=?, expires_at=?, updated_at=?
           WHERE id=?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.package_name)
        .bind(record.message_limit)
        .bind(record.device_limit)
        .bind(record.expires_at.map(datetime_to_millis))
        .bind(datetime_to_millis(Utc::now()))
        .bind(&record.id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn reset_account_usage(pool: &AnyPool, kind: DbKind, id: &str) -> Result<()> {
    let sql = rewrite_sql("UPDATE accounts SET messages_used=0, updated_at=? WHERE id=?", kind);
    sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Takes one message credit. Returns false once the limit is reached.
pub async fn reserve_credit(pool: &AnyPool, kind: DbKind, account_id: &str) -> Result<bool> {
    let sql = rewrite_sql(
        r#"UPDATE accounts SET messages_used = messages_used + 1
           WHERE id = ? AND (message_limit < 0 OR messages_used < message_limit)"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn refund_credits(pool: &AnyPool, kind: DbKind, account_id: &str, count: i64) -> Result<()> {
    if count <= 0 {
        return Ok(());
    }
    let sql = rewrite_sql(
        r#"UPDATE accounts SET messages_used = CASE WHEN messages_used > ? THEN messages_used - ? ELSE 0 END
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(count)
        .bind(count)
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(())
}

// Servers

const SERVER_COLUMNS: &str = "id, url, max_capacity, status, ping_ms, uptime_seconds, last_checked_at";

fn server_from_row(row: &AnyRow) -> Result<ServerRecord> {
    let status: String = row.try_get("status")?;
    Ok(ServerRecord {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        max_capacity: row.try_get("max_capacity")?,
        status: status.parse()?,
        ping_ms: row.try_get("ping_ms")?,
        uptime_seconds: row.try_get("uptime_seconds")?,
        last_checked_at: opt_datetime(row.try_get("last_checked_at")?),
    })
}

/// Registers or refreshes a server; an existing operator-set status is kept.
pub async fn upsert_server(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    url: &str,
    max_capacity: i64,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO servers (id, url, max_capacity, status) VALUES (?, ?, ?, 'active')
           ON CONFLICT(id) DO UPDATE SET url=excluded.url, max_capacity=excluded.max_capacity"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(id)
        .bind(url)
        .bind(max_capacity)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_server(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<ServerRecord>> {
    let sql = format!("SELECT {} FROM servers WHERE id = ?", SERVER_COLUMNS);
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(server_from_row).transpose()
}

pub async fn list_servers(pool: &AnyPool, kind: DbKind) -> Result<Vec<ServerRecord>> {
    let sql = format!("SELECT {} FROM servers ORDER BY id ASC", SERVER_COLUMNS);
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref()).fetch_all(pool).await?;
    rows.iter().map(server_from_row).collect()
}

pub async fn set_server_status(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    status: ServerStatus,
) -> Result<bool> {
    let sql = rewrite_sql("UPDATE servers SET status=? WHERE id=?", kind);
    let result = sqlx::query(sql.as_ref())
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn record_server_probe(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    ping_ms: Option<i64>,
    uptime_seconds: Option<i64>,
    checked_at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE servers SET ping_ms=?, uptime_seconds=?, last_checked_at=? WHERE id=?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(ping_ms)
        .bind(uptime_seconds)
        .bind(datetime_to_millis(checked_at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn device_counts_by_server(pool: &AnyPool, kind: DbKind) -> Result<HashMap<String, i64>> {
    let sql = rewrite_sql(
        "SELECT server_id, COUNT(1) AS n FROM devices GROUP BY server_id",
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).fetch_all(pool).await?;
    let mut counts = HashMap::new();
    for row in rows {
        counts.insert(row.try_get::<String, _>("server_id")?, row.try_get::<i64, _>("n")?);
    }
    Ok(counts)
}

// Devices

const DEVICE_COLUMNS: &str = "id, account_id, name, phone_number, status, server_id, message_count, last_activity, last_error, qr_code, qr_image, qr_expires_at, created_at, updated_at";

fn device_from_row(row: &AnyRow) -> Result<DeviceRecord> {
    let status: String = row.try_get("status")?;
    Ok(DeviceRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        name: row.try_get("name")?,
        phone_number: row.try_get("phone_number")?,
        status: status.parse()?,
        server_id: row.try_get("server_id")?,
        message_count: row.try_get("message_count")?,
        last_activity: opt_datetime(row.try_get("last_activity")?),
        last_error: row.try_get("last_error")?,
        qr_code: row.try_get("qr_code")?,
        qr_image: row.try_get("qr_image")?,
        qr_expires_at: opt_datetime(row.try_get("qr_expires_at")?),
        created_at: millis_to_datetime(row.try_get("created_at")?),
        updated_at: millis_to_datetime(row.try_get("updated_at")?),
    })
}

pub async fn insert_device(pool: &AnyPool, kind: DbKind, record: &DeviceRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO devices (
            id, account_id, name, phone_number, status, server_id, message_count, last_activity,
            last_error, qr_code, qr_image, qr_expires_at, next_seq, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.account_id)
        .bind(&record.name)
        .bind(record.phone_number.as_deref())
        .bind(record.status.as_str())
        .bind(&record.server_id)
        .bind(record.message_count)
        .bind(record.last_activity.map(datetime_to_millis))
        .bind(record.last_error.as_deref())
        .bind(record.qr_code.as_deref())
        .bind(record.qr_image.as_deref())
        .bind(record.qr_expires_at.map(datetime_to_millis))
        .bind(datetime_to_millis(record.created_at))
        .bind(datetime_to_millis(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_device(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<DeviceRecord>> {
    let sql = format!("SELECT {} FROM devices WHERE id = ?", DEVICE_COLUMNS);
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(device_from_row).transpose()
}

pub async fn list_devices(pool: &AnyPool, kind: DbKind, account_id: &str) -> Result<Vec<DeviceRecord>> {
    let sql = format!(
        "SELECT {} FROM devices WHERE account_id = ? ORDER BY created_at ASC",
        DEVICE_COLUMNS
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(account_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(device_from_row).collect()
}

pub async fn count_devices(pool: &AnyPool, kind: DbKind, account_id: &str) -> Result<i64> {
    let sql = rewrite_sql("SELECT COUNT(1) FROM devices WHERE account_id = ?", kind);
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref())
        .bind(account_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn delete_device(pool: &AnyPool, kind: DbKind, id: &str) -> Result<()> {
    let sql = rewrite_sql("DELETE FROM devices WHERE id = ?", kind);
    sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    Ok(())
}

/// Compare-and-set on the current status. Leaving AUTHENTICATING drops the QR.
pub async fn update_device_status(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    from: DeviceStatus,
    to: DeviceStatus,
    phone_number: Option<&str>,
    last_error: Option<&str>,
) -> Result<bool> {
    let clear_qr = to != DeviceStatus::Authenticating;
    let sql = rewrite_sql(
        r#"UPDATE devices SET
            status = ?,
            phone_number = COALESCE(?, phone_number),
            last_error = ?,
            qr_code = CASE WHEN ? = 1 THEN NULL ELSE qr_code END,
            qr_image = CASE WHEN ? = 1 THEN NULL ELSE qr_image END,
            qr_expires_at = CASE WHEN ? = 1 THEN NULL ELSE qr_expires_at END,
            updated_at = ?
           WHERE id = ? AND status = ?"#,
        kind,
    );
    let flag = i64::from(clear_qr);
    let result = sqlx::query(sql.as_ref())
        .bind(to.as_str())
        .bind(phone_number)
        .bind(last_error)
        .bind(flag)
        .bind(flag)
        .bind(flag)
        .bind(datetime_to_millis(Utc::now()))
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn store_device_qr(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    code: &str,
    image: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE devices SET qr_code=?, qr_image=?, qr_expires_at=?, updated_at=? WHERE id=?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(code)
        .bind(image)
        .bind(datetime_to_millis(expires_at))
        .bind(datetime_to_millis(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_device_activity(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE devices SET message_count = message_count + 1, last_activity = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Per-device submission sequence; atomic on both backends.
pub async fn next_device_seq(pool: &AnyPool, kind: DbKind, id: &str) -> Result<i64> {
    let sql = rewrite_sql(
        "UPDATE devices SET next_seq = next_seq + 1 WHERE id = ? RETURNING next_seq",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_one(pool).await?;
    Ok(row.try_get::<i64, _>("next_seq")?)
}

// Messages

const MESSAGE_COLUMNS: &str = "id, account_id, device_id, batch_id, recipient, body, attachment_url, priority, seq, queue_position, status, scheduled_at, available_at, estimated_delivery, attempts, last_error, provider_message_id, created_at, updated_at, sent_at";

fn message_from_row(row: &AnyRow) -> Result<MessageRecord> {
    let status: String = row.try_get("status")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        device_id: row.try_get("device_id")?,
        batch_id: row.try_get("batch_id")?,
        recipient: row.try_get("recipient")?,
        body: row.try_get("body")?,
        attachment_url: row.try_get("attachment_url")?,
        priority: row.try_get("priority")?,
        seq: row.try_get("seq")?,
        queue_position: row.try_get("queue_position")?,
        status: status.parse()?,
        scheduled_at: opt_datetime(row.try_get("scheduled_at")?),
        available_at: millis_to_datetime(row.try_get("available_at")?),
        estimated_delivery: millis_to_datetime(row.try_get("estimated_delivery")?),
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        provider_message_id: row.try_get("provider_message_id")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
        updated_at: millis_to_datetime(row.try_get("updated_at")?),
        sent_at: opt_datetime(row.try_get("sent_at")?),
    })
}

pub async fn insert_message(pool: &AnyPool, kind: DbKind, record: &MessageRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO messages (
            id, account_id, device_id, batch_id, recipient, body, attachment_url, priority, seq,
            queue_position, status, scheduled_at, available_at, estimated_delivery, attempts,
            last_error, provider_message_id, created_at, updated_at, sent_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.account_id)
        .bind(&record.device_id)
        .bind(record.batch_id.as_deref())
        .bind(&record.recipient)
        .bind(record.body.as_deref())
        .bind(record.attachment_url.as_deref())
        .bind(record.priority)
        .bind(record.seq)
        .bind(record.queue_position)
        .bind(record.status.as_str())
        .bind(record.scheduled_at.map(datetime_to_millis))
        .bind(datetime_to_millis(record.available_at))
        .bind(datetime_to_millis(record.estimated_delivery))
        .bind(record.attempts)
        .bind(record.last_error.as_deref())
        .bind(record.provider_message_id.as_deref())
        .bind(datetime_to_millis(record.created_at))
        .bind(datetime_to_millis(record.updated_at))
        .bind(record.sent_at.map(datetime_to_millis))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_message(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<MessageRecord>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(message_from_row).transpose()
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub account_id: String,
    pub statuses: Vec<MessageStatus>,
    pub device_id: Option<String>,
    pub batch_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

enum SqlValue {
    Text(String),
    Int(i64),
}

fn message_where(filter: &MessageFilter, with_statuses: bool) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["account_id = ?".to_string()];
    let mut binds = vec![SqlValue::Text(filter.account_id.clone())];

    if with_statuses && !filter.statuses.is_empty() {
        let placeholders = filter.statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        clauses.push(format!("status IN ({})", placeholders));
        for status in &filter.statuses {
            binds.push(SqlValue::Text(status.as_str().to_string()));
        }
    }
    if let Some(device_id) = filter.device_id.as_ref() {
        clauses.push("device_id = ?".to_string());
        binds.push(SqlValue::Text(device_id.clone()));
    }
    if let Some(batch_id) = filter.batch_id.as_ref() {
        clauses.push("batch_id = ?".to_string());
        binds.push(SqlValue::Text(batch_id.clone()));
    }
    if let Some(from) = filter.from {
        clauses.push("created_at >= ?".to_string());
        binds.push(SqlValue::Int(datetime_to_millis(from)));
    }
    if let Some(to) = filter.to {
        clauses.push("created_at <= ?".to_string());
        binds.push(SqlValue::Int(datetime_to_millis(to)));
    }
    (clauses.join(" AND "), binds)
}

/// One page of messages plus the total matching the filter.
pub async fn list_messages(
    pool: &AnyPool,
    kind: DbKind,
    filter: &MessageFilter,
) -> Result<(Vec<MessageRecord>, i64)> {
    let (where_sql, binds) = message_where(filter, true);

    let count_sql = format!("SELECT COUNT(1) AS n FROM messages WHERE {}", where_sql);
    let count_sql = rewrite_sql(&count_sql, kind);
    let mut count_query = sqlx::query(count_sql.as_ref());
    for value in &binds {
        count_query = match value {
            SqlValue::Text(s) => count_query.bind(s.clone()),
            SqlValue::Int(n) => count_query.bind(*n),
        };
    }
    let total: i64 = count_query.fetch_one(pool).await?.try_get("n")?;

    let page_sql = format!(
        "SELECT {} FROM messages WHERE {} ORDER BY created_at DESC, seq DESC LIMIT ? OFFSET ?",
        MESSAGE_COLUMNS, where_sql
    );
    let page_sql = rewrite_sql(&page_sql, kind);
    let mut page_query = sqlx::query(page_sql.as_ref());
    for value in &binds {
        page_query = match value {
            SqlValue::Text(s) => page_query.bind(s.clone()),
            SqlValue::Int(n) => page_query.bind(*n),
        };
    }
    let rows = page_query
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(pool)
        .await?;
    let messages = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;
    Ok((messages, total))
}

/// Counts per status for the filter, ignoring its status list and paging.
pub async fn message_status_counts(
    pool: &AnyPool,
    kind: DbKind,
    filter: &MessageFilter,
) -> Result<HashMap<MessageStatus, i64>> {
    let (where_sql, binds) = message_where(filter, false);
    let sql = format!(
        "SELECT status, COUNT(1) AS n FROM messages WHERE {} GROUP BY status",
        where_sql
    );
    let sql = rewrite_sql(&sql, kind);
    let mut query = sqlx::query(sql.as_ref());
    for value in &binds {
        query = match value {
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Int(n) => query.bind(*n),
        };
    }
    let rows = query.fetch_all(pool).await?;
    let mut counts = HashMap::new();
    for row in rows {
        let status: String = row.try_get("status")?;
        counts.insert(status.parse()?, row.try_get::<i64, _>("n")?);
    }
    Ok(counts)
}

/// Active messages on the device that a new message of `priority` will wait behind.
pub async fn count_messages_ahead(
    pool: &AnyPool,
    kind: DbKind,
    device_id: &str,
    priority: i64,
) -> Result<i64> {
    let sql = rewrite_sql(
        r#"SELECT COUNT(1) FROM messages
           WHERE device_id = ? AND status IN ('QUEUED','PENDING','SCHEDULED','PROCESSING') AND priority >= ?"#,
        kind,
    );
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref())
        .bind(device_id)
        .bind(priority)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Head of the device queue: highest priority first, then submission order.
/// Only messages whose explicit `scheduled_at` lies in the future are passed
/// over; a backed-off retry or a paced batch message stays at the head even
/// while its `available_at` is ahead of `now`.
pub async fn next_waiting_message(
    pool: &AnyPool,
    kind: DbKind,
    device_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<MessageRecord>> {
    let sql = format!(
        r#"SELECT {} FROM messages
           WHERE device_id = ? AND status IN ('QUEUED','PENDING','SCHEDULED')
             AND (scheduled_at IS NULL OR scheduled_at <= ?)
           ORDER BY priority DESC, seq ASC
           LIMIT 1"#,
        MESSAGE_COLUMNS
    );
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(device_id)
        .bind(datetime_to_millis(now))
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(message_from_row).transpose()
}

/// Holds back the rest of a batch until `not_before`.
pub async fn defer_batch_messages(
    pool: &AnyPool,
    kind: DbKind,
    batch_id: &str,
    not_before: DateTime<Utc>,
) -> Result<u64> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET
            available_at = ?,
            estimated_delivery = CASE WHEN estimated_delivery < ? THEN ? ELSE estimated_delivery END,
            updated_at = ?
           WHERE batch_id = ? AND status IN ('QUEUED','PENDING','SCHEDULED') AND available_at < ?"#,
        kind,
    );
    let at = datetime_to_millis(not_before);
    let result = sqlx::query(sql.as_ref())
        .bind(at)
        .bind(at)
        .bind(at)
        .bind(datetime_to_millis(Utc::now()))
        .bind(batch_id)
        .bind(at)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn claim_message(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    from: MessageStatus,
) -> Result<bool> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET status='PROCESSING', attempts = attempts + 1, updated_at = ?
           WHERE id = ? AND status = ?"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(Utc::now()))
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_message_sent(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    provider_message_id: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET status='SENT', provider_message_id=?, last_error=NULL, sent_at=?, updated_at=?
           WHERE id = ? AND status = 'PROCESSING'"#,
        kind,
    );
    let at = datetime_to_millis(at);
    sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Puts a claimed message back in the queue. Returns false, leaving the row
/// in PROCESSING, when its device no longer exists.
pub async fn mark_message_retry(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    available_at: DateTime<Utc>,
    error: &str,
) -> Result<bool> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET status='PENDING', available_at=?, estimated_delivery=?, last_error=?, updated_at=?
           WHERE id = ? AND status = 'PROCESSING'
             AND EXISTS (SELECT 1 FROM devices d WHERE d.id = messages.device_id)"#,
        kind,
    );
    let available = datetime_to_millis(available_at);
    let result = sqlx::query(sql.as_ref())
        .bind(available)
        .bind(available)
        .bind(error)
        .bind(datetime_to_millis(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_message_failed(pool: &AnyPool, kind: DbKind, id: &str, error: &str) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET status='FAILED', last_error=?, updated_at=?
           WHERE id = ? AND status = 'PROCESSING'"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(error)
        .bind(datetime_to_millis(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn cancel_message(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    from: MessageStatus,
) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE messages SET status='CANCELLED', updated_at=? WHERE id = ? AND status = ?",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(Utc::now()))
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Cancels everything still waiting on the device and returns how many rows changed.
pub async fn cancel_device_messages(pool: &AnyPool, kind: DbKind, device_id: &str) -> Result<i64> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET status='CANCELLED', updated_at=?
           WHERE device_id = ? AND status IN ('QUEUED','PENDING','SCHEDULED')"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(Utc::now()))
        .bind(device_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() as i64)
}

/// Rows claimed by a worker that never finished go back to the queue.
pub async fn requeue_stale_processing(pool: &AnyPool, kind: DbKind) -> Result<u64> {
    let sql = rewrite_sql(
        "UPDATE messages SET status='PENDING', updated_at=? WHERE status='PROCESSING'",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(Utc::now()))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn devices_with_due_messages(
    pool: &AnyPool,
    kind: DbKind,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let sql = rewrite_sql(
        r#"SELECT DISTINCT m.device_id AS device_id FROM messages m
           JOIN devices d ON d.id = m.device_id
           WHERE d.status = 'CONNECTED'
             AND m.status IN ('QUEUED','PENDING','SCHEDULED')
             AND m.available_at <= ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_millis(now))
        .fetch_all(pool)
        .await?;
    let mut devices = Vec::with_capacity(rows.len());
    for row in rows {
        devices.push(row.try_get::<String, _>("device_id")?);
    }
    Ok(devices)
}

// Batches

pub async fn insert_batch(pool: &AnyPool, kind: DbKind, record: &BatchRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO batches (
            id, account_id, device_id, delay_ms, total_messages, queued_messages, failed_messages, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.account_id)
        .bind(&record.device_id)
        .bind(record.delay_ms)
        .bind(record.total_messages)
        .bind(record.queued_messages)
        .bind(record.failed_messages)
        .bind(datetime_to_millis(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_batch_counts(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    queued: i64,
    failed: i64,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE batches SET queued_messages = ?, failed_messages = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(queued)
        .bind(failed)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_batch(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<BatchRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, account_id, device_id, delay_ms, total_messages, queued_messages, failed_messages, created_at
           FROM batches WHERE id = ?"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(BatchRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        device_id: row.try_get("device_id")?,
        delay_ms: row.try_get("delay_ms")?,
        total_messages: row.try_get("total_messages")?,
        queued_messages: row.try_get("queued_messages")?,
        failed_messages: row.try_get("failed_messages")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
    }))
}

pub async fn count_all(pool: &AnyPool, kind: DbKind, table: Table) -> Result<i64> {
    let sql = match table {
        Table::Devices => "SELECT COUNT(1) FROM devices",
        Table::Messages => "SELECT COUNT(1) FROM messages",
        Table::QueuedMessages => {
            "SELECT COUNT(1) FROM messages WHERE status IN ('QUEUED','PENDING','SCHEDULED','PROCESSING')"
        }
    };
    let sql = rewrite_sql(sql, kind);
    Ok(sqlx::query_scalar::<_, i64>(sql.as_ref()).fetch_one(pool).await?)
}

#[derive(Debug, Clone, Copy)]
pub enum Table {
    Devices,
    Messages,
    QueuedMessages,
}
