//! Device lifecycle: provisioning, QR pairing, relinking, status sync from
//! the session servers, and number lookups.

use crate::accounts::ensure_active;
use crate::db::{self, AccountRecord, DeviceRecord};
use crate::error::{ApiError, ApiResult};
use crate::phone::{normalize_phone, USER_JID_SUFFIX};
use crate::servers::place_device;
use crate::types::{DeviceStatus, QrFormat};
use crate::ws::{WsEvent, DEVICE_STATUS_EVENT};
use crate::AppState;
use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

const MAX_NAME_LEN: usize = 100;
const DEFAULT_QR_MIME: &str = "image/png";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrView {
    pub device_id: String,
    pub qr_code: String,
    pub base64_image: String,
    pub expires_at: DateTime<Utc>,
}

/// What `GET /devices/{id}/qr` renders, depending on the requested format.
#[derive(Debug, Clone)]
pub enum QrResponse {
    Json(QrView),
    Base64(String),
    Image { mime: String, bytes: Vec<u8> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDeviceRequest {
    pub name: String,
    pub phone_number: Option<String>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceWithQr {
    pub device: DeviceRecord,
    pub qr: Option<QrView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedDevice {
    pub device_id: String,
    pub cancelled_messages: i64,
}

/// Pushed by the session servers whenever a session changes state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub device_id: String,
    pub status: DeviceStatus,
    pub phone_number: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckNumberRequest {
    #[serde(alias = "phone", alias = "number")]
    pub phone_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberCheck {
    pub phone_number: String,
    #[serde(rename = "isOnWhatsApp")]
    pub is_on_whatsapp: bool,
    pub jid: Option<String>,
}

/// Splits a stored QR image into its MIME type and raw bytes. Accepts bare
/// base64 as well as `data:` URLs.
pub fn decode_qr_image(raw: &str) -> anyhow::Result<(String, Vec<u8>)> {
    let raw = raw.trim();
    let (mime, payload) = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| anyhow!("malformed data URL"))?;
            let mime = header.split(';').next().filter(|m| !m.is_empty());
            (mime.unwrap_or(DEFAULT_QR_MIME).to_string(), payload)
        }
        None => (DEFAULT_QR_MIME.to_string(), raw),
    };
    let bytes = BASE64
        .decode(payload.trim())
        .context("QR image is not valid base64")?;
    Ok((mime, bytes))
}

/// The device, provided it exists and belongs to `account`.
pub async fn owned_device(
    state: &AppState,
    account: &AccountRecord,
    device_id: &str,
) -> ApiResult<DeviceRecord> {
    db::get_device(&state.pool, state.db_kind, device_id)
        .await?
        .filter(|d| d.account_id == account.id)
        .ok_or_else(|| ApiError::NotFound("device", device_id.to_string()))
}

async fn reload(state: &AppState, device_id: &str) -> ApiResult<DeviceRecord> {
    db::get_device(&state.pool, state.db_kind, device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device", device_id.to_string()))
}

async fn server_url(state: &AppState, device: &DeviceRecord) -> ApiResult<String> {
    let server = db::get_server(&state.pool, state.db_kind, &device.server_id)
        .await?
        .ok_or_else(|| anyhow!("device {} placed on unknown server {}", device.id, device.server_id))?;
    Ok(server.url)
}

fn publish(state: &AppState, device: &DeviceRecord) {
    let _ = state.ws_tx.send(WsEvent::new(
        DEVICE_STATUS_EVENT,
        &device.account_id,
        json!({
            "deviceId": device.id,
            "status": device.status,
            "phoneNumber": device.phone_number,
            "error": device.last_error,
        }),
    ));
}

/// Moves a device along its state machine. Repeating the current status is
/// a no-op.
pub async fn transition(
    state: &AppState,
    device: &DeviceRecord,
    to: DeviceStatus,
    phone_number: Option<&str>,
    error: Option<&str>,
) -> ApiResult<DeviceRecord> {
    if device.status == to {
        return Ok(device.clone());
    }
    if !device.status.can_transition_to(to) {
        return Err(ApiError::Conflict(format!(
            "device {} cannot go from {} to {}",
            device.id, device.status, to
        )));
    }
    let updated = db::update_device_status(
        &state.pool,
        state.db_kind,
        &device.id,
        device.status,
        to,
        phone_number,
        error,
    )
    .await?;
    if !updated {
        return Err(ApiError::Conflict(format!(
            "device {} changed status concurrently",
            device.id
        )));
    }

    let device = reload(state, &device.id).await?;
    publish(state, &device);
    info!(device_id = %device.id, status = %device.status, "device status changed");
    if device.status == DeviceStatus::Connected {
        state.delivery.wake(&device.id);
    }
    Ok(device)
}

/// Requests a fresh pairing QR and stores it. A failing session server puts
/// the device in ERROR.
async fn issue_qr(state: &AppState, device: &DeviceRecord) -> ApiResult<QrView> {
    let url = server_url(state, device).await?;
    let artifact = match state.sessions.start_pairing(&url, &device.id).await {
        Ok(artifact) => artifact,
        Err(err) => {
            warn!(device_id = %device.id, "pairing failed: {err:#}");
            let reason = format!("{err:#}");
            if let Err(mark_err) =
                transition(state, device, DeviceStatus::Error, None, Some(&reason)).await
            {
                warn!(device_id = %device.id, "could not mark device as errored: {mark_err}");
            }
            return Err(ApiError::upstream(err));
        }
    };
    let expires_at = Utc::now() + Duration::seconds(state.config.devices.qr_ttl_seconds);
    db::store_device_qr(
        &state.pool,
        state.db_kind,
        &device.id,
        &artifact.code,
        &artifact.base64,
        expires_at,
    )
    .await?;
    Ok(QrView {
        device_id: device.id.clone(),
        qr_code: artifact.code,
        base64_image: artifact.base64,
        expires_at,
    })
}

pub async fn add(
    state: &AppState,
    account: &AccountRecord,
    req: AddDeviceRequest,
) -> ApiResult<DeviceWithQr> {
    ensure_active(account)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::validation(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    let phone_number = req
        .phone_number
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .map(normalize_phone)
        .transpose()
        .map_err(|err| ApiError::validation(format!("invalid phoneNumber: {err}")))?;

    if account.device_limit >= 0 {
        let used = db::count_devices(&state.pool, state.db_kind, &account.id).await?;
        if used >= account.device_limit {
            return Err(ApiError::Forbidden("device limit reached".to_string()));
        }
    }
    let server = place_device(state, req.server_id.as_deref()).await?;

    let now = Utc::now();
    let record = DeviceRecord {
        id: uuid::Uuid::new_v4().to_string(),
        account_id: account.id.clone(),
        name: name.to_string(),
        phone_number,
        status: DeviceStatus::Authenticating,
        server_id: server.id.clone(),
        message_count: 0,
        last_activity: None,
        last_error: None,
        qr_code: None,
        qr_image: None,
        qr_expires_at: None,
        created_at: now,
        updated_at: now,
    };
    db::insert_device(&state.pool, state.db_kind, &record).await?;
    publish(state, &record);
    info!(device_id = %record.id, server_id = %server.id, "device created");

    let qr = issue_qr(state, &record).await?;
    Ok(DeviceWithQr {
        device: reload(state, &record.id).await?,
        qr: Some(qr),
    })
}

pub async fn qr(
    state: &AppState,
    account: &AccountRecord,
    device_id: &str,
    format: QrFormat,
) -> ApiResult<QrResponse> {
    let device = owned_device(state, account, device_id).await?;
    if device.status != DeviceStatus::Authenticating {
        return Err(ApiError::Conflict(format!(
            "device is {}; QR codes are only available while authenticating",
            device.status
        )));
    }

    let stored = match (&device.qr_code, &device.qr_image, device.qr_expires_at) {
        (Some(code), Some(image), Some(expires_at)) if expires_at > Utc::now() => Some(QrView {
            device_id: device.id.clone(),
            qr_code: code.clone(),
            base64_image: image.clone(),
            expires_at,
        }),
        _ => None,
    };
    let view = match stored {
        Some(view) => view,
        None => issue_qr(state, &device).await?,
    };

    Ok(match format {
        QrFormat::Json => QrResponse::Json(view),
        QrFormat::Base64 => QrResponse::Base64(view.base64_image),
        QrFormat::Image => {
            let (mime, bytes) = decode_qr_image(&view.base64_image).map_err(ApiError::upstream)?;
            QrResponse::Image { mime, bytes }
        }
    })
}

pub async fn list(state: &AppState, account: &AccountRecord) -> ApiResult<Vec<DeviceRecord>> {
    Ok(db::list_devices(&state.pool, state.db_kind, &account.id).await?)
}

pub async fn delete(
    state: &AppState,
    account: &AccountRecord,
    device_id: &str,
) -> ApiResult<DeletedDevice> {
    let device = owned_device(state, account, device_id).await?;

    let cancelled = db::cancel_device_messages(&state.pool, state.db_kind, &device.id).await?;
    db::refund_credits(&state.pool, state.db_kind, &account.id, cancelled).await?;
    state.delivery.retire(&device.id);

    match server_url(state, &device).await {
        Ok(url) => {
            if let Err(err) = state.sessions.logout(&url, &device.id).await {
                warn!(device_id = %device.id, "session logout failed: {err:#}");
            }
        }
        Err(err) => warn!(device_id = %device.id, "skipping session logout: {err}"),
    }
    db::delete_device(&state.pool, state.db_kind, &device.id).await?;
    info!(device_id = %device.id, cancelled, "device deleted");

    Ok(DeletedDevice {
        device_id: device.id,
        cancelled_messages: cancelled,
    })
}

/// DISCONNECTED devices reconnect with their existing session; ERROR devices
/// start pairing again.
pub async fn relink(
    state: &AppState,
    account: &AccountRecord,
    device_id: &str,
) -> ApiResult<DeviceWithQr> {
    let device = owned_device(state, account, device_id).await?;
    match device.status {
        DeviceStatus::Disconnected => {
            let url = server_url(state, &device).await?;
            state
                .sessions
                .reconnect(&url, &device.id)
                .await
                .map_err(ApiError::upstream)?;
            let device = transition(state, &device, DeviceStatus::Connecting, None, None).await?;
            Ok(DeviceWithQr { device, qr: None })
        }
        DeviceStatus::Error => {
            let device = transition(state, &device, DeviceStatus::Authenticating, None, None).await?;
            let qr = issue_qr(state, &device).await?;
            Ok(DeviceWithQr {
                device: reload(state, &device.id).await?,
                qr: Some(qr),
            })
        }
        other => Err(ApiError::Conflict(format!("device is {other} and cannot be relinked"))),
    }
}

pub async fn apply_status(state: &AppState, update: StatusUpdate) -> ApiResult<DeviceRecord> {
    let device = reload(state, &update.device_id).await?;
    let phone_number = update
        .phone_number
        .as_deref()
        .map(|raw| raw.trim_end_matches(USER_JID_SUFFIX))
        .and_then(|raw| raw.split(':').next())
        .and_then(|raw| normalize_phone(raw).ok());
    transition(
        state,
        &device,
        update.status,
        phone_number.as_deref(),
        update.error.as_deref(),
    )
    .await
}

pub async fn check_number(
    state: &AppState,
    account: &AccountRecord,
    device_id: &str,
    raw_phone: &str,
) -> ApiResult<NumberCheck> {
    let device = owned_device(state, account, device_id).await?;
    let phone = normalize_phone(raw_phone)
        .map_err(|err| ApiError::validation(format!("invalid phone number: {err}")))?;
    if device.status != DeviceStatus::Connected {
        return Err(ApiError::Conflict(format!(
            "device is {}; number checks need a connected device",
            device.status
        )));
    }
    let url = server_url(state, &device).await?;
    let lookup = state
        .sessions
        .check_number(&url, &device.id, &phone)
        .await
        .map_err(ApiError::upstream)?;
    Ok(NumberCheck {
        phone_number: phone,
        is_on_whatsapp: lookup.exists,
        jid: if lookup.exists { lookup.jid } else { None },
    })
}
