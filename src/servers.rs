use crate::db::{self, ServerRecord};
use crate::error::{ApiError, ApiResult};
use crate::types::ServerStatus;
use crate::AppState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub max: i64,
    pub current: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    /// Round trip of the last health probe, in milliseconds.
    pub ping: Option<i64>,
    /// Seconds, as reported by the session server.
    pub uptime: Option<i64>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerView {
    pub id: String,
    pub url: String,
    pub capacity: Capacity,
    pub performance: Performance,
    pub status: ServerStatus,
}

impl ServerView {
    pub fn new(record: ServerRecord, current: i64) -> Self {
        Self {
            capacity: Capacity {
                max: record.max_capacity,
                current,
            },
            performance: Performance {
                ping: record.ping_ms,
                uptime: record.uptime_seconds,
                last_checked_at: record.last_checked_at,
            },
            id: record.id,
            url: record.url,
            status: record.status,
        }
    }

    pub fn has_room(&self) -> bool {
        self.capacity.current < self.capacity.max
    }

    pub fn load(&self) -> f64 {
        if self.capacity.max <= 0 {
            return f64::INFINITY;
        }
        self.capacity.current as f64 / self.capacity.max as f64
    }
}

/// Least loaded active server with room left; ping breaks ties.
pub fn pick_server(servers: &[ServerView]) -> Option<&ServerView> {
    servers
        .iter()
        .filter(|s| s.status == ServerStatus::Active && s.has_room())
        .min_by(|a, b| {
            a.load()
                .partial_cmp(&b.load())
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    a.performance
                        .ping
                        .unwrap_or(i64::MAX)
                        .cmp(&b.performance.ping.unwrap_or(i64::MAX))
                })
                .then_with(|| a.id.cmp(&b.id))
        })
}

pub async fn list(state: &AppState) -> ApiResult<Vec<ServerView>> {
    let counts: HashMap<String, i64> = db::device_counts_by_server(&state.pool, state.db_kind).await?;
    let servers = db::list_servers(&state.pool, state.db_kind).await?;
    Ok(servers
        .into_iter()
        .map(|record| {
            let current = counts.get(&record.id).copied().unwrap_or(0);
            ServerView::new(record, current)
        })
        .collect())
}

pub async fn get(state: &AppState, id: &str) -> ApiResult<ServerView> {
    list(state)
        .await?
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| ApiError::NotFound("server", id.to_string()))
}

/// Chooses the backing server for a new device.
pub async fn place_device(state: &AppState, requested: Option<&str>) -> ApiResult<ServerView> {
    let servers = list(state).await?;
    if let Some(id) = requested.filter(|id| !id.is_empty()) {
        let server = servers
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| ApiError::NotFound("server", id.to_string()))?;
        if server.status != ServerStatus::Active {
            return Err(ApiError::Conflict(format!("server {id} is {}", server.status)));
        }
        if !server.has_room() {
            return Err(ApiError::Conflict(format!("server {id} is at capacity")));
        }
        return Ok(server);
    }
    pick_server(&servers)
        .cloned()
        .ok_or_else(|| ApiError::Conflict("no active server has free capacity".to_string()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerRequest {
    pub id: String,
    pub url: String,
    pub max_capacity: i64,
}

pub async fn register(state: &AppState, req: RegisterServerRequest) -> ApiResult<ServerView> {
    let id = req.id.trim();
    if id.is_empty() {
        return Err(ApiError::validation("id is required"));
    }
    if !(req.url.starts_with("http://") || req.url.starts_with("https://")) {
        return Err(ApiError::validation("url must be an http(s) URL"));
    }
    if req.max_capacity < 1 {
        return Err(ApiError::validation("maxCapacity must be at least 1"));
    }
    db::upsert_server(&state.pool, state.db_kind, id, &req.url, req.max_capacity).await?;
    info!(server_id = id, url = %req.url, "server registered");
    get(state, id).await
}

pub async fn set_status(state: &AppState, id: &str, status: ServerStatus) -> ApiResult<ServerView> {
    if !db::set_server_status(&state.pool, state.db_kind, id, status).await? {
        return Err(ApiError::NotFound("server", id.to_string()));
    }
    info!(server_id = id, %status, "server status changed");
    get(state, id).await
}

pub async fn seed_servers(state: &AppState) -> anyhow::Result<()> {
    for seed in &state.config.servers {
        db::upsert_server(&state.pool, state.db_kind, &seed.id, &seed.url, seed.max_capacity).await?;
    }
    Ok(())
}

/// Probes every server once and records ping and uptime.
pub async fn probe_all(state: &AppState) -> anyhow::Result<()> {
    for server in db::list_servers(&state.pool, state.db_kind).await? {
        let checked_at = Utc::now();
        match state.sessions.probe(&server.url).await {
            Ok(health) => {
                debug!(server_id = %server.id, ping_ms = health.ping_ms, "server probe ok");
                db::record_server_probe(
                    &state.pool,
                    state.db_kind,
                    &server.id,
                    Some(health.ping_ms),
                    health.uptime_seconds,
                    checked_at,
                )
                .await?;
            }
            Err(err) => {
                warn!(server_id = %server.id, "server probe failed: {err:#}");
                db::record_server_probe(&state.pool, state.db_kind, &server.id, None, None, checked_at)
                    .await?;
            }
        }
    }
    Ok(())
}

pub async fn start_server_monitor(state: AppState) {
    let interval = Duration::from_secs(state.config.devices.probe_interval_seconds.max(1));
    loop {
        if let Err(err) = probe_all(&state).await {
            warn!("server monitor error: {err:?}");
        }
        sleep(interval).await;
    }
}
