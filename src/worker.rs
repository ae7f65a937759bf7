//! Message delivery.
//!
//! A WhatsApp session accepts one writer, so each device gets a single
//! consumer task that drains its queue in `priority DESC, seq ASC` order.
//! Different devices are drained concurrently. A dispatcher loop wakes the
//! workers of devices whose scheduled or retrying messages became due.

use crate::config::QueueConfig;
use crate::db::{self, DbKind, MessageRecord};
use crate::session_layer::{OutgoingMessage, SessionLayer};
use crate::types::{DeviceStatus, MessageStatus};
use crate::ws::{WsEvent, MESSAGE_STATUS_EVENT};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub fn compute_backoff(retry_count: i64) -> Duration {
    let exponent = (retry_count.max(1) - 1).min(8) as u32;
    let base = 2_i64.pow(exponent);
    Duration::seconds((base * 5).min(300))
}

pub struct DeliveryContext {
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub sessions: Arc<dyn SessionLayer>,
    pub ws_tx: broadcast::Sender<WsEvent>,
    pub queue: QueueConfig,
}

impl DeliveryContext {
    pub fn publish(&self, message: &MessageRecord, status: MessageStatus, error: Option<&str>) {
        let _ = self.ws_tx.send(WsEvent::new(
            MESSAGE_STATUS_EVENT,
            &message.account_id,
            json!({
                "messageId": message.id,
                "deviceId": message.device_id,
                "batchId": message.batch_id,
                "status": status,
                "error": error,
            }),
        ));
    }
}

/// Delivers the head of a device's queue. `None` when there is nothing to do
/// right now: queue empty, head not due yet (retry backoff or batch pacing),
/// or device not connected.
pub async fn deliver_next(
    ctx: &DeliveryContext,
    device_id: &str,
) -> anyhow::Result<Option<MessageStatus>> {
    let Some(device) = db::get_device(&ctx.pool, ctx.db_kind, device_id).await? else {
        return Ok(None);
    };
    if device.status != DeviceStatus::Connected {
        return Ok(None);
    }
    let Some(server) = db::get_server(&ctx.pool, ctx.db_kind, &device.server_id).await? else {
        warn!(device_id, server_id = %device.server_id, "device placed on unknown server");
        return Ok(None);
    };

    loop {
        let now = Utc::now();
        let Some(message) = db::next_waiting_message(&ctx.pool, ctx.db_kind, device_id, now).await?
        else {
            return Ok(None);
        };
        if message.available_at > now {
            // Later messages wait behind the head.
            return Ok(None);
        }
        if !db::claim_message(&ctx.pool, ctx.db_kind, &message.id, message.status).await? {
            // Cancelled or claimed elsewhere between select and update.
            continue;
        }
        ctx.publish(&message, MessageStatus::Processing, None);
        let attempts = message.attempts + 1;

        let outgoing = OutgoingMessage {
            to: &message.recipient,
            text: message.body.as_deref(),
            attachment_url: message.attachment_url.as_deref(),
        };
        return match ctx.sessions.send(&server.url, device_id, &outgoing).await {
            Ok(provider_id) => {
                let now = Utc::now();
                db::mark_message_sent(&ctx.pool, ctx.db_kind, &message.id, provider_id.as_deref(), now)
                    .await?;
                db::record_device_activity(&ctx.pool, ctx.db_kind, device_id, now).await?;
                ctx.publish(&message, MessageStatus::Sent, None);
                debug!(message_id = %message.id, device_id, "message sent");
                if let Some(batch_id) = message.batch_id.as_deref() {
                    pace_batch(ctx, batch_id, now).await?;
                }
                Ok(Some(MessageStatus::Sent))
            }
            Err(err) => settle_failure(ctx, &message, attempts, format!("{err:#}")).await.map(Some),
        };
    }
}

/// Keeps the configured batch delay between consecutive sends, however late
/// the device came online.
async fn pace_batch(
    ctx: &DeliveryContext,
    batch_id: &str,
    sent_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    let Some(batch) = db::get_batch(&ctx.pool, ctx.db_kind, batch_id).await? else {
        return Ok(());
    };
    if batch.delay_ms > 0 {
        let not_before = sent_at + Duration::milliseconds(batch.delay_ms);
        db::defer_batch_messages(&ctx.pool, ctx.db_kind, batch_id, not_before).await?;
    }
    Ok(())
}

async fn settle_failure(
    ctx: &DeliveryContext,
    message: &MessageRecord,
    attempts: i64,
    reason: String,
) -> anyhow::Result<MessageStatus> {
    if attempts >= ctx.queue.max_retries {
        db::mark_message_failed(&ctx.pool, ctx.db_kind, &message.id, &reason).await?;
        ctx.publish(message, MessageStatus::Failed, Some(&reason));
        warn!(message_id = %message.id, device_id = %message.device_id, attempts, "giving up on message: {reason}");
        return Ok(MessageStatus::Failed);
    }

    let next = Utc::now() + compute_backoff(attempts);
    if db::mark_message_retry(&ctx.pool, ctx.db_kind, &message.id, next, &reason).await? {
        ctx.publish(message, MessageStatus::Pending, Some(&reason));
        debug!(message_id = %message.id, device_id = %message.device_id, attempts, "send failed, retrying: {reason}");
        return Ok(MessageStatus::Pending);
    }

    // The device was deleted while the send was in flight.
    if db::cancel_message(&ctx.pool, ctx.db_kind, &message.id, MessageStatus::Processing).await? {
        db::refund_credits(&ctx.pool, ctx.db_kind, &message.account_id, 1).await?;
        ctx.publish(message, MessageStatus::Cancelled, Some(&reason));
        info!(message_id = %message.id, device_id = %message.device_id, "dropped message of deleted device");
    }
    Ok(MessageStatus::Cancelled)
}

/// Runs `deliver_next` until the device has nothing due. Returns how many
/// messages were handled.
pub async fn drain_device(ctx: &DeliveryContext, device_id: &str) -> anyhow::Result<usize> {
    let mut handled = 0;
    while deliver_next(ctx, device_id).await?.is_some() {
        handled += 1;
    }
    Ok(handled)
}

#[derive(Clone)]
pub struct DeliveryPool {
    ctx: Arc<DeliveryContext>,
    workers: Arc<Mutex<HashMap<String, mpsc::Sender<()>>>>,
}

impl DeliveryPool {
    pub fn new(ctx: DeliveryContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &DeliveryContext {
        &self.ctx
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<()>>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Nudges the device's worker, starting one if needed.
    pub fn wake(&self, device_id: &str) {
        let mut workers = self.workers();
        if let Some(tx) = workers.get(device_id) {
            match tx.try_send(()) {
                // A pending wake-up already covers this one.
                Ok(()) | Err(mpsc::error::TrySendError::Full(())) => return,
                Err(mpsc::error::TrySendError::Closed(())) => {
                    workers.remove(device_id);
                }
            }
        }

        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(());
        workers.insert(device_id.to_string(), tx);
        tokio::spawn(run_device_worker(
            Arc::clone(&self.ctx),
            device_id.to_string(),
            rx,
        ));
    }

    /// Stops the device's worker once it finishes its current message.
    pub fn retire(&self, device_id: &str) {
        self.workers().remove(device_id);
    }

    pub fn active_workers(&self) -> usize {
        self.workers().len()
    }
}

async fn run_device_worker(ctx: Arc<DeliveryContext>, device_id: String, mut rx: mpsc::Receiver<()>) {
    debug!(device_id = %device_id, "delivery worker started");
    while rx.recv().await.is_some() {
        match drain_device(&ctx, &device_id).await {
            Ok(0) => {}
            Ok(handled) => debug!(device_id = %device_id, handled, "drained device queue"),
            Err(err) => error!(device_id = %device_id, "delivery worker error: {err:?}"),
        }
    }
    debug!(device_id = %device_id, "delivery worker stopped");
}

pub async fn start_dispatcher(pool: DeliveryPool) {
    let ctx = Arc::clone(&pool.ctx);
    match db::requeue_stale_processing(&ctx.pool, ctx.db_kind).await {
        Ok(0) => {}
        Ok(n) => info!(requeued = n, "returned interrupted deliveries to the queue"),
        Err(err) => error!("failed to requeue interrupted deliveries: {err:?}"),
    }

    let interval = std::time::Duration::from_millis(ctx.queue.poll_interval_ms.max(50));
    loop {
        match db::devices_with_due_messages(&ctx.pool, ctx.db_kind, Utc::now()).await {
            Ok(devices) => {
                for device_id in devices {
                    pool.wake(&device_id);
                }
            }
            Err(err) => error!("dispatcher poll failed: {err:?}"),
        }
        sleep(interval).await;
    }
}
