mod support;

use axum::http::{Method, StatusCode};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::{spawn_app, spawn_app_with, test_config, FakeSessions, API_KEY, LIMITED_KEY, OTHER_KEY};
use wa_gateway::db;

#[tokio::test]
async fn test_health_uses_envelope() {
    let app = spawn_app().await;
    let (status, bytes, _) = app.request(Method::GET, "/v1/health", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({"success": true, "data": {"status": "ok"}}));
}

#[tokio::test]
async fn test_customer_routes_require_api_key() {
    let app = spawn_app().await;
    let (status, bytes, _) = app.request(Method::GET, "/v1/devices", &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], false);

    let (status, _) = app.call(Method::GET, "/v1/devices", "wa_unknown", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_send_assigns_queue_positions() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;

    let send = |priority: i64| {
        json!({
            "deviceId": device,
            "recipient": "+62 812 3456 7890",
            "message": "hello",
            "priority": priority
        })
    };

    let (status, first) = app.call(Method::POST, "/v1/messages/send", API_KEY, Some(send(0))).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first["success"], true);
    assert_eq!(first["data"]["status"], "QUEUED");
    assert_eq!(first["data"]["queuePosition"], 1);
    assert!(first["data"]["remainingMessages"].is_null());

    let (_, second) = app.call(Method::POST, "/v1/messages/send", API_KEY, Some(send(0))).await;
    assert_eq!(second["data"]["queuePosition"], 2);

    let (_, urgent) = app.call(Method::POST, "/v1/messages/send", API_KEY, Some(send(9))).await;
    assert_eq!(urgent["data"]["queuePosition"], 1);

    let message_id = first["data"]["messageId"].as_str().unwrap();
    let (status, message) = app
        .call(Method::GET, &format!("/v1/messages/{message_id}"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(message["data"]["recipient"], "6281234567890@s.whatsapp.net");
    assert_eq!(message["data"]["deviceId"], device);
}

#[tokio::test]
async fn test_send_scheduled_message() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;
    let at = (chrono::Utc::now() + chrono::Duration::hours(2)).to_rfc3339();

    let (status, body) = app
        .call(
            Method::POST,
            "/v1/messages/send",
            API_KEY,
            Some(json!({"deviceId": device, "to": "6281234567890", "body": "later", "scheduledAt": at})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "SCHEDULED");
    assert!(body["data"]["queuePosition"].as_i64().unwrap() >= 1);
}

#[tokio::test]
async fn test_send_validation_errors() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;

    let (status, body) = app
        .call(
            Method::POST,
            "/v1/messages/send",
            API_KEY,
            Some(json!({"deviceId": device, "recipient": "12ab", "message": "x"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("invalid recipient"));

    let (status, _) = app
        .call(
            Method::POST,
            "/v1/messages/send",
            API_KEY,
            Some(json!({"deviceId": device, "recipient": "6281234567890", "message": "x", "priority": 11})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .call(Method::POST, "/v1/messages/send", API_KEY, Some(json!({"message": "missing fields"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_send_to_unknown_or_foreign_device() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;
    let payload = json!({"deviceId": device, "recipient": "6281234567890", "message": "x"});

    let (status, _) = app
        .call(Method::POST, "/v1/messages/send", OTHER_KEY, Some(payload))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .call(
            Method::POST,
            "/v1/messages/send",
            API_KEY,
            Some(json!({"deviceId": "nope", "recipient": "6281234567890", "message": "x"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "device not found: nope");
}

#[tokio::test]
async fn test_message_limit_and_refund_on_cancel() {
    let app = spawn_app().await;
    let device = app.add_device(LIMITED_KEY, "Only").await;
    let payload = json!({"deviceId": device, "recipient": "6281234567890", "message": "x"});

    let (_, first) = app
        .call(Method::POST, "/v1/messages/send", LIMITED_KEY, Some(payload.clone()))
        .await;
    assert_eq!(first["data"]["remainingMessages"], 1);
    let (status, _) = app
        .call(Method::POST, "/v1/messages/send", LIMITED_KEY, Some(payload.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app
        .call(Method::POST, "/v1/messages/send", LIMITED_KEY, Some(payload.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "message limit reached");

    let message_id = first["data"]["messageId"].as_str().unwrap();
    let (status, cancelled) = app
        .call(Method::POST, &format!("/v1/messages/{message_id}/cancel"), LIMITED_KEY, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["data"]["status"], "CANCELLED");

    let (status, _) = app
        .call(Method::POST, &format!("/v1/messages/{message_id}/cancel"), LIMITED_KEY, None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, sub) = app.call(Method::GET, "/v1/subscription", LIMITED_KEY, None).await;
    assert_eq!(sub["data"]["messagesUsed"], 1);
    assert_eq!(sub["data"]["remainingMessages"], 1);
    assert_eq!(sub["data"]["devicesUsed"], 1);
    assert_eq!(sub["data"]["remainingDevices"], 0);

    let (status, _) = app
        .call(Method::POST, "/v1/messages/send", LIMITED_KEY, Some(payload))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_device_limit() {
    let app = spawn_app().await;
    app.add_device(LIMITED_KEY, "Only").await;
    let (status, body) = app
        .call(Method::POST, "/v1/devices/add", LIMITED_KEY, Some(json!({"name": "Second"})))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "device limit reached");
}

#[tokio::test]
async fn test_bulk_counts_add_up() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Campaign").await;

    let (status, body) = app
        .call(
            Method::POST,
            "/v1/messages/bulk",
            API_KEY,
            Some(json!({
                "deviceId": device,
                "delay": 1500,
                "messages": [
                    {"recipient": "6281234567890", "message": "one"},
                    {"recipient": "not-a-number", "message": "two"},
                    {"recipient": "6281234567891", "message": "three"}
                ]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let data = &body["data"];
    assert_eq!(data["totalMessages"], 3);
    assert_eq!(data["queuedMessages"], 2);
    assert_eq!(data["failedMessages"], 1);
    assert_eq!(
        data["queuedMessages"].as_i64().unwrap() + data["failedMessages"].as_i64().unwrap(),
        data["totalMessages"].as_i64().unwrap()
    );
    assert_eq!(data["errors"][0]["index"], 1);

    let batch_id = data["batchId"].as_str().unwrap();
    let (status, batch) = app
        .call(Method::GET, &format!("/v1/batches/{batch_id}"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(batch["data"]["delayMs"], 1500);
    assert_eq!(batch["data"]["summary"]["queued"], 2);

    let (_, page) = app
        .call(
            Method::GET,
            &format!("/v1/messages/history?batchId={batch_id}"),
            API_KEY,
            None,
        )
        .await;
    let messages = page["data"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    let mut estimates: Vec<chrono::DateTime<chrono::Utc>> = messages
        .iter()
        .map(|m| serde_json::from_value(m["estimatedDelivery"].clone()).unwrap())
        .collect();
    estimates.sort();
    assert!(estimates[1] - estimates[0] >= chrono::Duration::milliseconds(1500));
}

#[tokio::test]
async fn test_bulk_rejects_empty_batch() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Campaign").await;
    let (status, _) = app
        .call(
            Method::POST,
            "/v1/messages/bulk",
            API_KEY,
            Some(json!({"deviceId": device, "messages": []})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_history_and_queue_filters() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;
    let mut ids = Vec::new();
    for n in 0..3 {
        let (_, body) = app
            .call(
                Method::POST,
                "/v1/messages/send",
                API_KEY,
                Some(json!({"deviceId": device, "recipient": "6281234567890", "message": format!("m{n}")})),
            )
            .await;
        ids.push(body["data"]["messageId"].as_str().unwrap().to_string());
    }
    app.call(Method::POST, &format!("/v1/messages/{}/cancel", ids[0]), API_KEY, None)
        .await;

    let (status, queue) = app.call(Method::GET, "/v1/messages/queue", API_KEY, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queue["data"]["pagination"]["total"], 2);
    assert_eq!(queue["data"]["summary"]["queued"], 2);
    assert_eq!(queue["data"]["summary"]["cancelled"], 1);
    assert_eq!(queue["data"]["summary"]["total"], 3);

    let (_, history) = app
        .call(Method::GET, "/v1/messages/history?limit=1&offset=1", API_KEY, None)
        .await;
    assert_eq!(history["data"]["messages"].as_array().unwrap().len(), 1);
    assert_eq!(history["data"]["pagination"]["total"], 3);
    assert_eq!(history["data"]["pagination"]["hasMore"], true);

    let (_, cancelled) = app
        .call(Method::GET, "/v1/messages/history?status=CANCELLED", API_KEY, None)
        .await;
    assert_eq!(cancelled["data"]["messages"][0]["id"], ids[0].as_str());

    let (status, _) = app
        .call(Method::GET, "/v1/messages/history?status=LOST", API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, foreign) = app.call(Method::GET, "/v1/messages/history", OTHER_KEY, None).await;
    assert_eq!(foreign["data"]["pagination"]["total"], 0);
}

#[tokio::test]
async fn test_qr_formats() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;

    let (status, body) = app
        .call(Method::GET, &format!("/v1/devices/{device}/qr?format=json"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["qrCode"].is_string());
    assert!(body["data"]["base64Image"].is_string());
    assert!(body["data"]["expiresAt"].is_string());

    let (_, body) = app
        .call(Method::GET, &format!("/v1/devices/{device}/qr?format=base64"), API_KEY, None)
        .await;
    let data = body["data"].as_object().unwrap();
    assert_eq!(data.len(), 1);
    assert!(data.contains_key("base64Image"));

    let auth = format!("Bearer {API_KEY}");
    let (status, bytes, content_type) = app
        .request(
            Method::GET,
            &format!("/v1/devices/{device}/qr?format=image"),
            &[("authorization", auth.as_str())],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/png"));
    assert_eq!(bytes, b"hello");

    let (status, _) = app
        .call(Method::GET, &format!("/v1/devices/{device}/qr?format=svg"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Served from storage while valid; pairing was only requested at creation.
    assert_eq!(app.sessions.pairings.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_qr_unavailable_once_connected() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;
    app.connect_device(&device).await;

    let (status, _) = app
        .call(Method::GET, &format!("/v1/devices/{device}/qr"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_expired_qr_is_regenerated() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.devices.qr_ttl_seconds = 0;
    let app = spawn_app_with(config, dir).await;
    let device = app.add_device(API_KEY, "Sales").await;

    let (_, body) = app
        .call(Method::GET, &format!("/v1/devices/{device}/qr"), API_KEY, None)
        .await;
    assert_eq!(body["data"]["qrCode"], format!("2@{device}-2"));
    assert_eq!(app.sessions.pairings.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_device_status_machine() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;

    let (status, _) = app
        .session_event(json!({"deviceId": device, "status": "DISCONNECTED"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .session_event(json!({"deviceId": device, "status": "CONNECTING"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "CONNECTING");

    let (_, body) = app
        .session_event(json!({
            "deviceId": device,
            "status": "CONNECTED",
            "phoneNumber": "6281234567890:12@s.whatsapp.net"
        }))
        .await;
    assert_eq!(body["data"]["status"], "CONNECTED");
    assert_eq!(body["data"]["phoneNumber"], "6281234567890");

    // Repeating the current status is accepted.
    let (status, _) = app
        .session_event(json!({"deviceId": device, "status": "CONNECTED"}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .session_event(json!({"deviceId": "missing", "status": "CONNECTED"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_relink_paths() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;

    let (status, _) = app
        .call(Method::POST, &format!("/v1/devices/{device}/relink"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    app.connect_device(&device).await;
    app.session_event(json!({"deviceId": device, "status": "DISCONNECTED"}))
        .await;
    let (status, body) = app
        .call(Method::POST, &format!("/v1/devices/{device}/relink"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["device"]["status"], "CONNECTING");
    assert!(body["data"]["qr"].is_null());
    assert_eq!(app.sessions.reconnects.load(Ordering::SeqCst), 1);

    app.session_event(json!({"deviceId": device, "status": "ERROR", "error": "logged out"}))
        .await;
    let (_, body) = app
        .call(Method::POST, &format!("/v1/devices/{device}/relink"), API_KEY, None)
        .await;
    assert_eq!(body["data"]["device"]["status"], "AUTHENTICATING");
    assert!(body["data"]["qr"]["qrCode"].is_string());
}

#[tokio::test]
async fn test_pairing_failure_marks_device_error() {
    let app = spawn_app().await;
    app.sessions.fail_pairing.store(true, Ordering::SeqCst);

    let (status, body) = app
        .call(Method::POST, "/v1/devices/add", API_KEY, Some(json!({"name": "Broken"})))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);

    let (_, devices) = app.call(Method::GET, "/v1/devices", API_KEY, None).await;
    assert_eq!(devices["data"][0]["status"], "ERROR");
    assert!(devices["data"][0]["lastError"].is_string());
}

#[tokio::test]
async fn test_check_whatsapp_number() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;
    let uri = format!("/v1/accounts/{device}/check-whatsapp");

    let (status, _) = app
        .call(Method::POST, &uri, API_KEY, Some(json!({"phoneNumber": "6281234567890"})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    app.connect_device(&device).await;
    app.sessions.register("6281234567890");

    let (status, body) = app
        .call(Method::POST, &uri, API_KEY, Some(json!({"phoneNumber": "62-abc"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, body) = app
        .call(Method::POST, &uri, API_KEY, Some(json!({"phoneNumber": "+1 415 555 0100"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"],
        json!({"phoneNumber": "14155550100", "isOnWhatsApp": false, "jid": null})
    );

    let (_, body) = app
        .call(Method::POST, &uri, API_KEY, Some(json!({"phoneNumber": "+62 812 3456 7890"})))
        .await;
    assert_eq!(body["data"]["isOnWhatsApp"], true);
    assert_eq!(body["data"]["jid"], "6281234567890@s.whatsapp.net");

    let (status, _) = app
        .call(
            Method::POST,
            "/v1/accounts/unknown/check-whatsapp",
            API_KEY,
            Some(json!({"phoneNumber": "6281234567890"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_server_capacity_and_placement() {
    let app = spawn_app().await;
    app.add_device(API_KEY, "One").await;

    let (status, body) = app
        .call(Method::POST, "/v1/devices/add", API_KEY, Some(json!({"name": "Two", "serverId": "wa-2"})))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["device"]["serverId"], "wa-2");

    let (status, _) = app
        .call(Method::POST, "/v1/devices/add", API_KEY, Some(json!({"name": "Three", "serverId": "wa-2"})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .call(Method::POST, "/v1/devices/add", API_KEY, Some(json!({"name": "Four", "serverId": "wa-9"})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, servers) = app.call(Method::GET, "/v1/servers", API_KEY, None).await;
    let servers = servers["data"].as_array().unwrap();
    assert_eq!(servers[0]["id"], "wa-1");
    assert_eq!(servers[0]["capacity"], json!({"max": 10, "current": 1}));
    assert_eq!(servers[1]["capacity"], json!({"max": 1, "current": 1}));
    assert_eq!(servers[1]["status"], "active");
}

#[tokio::test]
async fn test_delete_device_cancels_queue() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;
    for _ in 0..2 {
        app.call(
            Method::POST,
            "/v1/messages/send",
            API_KEY,
            Some(json!({"deviceId": device, "recipient": "6281234567890", "message": "x"})),
        )
        .await;
    }

    let (status, body) = app
        .call(Method::DELETE, &format!("/v1/devices/{device}"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cancelledMessages"], 2);
    assert_eq!(app.sessions.logouts.load(Ordering::SeqCst), 1);

    let (status, _) = app
        .call(Method::GET, &format!("/v1/devices/{device}"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, history) = app
        .call(Method::GET, "/v1/messages/history?status=CANCELLED", API_KEY, None)
        .await;
    assert_eq!(history["data"]["pagination"]["total"], 2);
}

#[tokio::test]
async fn test_admin_surface() {
    let app = spawn_app().await;

    let (status, _) = app.call(Method::GET, "/v1/admin/accounts", API_KEY, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, created) = app
        .admin(
            Method::POST,
            "/v1/admin/accounts",
            Some(json!({"name": "Globex", "packageName": "business", "messageLimit": 1})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let key = created["data"]["apiKey"].as_str().unwrap().to_string();
    let account_id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, sub) = app.call(Method::GET, "/v1/subscription", &key, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sub["data"]["packageName"], "business");
    assert_eq!(sub["data"]["remainingMessages"], 1);

    let (status, updated) = app
        .admin(
            Method::PATCH,
            &format!("/v1/admin/accounts/{account_id}"),
            Some(json!({"messageLimit": 500, "resetUsage": true})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["data"]["messageLimit"], 500);

    let (status, server) = app
        .admin(
            Method::POST,
            "/v1/admin/servers",
            Some(json!({"id": "wa-3", "url": "http://wa-3.internal:4040", "maxCapacity": 25})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(server["data"]["capacity"]["max"], 25);

    let (status, server) = app
        .admin(Method::PATCH, "/v1/admin/servers/wa-3", Some(json!({"status": "maintenance"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(server["data"]["status"], "maintenance");

    let (status, _) = app
        .admin(Method::PATCH, "/v1/admin/servers/wa-404", Some(json!({"status": "inactive"})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_disabled_without_token() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.auth.admin_token = None;
    let app = spawn_app_with(config, dir).await;

    let (status, _) = app.admin(Method::GET, "/v1/admin/accounts", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_webhook_token_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sidecar.webhook_token = Some("hook".to_string());
    let app = spawn_app_with(config, dir).await;
    let device = app.add_device(API_KEY, "Sales").await;
    let event = json!({"deviceId": device, "status": "CONNECTING"});

    let (status, _) = app.session_event(event.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = app
        .request(
            Method::POST,
            "/v1/session-events",
            &[("x-sidecar-token", "hook")],
            Some(event),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_status_counts() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Sales").await;
    app.call(
        Method::POST,
        "/v1/messages/send",
        API_KEY,
        Some(json!({"deviceId": device, "recipient": "6281234567890", "message": "x"})),
    )
    .await;

    let (status, bytes, _) = app.request(Method::GET, "/v1/status", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["data"]["devices"], 1);
    assert_eq!(body["data"]["messages"], 1);
    assert_eq!(body["data"]["queuedMessages"], 1);
}

#[tokio::test]
async fn test_bulk_storage_failure_keeps_batch_counts() {
    let app = spawn_app().await;
    let device = app.add_device(API_KEY, "Campaign").await;
    sqlx::query(
        "CREATE TRIGGER reject_boom BEFORE INSERT ON messages WHEN NEW.body = 'boom' \
         BEGIN SELECT RAISE(ABORT, 'boom'); END",
    )
    .execute(&app.state.pool)
    .await
    .unwrap();

    let (status, body) = app
        .call(
            Method::POST,
            "/v1/messages/bulk",
            API_KEY,
            Some(json!({
                "deviceId": device,
                "messages": [
                    {"recipient": "6281234567890", "message": "ok"},
                    {"recipient": "6281234567891", "message": "boom"},
                    {"recipient": "6281234567892", "message": "ok"}
                ]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{body}");

    let (_, page) = app.call(Method::GET, "/v1/messages/history", API_KEY, None).await;
    let messages = page["data"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    let batch_id = messages[0]["batchId"].as_str().unwrap();

    let (status, batch) = app
        .call(Method::GET, &format!("/v1/batches/{batch_id}"), API_KEY, None)
        .await;
    assert_eq!(status, StatusCode::OK, "{batch}");
    assert_eq!(batch["data"]["totalMessages"], 3);
    assert_eq!(batch["data"]["queuedMessages"], 1);
    assert_eq!(batch["data"]["failedMessages"], 2);

    let (_, sub) = app.call(Method::GET, "/v1/subscription", API_KEY, None).await;
    assert_eq!(sub["data"]["messagesUsed"], 1);
}

#[tokio::test]
async fn test_webhook_path_is_configurable() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sidecar.webhook_path = "/hooks/whatsapp".to_string();
    let app = spawn_app_with(config, dir).await;
    let device = app.add_device(API_KEY, "Sales").await;

    let (status, _, _) = app
        .request(
            Method::POST,
            "/hooks/whatsapp",
            &[],
            Some(json!({"deviceId": device, "status": "CONNECTING"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let stored = db::get_device(&app.state.pool, app.state.db_kind, &device)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status.as_str(), "CONNECTING");
}

#[tokio::test]
async fn test_unusable_webhook_path_fails_startup() {
    for path in ["session-events", "/v1/health", "/hooks/:device"] {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.sidecar.webhook_path = path.to_string();
        let err = wa_gateway::init_state(config, Arc::new(FakeSessions::default()))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("webhook_path"), "{path}: {err}");
    }
}
