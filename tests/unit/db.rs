use chrono::{TimeZone, Utc};
use wa_gateway::db::{
    datetime_to_millis, db_kind_from_url, millis_to_datetime, rewrite_sql, AccountRecord, DbKind,
};

#[test]
fn test_db_kind_from_url_sqlite() {
    assert_eq!(db_kind_from_url("sqlite://state.db?mode=rwc"), DbKind::Sqlite);
    assert_eq!(db_kind_from_url("SQLite://state.db"), DbKind::Sqlite);
}

#[test]
fn test_db_kind_from_url_postgres() {
    assert_eq!(db_kind_from_url("postgres://localhost/wa"), DbKind::Postgres);
    assert_eq!(db_kind_from_url("postgresql://localhost/wa"), DbKind::Postgres);
}

#[test]
fn test_db_kind_from_url_default_sqlite() {
    assert_eq!(db_kind_from_url("mysql://localhost/wa"), DbKind::Sqlite);
}

#[test]
fn test_rewrite_sql_sqlite_untouched() {
    let sql = "UPDATE messages SET status = ? WHERE id = ? AND status = ?";
    assert_eq!(rewrite_sql(sql, DbKind::Sqlite).as_ref(), sql);
}

#[test]
fn test_rewrite_sql_postgres_numbers_placeholders() {
    let sql = "UPDATE messages SET status = ? WHERE id = ? AND status = ?";
    assert_eq!(
        rewrite_sql(sql, DbKind::Postgres).as_ref(),
        "UPDATE messages SET status = $1 WHERE id = $2 AND status = $3"
    );
}

#[test]
fn test_rewrite_sql_postgres_in_list() {
    let sql = "SELECT id FROM messages WHERE account_id = ? AND status IN (?,?) LIMIT ? OFFSET ?";
    assert_eq!(
        rewrite_sql(sql, DbKind::Postgres).as_ref(),
        "SELECT id FROM messages WHERE account_id = $1 AND status IN ($2,$3) LIMIT $4 OFFSET $5"
    );
}

#[test]
fn test_millis_conversion() {
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
    let ms = datetime_to_millis(at);
    assert_eq!(ms, 1_772_368_200_000);
    assert_eq!(millis_to_datetime(ms), at);
}

fn account(limit: i64, used: i64) -> AccountRecord {
    let now = Utc::now();
    AccountRecord {
        id: "acc".to_string(),
        name: "Acme".to_string(),
        package_name: "starter".to_string(),
        api_key: "wa_key".to_string(),
        message_limit: limit,
        messages_used: used,
        device_limit: 2,
        expires_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[test]
fn test_remaining_messages() {
    assert_eq!(account(100, 40).remaining_messages(), Some(60));
    assert_eq!(account(10, 12).remaining_messages(), Some(0));
    assert_eq!(account(-1, 500).remaining_messages(), None);
}

#[test]
fn test_account_serializes_camel_case() {
    let json = serde_json::to_value(account(5, 1)).unwrap();
    assert_eq!(json["messageLimit"], 5);
    assert_eq!(json["packageName"], "starter");
    assert!(json.get("message_limit").is_none());
}
