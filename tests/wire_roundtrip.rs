use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use tempora::engine::Engine;
use tempora::identity::UlidAllocator;
use tempora::permission::OwnerPolicy;
use tempora::service::SchedulerService;
use tempora::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tempora_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("tempora.wal")).unwrap());
    let service = Arc::new(SchedulerService::new(
        engine,
        tokio::runtime::Handle::current(),
        Arc::new(OwnerPolicy::new(["admin"])),
        Arc::new(UlidAllocator::new()),
        Duration::from_secs(5),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let service = service.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, service, "tempora".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("tempora")
        .user(user)
        .password("tempora");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

fn text(row: &SimpleQueryRow, column: &str) -> String {
    row.get(column).unwrap_or_default().to_string()
}

/// Room created by the admin, plus a reservation owned by `alice` with one appointment in it.
async fn seed(addr: SocketAddr) -> (String, String, String) {
    let admin = connect(addr, "admin").await;
    let room = query(
        &admin,
        "INSERT INTO resources (name, resource_type) VALUES ('Hall', 'room') RETURNING *",
    )
    .await;
    let room_id = text(&room[0], "id");

    let alice = connect(addr, "alice").await;
    let res = query(
        &alice,
        "INSERT INTO reservations (name, event_type) VALUES ('Algebra', 'lecture') RETURNING *",
    )
    .await;
    let res_id = text(&res[0], "id");
    assert_eq!(text(&res[0], "owner"), "alice");

    let app = query(
        &alice,
        &format!(
            r#"INSERT INTO appointments (reservation_id, start, "end", resources) VALUES ('{res_id}', 1000, 2000, '{room_id}') RETURNING *"#
        ),
    )
    .await;
    let app_id = text(&app[0], "id");
    (room_id, res_id, app_id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn insert_returning_allocates_ids_and_stamps() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;

    let rows = query(
        &admin,
        "INSERT INTO resources (name, resource_type) VALUES ('Room 1', 'room'), ('Room 2', 'room') RETURNING *",
    )
    .await;
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert!(Ulid::from_string(&text(row, "id")).is_ok());
        assert!(text(row, "last_modified").parse::<i64>().unwrap() > 0);
    }

    let listed = query(&admin, "SELECT * FROM resources").await;
    assert_eq!(listed.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_update_is_serialization_failure() {
    let addr = start_test_server().await;
    let (_, res_id, _) = seed(addr).await;
    let alice = connect(addr, "alice").await;

    let current = query(&alice, &format!("SELECT * FROM reservations WHERE id = '{res_id}'")).await;
    let v1 = text(&current[0], "last_modified");

    let updated = query(
        &alice,
        &format!(
            "UPDATE reservations SET name = 'Linear algebra' WHERE id = '{res_id}' AND last_modified = {v1} RETURNING *"
        ),
    )
    .await;
    assert_eq!(text(&updated[0], "name"), "Linear algebra");
    assert_ne!(text(&updated[0], "last_modified"), v1);

    let stale = format!(
        "UPDATE reservations SET name = 'Geometry' WHERE id = '{res_id}' AND last_modified = {v1}"
    );
    assert_eq!(sqlstate(&alice, &stale).await, "40001");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn referential_errors_are_foreign_key_violations() {
    let addr = start_test_server().await;
    let (_, res_id, _) = seed(addr).await;
    let alice = connect(addr, "alice").await;

    let current = query(&alice, &format!("SELECT * FROM reservations WHERE id = '{res_id}'")).await;
    let v1 = text(&current[0], "last_modified");
    let delete = format!("DELETE FROM reservations WHERE id = '{res_id}' AND last_modified = {v1}");
    assert_eq!(sqlstate(&alice, &delete).await, "23503");

    let ghost = Ulid::new();
    let orphan = format!(
        r#"INSERT INTO appointments (reservation_id, start, "end") VALUES ('{ghost}', 1000, 2000)"#
    );
    assert_eq!(sqlstate(&alice, &orphan).await, "23503");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_query_is_filtered_per_caller() {
    let addr = start_test_server().await;
    let (room_id, res_id, _) = seed(addr).await;

    let alice = connect(addr, "alice").await;
    let mine = query(
        &alice,
        &format!(r#"SELECT * FROM events WHERE start >= 0 AND "end" <= 5000 AND resource_id = '{room_id}'"#),
    )
    .await;
    assert_eq!(mine.len(), 1);
    assert_eq!(text(&mine[0], "id"), res_id);

    // same query, different caller: alice's reservation is private
    let bob = connect(addr, "bob").await;
    let theirs = query(
        &bob,
        &format!(r#"SELECT * FROM events WHERE start >= 0 AND "end" <= 5000 AND resource_id = '{room_id}'"#),
    )
    .await;
    assert!(theirs.is_empty());

    // outside the window: empty, not an error
    let later = query(&alice, r#"SELECT * FROM events WHERE start >= 5000 AND "end" <= 6000"#).await;
    assert!(later.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permission_errors_and_unsupported_selects() {
    let addr = start_test_server().await;
    let (_, res_id, _) = seed(addr).await;

    let bob = connect(addr, "bob").await;
    assert_eq!(
        sqlstate(&bob, "INSERT INTO resources (name) VALUES ('Broom closet')").await,
        "42501"
    );
    let current = query(&connect(addr, "alice").await, &format!("SELECT * FROM reservations WHERE id = '{res_id}'")).await;
    let v1 = text(&current[0], "last_modified");
    assert_eq!(
        sqlstate(
            &bob,
            &format!("UPDATE reservations SET name = 'Mine now' WHERE id = '{res_id}' AND last_modified = {v1}")
        )
        .await,
        "42501"
    );

    assert_eq!(sqlstate(&bob, "SELECT * FROM appointments").await, "0A000");
    assert_eq!(sqlstate(&bob, "SELECT * FROM nowhere").await, "42601");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn extended_protocol_delete_with_bound_params() {
    let addr = start_test_server().await;
    let (_, res_id, app_id) = seed(addr).await;
    let alice = connect(addr, "alice").await;

    let app = query(&alice, &format!("SELECT * FROM appointments WHERE reservation_id = '{res_id}'")).await;
    assert_eq!(app.len(), 1);
    let stamp = text(&app[0], "last_modified");

    let deleted = alice
        .execute(
            "DELETE FROM appointments WHERE id = $1 AND last_modified = $2",
            &[&app_id, &stamp],
        )
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let left = query(&alice, &format!("SELECT * FROM appointments WHERE reservation_id = '{res_id}'")).await;
    assert!(left.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn appointment_comment_round_trips_trimmed() {
    let addr = start_test_server().await;
    let (_, res_id, app_id) = seed(addr).await;
    let alice = connect(addr, "alice").await;
    let before = query(&alice, &format!("SELECT * FROM reservations WHERE id = '{res_id}'")).await;

    let app = query(&alice, &format!("SELECT * FROM appointments WHERE reservation_id = '{res_id}'")).await;
    assert_eq!(app[0].get("comment"), None);
    let stamp = text(&app[0], "last_modified");

    let updated = query(
        &alice,
        &format!(
            "UPDATE appointments SET comment = '  bring slides ' WHERE id = '{app_id}' AND last_modified = {stamp} RETURNING *"
        ),
    )
    .await;
    assert_eq!(text(&updated[0], "comment"), "bring slides");

    // the reservation's stamp is untouched by a comment edit
    let after = query(&alice, &format!("SELECT * FROM reservations WHERE id = '{res_id}'")).await;
    assert_eq!(text(&after[0], "last_modified"), text(&before[0], "last_modified"));
}
