use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use velocita::storefront::{StorefrontManager, StorefrontOptions};
use velocita::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<StorefrontManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("velocita_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let storefronts = Arc::new(StorefrontManager::new(dir, StorefrontOptions::default()));

    let sf = storefronts.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let sf = sf.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, sf, "velocita".to_string(), None).await;
            });
        }
    });

    (addr, storefronts)
}

async fn connect(addr: SocketAddr, storefront: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(storefront)
        .user("velocita")
        .password("velocita");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<String> {
    err.as_db_error().map(|e| e.code().code().to_string())
}

async fn seed_vehicle(client: &Client) -> Ulid {
    let vid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO vehicles (id, name, category, price_per_day, deposit) VALUES ('{vid}', 'Model A', 'sedan', 100, 200)"
        ))
        .await
        .unwrap();
    vid
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_is_priced_and_visible() {
    let (addr, _sf) = start_test_server().await;
    let client = connect(addr, "pricing").await;
    let vid = seed_vehicle(&client).await;
    let gps = Ulid::new();
    let rid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO add_ons (id, name, price) VALUES ('{gps}', 'GPS', 25)"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, customer_id, start, "end", add_on_ids) VALUES ('{rid}', '{vid}', 'cust-1', '2025-01-01', '2025-01-03', '{gps}')"#
        ))
        .await
        .unwrap();

    let found = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{rid}'")).await;
    assert_eq!(found.len(), 1);
    let r = &found[0];
    assert_eq!(r.get("status"), Some("pending"));
    assert_eq!(r.get("days"), Some("2"));
    assert_eq!(r.get("base_cost"), Some("200.00"));
    assert_eq!(r.get("add_ons_total"), Some("25.00"));
    assert_eq!(r.get("deposit"), Some("200.00"));
    assert_eq!(r.get("total"), Some("425.00"));
    assert_eq!(r.get("add_on_ids"), Some(format!("[\"{gps}\"]").as_str()));

    let quote = rows(
        &client,
        &format!(
            r#"SELECT * FROM quote WHERE vehicle_id = '{vid}' AND start >= '2025-01-01' AND "end" <= '2025-01-03' AND add_on_id IN ('{gps}')"#
        ),
    )
    .await;
    assert_eq!(quote[0].get("total"), Some("425.00"));
}

#[tokio::test]
async fn overlapping_booking_reports_exclusion_violation() {
    let (addr, _sf) = start_test_server().await;
    let client = connect(addr, "overlap").await;
    let vid = seed_vehicle(&client).await;

    let book = |start: &str, end: &str| {
        format!(
            r#"INSERT INTO reservations (id, vehicle_id, customer_id, start, "end") VALUES ('{}', '{vid}', 'cust-1', '{start}', '{end}')"#,
            Ulid::new()
        )
    };
    client.batch_execute(&book("2025-01-01", "2025-01-03")).await.unwrap();

    let err = client.batch_execute(&book("2025-01-02", "2025-01-04")).await.unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("23P01"));

    client.batch_execute(&book("2025-01-03", "2025-01-05")).await.unwrap();
    let listed = rows(&client, &format!("SELECT * FROM reservations WHERE vehicle_id = '{vid}'")).await;
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn lifecycle_through_history_inserts() {
    let (addr, _sf) = start_test_server().await;
    let client = connect(addr, "lifecycle").await;
    let vid = seed_vehicle(&client).await;
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, customer_id, start, "end") VALUES ('{rid}', '{vid}', 'cust-1', '2025-01-01', '2025-01-03')"#
        ))
        .await
        .unwrap();

    for action in ["confirmed", "active", "completed"] {
        client
            .batch_execute(&format!(
                "INSERT INTO history (reservation_id, action) VALUES ('{rid}', '{action}')"
            ))
            .await
            .unwrap();
    }
    // Repeating a transition is a no-op.
    client
        .batch_execute(&format!(
            "INSERT INTO history (reservation_id, action) VALUES ('{rid}', 'completed')"
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{rid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("55000"));

    let history = rows(&client, &format!("SELECT * FROM history WHERE reservation_id = '{rid}'")).await;
    let actions: Vec<&str> = history.iter().filter_map(|r| r.get("action")).collect();
    assert_eq!(actions, vec!["created", "confirmed", "activated", "completed"]);
}

#[tokio::test]
async fn cancel_frees_availability() {
    let (addr, _sf) = start_test_server().await;
    let client = connect(addr, "cancel").await;
    let vid = seed_vehicle(&client).await;
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, customer_id, start, "end") VALUES ('{rid}', '{vid}', 'cust-1', '2025-01-02', '2025-01-04')"#
        ))
        .await
        .unwrap();

    let window = format!(
        r#"SELECT * FROM availability WHERE vehicle_id = '{vid}' AND start >= '2025-01-01' AND "end" <= '2025-01-05'"#
    );
    assert_eq!(rows(&client, &window).await.len(), 2);

    client
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{rid}'"))
        .await
        .unwrap();
    let free = rows(&client, &window).await;
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].get("target"), Some(vid.to_string().as_str()));
}

#[tokio::test]
async fn search_honours_filters() {
    let (addr, _sf) = start_test_server().await;
    let client = connect(addr, "search").await;
    let (cheap, pricey) = (Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!(
            "INSERT INTO vehicles VALUES ('{cheap}', 'Polo', 'compact', 45, 100); \
             INSERT INTO vehicles VALUES ('{pricey}', 'X5', 'suv', 150, 500)"
        ))
        .await
        .unwrap();

    let compact = rows(&client, "SELECT * FROM vehicles WHERE category = 'COMPACT'").await;
    assert_eq!(compact.len(), 1);
    assert_eq!(compact[0].get("id"), Some(cheap.to_string().as_str()));

    let under_100 = rows(&client, "SELECT * FROM vehicles WHERE price_per_day <= 100").await;
    assert_eq!(under_100.len(), 1);
    assert_eq!(rows(&client, "SELECT * FROM vehicles").await.len(), 2);
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _sf) = start_test_server().await;
    let client = connect(addr, "errors").await;
    let vid = seed_vehicle(&client).await;

    let unknown = client
        .batch_execute(&format!(
            "INSERT INTO history (reservation_id, action) VALUES ('{}', 'confirmed')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&unknown).as_deref(), Some("P0002"));

    let inverted = client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, customer_id, start, "end") VALUES ('{}', '{vid}', 'c', '2025-01-03', '2025-01-01')"#,
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&inverted).as_deref(), Some("22023"));

    let garbage = client.batch_execute("SELEKT nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&garbage).as_deref(), Some("42601"));
}

#[tokio::test]
async fn storefronts_are_isolated() {
    let (addr, sf) = start_test_server().await;
    let rome = connect(addr, "rome").await;
    let milan = connect(addr, "milan").await;
    seed_vehicle(&rome).await;

    assert_eq!(rows(&rome, "SELECT * FROM vehicles").await.len(), 1);
    assert!(rows(&milan, "SELECT * FROM vehicles").await.is_empty());
    assert_eq!(sf.storefront_count(), 2);
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _sf) = start_test_server().await;
    let client = connect(addr, "extended").await;
    let vid = seed_vehicle(&client).await;
    let rid = Ulid::new();

    client
        .execute(
            r#"INSERT INTO reservations (id, vehicle_id, customer_id, start, "end") VALUES ($1, $2, $3, $4, $5)"#,
            &[
                &rid.to_string(),
                &vid.to_string(),
                &"cust-9",
                &"2025-03-01",
                &"2025-03-04",
            ],
        )
        .await
        .unwrap();

    let found = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{rid}'")).await;
    assert_eq!(found[0].get("days"), Some("3"));
    assert_eq!(found[0].get("customer_id"), Some("cust-9"));
}
