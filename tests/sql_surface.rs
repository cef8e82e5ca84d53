use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Datelike, Duration as Days, NaiveDate, Utc, Weekday};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use chairbook::auth::Roles;
use chairbook::notify::LogDispatcher;
use chairbook::policy::{Policy, SystemClock};
use chairbook::shop::{ShopRegistry, ShopSettings};
use chairbook::wire;

const PASSWORD: &str = "chairbook";
const OPERATOR: &str = "rosa";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("chairbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let registry = Arc::new(ShopRegistry::new(
        dir,
        ShopSettings::default(),
        Arc::new(SystemClock),
        Arc::new(LogDispatcher),
    ));
    let roles = Arc::new(Roles::new(vec![OPERATOR.to_string()]));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let registry = registry.clone();
            let roles = roles.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, registry, roles, PASSWORD.to_string(), None)
                    .await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, user: &str, shop: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(shop)
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// A business day far enough ahead that no lead time or started-slot rule applies.
fn open_day() -> String {
    let policy = Policy::default();
    let today = policy.local_time(Utc::now().timestamp_millis()).date();
    let mut day = today + Days::days(3);
    while matches!(day.weekday(), Weekday::Sun | Weekday::Mon) {
        day += Days::days(1);
    }
    day.format("%Y-%m-%d").to_string()
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<tokio_postgres::SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn book_sql(id: Ulid, day: &str, time: &str, name: &str) -> String {
    format!(
        "INSERT INTO appointments (id, date, start_time, service_id, owner_name, owner_email) \
         VALUES ('{id}', '{day}', '{time}', 'corte', '{name}', '{}@example.com')",
        name.to_lowercase()
    )
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_then_list() {
    let addr = start_test_server().await;
    let client = connect(addr, "ana", "centro").await;
    let day = open_day();

    let id = Ulid::new();
    client.batch_execute(&book_sql(id, &day, "14:00", "Ana")).await.unwrap();

    let free = rows(
        client
            .simple_query(&format!("SELECT * FROM availability WHERE date = '{day}'"))
            .await
            .unwrap(),
    );
    assert_eq!(free.len(), 17);
    assert!(free.iter().all(|r| r.get("start_time") != Some("14:00")));

    let mine = rows(client.simple_query("SELECT * FROM appointments").await.unwrap());
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(mine[0].get("status"), Some("confirmed"));
    assert_eq!(mine[0].get("price"), Some("2000"));
}

#[tokio::test]
async fn taken_slot_reports_exclusion_violation() {
    let addr = start_test_server().await;
    let ana = connect(addr, "ana", "centro").await;
    let bea = connect(addr, "bea", "centro").await;
    let day = open_day();

    ana.batch_execute(&book_sql(Ulid::new(), &day, "10:00", "Ana"))
        .await
        .unwrap();
    let err = bea
        .batch_execute(&book_sql(Ulid::new(), &day, "10:00", "Bea"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    assert!(err.as_db_error().unwrap().message().starts_with("slot_taken"));

    // Bea can wait for it instead.
    bea.batch_execute(&format!(
        "INSERT INTO waitlist (id, date, start_time, service_id, waiter_name, waiter_email) \
         VALUES ('{}', '{day}', '10:00', 'corte', 'Bea', 'bea@example.com')",
        Ulid::new()
    ))
    .await
    .unwrap();
    let waiting = rows(bea.simple_query("SELECT * FROM waitlist").await.unwrap());
    assert_eq!(waiting.len(), 1);
    assert!(matches!(waiting[0].get("notified"), Some("f") | Some("false")));
}

#[tokio::test]
async fn modify_and_cancel_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "ana", "centro").await;
    let day = open_day();

    let id = Ulid::new();
    client.batch_execute(&book_sql(id, &day, "10:00", "Ana")).await.unwrap();
    client
        .batch_execute(&format!(
            "UPDATE appointments SET date = '{day}', start_time = '11:30' WHERE id = '{id}'"
        ))
        .await
        .unwrap();

    let mine = rows(client.simple_query("SELECT * FROM appointments").await.unwrap());
    assert_eq!(mine[0].get("start_time"), Some("11:30"));
    assert_eq!(mine[0].get("modification_count"), Some("1"));

    // Extended protocol with a bound parameter.
    let deleted = client
        .execute("DELETE FROM appointments WHERE id = $1", &[&id.to_string()])
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(rows(client.simple_query("SELECT * FROM appointments").await.unwrap()).is_empty());
}

#[tokio::test]
async fn clients_cannot_run_operator_statements() {
    let addr = start_test_server().await;
    let ana = connect(addr, "ana", "centro").await;
    let rosa = connect(addr, OPERATOR, "centro").await;
    let day = open_day();

    let block = format!("INSERT INTO blocked_dates (id, date, reason) VALUES ('{}', '{day}', 'feriado')", Ulid::new());
    let err = ana.batch_execute(&block).await.unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    rosa.batch_execute(&block).await.unwrap();
    assert!(
        rows(
            ana.simple_query(&format!("SELECT * FROM availability WHERE date = '{day}'"))
                .await
                .unwrap()
        )
        .is_empty()
    );
    let err = ana
        .batch_execute(&book_sql(Ulid::new(), &day, "10:00", "Ana"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22007");

    let agenda = rosa
        .simple_query(&format!("SELECT * FROM appointments WHERE date = '{day}'"))
        .await
        .unwrap();
    assert!(rows(agenda).is_empty());
}

#[tokio::test]
async fn bad_input_is_an_invalid_argument() {
    let addr = start_test_server().await;
    let client = connect(addr, "ana", "centro").await;

    let err = client
        .batch_execute(&book_sql(Ulid::new(), "31/12/2025", "10:00", "Ana"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = client
        .batch_execute(&book_sql(Ulid::new(), &open_day(), "10:15", "Ana"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = client.batch_execute("DROP TABLE appointments").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn shops_do_not_share_slots() {
    let addr = start_test_server().await;
    let centro = connect(addr, "ana", "centro").await;
    let norte = connect(addr, "ana", "norte").await;
    let day = open_day();

    centro
        .batch_execute(&book_sql(Ulid::new(), &day, "10:00", "Ana"))
        .await
        .unwrap();
    norte
        .batch_execute(&book_sql(Ulid::new(), &day, "10:00", "Ana"))
        .await
        .unwrap();

    let services = rows(norte.simple_query("SELECT * FROM services").await.unwrap());
    assert_eq!(services.len(), 5);
    let day = NaiveDate::parse_from_str(&day, "%Y-%m-%d").unwrap();
    let occupancy = connect(addr, OPERATOR, "norte")
        .await
        .simple_query(&format!(
            "SELECT * FROM occupancy WHERE year = {} AND month = {}",
            day.year(),
            day.month()
        ))
        .await
        .unwrap();
    let booked: u32 = rows(occupancy)
        .iter()
        .filter_map(|r| r.get("booked").and_then(|b| b.parse::<u32>().ok()))
        .sum();
    assert_eq!(booked, 1);
}
