use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Datelike, Duration as Days, NaiveDate, Utc, Weekday};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const PASSWORD: &str = "chairbook";
/// Start times of the default 09:00-18:00 grid.
const GRID: [&str; 18] = [
    "09:00", "09:30", "10:00", "10:30", "11:00", "11:30", "12:00", "12:30", "13:00", "13:30",
    "14:00", "14:30", "15:00", "15:30", "16:00", "16:30", "17:00", "17:30",
];

async fn connect(host: &str, port: u16, shop: &str, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(shop)
        .user(user)
        .password(PASSWORD);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

/// Open days from the day after tomorrow on, under the default Tue-Sat week.
fn business_days(n: usize) -> Vec<String> {
    let today: NaiveDate = (Utc::now() - Days::hours(3)).date_naive();
    let mut day = today + Days::days(2);
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        if !matches!(day.weekday(), Weekday::Sun | Weekday::Mon) {
            out.push(day.format("%Y-%m-%d").to_string());
        }
        day += Days::days(1);
    }
    out
}

fn book_sql(id: Ulid, day: &str, time: &str, user: &str) -> String {
    format!(
        "INSERT INTO appointments (id, date, start_time, service_id, owner_name, owner_email) \
         VALUES ('{id}', '{day}', '{time}', 'corte', '{user}', '{user}@bench.test')"
    )
}

fn fresh_shop() -> String {
    format!("bench_{}", Ulid::new())
}

async fn phase1_sequential(host: &str, port: u16) {
    let shop = fresh_shop();
    let days = business_days(20);
    let slots: Vec<(&str, &str)> = days
        .iter()
        .flat_map(|d| GRID.iter().map(move |t| (d.as_str(), *t)))
        .collect();

    let mut latencies = Vec::with_capacity(slots.len());
    let start = Instant::now();

    // Three per client keeps every owner at the active limit, never over it.
    for (n, chunk) in slots.chunks(3).enumerate() {
        let user = format!("client{n}");
        let client = connect(host, port, &shop, &user).await;
        for (day, time) in chunk {
            let t = Instant::now();
            client
                .batch_execute(&book_sql(Ulid::new(), day, time, &user))
                .await
                .unwrap();
            latencies.push(t.elapsed());
        }
    }

    let elapsed = start.elapsed();
    let n = latencies.len();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("book latency", &mut latencies);
}

async fn phase2_slot_storm(host: &str, port: u16) {
    let shop = fresh_shop();
    let day = business_days(1).remove(0);
    let n_clients = 64;

    let winners = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_clients {
        let host = host.to_string();
        let shop = shop.clone();
        let day = day.clone();
        let winners = winners.clone();
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            let user = format!("storm{i}");
            let client = connect(&host, port, &shop, &user).await;
            match client
                .batch_execute(&book_sql(Ulid::new(), &day, "10:00", &user))
                .await
            {
                Ok(()) => winners.fetch_add(1, Ordering::Relaxed),
                Err(_) => refused.fetch_add(1, Ordering::Relaxed),
            };
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let won = winners.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients raced for one slot in {:.2}s: {won} confirmed, {} refused",
        start.elapsed().as_secs_f64(),
        refused.load(Ordering::Relaxed)
    );
    assert_eq!(won, 1, "slot confirmed more than once");
}

async fn phase3_reads_under_churn(host: &str, port: u16) {
    let shop = fresh_shop();
    let days = business_days(5);
    let stop = Arc::new(AtomicBool::new(false));

    // Writers book and cancel in a loop, invalidating the availability cache.
    let mut writer_handles = Vec::new();
    for w in 0..4 {
        let host = host.to_string();
        let shop = shop.clone();
        let day = days[w % days.len()].clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let user = format!("writer{w}");
            let client = connect(&host, port, &shop, &user).await;
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let id = Ulid::new();
                let time = GRID[(w * 4 + i) % GRID.len()];
                if client
                    .batch_execute(&book_sql(id, &day, time, &user))
                    .await
                    .is_ok()
                {
                    let _ = client
                        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{id}'"))
                        .await;
                }
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let shop = shop.clone();
        let days = days.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &shop, &format!("reader{r}")).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let day = &days[i % days.len()];
                let t = Instant::now();
                client
                    .simple_query(&format!("SELECT * FROM availability WHERE date = '{day}'"))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let shop = fresh_shop();
    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for i in 0..n_conns {
        let host = host.to_string();
        let shop = shop.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &shop, &format!("guest{i}")).await;
            for _ in 0..10 {
                client.simple_query("SELECT * FROM services").await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, 10 reads each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("CHAIRBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("CHAIRBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid CHAIRBOOK_PORT");

    println!("=== chairbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] one slot, many clients");
    phase2_slot_storm(&host, port).await;

    println!("\n[phase 3] availability reads under booking churn");
    phase3_reads_under_churn(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== done ===");
}
