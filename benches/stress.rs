use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const SEATS: usize = 40;

async fn connect(host: &str, port: u16, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("seatlock")
        .password("seatlock");

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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn seat_code(i: usize) -> String {
    format!("S{:02}", i + 1)
}

fn travel_date(offset: u64) -> NaiveDate {
    let base = NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid date");
    base.checked_add_days(Days::new(offset)).expect("date in range")
}

async fn provision(client: &Client) {
    let values: Vec<String> = (0..SEATS)
        .map(|i| {
            let deck = if i < SEATS / 2 { "LOWER" } else { "UPPER" };
            format!("('{}', '{deck}', {i})", seat_code(i))
        })
        .collect();
    client
        .batch_execute(&format!(
            "INSERT INTO seat_templates (seat_code, deck, sort_order) VALUES {}",
            values.join(", ")
        ))
        .await
        .unwrap();
    println!("  provisioned {SEATS} seats");
}

/// Hold then confirm two seats at a time, one trip date per iteration batch.
async fn phase1_sequential(host: &str, port: u16, db: &str) {
    let client = connect(host, port, db).await;
    let n = 1000;
    let mut hold_lat = Vec::with_capacity(n);
    let mut confirm_lat = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let date = travel_date((i * 2 / SEATS) as u64);
        let a = seat_code(i * 2 % SEATS);
        let b = seat_code((i * 2 + 1) % SEATS);

        let t = Instant::now();
        client
            .batch_execute(&format!(
                "INSERT INTO seat_holds (trip_id, travel_date, seat_code) \
                 VALUES (1, '{date}', '{a}'), (1, '{date}', '{b}')"
            ))
            .await
            .unwrap();
        hold_lat.push(t.elapsed());

        let t = Instant::now();
        client
            .batch_execute(&format!(
                "INSERT INTO booked_seats (trip_id, travel_date, seat_code, booking_code) \
                 VALUES (1, '{date}', '{a}', 'BK{i}'), (1, '{date}', '{b}', 'BK{i}')"
            ))
            .await
            .unwrap();
        confirm_lat.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    println!(
        "  {n} hold+confirm pairs in {:.2}s = {:.0} pairs/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("hold latency", &mut hold_lat);
    print_latency("confirm latency", &mut confirm_lat);
}

/// Many clients race for the same seats on one hot trip date. Every seat
/// must end up held by exactly one of them.
async fn phase2_hot_key(host: &str, port: u16, db: &str) {
    let n_clients = 32;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for c in 0..n_clients {
        let host = host.to_string();
        let db = db.to_string();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut latencies = Vec::new();
            for i in 0..SEATS / 2 {
                // Overlapping pairs: client c wants seats (c+i, c+i+1).
                let a = seat_code((c + i) % SEATS);
                let b = seat_code((c + i + 1) % SEATS);
                let t = Instant::now();
                let result = client
                    .batch_execute(&format!(
                        "INSERT INTO seat_holds (trip_id, travel_date, seat_code, user_id) \
                         VALUES (2, '2030-06-01', '{a}', 'c{c}'), (2, '2030-06-01', '{b}', 'c{c}')"
                    ))
                    .await;
                latencies.push(t.elapsed());
                match result {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                        lost.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_clients} clients: {} batches won, {} rejected in {:.2}s",
        won.load(Ordering::Relaxed),
        lost.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
    print_latency("contended hold latency", &mut latencies);

    let client = connect(host, port, db).await;
    let rows = client
        .simple_query("SELECT * FROM seat_holds WHERE trip_id = 2 AND travel_date = '2030-06-01'")
        .await
        .unwrap();
    let mut per_seat = vec![0usize; SEATS];
    for msg in rows {
        if let tokio_postgres::SimpleQueryMessage::Row(row) = msg {
            if row.get("status") == Some("HELD") {
                let code = row.get("seat_code").unwrap_or_default();
                if let Ok(n) = code.trim_start_matches('S').parse::<usize>() {
                    per_seat[n - 1] += 1;
                }
            }
        }
    }
    let double = per_seat.iter().filter(|&&n| n > 1).count();
    println!("  seats held twice: {double} (must be 0)");
    assert_eq!(double, 0);
}

/// Seat map reads on one trip date while writers keep holding other dates.
async fn phase3_read_under_load(host: &str, port: u16, db: &str) {
    let stop = Arc::new(AtomicUsize::new(0));
    let mut writers = Vec::new();
    for w in 0..4u64 {
        let host = host.to_string();
        let db = db.to_string();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut i = 0usize;
            while stop.load(Ordering::Relaxed) == 0 {
                let date = travel_date(1000 + w * 100 + (i / SEATS) as u64);
                let seat = seat_code(i % SEATS);
                let _ = client
                    .batch_execute(&format!(
                        "INSERT INTO seat_holds (trip_id, travel_date, seat_code) \
                         VALUES (3, '{date}', '{seat}')"
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    let client = connect(host, port, db).await;
    let mut latencies = Vec::with_capacity(2000);
    for _ in 0..2000 {
        let t = Instant::now();
        client
            .simple_query("SELECT * FROM seat_map WHERE trip_id = 2 AND travel_date = '2030-06-01'")
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    stop.store(1, Ordering::Relaxed);
    for w in writers {
        let _ = w.await;
    }
    print_latency("seat map read latency", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16, db: &str) {
    let n_conns = 100;
    let ok = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let db = db.to_string();
        let ok = ok.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            if client.simple_query("SELECT * FROM seat_templates").await.is_ok() {
                ok.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }
    println!(
        "  {}/{n_conns} connections served in {:.2}s",
        ok.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SEATLOCK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SEATLOCK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SEATLOCK_PORT");

    // A fresh tenant per run keeps earlier runs out of the numbers.
    let db = format!("bench_{}", Ulid::new());

    println!("=== seatlock stress benchmark ===");
    println!("target: {host}:{port}/{db}\n");

    println!("[setup]");
    provision(&connect(&host, port, &db).await).await;

    println!("\n[phase 1] sequential hold + confirm");
    phase1_sequential(&host, port, &db).await;

    println!("\n[phase 2] contention on one trip date");
    phase2_hot_key(&host, port, &db).await;

    println!("\n[phase 3] seat map reads under write load");
    phase3_read_under_load(&host, port, &db).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, &db).await;

    println!("\n=== benchmark complete ===");
}
