//! End-to-end throughput benchmark for Beacon.
//!
//! Connects authenticated clients to a running server, subscribes them
//! all to one topic and counts delivered MESSAGE frames while every
//! client publishes as fast as it can.
//!
//! ```bash
//! JWT_SECRET=change-me cargo run --release -p beacon-server
//! JWT_SECRET=change-me cargo run --release -p beacon-bench --bin e2e_throughput -- 16
//! ```

use beacon_core::JwtValidator;
use beacon_protocol::{codec, Command, Frame};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const TOPIC: &str = "/topic/benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let server_url =
        std::env::var("BEACON_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
    let secret = std::env::var("JWT_SECRET").map_err(|_| "JWT_SECRET must be set")?;
    let jwt = JwtValidator::new(&secret)?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Beacon End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running with the same JWT_SECRET    ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_pubsub_benchmark(num_clients, &server_url, &jwt).await;
    Ok(())
}

async fn run_pubsub_benchmark(num_clients: usize, server_url: &str, jwt: &JwtValidator) {
    println!("📊 Pub/Sub Benchmark: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let token = match jwt.issue(&format!("bench-{client_id}")) {
            Ok(token) => token,
            Err(e) => {
                eprintln!("Failed to issue token: {}", e);
                return;
            }
        };
        let url = format!("{server_url}?token={token}");
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to connect
    barrier.wait().await;
    println!("✓ All {} clients connected", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counter and start measurement
    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Delivered Messages:   {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

fn text(frame: &Frame) -> Result<Message, BoxError> {
    let data = codec::encode(frame)?;
    Ok(Message::Text(String::from_utf8(data.to_vec())?))
}

async fn run_client(
    client_id: usize,
    url: &str,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();
    let mut recv_buf = BytesMut::with_capacity(65536);

    sender
        .send(text(&Frame::connect("1.2").with_header("heart-beat", "0,0"))?)
        .await?;
    sender
        .send(text(
            &Frame::subscribe(format!("sub-{client_id}"), TOPIC).with_header("receipt", "ready"),
        )?)
        .await?;

    // Wait for CONNECTED and the subscription receipt
    let mut ready = false;
    while !ready {
        let Some(message) = receiver.next().await else {
            return Err("connection closed before subscribing".into());
        };
        if let Message::Text(data) = message? {
            recv_buf.extend_from_slice(data.as_bytes());
            while let Some(frame) = codec::decode_from(&mut recv_buf)? {
                match frame.command {
                    Some(Command::Receipt) => ready = true,
                    Some(Command::Error) => {
                        return Err(format!("server error: {:?}", frame.body_str()).into())
                    }
                    _ => {}
                }
            }
        }
    }

    barrier.wait().await;

    // Pre-encode the SEND frame
    let publish_msg = text(&Frame::send(TOPIC, vec![b'x'; 64]))?;

    let recv_count = message_count.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(data)) = result {
                recv_buf.extend_from_slice(data.as_bytes());
                while let Ok(Some(frame)) = codec::decode_from(&mut recv_buf) {
                    if frame.command == Some(Command::Message) {
                        recv_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    loop {
        if sender.send(publish_msg.clone()).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
