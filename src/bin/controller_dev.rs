//! Stand-in controller for local testing.
//!
//! Listens on the configured port, waits for the bridge to connect, then turns
//! stdin lines of the form `code [duration_ms]` into commands.

use effect_bridge::codec::{self, FrameDecoder};
use effect_bridge::Config;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(2000);

fn parse_command(line: &str, id: u64) -> Option<Value> {
    let mut parts = line.split_whitespace();
    let code = parts.next()?;
    let mut cmd = json!({ "id": id, "code": code, "viewer": "controller-dev" });
    if let Some(ms) = parts.next().and_then(|d| d.parse::<i64>().ok()) {
        cmd["duration"] = json!(ms);
    }
    Some(cmd)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let bind = format!("0.0.0.0:{}", config.connection.port);
    let listener = TcpListener::bind(&bind).await?;
    println!("controller-dev: listening on {bind}");

    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    println!("controller-dev: bridge connected from {peer}");
    let (mut read_half, mut write_half) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let Ok(frame) = codec::encode(&msg) else {
                continue;
            };
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_tx = out_tx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(json!({ "type": "KeepAlive" })).is_err() {
                break;
            }
        }
    });

    let input_tx = out_tx;
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut next_id: u64 = 1;
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(cmd) = parse_command(&line, next_id) else {
                continue;
            };
            println!("-> {cmd}");
            next_id += 1;
            if input_tx.send(cmd).is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::new(config.connection.max_frame_bytes);
    let mut buf = vec![0u8; 4096];
    loop {
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            println!("controller-dev: bridge disconnected");
            return Ok(());
        }
        for frame in decoder.feed(&buf[..n]) {
            let frame = frame?;
            let msg: Value = serde_json::from_slice(&frame)?;
            if msg["status"] == "KeepAlive" {
                continue;
            }
            println!("<- {msg}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await
}
