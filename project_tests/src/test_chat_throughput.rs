//! Load test for `server_chat`.
//!
//! Connects `--clients` WebSocket clients, lets each send `--messages` chat
//! messages, and checks what every client received: every chat message must
//! arrive, and chat from each sender must arrive in the order it was sent.
//!
//! Messages from different senders may interleave in any order, so sequence
//! numbers are only compared within one sender.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use lib_common::core::{Frame, MessageKind};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Server WebSocket endpoint
    #[clap(short, long, default_value = "ws://127.0.0.1:8765/ws")]
    url: String,

    /// Number of concurrent clients
    #[clap(short, long, default_value_t = 10)]
    clients: usize,

    /// Chat messages sent by each client
    #[clap(short, long, default_value_t = 100)]
    messages: usize,

    /// Seconds to wait for the last messages after sending
    #[clap(long, default_value_t = 10)]
    settle_seconds: u64,
}

#[derive(Debug, Default)]
struct ClientReport {
    name: String,
    received_chat: usize,
    violations: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let expected_per_client = args.clients * args.messages;
    println!(
        "Connecting {} clients to {} ({} messages each)...",
        args.clients, args.url, args.messages
    );

    let started = Instant::now();
    let mut clients = JoinSet::new();
    for i in 0..args.clients {
        let args = args.clone();
        clients.spawn(async move { run_client(format!("load_{}", i), args).await });
    }

    let mut reports = Vec::new();
    while let Some(joined) = clients.join_next().await {
        match joined {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => eprintln!("Client failed: {:#}", e),
            Err(e) => eprintln!("Client task failed: {}", e),
        }
    }
    let elapsed = started.elapsed();

    let total: usize = reports.iter().map(|r| r.received_chat).sum();
    println!("\n----- Summary -----");
    println!("Elapsed: {:.2?}", elapsed);
    println!("Deliveries: {} ({:.0}/s)", total, total as f64 / elapsed.as_secs_f64());
    let mut failed = false;
    for report in &reports {
        if report.received_chat != expected_per_client || !report.violations.is_empty() {
            failed = true;
            println!(
                "{}: {}/{} chat messages, {} ordering violation(s)",
                report.name,
                report.received_chat,
                expected_per_client,
                report.violations.len()
            );
            for violation in report.violations.iter().take(5) {
                println!("    {}", violation);
            }
        }
    }
    println!("-------------------");

    if failed || reports.len() != args.clients {
        bail!("load test found problems");
    }
    println!("All {} clients received every message in order.", reports.len());
    Ok(())
}

async fn run_client(name: String, args: Args) -> Result<ClientReport> {
    let url = format!("{}?name={}", args.url, name);
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("{} failed to connect", name))?;
    let (mut write, mut read) = ws_stream.split();

    // Give every client time to join before anyone talks.
    sleep(Duration::from_millis(500)).await;

    let sender_name = name.clone();
    let messages = args.messages;
    let writer = tokio::spawn(async move {
        for i in 0..messages {
            let text = json!({ "type": "chat_message", "message": format!("{}:{}", sender_name, i) }).to_string();
            write.send(Message::Text(text.into())).await?;
        }
        Ok::<_, anyhow::Error>(write)
    });

    let expected = args.clients * args.messages;
    let mut report = ClientReport {
        name: name.clone(),
        ..Default::default()
    };
    let mut senders: HashMap<String, SenderProgress> = HashMap::new();
    let deadline = Instant::now() + Duration::from_secs(args.settle_seconds) + Duration::from_millis(500);

    while report.received_chat < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let next = match timeout(remaining, read.next()).await {
            Ok(Some(next)) => next?,
            Ok(None) | Err(_) => break,
        };
        let Message::Text(text) = next else { continue };
        let Ok(frame) = Frame::decode(text.as_bytes()) else { continue };

        match frame {
            Frame::Message { kind: MessageKind::Chat, .. } => {
                check_sender_order(&frame, &mut senders, &mut report.violations);
                report.received_chat += 1;
            }
            Frame::Shutdown { .. } => {
                report.violations.push(format!("server shut down at {}", Utc::now()));
                break;
            }
            _ => {}
        }
    }

    let mut write = writer.await??;
    let _ = write.send(Message::Close(None)).await;
    Ok(report)
}

#[derive(Debug, Default)]
struct SenderProgress {
    next_index: usize,
    last_seq: u64,
}

/// Payloads are `<sender>:<index>`. Per sender, indexes must arrive as
/// 0, 1, 2, ... and sequence numbers must grow.
fn check_sender_order(
    frame: &Frame,
    senders: &mut HashMap<String, SenderProgress>,
    violations: &mut Vec<String>,
) {
    let Frame::Message { seq, sender, .. } = frame else { return };
    let Some(payload) = frame.payload_bytes() else { return };
    let text = String::from_utf8_lossy(&payload);
    let Some(index) = text.rsplit(':').next().and_then(|i| i.parse::<usize>().ok()) else {
        return;
    };
    let progress = senders.entry(sender.clone()).or_default();
    if index != progress.next_index {
        violations.push(format!("{}: got #{} expected #{}", sender, index, progress.next_index));
    }
    if *seq <= progress.last_seq {
        violations.push(format!("{}: seq {} after {}", sender, seq, progress.last_seq));
    }
    progress.next_index = index + 1;
    progress.last_seq = *seq;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::core::Message;

    fn chat(sender: &str, index: usize, seq: u64) -> Frame {
        let mut message = Message::new(sender, format!("{}:{}", sender, index));
        message.seq = seq;
        Frame::from_message(&message)
    }

    #[test]
    fn senders_may_interleave_out_of_seq_order() {
        let mut senders = HashMap::new();
        let mut violations = Vec::new();
        for frame in [chat("bob", 0, 2), chat("alice", 0, 1), chat("bob", 1, 3), chat("alice", 1, 4)] {
            check_sender_order(&frame, &mut senders, &mut violations);
        }
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn reordering_within_a_sender_is_reported() {
        let mut senders = HashMap::new();
        let mut violations = Vec::new();
        for frame in [chat("alice", 1, 2), chat("alice", 0, 1)] {
            check_sender_order(&frame, &mut senders, &mut violations);
        }
        assert_eq!(violations.len(), 3);
    }
}
