//! Replay a captured AMI stream through the tracker.
//!
//! Feeds a file of raw AMI frames (as written by `tcpdump -A` or a manager
//! session log) through the parser and dispatcher in small chunks, the way
//! they would arrive from the socket, then prints what the sink ended up
//! with. Useful for checking correlation against a real switch's traffic.
//!
//! Usage: RUST_LOG=info cargo run --example replay -- capture.txt [directory.json]

use std::sync::Arc;

use ami_call_tracker::{
    AmiEvent, AmiParser, Directory, EventDispatcher, MemorySink, MessageType, TrackerConfig,
};
use tracing::{info, warn};

/// Bytes handed to the parser per step
const CHUNK: usize = 1400;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let capture = match args.get(1) {
        Some(path) => path,
        None => {
            eprintln!("Usage: replay <capture.txt> [directory.json]");
            std::process::exit(2);
        }
    };
    let directory = match args.get(2) {
        Some(path) => Directory::from_json_file(path)?,
        None => Directory::new(),
    };
    let queues = directory.queues.clone();
    let mut agents: Vec<_> = directory.agents.values().copied().collect();
    agents.sort();

    let sink = Arc::new(MemorySink::new(directory));
    let config = TrackerConfig::default().with_recording_dirs(Vec::new());
    let dispatcher = EventDispatcher::new(sink.clone(), &config);

    let raw = tokio::fs::read(capture).await?;
    let mut parser = AmiParser::new();
    let (mut events, mut dropped, mut responses) = (0usize, 0usize, 0usize);

    for chunk in raw.chunks(CHUNK) {
        parser.add_data(chunk)?;
        while let Some(message) = parser.next_message() {
            match message.message_type {
                MessageType::Event => {
                    events += 1;
                    let event = AmiEvent::from_headers(message.headers);
                    if let Err(e) = dispatcher.dispatch(&event).await {
                        warn!("Dropped {} event: {}", event.event_type(), e);
                        dropped += 1;
                    }
                }
                MessageType::Response => responses += 1,
                MessageType::Other => {}
            }
        }
    }
    if parser.buffer_len() > 0 {
        warn!(
            "{} trailing bytes without a frame delimiter",
            parser.buffer_len()
        );
    }
    info!(
        "Replayed {} events ({} dropped) and {} responses",
        events, dropped, responses
    );

    println!("Calls:");
    for call in sink.calls().await {
        println!(
            "  {:<24} {:<8} {:<12} wait={:>4}s talk={:>4}s hold={:>4}s agent={}",
            call.call_id,
            call.direction.as_str(),
            call.status.as_str(),
            call.wait_time,
            call.talk_time,
            call.hold_time,
            call.agent
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    println!("Agents:");
    for agent in agents {
        if let Some(row) = sink.agent(agent).await {
            println!(
                "  {:<10} {:<10} calls={} talk={}s available={}s break={}s",
                agent.to_string(),
                row.status.as_str(),
                row.totals.calls,
                row.totals.talk_time,
                row.totals.available_time,
                row.totals.break_time,
            );
        }
    }

    println!("Queues:");
    for queue in queues {
        if let Some(stats) = sink.queue_stats(queue.id).await {
            println!(
                "  {:<16} waiting={} completed={} abandoned={} sl={:.1}% avg_wait={}s",
                queue.name,
                stats.calls_waiting,
                stats.calls_completed,
                stats.calls_abandoned,
                stats.service_level_percentage,
                stats.avg_wait_time,
            );
        }
    }

    let open = dispatcher.open_calls().await;
    if open > 0 {
        info!("{} calls still waiting for their CDR", open);
    }
    Ok(())
}
