//! Peek Round-Trip Example
//!
//! Sends a handful of messages to an in-process broker, peeks them back without
//! consuming, then receives them through an exclusive receiver.
//!
//! Run with:
//! ```bash
//! RUST_LOG=busline_client=debug cargo run --package busline-client --example peek_roundtrip
//! ```
//!
//! Retry settings are read from `busline.toml` in the working directory when
//! present.

use busline_client::transport::memory::{Broker, Fault};
use busline_client::{ClientOptions, Connection, EventPosition, Message};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("\nbusline peek round-trip");
    println!("=======================\n");

    // Step 1: Broker and entity
    println!("Step 1: Starting embedded broker");
    let broker = Broker::new("demo.bus.local");
    broker.create_entity("orders", 2).await?;
    println!("   created entity 'orders' with 2 partitions\n");

    // Step 2: Connect
    println!("Step 2: Connecting");
    let options = ClientOptions::load("busline.toml")?;
    println!(
        "   retry mode {:?}, max_retries {}",
        options.retry.mode, options.retry.max_retries
    );
    let connection = Connection::connect_embedded(
        broker.clone(),
        "Endpoint=sb://demo.bus.local/;EntityPath=orders",
        None,
        None,
        options,
    )
    .await?;
    let cancel = CancellationToken::new();
    let properties = connection.get_properties(&cancel).await?;
    println!(
        "   connected to {} ({:?})\n",
        connection.service_endpoint(),
        properties.partition_ids
    );

    // Step 3: Send, riding out a transient fault
    println!("Step 3: Sending 10 messages to partition 0");
    broker.inject_fault(Fault::Busy).await;
    let sender = connection.create_sender(Some("0"))?;
    let messages = (1..=10)
        .map(|i| {
            Message::new(format!("{{\"order_id\": {}, \"amount\": {}}}", i, i * 100))
                .with_label("order")
        })
        .collect();
    sender.send_messages(messages, &cancel).await?;
    println!("   sent (broker served {} requests)\n", broker.request_count());

    // Step 4: Peek
    println!("Step 4: Peeking");
    let receiver = connection
        .create_receiver()
        .partition_id("0")
        .event_position(EventPosition::Earliest)
        .owner_level(1)
        .track_last_enqueued_event_properties(true)
        .build()?;
    for message in receiver.peek(Some(1), 3, &cancel).await? {
        println!(
            "   #{} {}",
            message.sequence_number().unwrap_or_default(),
            String::from_utf8_lossy(message.body())
        );
    }
    println!();

    // Step 5: Receive everything
    println!("Step 5: Receiving");
    let mut received = 0;
    loop {
        let batch = receiver
            .receive(4, Duration::from_millis(200), &cancel)
            .await?;
        if batch.is_empty() {
            break;
        }
        received += batch.len();
        println!("   got {} messages", batch.len());
    }
    if let Some(last) = receiver.last_enqueued_event_properties().await {
        println!(
            "   received {} total, last enqueued sequence number {:?}\n",
            received, last.sequence_number
        );
    }

    // Step 6: Shutdown
    println!("Step 6: Closing");
    connection.close(&cancel).await?;
    println!("   closed: {}", connection.is_closed());

    Ok(())
}
