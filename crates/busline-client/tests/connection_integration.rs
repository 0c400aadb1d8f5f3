//! Integration tests for Connection → TransportClient → embedded broker.
//!
//! These tests drive the public facades end to end:
//! 1. Connect with a connection string
//! 2. Send through SenderClient
//! 3. Read back through ReceiverClient (receive and peek)
//! 4. Exercise ownership, purging, cancellation and shutdown

use busline_client::transport::memory::{Broker, Fault};
use busline_client::{
    ClientError, ClientOptions, Connection, Credential, EventPosition, Message, RetryOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "contoso.bus.local";
const CONNECTION_STRING: &str =
    "Endpoint=sb://contoso.bus.local/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0";

/// Retry settings that keep failing tests fast.
fn fast_options() -> ClientOptions {
    ClientOptions {
        retry: RetryOptions {
            max_retries: 2,
            delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            try_timeout: Duration::from_secs(2),
            ..RetryOptions::default()
        },
        ..ClientOptions::default()
    }
}

/// Helper to create a broker with entity `Q` and a connection to it.
async fn setup(partitions: usize) -> (Broker, Connection) {
    let broker = Broker::new(NAMESPACE);
    broker.create_entity("Q", partitions).await.unwrap();
    let connection = Connection::connect_embedded(
        broker.clone(),
        CONNECTION_STRING,
        Some("Q"),
        None,
        fast_options(),
    )
    .await
    .unwrap();
    (broker, connection)
}

// ============================================================================
// Send and peek
// ============================================================================

#[tokio::test]
async fn test_peek_returns_sent_messages_in_order() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let sender = connection.create_sender(None).unwrap();
    let messages: Vec<Message> = (1..=10)
        .map(|i| {
            Message::new(format!("message-{}", i))
                .with_message_id(format!("id-{}", i))
                .with_label("peek-test")
        })
        .collect();
    sender.send_messages(messages, &cancel).await.unwrap();

    let receiver = connection
        .create_receiver()
        .partition_id("0")
        .event_position(EventPosition::Earliest)
        .build()
        .unwrap();

    let peeked = receiver.peek(Some(1), 10, &cancel).await.unwrap();
    assert_eq!(peeked.len(), 10);
    for (i, message) in peeked.iter().enumerate() {
        let n = i + 1;
        assert_eq!(message.body(), format!("message-{}", n).as_str());
        assert_eq!(message.message_id(), format!("id-{}", n));
        assert_eq!(message.label(), Some("peek-test"));
        assert_eq!(message.sequence_number(), Some(n as i64));
    }
}

#[tokio::test]
async fn test_peek_is_idempotent_and_non_destructive() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let sender = connection.create_sender(Some("0")).unwrap();
    for i in 0..4 {
        sender
            .send(Message::new(format!("m{}", i)), &cancel)
            .await
            .unwrap();
    }

    let receiver = connection
        .create_receiver()
        .partition_id("0")
        .event_position(EventPosition::Earliest)
        .build()
        .unwrap();

    let first = receiver.peek(Some(2), 2, &cancel).await.unwrap();
    let second = receiver.peek(Some(2), 2, &cancel).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first[0].sequence_number(), Some(2));

    // fewer available than requested
    let tail = receiver.peek(Some(3), 10, &cancel).await.unwrap();
    assert_eq!(tail.len(), 2);

    // receiving afterwards still starts at the beginning
    let received = receiver
        .receive(10, Duration::from_millis(200), &cancel)
        .await
        .unwrap();
    assert_eq!(received.len(), 4);
    assert_eq!(received[0].sequence_number(), Some(1));
}

#[tokio::test]
async fn test_peek_session_filters_messages() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let sender = connection.create_sender(Some("0")).unwrap();
    sender
        .send_messages(
            vec![
                Message::new("a").with_session_id("s1"),
                Message::new("b").with_session_id("s2"),
                Message::new("c").with_session_id("s1"),
            ],
            &cancel,
        )
        .await
        .unwrap();

    let receiver = connection.create_receiver().partition_id("0").build().unwrap();
    let peeked = receiver
        .peek_session(Some(1), 10, Some("s1"), &cancel)
        .await
        .unwrap();
    assert_eq!(peeked.len(), 2);
    assert!(peeked.iter().all(|m| m.session_id() == Some("s1")));
}

#[tokio::test]
async fn test_batch_roundtrip() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();
    let sender = connection.create_sender(None).unwrap();

    let mut batch = sender.create_batch(&cancel).await.unwrap();
    for i in 0..25 {
        assert!(batch.try_add(Message::new(format!("batched-{}", i))));
    }
    assert_eq!(batch.len(), 25);
    sender.send_batch(batch, &cancel).await.unwrap();

    let props = connection
        .get_partition_properties("0", &cancel)
        .await
        .unwrap();
    assert_eq!(props.last_enqueued_sequence_number, 25);
    assert_eq!(props.beginning_sequence_number, 1);
}

// ============================================================================
// Metadata
// ============================================================================

#[tokio::test]
async fn test_properties_and_partition_ids() {
    let (_broker, connection) = setup(3).await;
    let cancel = CancellationToken::new();

    let props = connection.get_properties(&cancel).await.unwrap();
    assert_eq!(props.name, "Q");
    assert_eq!(
        connection.get_partition_ids(&cancel).await.unwrap(),
        vec!["0", "1", "2"]
    );
    assert_eq!(connection.service_endpoint(), "sb://contoso.bus.local/");

    let err = connection
        .get_partition_properties("42", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::PartitionNotFound { .. }));
}

#[tokio::test]
async fn test_cancelled_token_makes_no_broker_call() {
    let (broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let before = broker.request_count();
    let err = connection
        .get_partition_properties("0", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::OperationCanceled));
    assert_eq!(broker.request_count(), before);
}

#[tokio::test]
async fn test_transient_faults_exhaust_retries() {
    let (broker, connection) = setup(1).await;
    broker.inject_faults(Fault::Busy, 10).await;

    let err = connection
        .get_properties(&CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ClientError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_stalled_call_times_out_per_attempt() {
    let broker = Broker::new(NAMESPACE);
    broker.create_entity("Q", 1).await.unwrap();
    let mut options = fast_options();
    options.retry.try_timeout = Duration::from_millis(50);
    let connection =
        Connection::connect_embedded(broker.clone(), CONNECTION_STRING, Some("Q"), None, options)
            .await
            .unwrap();

    broker.inject_fault(Fault::Stall(Duration::from_secs(30))).await;
    let props = connection
        .get_partition_properties("0", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(props.partition_id, "0");
}

// ============================================================================
// Connecting
// ============================================================================

#[tokio::test]
async fn test_rejected_credential() {
    let broker = Broker::new(NAMESPACE);
    broker.create_entity("Q", 1).await.unwrap();
    broker
        .allow_credential(Credential::SharedAccessKey {
            key_name: "Listen".to_string(),
            key: "other".to_string(),
        })
        .await;

    let err = Connection::connect_embedded(broker, CONNECTION_STRING, Some("Q"), None, fast_options())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Authorization(_)));
}

#[tokio::test]
async fn test_connection_string_credential_accepted() {
    let broker = Broker::new(NAMESPACE);
    broker.create_entity("Q", 1).await.unwrap();
    broker
        .allow_credential(Credential::SharedAccessKey {
            key_name: "RootManageSharedAccessKey".to_string(),
            key: "c2VjcmV0".to_string(),
        })
        .await;

    let connection =
        Connection::connect_embedded(broker, CONNECTION_STRING, Some("Q"), None, fast_options())
            .await
            .unwrap();
    assert_eq!(connection.entity_name(), "Q");
}

#[tokio::test]
async fn test_unknown_host_is_communication_failure() {
    let broker = Broker::new("elsewhere.bus.local");
    let err = Connection::connect_embedded(broker, CONNECTION_STRING, Some("Q"), None, fast_options())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), ClientError::ServiceCommunication(_)));
}

#[tokio::test]
async fn test_invalid_connection_string() {
    let broker = Broker::new(NAMESPACE);
    let err = Connection::connect_embedded(
        broker,
        "SharedAccessKeyName=a;SharedAccessKey=b",
        Some("Q"),
        None,
        fast_options(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ClientError::Core(_)));
}

// ============================================================================
// Ownership
// ============================================================================

#[tokio::test]
async fn test_higher_owner_level_preempts_lower() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let low = connection
        .create_receiver()
        .partition_id("0")
        .owner_level(3)
        .build()
        .unwrap();
    low.receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap();

    let high = connection
        .create_receiver()
        .partition_id("0")
        .owner_level(5)
        .build()
        .unwrap();
    high.receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap();

    let err = low
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ConsumerPreempted { .. }));

    // the winner keeps reading
    assert!(high
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_lower_owner_level_is_refused() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let high = connection
        .create_receiver()
        .partition_id("0")
        .owner_level(5)
        .build()
        .unwrap();
    high.receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap();

    let low = connection
        .create_receiver()
        .partition_id("0")
        .owner_level(3)
        .build()
        .unwrap();
    let err = low
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ConsumerPreempted { .. }));
}

#[tokio::test]
async fn test_shared_receiver_blocked_by_exclusive_holder() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let exclusive = connection
        .create_receiver()
        .partition_id("0")
        .owner_level(1)
        .build()
        .unwrap();
    exclusive
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap();

    let shared = connection.create_receiver().partition_id("0").build().unwrap();
    let err = shared
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ConsumerPreempted { .. }));

    // another consumer group is a different binding
    let other_group = connection
        .create_receiver()
        .consumer_group("audit")
        .partition_id("0")
        .build()
        .unwrap();
    assert!(other_group
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_dropped_exclusive_receiver_frees_binding() {
    let (broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let exclusive = connection
        .create_receiver()
        .partition_id("0")
        .owner_level(3)
        .build()
        .unwrap();
    exclusive
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap();
    drop(exclusive);
    connection.close(&cancel).await.unwrap();

    let fresh = Connection::connect_embedded(
        broker,
        CONNECTION_STRING,
        Some("Q"),
        None,
        fast_options(),
    )
    .await
    .unwrap();
    let shared = fresh.create_receiver().partition_id("0").build().unwrap();
    assert!(shared
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_close_during_first_receive_releases_link() {
    let (broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();
    broker.set_latency(Duration::from_millis(100));

    let exclusive = Arc::new(
        connection
            .create_receiver()
            .partition_id("0")
            .owner_level(2)
            .build()
            .unwrap(),
    );
    let pending = {
        let exclusive = exclusive.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            exclusive
                .receive(1, Duration::from_millis(10), &cancel)
                .await
        })
    };

    // the link is still being created
    tokio::time::sleep(Duration::from_millis(30)).await;
    exclusive.close(&cancel).await.unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::ClientClosed(_))));

    broker.set_latency(Duration::ZERO);
    let shared = connection.create_receiver().partition_id("0").build().unwrap();
    assert!(shared
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .is_ok());
}

// ============================================================================
// Positions
// ============================================================================

#[tokio::test]
async fn test_purged_position_is_unavailable() {
    let (broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let sender = connection.create_sender(Some("0")).unwrap();
    for i in 0..10 {
        sender
            .send(Message::new(format!("m{}", i)), &cancel)
            .await
            .unwrap();
    }
    broker.purge("Q", "0", 6).await.unwrap();

    let receiver = connection
        .create_receiver()
        .partition_id("0")
        .event_position(EventPosition::from_sequence_number(2))
        .build()
        .unwrap();
    let err = receiver
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::PositionUnavailable { .. }));

    let earliest = connection
        .create_receiver()
        .partition_id("0")
        .event_position(EventPosition::Earliest)
        .build()
        .unwrap();
    let messages = earliest
        .receive(10, Duration::from_millis(100), &cancel)
        .await
        .unwrap();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0].sequence_number(), Some(6));
}

#[tokio::test]
async fn test_fully_purged_offset_is_unavailable() {
    let (broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let sender = connection.create_sender(Some("0")).unwrap();
    for i in 0..3 {
        sender
            .send(Message::new(format!("m{}", i)), &cancel)
            .await
            .unwrap();
    }
    broker.purge("Q", "0", 100).await.unwrap();

    let receiver = connection
        .create_receiver()
        .partition_id("0")
        .event_position(EventPosition::from_offset(0))
        .build()
        .unwrap();
    let err = receiver
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::PositionUnavailable { .. }));
}

#[tokio::test]
async fn test_extreme_peek_start_and_unbounded_wait() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();
    let sender = connection.create_sender(Some("0")).unwrap();
    sender.send(Message::new("only"), &cancel).await.unwrap();

    let receiver = Arc::new(
        connection
            .create_receiver()
            .partition_id("0")
            .event_position(EventPosition::SequenceNumber {
                value: 1,
                inclusive: false,
            })
            .build()
            .unwrap(),
    );

    let peeked = receiver.peek(Some(i64::MIN), 5, &cancel).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert!(receiver
        .peek(Some(i64::MAX), 5, &cancel)
        .await
        .unwrap()
        .is_empty());

    // Duration::MAX waits until a message shows up
    let waiting = {
        let receiver = receiver.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { receiver.receive(1, Duration::MAX, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    sender.send(Message::new("late"), &cancel).await.unwrap();
    let messages = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(messages[0].body(), "late");

    // and stays cancellable
    let stop = CancellationToken::new();
    let waiting = {
        let receiver = receiver.clone();
        let stop = stop.clone();
        tokio::spawn(async move { receiver.receive(1, Duration::MAX, &stop).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    stop.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ClientError::OperationCanceled)));
}

#[tokio::test]
async fn test_latest_position_skips_existing_messages() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();
    let sender = connection.create_sender(Some("0")).unwrap();
    sender.send(Message::new("old"), &cancel).await.unwrap();

    let receiver = connection
        .create_receiver()
        .partition_id("0")
        .track_last_enqueued_event_properties(true)
        .build()
        .unwrap();
    let nothing = receiver
        .receive(1, Duration::from_millis(60), &cancel)
        .await
        .unwrap();
    assert!(nothing.is_empty());

    sender.send(Message::new("new"), &cancel).await.unwrap();
    let messages = receiver
        .receive(1, Duration::from_secs(2), &cancel)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body(), "new");

    let tracked = receiver.last_enqueued_event_properties().await.unwrap();
    assert_eq!(tracked.sequence_number, Some(2));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_closed_connection_rejects_everything() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();

    let receiver = connection
        .create_receiver()
        .partition_id("0")
        .event_position(EventPosition::Earliest)
        .build()
        .unwrap();
    receiver
        .receive(1, Duration::from_millis(10), &cancel)
        .await
        .unwrap();
    let sender = connection.create_sender(None).unwrap();

    connection.close(&cancel).await.unwrap();
    assert!(connection.is_closed());

    assert!(matches!(
        connection.get_properties(&cancel).await,
        Err(ClientError::ClientClosed(_))
    ));
    assert!(matches!(
        connection.get_partition_properties("0", &cancel).await,
        Err(ClientError::ClientClosed(_))
    ));
    assert!(matches!(
        connection.create_sender(None),
        Err(ClientError::ClientClosed(_))
    ));
    assert!(matches!(
        connection.create_receiver().partition_id("0").build(),
        Err(ClientError::ClientClosed(_))
    ));
    assert!(matches!(
        receiver.peek(Some(1), 1, &cancel).await,
        Err(ClientError::ClientClosed(_))
    ));
    assert!(matches!(
        receiver.receive(1, Duration::from_millis(10), &cancel).await,
        Err(ClientError::ClientClosed(_))
    ));
    assert!(matches!(
        sender.send(Message::new("late"), &cancel).await,
        Err(ClientError::ClientClosed(_))
    ));

    // closing again is fine, and so is dispose
    connection.close(&cancel).await.unwrap();
    connection.dispose().await;
    receiver.close(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_receiver_close_is_idempotent() {
    let (_broker, connection) = setup(1).await;
    let cancel = CancellationToken::new();
    let receiver = connection.create_receiver().partition_id("0").build().unwrap();

    // closing before the link exists
    receiver.close(&cancel).await.unwrap();
    receiver.close(&cancel).await.unwrap();
    assert!(receiver.is_closed());
    assert!(matches!(
        receiver.receive(1, Duration::from_millis(10), &cancel).await,
        Err(ClientError::ClientClosed(_))
    ));
}
