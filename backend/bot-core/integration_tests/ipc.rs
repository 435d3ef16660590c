use bot_core::config::IpcConfig;
use bot_core::error::ipc::IpcError;
use bot_core::ipc::message::{ConfigUpdate, StatusQuery};
use bot_core::ipc::{IpcChannel, IpcMessage, Payload};

use std::time::Duration;

use bytes::Bytes;
use futures_util::SinkExt;
use prost::Message as ProstMessage;
use tokio::io::DuplexStream;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

fn raw_writer(io: DuplexStream) -> FramedWrite<DuplexStream, LengthDelimitedCodec> {
    FramedWrite::new(io, LengthDelimitedCodec::new())
}

fn encoded(seq: u64, payload: Payload) -> Bytes {
    Bytes::from(IpcMessage::new(seq, payload).encode_to_vec())
}

fn config_update(n: u32) -> Payload {
    Payload::ConfigUpdate(ConfigUpdate {
        key: "dispatcher.prefix".to_string(),
        value: n.to_string(),
    })
}

/// **VALUE**: Frames arrive in send order with sequence numbers 1..=n.
///
/// **WHY THIS MATTERS**: The supervisor applies ConfigUpdates in the order received.
/// Reordering would leave the worker on a stale value.
#[tokio::test]
async fn given_channel_pair_when_hundred_frames_sent_then_received_in_order() {
    // GIVEN
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (sender, _a_rx) = IpcChannel::new(a, &IpcConfig::default());
    let (_b_tx, mut receiver) = IpcChannel::new(b, &IpcConfig::default());

    // WHEN
    let producer = tokio::spawn(async move {
        for n in 0..100 {
            sender.send(config_update(n)).await.expect("send");
        }
        sender
    });

    // THEN
    for n in 0..100u32 {
        let message = receiver
            .receive_timeout(Duration::from_secs(5))
            .await
            .expect("frame");
        assert_eq!(message.seq, u64::from(n) + 1);
        match message.payload {
            Some(Payload::ConfigUpdate(update)) => assert_eq!(update.value, n.to_string()),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    let sender = producer.await.unwrap();
    assert_eq!(sender.stats().frames_sent, 100);
    assert_eq!(receiver.stats().frames_received, 100);
}

/// **VALUE**: Frames survive a pipe that only moves 3 bytes at a time.
///
/// **WHY THIS MATTERS**: Real pipes split writes and reads at arbitrary points, so every
/// frame crosses several partial writes and partial reads here.
///
/// **BUG THIS CATCHES**: A frame interleaving with the next one, or a partially read length
/// prefix being decoded as a whole frame.
#[tokio::test]
async fn given_three_byte_pipe_when_many_frames_sent_then_delivered_in_order() {
    // GIVEN
    let (a, b) = tokio::io::duplex(3);
    let (sender, _a_rx) = IpcChannel::new(a, &IpcConfig::default());
    let (_b_tx, mut receiver) = IpcChannel::new(b, &IpcConfig::default());

    // WHEN
    let producer = tokio::spawn(async move {
        for n in 0..200 {
            sender.send(config_update(n)).await.expect("send");
        }
        sender
    });

    // THEN
    for n in 0..200u32 {
        let message = receiver
            .receive_timeout(Duration::from_secs(10))
            .await
            .expect("frame");
        assert_eq!(message.seq, u64::from(n) + 1);
        match message.payload {
            Some(Payload::ConfigUpdate(update)) => assert_eq!(update.value, n.to_string()),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    let sender = producer.await.unwrap();
    assert_eq!(sender.stats().frames_sent, 200);
    assert_eq!(receiver.stats().frames_received, 200);
    assert_eq!(receiver.stats().frames_malformed, 0);
}

/// **VALUE**: Garbage and payload-less frames are dropped and counted, and the
/// channel keeps going.
///
/// **BUG THIS CATCHES**: A decode error tearing down the whole link, which the
/// supervisor would read as a crash.
#[tokio::test]
async fn given_malformed_frames_when_reading_then_dropped_and_next_frame_delivered() {
    // GIVEN
    let (raw, ours) = tokio::io::duplex(64 * 1024);
    let (_tx, mut receiver) = IpcChannel::new(ours, &IpcConfig::default());
    let mut peer = raw_writer(raw);

    // WHEN
    peer.send(Bytes::from_static(&[0xFF, 0xFF, 0xFF])).await.unwrap();
    peer.send(Bytes::from(
        IpcMessage {
            seq: 1,
            payload: None,
        }
        .encode_to_vec(),
    ))
    .await
    .unwrap();
    peer.send(encoded(2, Payload::StatusQuery(StatusQuery {})))
        .await
        .unwrap();

    // THEN
    let message = receiver
        .receive_timeout(Duration::from_secs(5))
        .await
        .expect("valid frame after garbage");
    assert_eq!(message.seq, 2);
    assert_eq!(receiver.stats().frames_malformed, 2);
    assert!(!receiver.is_closed());
}

/// **VALUE**: A frame whose seq is not above the last accepted one is rejected.
///
/// **BUG THIS CATCHES**: Replayed or reordered frames being acted on twice.
#[tokio::test]
async fn given_stale_sequence_when_reading_then_rejected() {
    // GIVEN
    let (raw, ours) = tokio::io::duplex(64 * 1024);
    let (_tx, mut receiver) = IpcChannel::new(ours, &IpcConfig::default());
    let mut peer = raw_writer(raw);

    // WHEN: 1, 3 (gap), 2 (stale), 3 (stale), 4
    for seq in [1, 3, 2, 3, 4] {
        peer.send(encoded(seq, Payload::StatusQuery(StatusQuery {})))
            .await
            .unwrap();
    }

    // THEN
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(
            receiver
                .receive_timeout(Duration::from_secs(5))
                .await
                .expect("frame")
                .seq,
        );
    }
    assert_eq!(seen, vec![1, 3, 4]);
    assert_eq!(receiver.stats().frames_out_of_order, 2);
}

/// **VALUE**: Frames queued before `close` are flushed and both ends then see
/// ChannelClosed.
///
/// **WHY THIS MATTERS**: The worker's final Ack and status report are sent right
/// before it closes. Losing them makes every clean stop look like a crash.
#[tokio::test]
async fn given_queued_frames_when_closed_then_flushed_and_peer_sees_closed() {
    // GIVEN
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (sender, mut a_rx) = IpcChannel::new(a, &IpcConfig::default());
    let (b_tx, mut b_rx) = IpcChannel::new(b, &IpcConfig::default());

    sender.send(Payload::ack(7, Ok(()))).await.unwrap();
    sender.send(Payload::ack(8, Ok(()))).await.unwrap();

    // WHEN
    sender.close().await;

    // THEN: Both frames delivered, then closed
    assert_eq!(b_rx.receive_timeout(Duration::from_secs(5)).await.unwrap().seq, 1);
    assert_eq!(b_rx.receive_timeout(Duration::from_secs(5)).await.unwrap().seq, 2);
    assert!(matches!(
        b_rx.receive_timeout(Duration::from_secs(5)).await,
        Err(IpcError::ChannelClosed { .. })
    ));

    assert!(sender.is_closed());
    assert!(matches!(
        sender.send(Payload::ack(9, Ok(()))).await,
        Err(IpcError::ChannelClosed { .. })
    ));
    assert!(matches!(a_rx.receive().await, Err(IpcError::ChannelClosed { .. })));

    tokio::time::timeout(Duration::from_secs(5), b_tx.closed())
        .await
        .expect("peer link should go down");
}

/// **VALUE**: Receive with a deadline reports Timeout when nothing arrives.
#[tokio::test(start_paused = true)]
async fn given_idle_peer_when_receiving_with_timeout_then_timeout_error() {
    let (a, b) = tokio::io::duplex(1024);
    let (_a_tx, _a_rx) = IpcChannel::new(a, &IpcConfig::default());
    let (_b_tx, mut b_rx) = IpcChannel::new(b, &IpcConfig::default());

    let result = b_rx.receive_timeout(Duration::from_millis(100)).await;

    assert!(matches!(result, Err(IpcError::Timeout { .. })));
}
