//! Receive-buffer backpressure tests.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

mod common;
use common::{connect, recording_server, test_config, wait_until, Mode, WAIT};

#[tokio::test]
async fn unconsumed_buffer_drops_connection() {
    let mut config = test_config();
    config.listener.receive_buffer_size = 2048;
    let (server, recorder) = recording_server(config, Mode::Hold);
    assert!(server.start());

    let mut client = connect(&server).await;
    assert!(wait_until(WAIT, || server.client_count() == 1).await);
    let conn = server.clients().pop().unwrap();
    assert_eq!(conn.buffer_capacity(), 2048);

    // The peer may reset once the server closes; only the server side matters.
    let _ = client.write_all(&[0x5A; 4096]).await;

    assert!(wait_until(WAIT, || server.client_count() == 0).await);
    assert!(wait_until(WAIT, || recorder.disconnects() == 1).await);

    assert!(recorder.bytes() <= 2048);
    let stats = conn.stats();
    assert!(stats.bytes_in <= 2048);
    assert!(stats.max_reads_in_flight <= 1);
    assert_eq!(server.metrics().backpressure_drops, 1);

    // Nothing is delivered after the drop.
    let calls = recorder.receive_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.receive_calls.load(Ordering::SeqCst), calls);

    server.stop().await;
}

#[tokio::test]
async fn consuming_handler_keeps_connection() {
    let mut config = test_config();
    config.listener.receive_buffer_size = 1024;
    let (server, recorder) = recording_server(config, Mode::Consume);
    assert!(server.start());

    let mut client = connect(&server).await;
    for _ in 0..10 {
        client.write_all(&[1u8; 1024]).await.unwrap();
    }

    assert!(wait_until(WAIT, || recorder.bytes() == 10 * 1024).await);
    assert_eq!(server.client_count(), 1);
    assert_eq!(server.metrics().backpressure_drops, 0);

    let conn = server.clients().pop().unwrap();
    assert_eq!(conn.stats().max_reads_in_flight, 1);
    assert_eq!(conn.stats().cursor, 0);

    server.stop().await;
}
