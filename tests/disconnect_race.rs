//! Concurrent teardown tests.

use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{connect, recording_server, test_config, wait_until, Mode, WAIT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_disconnects_have_one_winner() {
    let (server, recorder) = recording_server(test_config(), Mode::Consume);
    assert!(server.start());
    let _client = connect(&server).await;
    assert!(wait_until(WAIT, || recorder.connects() == 1).await);
    let conn = server.clients().pop().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let server = Arc::clone(&server);
            let conn = Arc::clone(&conn);
            std::thread::spawn(move || {
                if i % 2 == 0 {
                    server.disconnect(&conn)
                } else {
                    conn.disconnect()
                }
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    assert!(wait_until(WAIT, || recorder.disconnects() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.disconnects_for(conn.id()), 1);

    let pool = server.pool_stats();
    assert_eq!(pool.acquired, 1);
    assert_eq!(pool.released, 1);
    assert_eq!(server.metrics().connections_closed, 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_close_racing_stop() {
    let (server, recorder) = recording_server(test_config(), Mode::Consume);
    assert!(server.start());

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(connect(&server).await);
    }
    assert!(wait_until(WAIT, || recorder.connects() == 4).await);

    let dropper = tokio::spawn(async move { drop(clients) });
    server.stop().await;
    dropper.await.unwrap();

    assert!(wait_until(WAIT, || recorder.disconnects() == 4).await);
    assert_eq!(recorder.max_disconnects_per_connection(), 1);
    assert_eq!(server.metrics().connections_closed, 4);
    assert_eq!(server.metrics().active_connections, 0);

    let pool = server.pool_stats();
    assert_eq!(pool.acquired, pool.released);
}
