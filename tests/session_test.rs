//! Session semantics: exactly-once commands, deterministic expiration,
//! and ordered event delivery.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use quoraft::protocol::{CommandRequest, LocalNetwork, RaftProtocol};
use quoraft::server::SessionEvent;
use quoraft::RaftClient;

use common::{start_cluster, test_logger, wait_for_leader};

#[tokio::test]
async fn test_duplicate_command_applies_once() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1, 2, 3]).await;
    let leader_slot = wait_for_leader(&servers).await;
    let leader_id = servers[leader_slot].id();

    let client = RaftClient::builder(vec![1, 2, 3])
        .with_logger(test_logger("client"))
        .with_session_timeout(Duration::from_secs(10))
        .connect(network.client_protocol())
        .await
        .unwrap();
    let session = client.session_id().await;

    // Submit the same (session, sequence) pair twice, as a network
    // retry would.
    let protocol = network.client_protocol();
    let request = CommandRequest::builder()
        .session(session)
        .sequence(1)
        .operation(b"incr counter".to_vec())
        .build()
        .unwrap();

    let first = protocol.command(leader_id, request.clone()).await.unwrap();
    let second = protocol.command(leader_id, request).await.unwrap();

    // The counter moved exactly once and both replies carry the same
    // bytes and index.
    assert_eq!(first.result, b"1");
    assert_eq!(second.result, first.result);
    assert_eq!(second.index, first.index);

    client.close().await.unwrap();
    for server in &servers {
        server.shutdown().await;
    }
}

#[tokio::test]
async fn test_session_expires_on_every_replica() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1, 2, 3]).await;
    wait_for_leader(&servers).await;

    let mut watchers: Vec<_> = servers.iter().map(|s| s.session_events()).collect();

    // A short-lived session that will stop renewing.
    let doomed = RaftClient::builder(vec![1, 2, 3])
        .with_logger(test_logger("doomed"))
        .with_session_timeout(Duration::from_millis(1000))
        .connect(network.client_protocol())
        .await
        .unwrap();
    let doomed_id = doomed.session_id().await;

    // A healthy session whose keep-alives keep log timestamps moving.
    let healthy = RaftClient::builder(vec![1, 2, 3])
        .with_logger(test_logger("healthy"))
        .with_session_timeout(Duration::from_millis(1000))
        .connect(network.client_protocol())
        .await
        .unwrap();

    // Dropping the client cancels its keep-alive schedule without
    // closing the session.
    drop(doomed);

    // Wait past the lease while the healthy session stamps the log.
    let mut expired_everywhere = true;
    for watcher in watchers.iter_mut() {
        let mut saw_expired = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), watcher.recv()).await {
                Ok(Ok(SessionEvent::Expired(id))) if id == doomed_id => {
                    saw_expired = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }
        expired_everywhere &= saw_expired;
    }
    assert!(
        expired_everywhere,
        "session {} must expire on every replica",
        doomed_id
    );

    healthy.close().await.unwrap();
    for server in &servers {
        server.shutdown().await;
    }
}

#[tokio::test]
async fn test_events_reach_the_session_in_order() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1, 2, 3]).await;
    wait_for_leader(&servers).await;

    let client = RaftClient::builder(vec![1, 2, 3])
        .with_logger(test_logger("client"))
        .with_session_timeout(Duration::from_secs(10))
        .connect(network.client_protocol())
        .await
        .unwrap();

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    client.on_event(move |payload| {
        sink.lock().unwrap().push(payload);
    });

    for i in 0..3 {
        client
            .submit_command(format!("notify event-{}", i).into_bytes())
            .await
            .unwrap();
    }

    // Events are pushed best-effort after commit; give them a moment.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if received.lock().unwrap().len() >= 3 || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let events = received.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            b"event-0".to_vec(),
            b"event-1".to_vec(),
            b"event-2".to_vec()
        ]
    );

    client.close().await.unwrap();
    for server in &servers {
        server.shutdown().await;
    }
}
