//! Single-node cluster: commands commit against a quorum of one and
//! queries observe them at every consistency level.

mod common;

use std::time::Duration;

use quoraft::protocol::LocalNetwork;
use quoraft::{Consistency, RaftClient};

use common::{start_cluster, test_logger, wait_for_leader};

#[tokio::test]
async fn test_single_node_commit() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1]).await;
    let leader = wait_for_leader(&servers).await;
    assert_eq!(servers[leader].id(), 1);

    let client = RaftClient::builder(vec![1])
        .with_logger(test_logger("client"))
        .connect(network.client_protocol())
        .await
        .expect("client should connect");

    let response = client
        .submit_command(b"put k v".to_vec())
        .await
        .expect("command should commit");
    assert_eq!(response, b"ok");

    // Entry 1 is the leader's initialize no-op, entry 2 opened the
    // session, entry 3 carried the command; all of it is applied.
    let status = servers[0].status().await.unwrap();
    assert_eq!(status.applied_index, 3);
    assert_eq!(status.commit_index, 3);

    for consistency in [
        Consistency::Linearizable,
        Consistency::Sequential,
        Consistency::Eventual,
    ] {
        let value = client
            .submit_query(b"get k".to_vec(), consistency)
            .await
            .expect("query should succeed");
        assert_eq!(value, b"v", "mode {:?}", consistency);
    }

    client.close().await.expect("session should close");
    for server in &servers {
        server.shutdown().await;
    }
}

#[tokio::test]
async fn test_unknown_session_is_terminal() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1]).await;
    wait_for_leader(&servers).await;

    let protocol = network.client_protocol();
    let request = quoraft::protocol::CommandRequest::builder()
        .session(999)
        .sequence(1)
        .operation(b"put a b".to_vec())
        .build()
        .unwrap();
    use quoraft::protocol::RaftProtocol;
    let err = protocol.command(1, request).await.unwrap_err();
    assert!(matches!(err, quoraft::RaftError::UnknownSession(999)));

    for server in &servers {
        server.shutdown().await;
    }
}

#[tokio::test]
async fn test_application_errors_do_not_poison_the_log() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1]).await;
    wait_for_leader(&servers).await;

    let client = RaftClient::builder(vec![1])
        .with_logger(test_logger("client"))
        .connect(network.client_protocol())
        .await
        .unwrap();

    let err = client
        .submit_command(b"explode now".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, quoraft::RaftError::Application(_)));

    // The log keeps moving afterwards.
    let response = client.submit_command(b"put k v".to_vec()).await.unwrap();
    assert_eq!(response, b"ok");

    client.close().await.unwrap();
    for server in &servers {
        server.shutdown().await;
    }
    // Give detached actor tasks a beat to wind down.
    tokio::time::sleep(Duration::from_millis(20)).await;
}
