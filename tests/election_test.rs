//! Leader election: a three-node cluster elects exactly one leader,
//! survives losing it, and never loses committed entries.

mod common;

use std::time::Duration;

use quoraft::protocol::LocalNetwork;
use quoraft::{Consistency, RaftClient};

use common::{start_cluster, test_logger, wait_for_leader};

#[tokio::test]
async fn test_three_node_election_and_failover() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1, 2, 3]).await;

    let first = wait_for_leader(&servers).await;
    let first_id = servers[first].id();
    let first_term = servers[first].status().await.unwrap().term;

    // Commit something under the first leader.
    let client = RaftClient::builder(vec![1, 2, 3])
        .with_logger(test_logger("client"))
        .with_session_timeout(Duration::from_secs(10))
        .connect(network.client_protocol())
        .await
        .expect("client should connect");
    let response = client
        .submit_command(b"put color blue".to_vec())
        .await
        .unwrap();
    assert_eq!(response, b"ok");

    // Cut the leader off; the survivors must elect a replacement with
    // a strictly greater term within a couple of election timeouts.
    network.disconnect(first_id);
    let survivors: Vec<_> = servers
        .iter()
        .filter(|s| s.id() != first_id)
        .cloned()
        .collect();
    let second = wait_for_leader(&survivors).await;
    let second_id = survivors[second].id();
    assert_ne!(second_id, first_id);

    let second_term = survivors[second].status().await.unwrap().term;
    assert!(
        second_term > first_term,
        "new leader term {} must exceed old term {}",
        second_term,
        first_term
    );

    // The committed entry survives the failover.
    let value = client
        .submit_query(b"get color".to_vec(), Consistency::Linearizable)
        .await
        .unwrap();
    assert_eq!(value, b"blue");

    // Metadata from any reachable server points at the new leader.
    let metadata = client.metadata().await.unwrap();
    assert_eq!(metadata.leader, Some(second_id));
    assert_eq!(metadata.members.len(), 3);

    // The old leader rejoins as a follower and catches up.
    network.reconnect(first_id);
    tokio::time::sleep(Duration::from_millis(800)).await;
    let old = servers.iter().find(|s| s.id() == first_id).unwrap();
    assert!(!old.is_leader());
    let status = old.status().await.unwrap();
    assert!(status.term >= second_term);

    client.close().await.unwrap();
    for server in &servers {
        server.shutdown().await;
    }
}

#[tokio::test]
async fn test_exactly_one_leader_per_term() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1, 2, 3]).await;
    wait_for_leader(&servers).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut leaders = 0;
    for server in &servers {
        if server.is_leader() {
            leaders += 1;
        }
    }
    assert_eq!(leaders, 1);

    // All replicas agree on who leads.
    let mut hints = Vec::new();
    for server in &servers {
        hints.push(server.status().await.unwrap().leader);
    }
    assert!(hints.iter().all(|h| *h == hints[0] && h.is_some()));

    for server in &servers {
        server.shutdown().await;
    }
}
