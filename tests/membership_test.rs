//! Cluster membership: joining and leaving through configuration
//! entries, one change at a time.

mod common;

use std::time::Duration;

use quoraft::protocol::LocalNetwork;
use quoraft::{MemberKind, RaftClient};

use common::{fast_config, start_cluster, start_server, test_logger, wait_for_leader};

use quoraft::Member;

#[tokio::test]
async fn test_join_expands_the_committed_configuration() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1, 2, 3]).await;
    wait_for_leader(&servers).await;

    // Node 4 starts outside the configuration, seeded with the
    // existing members, then asks to join.
    let seed_members: Vec<Member> = [1u64, 2, 3].iter().map(|&id| Member::active(id)).collect();
    let joiner = start_server(&network, 4, seed_members, fast_config()).await;
    joiner
        .join(&[1, 2, 3], MemberKind::Active)
        .await
        .expect("join should commit");

    // Every replica converges on the four-member configuration.
    let mut all = servers.clone();
    all.push(joiner.clone());
    for server in &all {
        let mut members = Vec::new();
        for _ in 0..100 {
            members = server.status().await.unwrap().members;
            if members.len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let mut ids: Vec<u64> = members.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4], "server {}", server.id());
    }

    // The new member replicates subsequent commands.
    let client = RaftClient::builder(vec![1, 2, 3, 4])
        .with_logger(test_logger("client"))
        .with_session_timeout(Duration::from_secs(10))
        .connect(network.client_protocol())
        .await
        .unwrap();
    client.submit_command(b"put joined yes".to_vec()).await.unwrap();

    let mut caught_up = false;
    for _ in 0..100 {
        let status = joiner.status().await.unwrap();
        if status.applied_index > 0 && status.applied_index == status.commit_index {
            caught_up = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(caught_up, "joiner should apply replicated commands");

    // The committed configuration survives losing the leader: the next
    // leader still reports exactly four members.
    let leader_id = all
        .iter()
        .find(|s| s.is_leader())
        .map(|s| s.id())
        .expect("a leader exists");
    network.disconnect(leader_id);
    let survivors: Vec<_> = all.iter().filter(|s| s.id() != leader_id).cloned().collect();
    let new_leader = wait_for_leader(&survivors).await;
    let mut ids: Vec<u64> = survivors[new_leader]
        .status()
        .await
        .unwrap()
        .members
        .iter()
        .map(|m| m.id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    network.reconnect(leader_id);

    client.close().await.unwrap();
    for server in &all {
        server.shutdown().await;
    }
}

#[tokio::test]
async fn test_leave_shrinks_the_configuration() {
    let network = LocalNetwork::new();
    let servers = start_cluster(&network, &[1, 2, 3]).await;
    let leader_slot = wait_for_leader(&servers).await;
    let leader_id = servers[leader_slot].id();

    // A follower leaves; the remaining pair keeps a working quorum.
    let leaver = servers.iter().find(|s| s.id() != leader_id).unwrap();
    let leaver_id = leaver.id();
    leaver.leave(&[1, 2, 3]).await.expect("leave should commit");

    for server in servers.iter().filter(|s| s.id() != leaver_id) {
        let mut ids: Vec<u64> = Vec::new();
        for _ in 0..100 {
            ids = server
                .status()
                .await
                .unwrap()
                .members
                .iter()
                .map(|m| m.id)
                .collect();
            if ids.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        ids.sort_unstable();
        assert!(!ids.contains(&leaver_id), "server {}", server.id());
    }

    // The shrunk cluster still commits.
    let client = RaftClient::builder(vec![1, 2, 3])
        .with_logger(test_logger("client"))
        .with_session_timeout(Duration::from_secs(10))
        .connect(network.client_protocol())
        .await
        .unwrap();
    let response = client.submit_command(b"put after leave".to_vec()).await.unwrap();
    assert_eq!(response, b"ok");

    client.close().await.unwrap();
    for server in &servers {
        server.shutdown().await;
    }
}
