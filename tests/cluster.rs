//! Multi-node scenarios over the in-memory transport.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use swim_membership::network::{InMemoryNetworkClient, InboundMessage};
use swim_membership::{Member, MemberId, MemberState, MembershipService, SwimConfig, DEFAULT_PORT};

fn address(last: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), DEFAULT_PORT)
}

fn identity(timestamp: u64, last: u8) -> MemberId {
    MemberId::new(timestamp, u32::from(Ipv4Addr::new(10, 0, 0, last)))
}

struct Node {
    service: Arc<MembershipService>,
    handles: Vec<JoinHandle<()>>,
}

/// Starts one introducer (10.0.0.1, ts=1) plus a non-introducer per entry
/// of `joiners` (ip last octet, timestamp), all wired to each other.
fn start_cluster(joiners: &[(u8, u64)]) -> Vec<Node> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut specs = vec![(1u8, 1u64)];
    specs.extend_from_slice(joiners);

    let mut channels = HashMap::new();
    let mut receivers = Vec::new();
    for (last, _) in &specs {
        let (sender, receiver) = mpsc::unbounded_channel::<InboundMessage>();
        channels.insert(address(*last), sender);
        receivers.push(receiver);
    }

    specs.iter().zip(receivers).map(|((last, timestamp), receiver)| {
        let is_introducer = *last == 1;
        let config = SwimConfig {
            introducer: if is_introducer { None } else { Some(address(1)) },
            ..SwimConfig::default()
        };
        let state = if is_introducer {
            MemberState::ALIVE | MemberState::INTRODUCER | MemberState::MONITOR
        } else {
            MemberState::ALIVE
        };
        let client = InMemoryNetworkClient::new(channels.clone(), address(*last));
        let service = MembershipService::new(config, Member::new(identity(*timestamp, *last), state), Box::new(client));
        let handles = service.start(receiver);
        Node { service, handles }
    }).collect()
}

async fn stop(nodes: Vec<Node>) {
    for node in &nodes {
        node.service.shutdown();
    }
    for node in nodes {
        for handle in node.handles {
            handle.await.unwrap();
        }
    }
}

fn ids(node: &Node) -> Vec<MemberId> {
    let mut ids: Vec<MemberId> = node.service.members().iter().map(|member| member.id).collect();
    ids.sort();
    ids
}

#[tokio::test(start_paused = true)]
async fn joining_node_receives_membership_from_introducer() {
    let nodes = start_cluster(&[(2, 100)]);

    nodes[1].service.join().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let expected = vec![identity(1, 1), identity(100, 2)];
    assert_eq!(expected, ids(&nodes[1]));
    assert_eq!(expected, ids(&nodes[0]));
    let joiner = nodes[0].service.member(&identity(100, 2)).unwrap();
    assert_eq!(MemberState::ALIVE, joiner.state);
    stop(nodes).await;
}

#[tokio::test(start_paused = true)]
async fn join_gossip_reaches_earlier_members() {
    let nodes = start_cluster(&[(2, 100), (3, 200)]);

    nodes[1].service.join().await.unwrap();
    nodes[2].service.join().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let expected = vec![identity(1, 1), identity(100, 2), identity(200, 3)];
    for node in &nodes {
        assert_eq!(expected, ids(node));
        assert!(node.service.members().iter().all(|member| member.state.contains(MemberState::ALIVE)));
    }
    stop(nodes).await;
}

#[tokio::test(start_paused = true)]
async fn crashed_member_is_removed() {
    let nodes = start_cluster(&[(2, 100)]);
    nodes[1].service.join().await.unwrap();

    nodes[1].service.shutdown();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(vec![identity(1, 1)], ids(&nodes[0]));
    stop(nodes).await;
}

#[tokio::test(start_paused = true)]
async fn leaving_member_is_removed() {
    let nodes = start_cluster(&[(2, 100)]);
    nodes[1].service.join().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    nodes[1].service.leave().unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(vec![identity(1, 1)], ids(&nodes[0]));
    stop(nodes).await;
}

#[tokio::test(start_paused = true)]
async fn join_fails_without_introducer() {
    let nodes = start_cluster(&[(2, 100)]);
    nodes[0].service.shutdown();

    let result = nodes[1].service.join().await;

    assert!(result.is_err());
    assert_eq!(vec![identity(100, 2)], ids(&nodes[1]));
    stop(nodes).await;
}
