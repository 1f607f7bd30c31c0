
use std::net::TcpListener;
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::cluster::identity::NodeIdentity;
use crate::error::Error;
use crate::node::options::Options;
use crate::node::{Node, NodeState};
use crate::partition::{PartitionHandle, Role};
use crate::router::{Operation, Request};

pub(crate) const CONVERGENCE: Duration = Duration::from_secs(20);

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn options(base: Vec<NodeIdentity>, replicas: usize) -> Options {
    let mut options = Options::with_base(base);
    options.replicas = replicas;
    options.gossip_interval = Duration::from_millis(100);
    options.suspect_after = Duration::from_secs(1);
    options.subnode.consensus_backend.tick_interval = Duration::from_millis(20);
    options
}

pub(crate) fn start_node(base: Vec<NodeIdentity>, replicas: usize) -> Node {
    let node = Node::new(options(base, replicas)).unwrap();
    assert_eq!(node.start(), NodeState::Started);
    node
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) fn eventually<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20));
    }
    condition()
}

fn voters(partition: &PartitionHandle) -> Vec<NodeIdentity> {
    partition.info().map(|info| info.peers).unwrap_or_default()
}

fn kv_handler(request: Request) {
    let (partition, operation, reply) = request.into_parts();
    match operation.kind.as_str() {
        "put" => reply.send(partition.put(operation.key, operation.value).map(|_| None)),
        "get" => reply.send(partition.get(operation.key)),
        other => reply.error(Error::UnknownOperation(other.to_string())),
    }
}

#[test]
#[serial]
fn start_and_stop() {
    init_logger();
    let node = Node::new(options(vec![], 3)).unwrap();
    assert_eq!(node.partition("p").unwrap_err(), Error::Stopped);

    assert_eq!(node.start(), NodeState::Started);
    assert_eq!(node.start(), NodeState::Started);
    assert_eq!(node.stop(), NodeState::Stopped);
    assert_eq!(node.stop(), NodeState::Stopped);

    assert!(matches!(node.start(), NodeState::Error(_)));
    assert_eq!(node.partition("p").unwrap_err(), Error::Stopped);
}

#[test]
#[serial]
fn dropping_an_unstarted_node_releases_its_port() {
    init_logger();
    let node = Node::new(options(vec![], 3)).unwrap();
    let address = node.whoami().socket_addr();
    drop(node);

    assert!(eventually(Duration::from_secs(5), || TcpListener::bind(address).is_ok()));
}

#[test]
#[serial]
fn single_node_bootstraps_partitions() {
    init_logger();
    let node = start_node(vec![], 3);
    let partition = node.partition("users").unwrap();

    assert_eq!(partition.get("alice").unwrap(), None);
    partition.put("alice", "1").unwrap();
    partition.put("alice", "2").unwrap();
    assert_eq!(partition.get("alice").unwrap(), Some(Bytes::from("2")));

    let info = partition.info().unwrap();
    assert_eq!(info.role, Role::Leader);
    assert_eq!(info.leader, Some(node.whoami()));
    assert_eq!(info.peers, vec![node.whoami()]);
    assert!(info.learners.is_empty());
    assert!(info.applied_index >= 3);
    assert_eq!(info.source, format!("{}/p/users", node.whoami()));

    // partitions do not share keys
    let other = node.partition("orders").unwrap();
    assert_eq!(other.get("alice").unwrap(), None);

    assert_eq!(node.stop(), NodeState::Stopped);
    assert_eq!(partition.get("alice").unwrap_err(), Error::Stopped);
}

#[test]
#[serial]
fn node_joins_through_its_base() {
    init_logger();
    let first = start_node(vec![], 3);
    let partition = first.partition("p").unwrap();
    partition.put("k", "v").unwrap();

    let second = start_node(vec![first.whoami()], 3);
    let joined = second.partition("p").unwrap();

    assert!(eventually(CONVERGENCE, || voters(&partition).contains(&second.whoami())));
    assert!(eventually(CONVERGENCE, || joined.is_member()));
    assert!(second.known_nodes().contains(&first.whoami()));

    // reads through the new replica reach the leader
    assert_eq!(joined.get("k").unwrap(), Some(Bytes::from("v")));
    joined.put("k", "w").unwrap();
    assert_eq!(partition.get("k").unwrap(), Some(Bytes::from("w")));

    let remote = joined.remote_info(first.whoami()).unwrap();
    assert_eq!(remote.role, Role::Leader);
    assert!(remote.peers.contains(&second.whoami()));

    assert_eq!(second.stop(), NodeState::Stopped);
    assert_eq!(first.stop(), NodeState::Stopped);
}

#[test]
#[serial]
fn removed_peer_leaves_the_replica_set() {
    init_logger();
    // a single replica is wanted, so the removed node is not absorbed back
    let first = start_node(vec![], 1);
    let partition = first.partition("p").unwrap();
    let second = start_node(vec![first.whoami()], 1);
    let _ = second.partition("p").unwrap();
    assert!(eventually(CONVERGENCE, || voters(&partition).len() == 2));

    partition.remove_peer(second.whoami()).unwrap();
    assert!(eventually(CONVERGENCE, || voters(&partition) == vec![first.whoami()]));
    assert_eq!(second.stop(), NodeState::Stopped);

    partition.put("still", "writable").unwrap();
    assert!(matches!(
        partition.remove_peer(first.whoami()),
        Err(Error::Application(_))
    ));

    assert_eq!(first.stop(), NodeState::Stopped);
}

#[test]
#[serial]
fn cluster_survives_the_loss_of_its_leader() {
    init_logger();
    let first = start_node(vec![], 5);
    let partition = first.partition("p").unwrap();
    let others: Vec<Node> = (0..4).map(|_| start_node(vec![first.whoami()], 5)).collect();
    let handles: Vec<PartitionHandle> = others.iter().map(|node| node.partition("p").unwrap()).collect();

    assert!(eventually(CONVERGENCE, || voters(&partition).len() == 5));
    partition.put("k", "before").unwrap();
    assert!(eventually(CONVERGENCE, || handles
        .iter()
        .all(|handle| handle.view().membership.voters.len() == 5)));

    assert_eq!(first.stop(), NodeState::Stopped);

    let survivor = &handles[0];
    assert!(eventually(CONVERGENCE, || handles
        .iter()
        .any(|handle| handle.role() == Role::Leader)));
    assert_eq!(survivor.get("k").unwrap(), Some(Bytes::from("before")));
    survivor.put("k", "after").unwrap();
    assert_eq!(handles[3].get("k").unwrap(), Some(Bytes::from("after")));

    for node in others.iter() {
        assert_eq!(node.stop(), NodeState::Stopped);
    }
}

#[test]
#[serial]
fn writes_in_flight_fail_over_when_the_leader_stops() {
    init_logger();
    let first = start_node(vec![], 5);
    let partition = first.partition("p").unwrap();
    let others: Vec<Node> = (0..4).map(|_| start_node(vec![first.whoami()], 5)).collect();
    let handles: Vec<PartitionHandle> = others.iter().map(|node| node.partition("p").unwrap()).collect();

    assert!(eventually(CONVERGENCE, || voters(&partition).len() == 5));
    assert!(eventually(CONVERGENCE, || handles
        .iter()
        .all(|handle| handle.view().membership.voters.len() == 5)));

    let writers: Vec<_> = handles
        .iter()
        .cloned()
        .enumerate()
        .map(|(idx, handle)| {
            thread::spawn(move || {
                (0..40)
                    .map(|round| handle.put(format!("writer {}", idx), round.to_string()))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    sleep(Duration::from_millis(50));
    assert_eq!(first.stop(), NodeState::Stopped);

    for (idx, writer) in writers.into_iter().enumerate() {
        let failed: Vec<Error> = writer.join().unwrap().into_iter().filter_map(Result::err).collect();
        assert!(failed.is_empty(), "writer {} failed: {:?}", idx, failed);
    }

    let survivor = &handles[0];
    for idx in 0..handles.len() {
        assert_eq!(
            survivor.get(format!("writer {}", idx)).unwrap(),
            Some(Bytes::from("39"))
        );
    }

    for node in others.iter() {
        assert_eq!(node.stop(), NodeState::Stopped);
    }
}

#[test]
#[serial]
fn replica_set_grows_to_the_wanted_size_by_itself() {
    init_logger();
    let first = start_node(vec![], 3);
    let partition = first.partition("partition 1").unwrap();
    // the others never reference the partition, the leader absorbs them as they show up
    let others: Vec<Node> = (0..4).map(|_| start_node(vec![first.whoami()], 3)).collect();

    assert!(eventually(CONVERGENCE, || voters(&partition).len() == 3));
    sleep(Duration::from_secs(2));

    let info = partition.info().unwrap();
    assert_eq!(info.peers.len(), 3);
    assert!(info.learners.is_empty());
    assert!(info
        .peers
        .iter()
        .all(|peer| *peer == first.whoami() || others.iter().any(|node| node.whoami() == *peer)));
    assert_eq!(info.source, format!("{}/p/partition 1", first.whoami()));
    assert!(info.source.starts_with("/ip4/127.0.0.1/tcp/"));

    for node in others.iter() {
        assert_eq!(node.stop(), NodeState::Stopped);
    }
    assert_eq!(first.stop(), NodeState::Stopped);
}

#[test]
#[serial]
fn requests_reach_the_leader_handler() {
    init_logger();
    let first = start_node(vec![], 3);
    first.on_request(kv_handler);
    let leader = first.partition("p").unwrap();

    let second = start_node(vec![first.whoami()], 3);
    second.on_request(kv_handler);
    let follower = second.partition("p").unwrap();
    assert!(eventually(CONVERGENCE, || follower.is_member() && follower.leader().is_some()));

    assert_eq!(second.request("p", Operation::put("k", "v")).unwrap(), None);
    assert_eq!(first.request("p", Operation::get("k")).unwrap(), Some(Bytes::from("v")));
    assert_eq!(second.request("p", Operation::get("k")).unwrap(), Some(Bytes::from("v")));
    assert_eq!(leader.get("k").unwrap(), Some(Bytes::from("v")));

    let unknown = Operation::new("frobnicate", "k", "");
    assert_eq!(
        first.request("p", unknown.clone()).unwrap_err(),
        Error::UnknownOperation("frobnicate".to_string())
    );
    assert_eq!(
        second.request("p", unknown).unwrap_err(),
        Error::UnknownOperation("frobnicate".to_string())
    );

    assert_eq!(second.stop(), NodeState::Stopped);
    assert_eq!(first.stop(), NodeState::Stopped);
}

#[test]
#[serial]
fn request_without_handler_fails() {
    init_logger();
    let node = start_node(vec![], 1);
    assert_eq!(
        node.request("p", Operation::get("k")).unwrap_err(),
        Error::Application("no request handler registered".to_string())
    );
    assert_eq!(node.stop(), NodeState::Stopped);
}
