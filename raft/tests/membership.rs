use common::*;
use raft::log::Log;
use raft::message::{Message, Rpc, TermId, VoteResponse};

mod common;

#[test]
pub fn learner_never_campaigns() {
    let mut learner = learner(1, &mut init_random());
    for _ in 0..10 * CONFIG.election_timeout_ticks {
        assert!(learner.timer_tick().is_none());
    }
    assert!(learner.timeout().is_none());
    assert!(!learner.is_leader());
}

#[test]
pub fn learners_alone_elect_nobody() {
    TestRaftGroup::with_learners(1, 2, &mut init_random(), config().node_down(0))
        .run_for_inspect(10 * CONFIG.election_timeout_ticks, |group| {
            assert!(!group.has_leader())
        });
}

#[test]
pub fn vote_from_non_voter_does_not_count() {
    let mut raft = raft(1, vec![2, 3], None, &mut init_random());
    let Message { term, .. } = raft.timeout().unwrap().message;

    send(
        &mut raft,
        4,
        term,
        Rpc::VoteResponse(VoteResponse { vote_granted: true }),
    );
    assert!(!raft.is_leader());

    send(
        &mut raft,
        2,
        term,
        Rpc::VoteResponse(VoteResponse { vote_granted: true }),
    );
    assert!(raft.is_leader());
}

#[test]
pub fn vote_request_from_non_voter_is_dropped() {
    let mut raft = raft(1, vec![2], None, &mut init_random());
    let term = TermId { id: 5 };
    assert!(send(&mut raft, 3, term, Rpc::VoteRequest(Default::default())).is_none());
    assert_eq!(raft.leader(), (None, &TermId::default()));
}

#[test]
pub fn shrinking_voters_completes_election() {
    let mut raft = raft(1, vec![2, 3], None, &mut init_random());
    assert!(raft.timeout().is_some());
    assert!(!raft.is_leader());

    raft.reconfigure(membership(&[1], &[]));
    assert!(raft.is_leader());
}

#[test]
pub fn learner_acks_do_not_commit() {
    let mut group = TestRaftGroup::with_learners(2, 1, &mut init_random(), config());
    group.run_on_node(0, |raft| raft.timeout());
    group.run_until(|group| group.nodes[0].is_leader());

    group.config = config().isolate(1);
    assert!(group.nodes[0].client_request("one".into()).is_ok());
    group.run_for(CONFIG.election_timeout_ticks);

    assert_eq!(
        group.nodes[2].log().last_index(),
        group.nodes[0].log().last_index()
    );
    assert!(group.take_committed().all(|commit| commit.data.is_empty()));

    group.config = config();
    group.run_until_commit(|commit| {
        assert_eq!(commit.data, "one");
        true
    });
}

#[test]
pub fn new_member_catches_up() {
    let mut random = init_random();
    let mut group = TestRaftGroup::new(1, &mut random, config());
    group.nodes.push(learner(1, &mut random));
    group.run_on_node(0, |raft| raft.timeout());
    assert!(group.nodes[0].is_leader());
    assert!(group.nodes[0].client_request("one".into()).is_ok());

    group.nodes[0].reconfigure(membership(&[0], &[1]));
    group.run_until(|group| {
        group.nodes[1].commit_idx() == group.nodes[0].commit_idx()
            && group.nodes[1].log().last_index() == group.nodes[0].log().last_index()
    });
    assert_eq!(group.nodes[1].leader().0, Some(&0.into()));
    assert!(!group.nodes[1].is_voter());
}

#[test]
pub fn promoted_learner_can_lead() {
    let mut group = TestRaftGroup::with_learners(1, 1, &mut init_random(), config());
    group.run_on_node(0, |raft| raft.timeout());
    assert!(group.nodes[0].is_leader());
    assert!(group.nodes[0].client_request("one".into()).is_ok());
    group.run_until(|group| {
        group.nodes[1].commit_idx() == group.nodes[0].commit_idx()
            && group.nodes[1].log().last_index() == group.nodes[0].log().last_index()
    });

    group
        .reconfigure(membership(&[0, 1], &[]))
        .run_on_node(1, |raft| raft.timeout())
        .inspect(|group| assert!(group.nodes[1].is_leader()));
}

#[test]
pub fn removed_leader_steps_down() {
    let mut group = TestRaftGroup::new(3, &mut init_random(), config());
    group.run_on_node(0, |raft| raft.timeout());
    assert!(group.nodes[0].is_leader());

    group.reconfigure(membership(&[1, 2], &[]));
    assert!(!group.nodes[0].is_leader());
    assert!(group.nodes[0].timeout().is_none());

    group
        .run_until(|group| group.nodes[1..].iter().any(|raft| raft.is_leader()))
        .run_for_inspect(10 * CONFIG.election_timeout_ticks, |group| {
            assert!(!group.nodes[0].is_leader())
        });
}

#[test]
pub fn removed_member_stops_receiving() {
    let mut group = TestRaftGroup::new(3, &mut init_random(), config());
    group.run_on_node(0, |raft| raft.timeout());
    group.reconfigure(membership(&[0, 1], &[]));
    assert!(group.nodes[0].replication_state(&2.into()).is_none());

    let removed_last_index = group.nodes[2].log().last_index();
    assert!(group.nodes[0].client_request("one".into()).is_ok());
    group.run_until_commit(|commit| commit.data == "one");
    assert_eq!(group.nodes[2].log().last_index(), removed_last_index);
}
