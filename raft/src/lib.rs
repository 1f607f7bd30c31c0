//! Raft consensus for a single replicated log, written without any I/O.
//!
//! A [`node::Node`] is driven by three inputs: timer ticks, messages received from peers, and data appended by the
//! application. It produces messages to be delivered to peers and a stream of committed log entries. Transport,
//! timers and the state machine are left to the embedding application.
//!
//! Group membership is explicit: a node knows the [voters and learners](membership::Membership) of its group.
//! Learners receive replicated entries but never vote, campaign or count towards a commit quorum. Changing the
//! membership is done one node at a time by calling [`node::Node::reconfigure`] once the application has applied a
//! configuration entry from the log.

#[macro_use]
mod macros;

pub mod core;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;
