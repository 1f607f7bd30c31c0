//! Cluster topology: which nodes exist, and how each partition's replica set should change.

pub mod address_book;
pub mod planner;
