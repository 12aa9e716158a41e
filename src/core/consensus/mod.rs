// src/core/consensus/mod.rs

//! Raft-style consensus: a replicated log with leader election, log
//! replication, and commit/apply.

pub mod engine;
pub mod log;

pub use engine::{
    AppendEntriesRequest, AppendEntriesResponse, ClusterTransport, ConsensusEngine, ConsensusStats,
    RaftRole, RequestVote, StateMachineCallback, VoteResponse,
};
pub use log::{LogEntry, RaftLog};
