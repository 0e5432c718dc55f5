//! Replicated key-value store on top of raft.
//!
//! Writes go through the raft log and are applied to an in-memory map on
//! every member in the same order; reads are served from the local map and
//! may be stale on a follower.
//!
//! # Architecture
//!
//! - **HTTP tasks** (tokio): serve `/get`, `/set` and `/join` through the
//!   [`gateway`]
//! - **Raft worker thread**: owns the raft node, applies committed entries to
//!   the [`fsm`], takes periodic snapshots
//! - **Network threads**: accept peer connections and send outbound raft
//!   messages, one sender per peer
//! - **Leadership monitor thread**: turns leadership notifications into the
//!   write gate handlers check before accepting a write
//!
//! # Modules
//!
//! - [`store`]: thread-safe in-memory key-value map
//! - [`command`]: the replicated log entry and its encoding
//! - [`fsm`]: applies committed entries to the store
//! - [`snapshot`]: point-in-time snapshots of the store
//! - [`leadership`]: leadership notifications and the write gate
//! - [`gateway`]: HTTP request surface
//! - [`join`]: startup handshake with an existing member
//! - [`consensus`]: engine contract and the raft-backed engine
//! - [`cli`]: command-line options

pub mod cli;
pub mod command;
pub mod consensus;
pub mod error;
pub mod fsm;
pub mod gateway;
pub mod join;
pub mod leadership;
pub mod snapshot;
pub mod store;
