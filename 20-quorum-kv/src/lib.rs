//! Replicated key-value store with quorum-committed writes.
//!
//! Every node runs a [`server`] holding a full replica of a fixed-size
//! integer [`table`] and a [`client`] coordinator that broadcasts its
//! transactions to every server. A PUT is applied only after every server
//! has voted ACK for it; a single CANCEL aborts the attempt everywhere and
//! the PUT is retried under a new message ID after a randomized backoff.
//!
//! Servers and clients talk over plain TCP using the fixed-length records
//! in [`codec`].
//!
//! # Modules
//!
//! - [`codec`]: request/response records and stream framing
//! - [`table`]: per-slot locked storage
//! - [`transport`]: shared socket writers and connect-with-retry
//! - [`server`]: dispatcher and worker pool
//! - [`client`]: coordinator state machine and its async shell
//! - [`workload`]: random and scripted transaction sources
//! - [`config`], [`topology`], [`cli`], [`node`]: process wiring

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod node;
pub mod server;
pub mod table;
pub mod topology;
pub mod transport;
pub mod workload;
