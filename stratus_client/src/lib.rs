//! Client runtime for the stratus sharded time-series storage service.
//!
//! A stratus deployment is a set of named *services* (regional replica sets);
//! every logical key is owned by exactly one shard within each service, and
//! independent services hold copies of the same data. This crate is the
//! asynchronous runtime that sits between application code and those
//! services:
//!
//! * a **write pipeline** buffering data points into bounded per-service
//!   queues drained by worker tasks that batch, transmit, and feed failed
//!   points into a delayed retry queue;
//! * **read coordinators**: a sequential path that fails over across
//!   services with one in-service retry, and a parallel path that fans one
//!   read out to every service and finalizes as soon as a full copy of the
//!   data exists ([`collector`]);
//! * a **service refresher** hot-swapping the read-service set under a
//!   reader/writer lock.
//!
//! Routing (shard → host), the wire codec, and the RPC transport are
//! collaborators behind the [`NetworkClient`] and [`Directory`] traits; this
//! crate ships mock implementations of both for testing.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod client;
pub mod collector;
mod config;
pub mod directory;
mod error;
mod metrics;
pub mod network;
mod parallel;
mod queue;
mod read;
mod refresh;
mod retry;
pub mod time;
mod write;

pub use client::StratusClient;
pub use collector::{GetResult, KeyReadResult};
pub use config::ClientConfig;
pub use directory::Directory;
pub use error::{ConnectError, ReadError};
pub use network::{Connector, HostInfo, NetworkClient, PointPlacement};
