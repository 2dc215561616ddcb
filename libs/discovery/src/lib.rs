//! # discovery
//!
//! Watches a discovery backend for the addresses behind a logical service and
//! fans every change out to subscribers.
//!
//! - [`Snapshot`] is the latest known state: a sorted address list, or a failure.
//! - [`Cache`] stores the last snapshot, drops redundant updates and notifies
//!   every registered subscriber channel.
//! - [`Watcher`] runs the blocking-query loop against a [`Backend`] and feeds
//!   its [`Cache`], backing off on failures and stale cursors.
//! - [`Registrar`] registers and deregisters an instance with the backend.
//! - [`MemoryBackend`] is an in-process [`Backend`] for tests and demos.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

pub mod backend;
pub mod cache;
pub mod event;
pub mod memory;
pub mod registrar;
pub mod watcher;

mod registry;

pub use backend::{Backend, HealthCheck, QueryResult, Registration, ServiceQuery, NO_INDEX};
pub use cache::Cache;
pub use event::Snapshot;
pub use memory::MemoryBackend;
pub use registrar::Registrar;
pub use registry::SubscriberId;
pub use watcher::{Instancer, Watcher};
