//! # endpointer
//!
//! Client side of the resolution pipeline: discovery snapshots in, endpoint
//! calls out.
//!
//! - [`EndpointCache`] keeps one [`Endpoint`](relay_core::Endpoint) per
//!   discovered address, with an optional grace period on discovery failures.
//! - [`DefaultEndpointer`] subscribes a cache to an
//!   [`Instancer`](discovery::Instancer).
//! - [`RoundRobin`] picks the endpoint for each call.
//! - [`Retry`] runs a call through a balancer with a retry policy, backoff and
//!   a deadline for the whole call.
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

pub mod balancer;
pub mod cache;
pub mod endpointer;
pub mod retry;

pub use balancer::{Balancer, RoundRobin};
pub use cache::{EndpointCache, EndpointerOptions};
pub use endpointer::{DefaultEndpointer, Endpointer, FixedEndpointer};
pub use retry::{Retry, RetryPolicy};
