//! # relay
//!
//! Core types shared by every relay crate. An [`Endpoint`] is the callable
//! unit the rest of the workspace moves around: discovery turns addresses into
//! endpoints through a [`Factory`], balancers pick one, and executors retry
//! them.
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
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
pub use anyhow;
pub use async_trait::async_trait;
pub use futures;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub use crate::backoff::Backoff;
pub use crate::endpoint::{release_fn, Endpoint, Factory, Release};
pub use crate::error::{DiscoveryError, Error, RetryError};
pub use crate::middleware::{chain, Middleware};

pub mod backoff;
pub mod config;
pub mod endpoint;
pub mod env;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod prelude;
