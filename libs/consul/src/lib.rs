//! # consul
//!
//! [`Backend`](discovery::Backend) implementation for a consul agent.
//!
//! - [`ConsulClient`] answers blocking queries with
//!   `GET /v1/health/service/{service}` and registers instances through the
//!   agent endpoints.
//! - [`ConsulError`] is the crate error, converted into
//!   [`DiscoveryError`](relay_core::DiscoveryError) at the backend boundary.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod client;
pub mod error;
pub mod models;

pub use client::{ConsulClient, ConsulConfig, DEFAULT_ADDR, DEFAULT_WAIT};
pub use error::{ConsulError, ConsulResult};
