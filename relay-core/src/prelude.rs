//! relay prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait,
    backoff::Backoff,
    endpoint::{Endpoint, Factory, Release},
    error::{DiscoveryError, Error},
    tokio,
    tokio_util::sync::CancellationToken,
    tracing::{self, debug, error, info, instrument, trace, warn},
};

pub use std::{sync::Arc, time::Duration};
