//! # Middleware
//!
//! A middleware turns one [`Endpoint`] into another. Logging, metrics and
//! error decoration are all expressed this way and stacked with [`chain`].
use std::{fmt, sync::Arc, time::Instant};

use tracing::{debug, debug_span};
use tracing_futures::Instrument;

use crate::{
    endpoint::Endpoint,
    metrics::{ENDPOINT_DURATION, ENDPOINT_REQUESTS},
};

/// transform from one endpoint to another
pub type Middleware<Req, Resp> =
    Arc<dyn Fn(Endpoint<Req, Resp>) -> Endpoint<Req, Resp> + Send + Sync>;

/// Compose middlewares into one. `outer` sees the request first, then each of
/// `others` in order, then the wrapped endpoint. Responses travel back in
/// reverse.
pub fn chain<Req, Resp>(
    outer: Middleware<Req, Resp>,
    others: Vec<Middleware<Req, Resp>>,
) -> Middleware<Req, Resp>
where
    Req: 'static,
    Resp: 'static,
{
    Arc::new(move |mut next: Endpoint<Req, Resp>| {
        for mw in others.iter().rev() {
            next = mw(next);
        }
        outer(next)
    })
}

/// An endpoint failure tagged with the operation that produced it.
#[derive(Debug)]
pub struct OperationError {
    /// name of the failing operation
    pub operation: Arc<str>,
    /// the underlying failure
    pub source: anyhow::Error,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.source)
    }
}

impl std::error::Error for OperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + 'static) = self.source.as_ref();
        Some(source)
    }
}

/// wrap every failure in an [`OperationError`] naming `operation`
pub fn error_context<Req, Resp>(operation: &str) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let operation: Arc<str> = operation.into();
    Arc::new(move |next: Endpoint<Req, Resp>| {
        let operation = operation.clone();
        Endpoint::new(move |req| {
            let fut = next.call(req);
            let operation = operation.clone();
            async move {
                fut.await
                    .map_err(|source| anyhow::Error::new(OperationError { operation, source }))
            }
        })
    })
}

/// record request counts and durations under `operation`
pub fn metrics<Req, Resp>(operation: &str) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let operation: Arc<str> = operation.into();
    Arc::new(move |next: Endpoint<Req, Resp>| {
        let operation = operation.clone();
        Endpoint::new(move |req| {
            let fut = next.call(req);
            let operation = operation.clone();
            async move {
                let start = Instant::now();
                let res = fut.await;
                ENDPOINT_DURATION
                    .with_label_values(&[&*operation])
                    .observe(start.elapsed().as_secs_f64());
                let outcome = if res.is_ok() { "success" } else { "error" };
                ENDPOINT_REQUESTS
                    .with_label_values(&[&*operation, outcome])
                    .inc();
                res
            }
        })
    })
}

/// run every call inside a debug span and log failures
pub fn trace<Req, Resp>(operation: &str) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let operation: Arc<str> = operation.into();
    Arc::new(move |next: Endpoint<Req, Resp>| {
        let operation = operation.clone();
        Endpoint::new(move |req| {
            let fut = next.call(req);
            let span = debug_span!("endpoint", operation = %operation);
            async move {
                let start = Instant::now();
                let res = fut.await;
                match &res {
                    Ok(_) => debug!(elapsed = ?start.elapsed(), "call succeeded"),
                    Err(err) => debug!(elapsed = ?start.elapsed(), ?err, "call failed"),
                }
                res
            }
            .instrument(span)
        })
    })
}
