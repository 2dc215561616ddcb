//! Endpoint selection.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use relay_core::{Endpoint, Error};

use crate::endpointer::Endpointer;

/// Picks one endpoint per call.
pub trait Balancer<Req, Resp>: Send + Sync {
    /// the endpoint to use for the next call
    fn endpoint(&self) -> Result<Endpoint<Req, Resp>, Error>;
}

impl<Req, Resp, B> Balancer<Req, Resp> for Arc<B>
where
    B: Balancer<Req, Resp> + ?Sized,
{
    fn endpoint(&self) -> Result<Endpoint<Req, Resp>, Error> {
        (**self).endpoint()
    }
}

/// Cycles through the endpoints in address order.
///
/// The counter belongs to this balancer only and wraps around; concurrent
/// callers each get a distinct tick but no ordering between them.
pub struct RoundRobin<E> {
    endpointer: E,
    counter: AtomicU64,
}

impl<E: fmt::Debug> fmt::Debug for RoundRobin<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundRobin")
            .field("endpointer", &self.endpointer)
            .field("counter", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl<E> RoundRobin<E> {
    /// balancer over `endpointer`
    pub fn new(endpointer: E) -> Self {
        Self {
            endpointer,
            counter: AtomicU64::new(0),
        }
    }
}

impl<Req, Resp, E> Balancer<Req, Resp> for RoundRobin<E>
where
    E: Endpointer<Req, Resp>,
{
    fn endpoint(&self) -> Result<Endpoint<Req, Resp>, Error> {
        let endpoints = self.endpointer.endpoints()?;
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        let tick = self.counter.fetch_add(1, Ordering::Relaxed);
        let idx = (tick % endpoints.len() as u64) as usize;
        Ok(endpoints[idx].clone())
    }
}
