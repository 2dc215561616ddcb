//! # Endpoint
//!
//! An [`Endpoint`] is one way to reach a remote operation: give it a request,
//! get back a response or a failure. Transports build them, discovery caches
//! them per address and executors invoke them. Dropping the returned future
//! cancels the call.
use std::{fmt, future::Future, sync::Arc};

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

type CallFn<Req, Resp> = dyn Fn(Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync;

/// invoke a remote operation with a request
pub struct Endpoint<Req, Resp> {
    inner: Arc<CallFn<Req, Resp>>,
}

impl<Req, Resp> Endpoint<Req, Resp> {
    /// wrap an async fn as an endpoint
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |req| f(req).boxed()),
        }
    }

    /// invoke the endpoint
    pub fn call(&self, req: Req) -> BoxFuture<'static, Result<Resp>> {
        (self.inner)(req)
    }

    /// true if both handles point at the same underlying function, i.e. one
    /// is a clone of the other
    pub fn same_endpoint(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inner) as *const (),
            Arc::as_ptr(&other.inner) as *const (),
        )
    }
}

impl<Req: Send + 'static> Endpoint<Req, ()> {
    /// endpoint that does nothing and always succeeds
    pub fn nop() -> Self {
        Endpoint::new(|_req| async { Ok(()) })
    }
}

impl<Req, Resp> Clone for Endpoint<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req, Resp> fmt::Debug for Endpoint<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("ptr", &(Arc::as_ptr(&self.inner) as *const ()))
            .finish()
    }
}

/// A resource tied to a built endpoint (a connection, a background task).
///
/// `release` consumes the handle so it can only ever run once.
pub trait Release: Send + Sync + 'static {
    /// tear down the resource
    fn release(self: Box<Self>);
}

impl Release for CancellationToken {
    fn release(self: Box<Self>) {
        self.cancel();
    }
}

struct ReleaseFn<F>(F);

impl<F> Release for ReleaseFn<F>
where
    F: FnOnce() + Send + Sync + 'static,
{
    fn release(self: Box<Self>) {
        (self.0)()
    }
}

/// make a release handle from a closure
pub fn release_fn<F>(f: F) -> Box<dyn Release>
where
    F: FnOnce() + Send + Sync + 'static,
{
    Box::new(ReleaseFn(f))
}

/// What a [`Factory`] hands back for an address: the endpoint and an optional
/// handle to release when the address goes away.
pub type Built<Req, Resp> = (Endpoint<Req, Resp>, Option<Box<dyn Release>>);

/// Turns an address into an [`Endpoint`]. Supplied by the transport layer,
/// the core never opens connections itself.
pub trait Factory<Req, Resp>: Send + Sync + 'static {
    /// build an endpoint for `address`
    fn build(&self, address: &str) -> Result<Built<Req, Resp>>;
}

impl<Req, Resp, F> Factory<Req, Resp> for F
where
    F: Fn(&str) -> Result<Built<Req, Resp>> + Send + Sync + 'static,
{
    fn build(&self, address: &str) -> Result<Built<Req, Resp>> {
        self(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_endpoint_basic() {
        let ep = Endpoint::new(|req: &'static str| async move { Ok(format!("response to {req}")) });
        let resp = ep.call("test").await.unwrap();
        assert_eq!(resp, "response to test");
    }

    #[tokio::test]
    async fn test_nop() {
        let ep = Endpoint::<u32, ()>::nop();
        assert!(ep.call(1).await.is_ok());
    }

    #[test]
    fn test_same_endpoint() {
        let a = Endpoint::<(), ()>::nop();
        let b = a.clone();
        let c = Endpoint::<(), ()>::nop();
        assert!(a.same_endpoint(&b));
        assert!(!a.same_endpoint(&c));
    }

    #[test]
    fn test_release_fn_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = release_fn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handle.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_token() {
        let token = CancellationToken::new();
        let handle: Box<dyn Release> = Box::new(token.clone());
        handle.release();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_closure_factory() {
        let factory = |addr: &str| -> Result<Built<(), String>> {
            let addr = addr.to_owned();
            Ok((
                Endpoint::new(move |_| {
                    let addr = addr.clone();
                    async move { Ok(addr) }
                }),
                None,
            ))
        };
        let (ep, closer) = factory.build("10.0.0.1:9").unwrap();
        assert!(closer.is_none());
        assert_eq!(ep.call(()).await.unwrap(), "10.0.0.1:9");
    }
}
