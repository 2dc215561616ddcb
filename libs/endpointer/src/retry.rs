//! # Retry
//!
//! Calls through a [`Balancer`] until one attempt succeeds, the policy gives
//! up, the deadline for the whole call passes or the caller cancels.
//!
//! Each attempt runs on its own task and races the deadline, so a hanging
//! endpoint cannot hold the call past its timeout. Failed attempts are
//! separated by an exponential backoff.
use std::{fmt, sync::Arc, time::Duration};

use anyhow::anyhow;
use relay_core::{
    metrics::{RETRY_ATTEMPTS, RETRY_OUTCOME},
    Backoff, Endpoint, Error, RetryError,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::balancer::Balancer;

type PolicyFn = dyn Fn(usize, &anyhow::Error) -> (bool, Option<anyhow::Error>) + Send + Sync;

/// Decides after a failed attempt whether to try again.
///
/// The callback gets the number of attempts made so far (starting at 1) and
/// the error of the last one. It returns whether to keep going and,
/// optionally, an error to report instead of the last one if it stops.
#[derive(Clone)]
pub struct RetryPolicy {
    callback: Arc<PolicyFn>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy").finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// policy from a callback
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(usize, &anyhow::Error) -> (bool, Option<anyhow::Error>) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(f),
        }
    }

    /// stop once `max` attempts have been made
    pub fn max_attempts(max: usize) -> Self {
        Self::new(move |n, _| (n < max, None))
    }

    /// never give up, only the deadline ends the call
    pub fn always() -> Self {
        Self::new(|_, _| (true, None))
    }

    /// consult the policy after attempt `n` failed with `err`
    pub fn check(&self, n: usize, err: &anyhow::Error) -> (bool, Option<anyhow::Error>) {
        (self.callback)(n, err)
    }
}

/// Retrying executor over a balancer.
pub struct Retry<Req, Resp> {
    balancer: Arc<dyn Balancer<Req, Resp>>,
    timeout: Duration,
    policy: RetryPolicy,
    backoff: Backoff,
}

impl<Req, Resp> fmt::Debug for Retry<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<Req, Resp> Retry<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    /// executor giving every call `timeout` in total
    pub fn new<B>(balancer: B, timeout: Duration, policy: RetryPolicy) -> Self
    where
        B: Balancer<Req, Resp> + 'static,
    {
        Self {
            balancer: Arc::new(balancer),
            timeout,
            policy,
            backoff: Backoff::default(),
        }
    }

    /// shorthand for [`RetryPolicy::max_attempts`]
    pub fn with_max_attempts<B>(balancer: B, max: usize, timeout: Duration) -> Self
    where
        B: Balancer<Req, Resp> + 'static,
    {
        Self::new(balancer, timeout, RetryPolicy::max_attempts(max))
    }

    /// use `backoff` between attempts
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// run `req` without outside cancellation
    pub async fn execute(&self, req: Req) -> Result<Resp, Error> {
        self.execute_with(&CancellationToken::new(), req).await
    }

    /// Run `req`, giving up with [`Error::Cancelled`] once `cancel` fires.
    /// A cancelled or timed out attempt is aborted and its result discarded.
    pub async fn execute_with(&self, cancel: &CancellationToken, req: Req) -> Result<Resp, Error> {
        let deadline = Instant::now() + self.timeout;
        let mut backoff = self.backoff;
        let mut record = RetryError::new();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            RETRY_ATTEMPTS.inc();

            let outcome = match self.balancer.endpoint() {
                Ok(endpoint) => {
                    let mut handle = tokio::spawn(endpoint.call(req.clone()));
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            handle.abort();
                            RETRY_OUTCOME.cancelled.inc();
                            return Err(Error::Cancelled);
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            handle.abort();
                            RETRY_OUTCOME.deadline.inc();
                            debug!(attempt, "deadline exceeded during attempt");
                            return Err(Error::DeadlineExceeded);
                        }
                        res = &mut handle => {
                            res.unwrap_or_else(|err| Err(anyhow!("attempt task failed: {err}")))
                        }
                    }
                }
                Err(err) => Err(anyhow::Error::new(err)),
            };

            let err = match outcome {
                Ok(resp) => {
                    RETRY_OUTCOME.success.inc();
                    trace!(attempt, "attempt succeeded");
                    return Ok(resp);
                }
                Err(err) => err,
            };

            debug!(attempt, err = %err, "attempt failed");
            let (keep_trying, replacement) = self.policy.check(attempt, &err);
            record.push(err);
            if !keep_trying {
                if let Some(replacement) = replacement {
                    record.set_final(replacement);
                }
                RETRY_OUTCOME.exhausted.inc();
                return Err(Error::Retry(record));
            }

            let delay = backoff.next_delay();
            trace!(attempt, delay_ms = delay.as_millis() as u64, "backing off before next attempt");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    RETRY_OUTCOME.cancelled.inc();
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    RETRY_OUTCOME.deadline.inc();
                    debug!(attempt, "deadline exceeded during backoff");
                    return Err(Error::DeadlineExceeded);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// The executor as a plain endpoint, errors come back as
    /// [`relay_core::Error`] inside the `anyhow::Error`.
    pub fn into_endpoint(self) -> Endpoint<Req, Resp> {
        let this = Arc::new(self);
        Endpoint::new(move |req| {
            let this = Arc::clone(&this);
            async move { this.execute(req).await.map_err(anyhow::Error::new) }
        })
    }
}
