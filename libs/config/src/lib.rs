use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use discovery::ServiceQuery;
use endpointer::{EndpointerOptions, RetryPolicy};
use relay_core::{
    backoff::{DEFAULT_CAP, DEFAULT_FLOOR},
    Backoff,
};
use tracing::debug;

pub mod wire;

/// attempts used when the file does not say
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// deadline for a whole call when the file does not say
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// How a call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// stop after this many attempts
    MaxAttempts(usize),
    /// only the deadline stops the call
    Forever,
}

/// validated resolver config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    invalidate_on_error: Option<Duration>,
    retry: RetryMode,
    timeout: Duration,
    backoff: Backoff,
    tags: Vec<String>,
    passing_only: bool,
    path: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            invalidate_on_error: None,
            retry: RetryMode::MaxAttempts(DEFAULT_MAX_ATTEMPTS),
            timeout: DEFAULT_TIMEOUT,
            backoff: Backoff::default(),
            tags: Vec::new(),
            passing_only: false,
            path: None,
        }
    }
}

impl TryFrom<wire::Config> for ResolverConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        let retry = match (cfg.retry.max_attempts, cfg.retry.forever) {
            (Some(_), true) => bail!("retry: `max_attempts` and `forever` are mutually exclusive"),
            (Some(max), false) => RetryMode::MaxAttempts(max.get()),
            (None, true) => RetryMode::Forever,
            (None, false) => RetryMode::MaxAttempts(DEFAULT_MAX_ATTEMPTS),
        };
        let timeout = cfg.timeout.unwrap_or(DEFAULT_TIMEOUT);
        if timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        let floor = cfg.backoff.floor.unwrap_or(DEFAULT_FLOOR);
        let cap = cfg.backoff.cap.unwrap_or(DEFAULT_CAP);
        if floor.is_zero() {
            bail!("backoff floor must be greater than zero");
        }
        if cap < floor {
            bail!("backoff cap {cap:?} is below floor {floor:?}");
        }

        Ok(Self {
            invalidate_on_error: cfg.invalidate_on_error,
            retry,
            timeout,
            backoff: Backoff::new(floor, cap),
            tags: cfg.discovery.tags,
            passing_only: cfg.discovery.passing_only,
            path: None,
        })
    }
}

impl ResolverConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::parse_str(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let config = match Self::json(s.as_ref()) {
            Ok(r) => r,
            Err(_err) => Self::yaml(s.as_ref())?,
        };
        debug!(?config);
        Ok(config)
    }

    /// decode from yaml
    pub fn yaml<S: AsRef<str>>(input: S) -> Result<Self> {
        let input = input.as_ref();
        // serde_yaml reads an empty document as null
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::try_from(serde_yaml::from_str::<wire::Config>(input)?)
    }

    /// decode from json
    pub fn json<S: AsRef<str>>(input: S) -> Result<Self> {
        Self::try_from(serde_json::from_str::<wire::Config>(input.as_ref())?)
    }

    /// where the config was read from, if a file
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// retry mode
    pub fn retry(&self) -> RetryMode {
        self.retry
    }

    /// deadline for a whole call
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// backoff between attempts
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// endpoint cache options
    pub fn endpointer_options(&self) -> EndpointerOptions {
        match self.invalidate_on_error {
            Some(timeout) => EndpointerOptions::invalidate_on_error(timeout),
            None => EndpointerOptions::default(),
        }
    }

    /// retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry {
            RetryMode::MaxAttempts(max) => RetryPolicy::max_attempts(max),
            RetryMode::Forever => RetryPolicy::always(),
        }
    }

    /// discovery query for `service` with the configured filters
    pub fn service_query(&self, service: impl Into<String>) -> ServiceQuery {
        ServiceQuery::new(service)
            .with_tags(self.tags.iter().cloned())
            .with_passing_only(self.passing_only)
    }

    /// Add tags and the passing filter given on the command line. Tags are
    /// appended, `passing_only` can only be switched on.
    pub fn merge_discovery(&mut self, tags: &[String], passing_only: bool) {
        for tag in tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
        self.passing_only |= passing_only;
    }
}
