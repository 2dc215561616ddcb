//! relay process configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default discovery backend address
    pub static DEFAULT_CONSUL_ADDR: &str = "http://127.0.0.1:8500";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "relay-worker";
    /// default log level. Can use this argument or RELAY_LOG env var
    pub const DEFAULT_RELAY_LOG: &str = "info";
    /// default delay between calls made by `relay call`
    pub const DEFAULT_CALL_INTERVAL_MS: u64 = 1_000;
    /// default payload sent by `relay call`
    pub static DEFAULT_PAYLOAD: &str = "ping";

    use std::{path::PathBuf, time::Duration};

    pub use clap::Parser;
    use clap::{Args, Subcommand};

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "relay", bin_name = "relay", about, long_about = None)]
    /// parses from cli & environment var. relay will load `.env` in the working dir as well
    pub struct Config {
        /// address of the consul agent
        #[clap(long, env, value_parser, default_value = DEFAULT_CONSUL_ADDR)]
        pub consul_addr: String,
        /// ACL token sent to consul
        #[clap(long, env, value_parser)]
        pub consul_token: Option<String>,
        /// consul datacenter to query
        #[clap(long, env, value_parser)]
        pub datacenter: Option<String>,
        /// path to a resolver config file (yaml or json)
        #[clap(short, long, env, value_parser)]
        pub config_path: Option<PathBuf>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of cpus
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_RELAY_LOG)]
        pub relay_log: String,
        /// what to do
        #[clap(subcommand)]
        pub command: Command,
    }

    /// relay subcommands
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// log every change to a service's address set
        Watch(ServiceArgs),
        /// call a service over the line protocol through the retry executor
        Call {
            /// the service to call
            #[clap(flatten)]
            service: ServiceArgs,
            /// line sent on every call
            #[clap(long, env, value_parser, default_value = DEFAULT_PAYLOAD)]
            payload: String,
            /// milliseconds between calls
            #[clap(long, env, value_parser, default_value_t = DEFAULT_CALL_INTERVAL_MS)]
            interval_ms: u64,
        },
        /// register an instance until interrupted, then deregister it
        Register(RegisterArgs),
    }

    /// which service to resolve
    #[derive(Args, Debug, Clone, PartialEq, Eq)]
    pub struct ServiceArgs {
        /// logical service name
        #[clap(value_parser)]
        pub service: String,
        /// only instances carrying every tag, may be repeated
        #[clap(long = "tag", value_parser)]
        pub tags: Vec<String>,
        /// only instances passing their health checks
        #[clap(long)]
        pub passing_only: bool,
    }

    /// instance to register
    #[derive(Args, Debug, Clone, PartialEq, Eq)]
    pub struct RegisterArgs {
        /// logical service name
        #[clap(value_parser)]
        pub name: String,
        /// address the instance is reachable on
        #[clap(long, value_parser)]
        pub address: String,
        /// port the instance listens on
        #[clap(long, value_parser)]
        pub port: u16,
        /// instance id, defaults to `name-address-port`
        #[clap(long, value_parser)]
        pub id: Option<String>,
        /// tags to attach, may be repeated
        #[clap(long = "tag", value_parser)]
        pub tags: Vec<String>,
    }

    impl Command {
        /// delay between calls, when calling
        pub fn interval(&self) -> Option<Duration> {
            match self {
                Command::Call { interval_ms, .. } => Some(Duration::from_millis(*interval_ms)),
                _ => None,
            }
        }
    }

}

pub mod trace {
    //! Log output for the relay binary. The level filter comes from
    //! `--relay-log`/`RELAY_LOG`, the output format from `LOG_FORMAT`.
    use std::str::FromStr;

    use anyhow::Result;
    use thiserror::Error;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// level used when `--relay-log` is not a valid filter
    const FALLBACK_LEVEL: &str = "info";

    /// How log lines are written.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum LogFormat {
        /// one json object per event, for log shippers
        Json,
        /// multi-line output for reading discovery changes by hand
        Pretty,
        /// single-line text
        #[default]
        Standard,
    }

    #[derive(Debug, Error)]
    #[error("unknown log format {0:?}, expected json, pretty or standard")]
    pub struct UnknownFormat(String);

    impl FromStr for LogFormat {
        type Err = UnknownFormat;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.to_ascii_lowercase().as_str() {
                "json" => Ok(Self::Json),
                "pretty" => Ok(Self::Pretty),
                "standard" | "" => Ok(Self::Standard),
                other => Err(UnknownFormat(other.to_owned())),
            }
        }
    }

    /// Filter for relay's own crates. The http stack under the consul
    /// client is noisy at debug, so hyper is silenced and reqwest capped.
    pub fn filter(relay_log: &str) -> Result<EnvFilter> {
        Ok(EnvFilter::try_new(relay_log)
            .or_else(|_| EnvFilter::try_new(FALLBACK_LEVEL))?
            .add_directive("hyper=off".parse()?)
            .add_directive("reqwest=info".parse()?))
    }

    /// Installed logging setup.
    #[derive(Debug)]
    pub struct Config {
        pub format: LogFormat,
    }

    impl Config {
        /// Install the global subscriber for the process. Call once, before
        /// the runtime starts.
        pub fn parse(relay_log: &str) -> Result<Self> {
            let format: LogFormat = parse_var_with_err("LOG_FORMAT", "standard")?;
            let filter = filter(relay_log)?;
            let registry = tracing_subscriber::registry().with(filter);

            match format {
                LogFormat::Json => registry.with(fmt::layer().json()).init(),
                LogFormat::Pretty => registry
                    .with(
                        fmt::layer()
                            .event_format(Format::default().pretty().with_source_location(false))
                            .fmt_fields(PrettyFields::new()),
                    )
                    .init(),
                LogFormat::Standard => registry.with(fmt::layer()).init(),
            }

            Ok(Self { format })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_log_format() {
            assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
            assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
            assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Standard);
            let err = "xml".parse::<LogFormat>().unwrap_err();
            assert!(err.to_string().contains("xml"));
        }

        #[test]
        fn test_filter_falls_back() {
            let fallback = filter("not a [valid filter").unwrap();
            assert!(fallback.to_string().contains("hyper=off"));
            let custom = filter("discovery=trace").unwrap();
            assert!(custom.to_string().contains("discovery=trace"));
        }
    }
}
