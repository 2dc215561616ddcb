#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};

mod line;

use config::ResolverConfig;
use consul::{ConsulClient, ConsulConfig};
use discovery::{Backend, Instancer, MemoryBackend, Registrar, Registration, Watcher};
use endpointer::{DefaultEndpointer, Retry, RoundRobin};
use relay_core::{
    chain,
    config::{
        cli::{self, Command, Parser, RegisterArgs, ServiceArgs},
        trace,
    },
    endpoint::Built,
    middleware,
    tokio::{self, runtime::Builder, signal, sync::mpsc},
    tracing::*,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// `--consul-addr` scheme that swaps consul for an in-process catalog seeded
/// with the listed `host:port` addresses
const MEMORY_SCHEME: &str = "memory://";

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.relay_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start relay"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let mut resolver = match &config.config_path {
        Some(path) => {
            debug!(?path, "parsing resolver config");
            ResolverConfig::parse(path)?
        }
        None => ResolverConfig::default(),
    };

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    match &config.command {
        Command::Watch(args) => {
            resolver.merge_discovery(&args.tags, args.passing_only);
            let backend = backend(&config, &args.service)?;
            watch(backend, &resolver, args, token).await
        }
        Command::Call {
            service, payload, ..
        } => {
            resolver.merge_discovery(&service.tags, service.passing_only);
            let backend = backend(&config, &service.service)?;
            let interval = config
                .command
                .interval()
                .ok_or_else(|| anyhow!("call without an interval"))?;
            call(backend, &resolver, service, payload, interval, token).await
        }
        Command::Register(args) => {
            let backend = backend(&config, &args.name)?;
            register(backend, args.clone(), token).await
        }
    }
}

/// Consul, or the in-process catalog when the address uses [`MEMORY_SCHEME`].
fn backend(config: &cli::Config, service: &str) -> Result<Arc<dyn Backend>> {
    if let Some(addrs) = config.consul_addr.strip_prefix(MEMORY_SCHEME) {
        let addrs = memory_addrs(addrs);
        info!(?addrs, %service, "using in-process catalog");
        let backend = MemoryBackend::new();
        backend.set_instances(service, addrs);
        return Ok(Arc::new(backend));
    }
    info!(addr = %config.consul_addr, datacenter = ?config.datacenter, "using consul");
    let client = ConsulClient::new(ConsulConfig {
        addr: config.consul_addr.clone(),
        token: config.consul_token.clone(),
        datacenter: config.datacenter.clone(),
        ..ConsulConfig::default()
    })?;
    Ok(Arc::new(client))
}

fn memory_addrs(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_owned)
        .collect()
}

async fn watch(
    backend: Arc<dyn Backend>,
    resolver: &ResolverConfig,
    args: &ServiceArgs,
    token: CancellationToken,
) -> Result<()> {
    let watcher =
        Watcher::with_backoff(backend, resolver.service_query(&args.service), resolver.backoff())
            .await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = watcher.register(&tx);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            snapshot = rx.recv() => match snapshot {
                Some(snapshot) => match snapshot.addresses() {
                    Some(addrs) => info!(service = %args.service, ?addrs, "instances changed"),
                    None => warn!(service = %args.service, err = ?snapshot.error(), "discovery failing"),
                },
                None => break,
            },
        }
    }
    watcher.deregister(id);
    Ok(())
}

async fn call(
    backend: Arc<dyn Backend>,
    resolver: &ResolverConfig,
    args: &ServiceArgs,
    payload: &str,
    interval: Duration,
    token: CancellationToken,
) -> Result<()> {
    let watcher =
        Watcher::with_backoff(backend, resolver.service_query(&args.service), resolver.backoff())
            .await;

    let op = format!("call {}", args.service);
    let mw = chain(
        middleware::trace(&op),
        vec![middleware::metrics(&op), middleware::error_context(&op)],
    );
    let lines = line::factory();
    let factory = move |addr: &str| -> Result<Built<String, String>> {
        let (endpoint, release) = lines(addr)?;
        Ok((mw(endpoint), release))
    };

    let endpointer = DefaultEndpointer::new(watcher, factory, resolver.endpointer_options());
    let retry = Retry::new(
        RoundRobin::new(endpointer),
        resolver.timeout(),
        resolver.retry_policy(),
    )
    .with_backoff(resolver.backoff());
    info!(service = %args.service, retry = ?resolver.retry(), timeout = ?resolver.timeout(), "calling");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match retry.execute_with(&token, payload.to_owned()).await {
            Ok(resp) => info!(%resp, "call succeeded"),
            Err(err) if err.is_cancelled() => break,
            Err(err) => warn!(%err, "call failed"),
        }
    }
    Ok(())
}

async fn register(
    backend: Arc<dyn Backend>,
    args: RegisterArgs,
    token: CancellationToken,
) -> Result<()> {
    let mut registration =
        Registration::new(args.name, args.address, args.port).with_tags(args.tags);
    if let Some(id) = args.id {
        registration = registration.with_id(id);
    }
    let registrar = Registrar::new(backend, registration);
    registrar
        .register()
        .await
        .context("failed to register instance")?;

    token.cancelled().await;
    registrar
        .deregister()
        .await
        .context("failed to deregister instance")?;
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery::{ServiceQuery, NO_INDEX};

    #[test]
    fn test_memory_addrs() {
        assert_eq!(
            memory_addrs("10.0.0.1:9, 10.0.0.2:9,,"),
            vec!["10.0.0.1:9", "10.0.0.2:9"]
        );
        assert!(memory_addrs("").is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_selected() {
        let config = cli::Config::parse_from([
            "relay",
            "--consul-addr",
            "memory://10.0.0.2:9,10.0.0.1:9",
            "watch",
            "users",
        ]);
        let backend = backend(&config, "users").unwrap();
        let res = backend
            .query(&ServiceQuery::new("users"), NO_INDEX)
            .await
            .unwrap();
        let mut instances = res.instances;
        instances.sort();
        assert_eq!(instances, vec!["10.0.0.1:9", "10.0.0.2:9"]);
    }

    #[tokio::test]
    async fn test_register_until_cancelled() {
        let memory = Arc::new(MemoryBackend::new());
        let args = RegisterArgs {
            name: "users".into(),
            address: "10.0.0.1".into(),
            port: 9000,
            id: None,
            tags: vec!["prod".into()],
        };
        let token = CancellationToken::new();
        let task = tokio::spawn(register(memory.clone(), args, token.clone()));

        let q = ServiceQuery::new("users");
        // parks until the registration lands
        let res = memory.query(&q, 1).await.unwrap();
        assert_eq!(res.instances, vec!["10.0.0.1:9000"]);

        token.cancel();
        task.await.unwrap().unwrap();
        let res = memory.query(&q, NO_INDEX).await.unwrap();
        assert!(res.instances.is_empty());
    }
}
