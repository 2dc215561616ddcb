use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use discovery::{MemoryBackend, ServiceQuery, Watcher};
use endpointer::{
    Balancer, DefaultEndpointer, EndpointerOptions, Retry, RetryPolicy, RoundRobin,
};
use parking_lot::Mutex;
use relay_core::{endpoint::Built, release_fn, Endpoint};

#[derive(Debug, Default)]
struct Tally {
    built: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
}

fn factory(tally: Arc<Tally>) -> impl Fn(&str) -> anyhow::Result<Built<(), String>> + Send + Sync + 'static {
    move |addr: &str| {
        tally.built.lock().push(addr.to_owned());
        let owned = addr.to_owned();
        let endpoint = Endpoint::new(move |_req: ()| {
            let addr = owned.clone();
            async move { Ok(addr) }
        });
        let tally = Arc::clone(&tally);
        let addr = addr.to_owned();
        let release = release_fn(move || tally.released.lock().push(addr));
        Ok((endpoint, Some(release)))
    }
}

async fn pick<B: Balancer<(), String>>(balancer: &B, n: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(balancer.endpoint().unwrap().call(()).await.unwrap());
    }
    out
}

#[tokio::test(start_paused = true)]
async fn discovery_to_round_robin() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_instances("users", ["10.0.0.1:9", "10.0.0.2:9"]);

    let watcher = Arc::new(Watcher::new(backend.clone(), ServiceQuery::new("users")).await);
    let tally = Arc::new(Tally::default());
    let endpointer = Arc::new(DefaultEndpointer::new(
        Arc::clone(&watcher),
        factory(Arc::clone(&tally)),
        EndpointerOptions::default(),
    ));
    let rr = RoundRobin::new(Arc::clone(&endpointer));

    assert_eq!(*tally.built.lock(), vec!["10.0.0.1:9", "10.0.0.2:9"]);
    assert_eq!(
        pick(&rr, 4).await,
        vec!["10.0.0.1:9", "10.0.0.2:9", "10.0.0.1:9", "10.0.0.2:9"]
    );

    backend.set_instances("users", ["10.0.0.2:9", "10.0.0.3:9"]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*tally.released.lock(), vec!["10.0.0.1:9"]);
    // .2 is kept, only .3 is new
    assert_eq!(
        *tally.built.lock(),
        vec!["10.0.0.1:9", "10.0.0.2:9", "10.0.0.3:9"]
    );
    let picked = pick(&rr, 4).await;
    assert!(picked.iter().all(|a| a == "10.0.0.2:9" || a == "10.0.0.3:9"));
    assert_ne!(picked[0], picked[1]);
    assert_eq!(picked[0], picked[2]);
    assert_eq!(picked[1], picked[3]);

    endpointer.close();
    assert_eq!(tally.released.lock().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_over_discovered_endpoints() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_instances("users", ["10.0.0.1:9", "10.0.0.2:9"]);
    let watcher = Watcher::new(backend.clone(), ServiceQuery::new("users")).await;

    // .1 always fails, .2 answers
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let endpointer = DefaultEndpointer::new(
        watcher,
        move |addr: &str| -> anyhow::Result<Built<u32, String>> {
            let owned = addr.to_owned();
            let counter = Arc::clone(&counter);
            Ok((
                Endpoint::new(move |req: u32| {
                    let addr = owned.clone();
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if addr == "10.0.0.1:9" {
                            anyhow::bail!("{addr} refused");
                        }
                        Ok(format!("{addr} answered {req}"))
                    }
                }),
                None,
            ))
        },
        EndpointerOptions::default(),
    );
    let retry = Retry::new(
        RoundRobin::new(endpointer),
        Duration::from_secs(5),
        RetryPolicy::max_attempts(3),
    );

    assert_eq!(retry.execute(7).await.unwrap(), "10.0.0.2:9 answered 7");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn discovery_outage_with_grace_window() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_instances("users", ["10.0.0.1:9"]);
    let watcher = Arc::new(Watcher::new(backend.clone(), ServiceQuery::new("users")).await);
    let endpointer = DefaultEndpointer::new(
        Arc::clone(&watcher),
        factory(Arc::new(Tally::default())),
        EndpointerOptions::invalidate_on_error(Duration::from_secs(10)),
    );
    let rr = RoundRobin::new(endpointer);
    assert_eq!(pick(&rr, 1).await, vec!["10.0.0.1:9"]);

    backend.set_failure(Some(discovery_error()));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(watcher_failed(&watcher));
    assert_eq!(pick(&rr, 1).await, vec!["10.0.0.1:9"]);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(rr.endpoint().is_err());

    // the catalog is back with the same contents and index
    backend.set_failure(None);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!watcher_failed(&watcher));
    assert_eq!(pick(&rr, 1).await, vec!["10.0.0.1:9"]);
}

fn discovery_error() -> relay_core::DiscoveryError {
    relay_core::DiscoveryError::Transport("catalog unreachable".into())
}

fn watcher_failed(watcher: &Watcher) -> bool {
    use discovery::Instancer;
    watcher.state().is_failure()
}
