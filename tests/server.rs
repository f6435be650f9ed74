use std::fs;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use predstore::{
    CollectionName, OperationClass, PredictionClient, PredictionServer, Quota, Result, Service,
    SharedQueueThreadPool, StoreConfig, StoreError, ThreadPool,
};
use serde_json::json;
use tempfile::TempDir;

/// retries until the server thread is listening
fn connect(addr: SocketAddr) -> PredictionClient {
    for _ in 0..100 {
        if let Ok(client) = PredictionClient::connect(addr) {
            return client;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server did not start listening on {}", addr);
}

// Should answer a request over its quota with a retryable error, leave other operation classes
// usable, and drain background work once stopped
#[test]
fn rate_limited_requests_reach_the_client() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let addr: SocketAddr = "127.0.0.1:4105".parse().unwrap();
    let mut config = StoreConfig::new(temp_dir.path());
    config
        .quotas
        .insert(OperationClass::Stats, Quota::new(2, Duration::from_secs(60)));
    config
        .quotas
        .insert(OperationClass::UsersRead, Quota::new(1, Duration::from_secs(60)));
    let service = Service::open(config)?;

    let server = PredictionServer::new(service.clone(), SharedQueueThreadPool::new(2)?);
    let stop = server.stop_handle();
    let handle = thread::spawn(move || server.run(addr));

    let mut client = connect(addr);
    client.stats()?;
    client.stats()?;
    let denied = client.stats().unwrap_err();
    assert!(denied.is_retryable());
    assert!(matches!(denied, StoreError::RateLimited(_)));

    client.get(CollectionName::Users)?;
    assert!(matches!(
        client.get(CollectionName::Users),
        Err(StoreError::RateLimited(_))
    ));
    // writes of the same collection have their own quota
    client.put(CollectionName::Guesses, json!({"alice": {"cs-f111": {"midsem": 75}}}))?;
    client.put(CollectionName::Users, json!({"alice": {}}))?;
    client.health()?;

    drop(client);
    stop.stop(addr);
    handle.join().unwrap()?;

    // the export queued by the guesses write finished before `run` returned
    assert!(service.pending_tasks().is_empty());
    assert_eq!(fs::read_dir(service.config().export_dir())?.count(), 3);
    assert!(matches!(
        service.trigger_backup(),
        Err(StoreError::BackgroundTask(_))
    ));
    assert_eq!(service.get(CollectionName::Users).len(), 1);

    Ok(())
}
