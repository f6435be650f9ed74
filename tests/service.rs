use std::fs;
use std::thread;

use crossbeam_utils::thread::scope;
use predstore::collection::into_collection;
use predstore::{
    BackupManager, Collection, CollectionName, FileStore, OperationClass, Persistence, Quota,
    Result, Service, StoreConfig, StoreError,
};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

fn obj(v: Value) -> Collection {
    into_collection(v).unwrap()
}

fn open(temp_dir: &TempDir) -> Service {
    let mut config = StoreConfig::new(temp_dir.path());
    config.export_on_write = false;
    Service::open(config).expect("unable to open the store")
}

fn count_backup_files(dir: &std::path::Path, suffix: &str) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.starts_with("backup_") && name.ends_with(suffix)
        })
        .count()
}

// Should keep only the ten newest snapshots, both encodings of each
#[test]
fn rotation_keeps_the_newest_snapshots() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let service = open(&temp_dir);
    service.put(CollectionName::Users, obj(json!({"alice": {}})))?;

    let ids: Vec<_> = (0..15).map(|_| service.snapshot()).collect::<Result<_>>()?;

    let listed = service.list_snapshots()?;
    let newest: Vec<_> = ids.iter().rev().take(10).cloned().collect();
    assert_eq!(listed, newest);

    let backup_dir = service.config().backup_dir();
    assert_eq!(count_backup_files(&backup_dir, ".json"), 10);
    assert_eq!(count_backup_files(&backup_dir, ".json.gz"), 10);

    Ok(())
}

// Should list an orphaned compressed snapshot and collect it during rotation
#[test]
fn rotation_collects_orphaned_encodings() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let backups = BackupManager::new(temp_dir.path().join("backups"), 10)?;
    let service = open(&temp_dir);

    let old = service.snapshot()?;
    let new = service.snapshot()?;
    fs::remove_file(backups.dir().join(format!("{}.json", old)))?;

    assert_eq!(backups.list()?, vec![new.clone(), old.clone()]);
    assert_eq!(backups.rotate(1)?, 1);
    assert_eq!(backups.list()?, vec![new]);
    assert_eq!(count_backup_files(backups.dir(), ".json.gz"), 1);

    Ok(())
}

// Should bring every collection back to its state at snapshot time
#[test]
fn restore_returns_the_snapshotted_state() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let service = open(&temp_dir);
    service.put(CollectionName::Users, obj(json!({"alice": {"email": "a@x.com"}})))?;
    service.put(
        CollectionName::Guesses,
        obj(json!({"alice": {"cs-f111": {"midsem": 75}}})),
    )?;
    let id = service.snapshot()?;

    service.put(CollectionName::Users, obj(json!({"bob": {}})))?;
    service.put(CollectionName::Results, obj(json!({"cs-f111": {"midsem": 70}})))?;

    service.restore(&id)?;
    assert_eq!(service.get(CollectionName::Users), obj(json!({"alice": {"email": "a@x.com"}})));
    assert_eq!(service.get(CollectionName::Guesses).len(), 1);
    assert!(service.get(CollectionName::Results).is_empty());

    let unknown = "backup_19990101_000000_000000000".parse()?;
    assert!(matches!(
        service.restore(&unknown),
        Err(StoreError::SnapshotNotFound(_))
    ));

    Ok(())
}

// Should snapshot the replaced data, so a restore can itself be undone
#[test]
fn restore_keeps_the_replaced_state() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let service = open(&temp_dir);
    service.put(CollectionName::Users, obj(json!({"alice": {}})))?;
    let id = service.snapshot()?;
    service.put(CollectionName::Users, obj(json!({"bob": {}})))?;

    let previous = service.restore(&id)?;

    assert_eq!(service.get(CollectionName::Users), obj(json!({"alice": {}})));
    assert_eq!(service.list_snapshots()?, vec![previous.clone(), id]);
    let backups = BackupManager::new(service.config().backup_dir(), 10)?;
    assert_eq!(
        backups.read(&previous)?.collection(CollectionName::Users),
        &obj(json!({"alice": {}, "bob": {}}))
    );

    service.restore(&previous)?;
    assert_eq!(service.get(CollectionName::Users).len(), 2);

    Ok(())
}

// Should never lose a write acknowledged while a clear is in progress: it is either in the
// snapshot taken by the clear or still in the store afterwards
#[test]
fn clear_all_never_drops_an_acknowledged_write() -> Result<()> {
    for _ in 0..10 {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let service = open(&temp_dir);

        let (acked, cleared) = scope(|s| {
            let writer = s.spawn(|_| {
                let mut acked = Vec::new();
                for i in 0..200 {
                    let key = format!("k{}", i);
                    let delta = obj(json!({ key.clone(): {} }));
                    if service.put(CollectionName::Users, delta).is_ok() {
                        acked.push(key);
                    }
                }
                acked
            });
            thread::sleep(Duration::from_millis(5));
            let cleared = service.clear_all();
            (writer.join().unwrap(), cleared)
        })
        .unwrap();

        let id = cleared?;
        let backups = BackupManager::new(service.config().backup_dir(), 10)?;
        let snapshot = backups.read(&id)?;
        let before = snapshot.collection(CollectionName::Users);
        let after = service.get(CollectionName::Users);
        let lost: Vec<_> = acked
            .iter()
            .filter(|key| !before.contains_key(*key) && !after.contains_key(*key))
            .collect();
        assert!(lost.is_empty(), "writes lost by the clear: {:?}", lost);
    }

    Ok(())
}

// Should leave every collection untouched when the snapshot preceding a clear fails
#[test]
fn clear_is_aborted_when_the_snapshot_fails() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let service = open(&temp_dir);
    service.put(CollectionName::Users, obj(json!({"alice": {}})))?;
    service.put(
        CollectionName::Guesses,
        obj(json!({"alice": {"cs-f111": {"midsem": 75}}})),
    )?;

    // a plain file where the backup directory should be makes every snapshot write fail
    let backup_dir = service.config().backup_dir();
    fs::remove_dir_all(&backup_dir)?;
    fs::write(&backup_dir, b"not a directory")?;

    assert!(service.clear_all().is_err());
    assert!(service.restart_competition().is_err());

    assert_eq!(service.get(CollectionName::Users).len(), 1);
    assert_eq!(service.get(CollectionName::Guesses).len(), 1);
    let files = FileStore::open(temp_dir.path())?;
    assert_eq!(files.load(CollectionName::Users)?.len(), 1);
    assert_eq!(files.load(CollectionName::Guesses)?.len(), 1);

    Ok(())
}

// Should take a snapshot of the data before clearing everything
#[test]
fn clear_all_snapshots_first() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let service = open(&temp_dir);
    service.put(CollectionName::Users, obj(json!({"alice": {}})))?;
    service.put(CollectionName::Results, obj(json!({"cs-f111": {"midsem": 70}})))?;

    let id = service.clear_all()?;

    for name in CollectionName::ALL.iter() {
        assert!(service.get(*name).is_empty(), "{} should be empty", name);
    }
    let backups = BackupManager::new(service.config().backup_dir(), 10)?;
    let snapshot = backups.read(&id)?;
    assert_eq!(snapshot.collection(CollectionName::Users).len(), 1);
    assert_eq!(snapshot.collection(CollectionName::Results).len(), 1);

    Ok(())
}

// Should keep registered users when restarting the competition
#[test]
fn restart_keeps_users() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let service = open(&temp_dir);
    service.put(CollectionName::Users, obj(json!({"alice": {}})))?;
    service.put(
        CollectionName::Guesses,
        obj(json!({"alice": {"cs-f111": {"midsem": 75}}})),
    )?;
    service.put(CollectionName::Results, obj(json!({"cs-f111": {"midsem": 70}})))?;

    service.restart_competition()?;

    assert_eq!(service.get(CollectionName::Users).len(), 1);
    assert!(service.get(CollectionName::Guesses).is_empty());
    assert!(service.get(CollectionName::Results).is_empty());
    assert_eq!(service.list_snapshots()?.len(), 1);

    Ok(())
}

// Should run triggered backups in the background and finish them before shutting down
#[test]
fn triggered_backup_runs_in_the_background() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let service = open(&temp_dir);
    service.put(CollectionName::Users, obj(json!({"alice": {}})))?;

    service.trigger_backup()?;
    service.trigger_export()?;
    service.shutdown();

    assert_eq!(service.list_snapshots()?.len(), 1);
    assert!(service.pending_tasks().is_empty());
    let exports = fs::read_dir(service.config().export_dir())?.count();
    assert_eq!(exports, 3);

    assert!(matches!(
        service.trigger_backup(),
        Err(StoreError::BackgroundTask(_))
    ));

    Ok(())
}

// Should fire the recurring backup on its own
#[test]
fn periodic_backup_fires() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let service = open(&temp_dir);

    service.start_periodic_backups(Duration::from_millis(50))?;
    std::thread::sleep(Duration::from_millis(400));
    service.shutdown();

    assert!(!service.list_snapshots()?.is_empty());

    Ok(())
}

// Should deny a client over its quota with a retryable error, while other clients go through
#[test]
fn quota_is_enforced_per_client() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let mut config = StoreConfig::new(temp_dir.path());
    config
        .quotas
        .insert(OperationClass::Stats, Quota::new(2, Duration::from_secs(60)));
    let service = Service::open(config)?;

    service.admit("10.0.0.1", OperationClass::Stats)?;
    service.admit("10.0.0.1", OperationClass::Stats)?;
    let denied = service.admit("10.0.0.1", OperationClass::Stats).unwrap_err();
    assert!(denied.is_retryable());
    assert!(matches!(denied, StoreError::QuotaExceeded { .. }));

    service.admit("10.0.0.2", OperationClass::Stats)?;
    service.admit("10.0.0.1", OperationClass::UsersWrite)?;

    Ok(())
}

// Should report per-collection health and compute reports from the live collections
#[test]
fn reports_follow_the_live_collections() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let service = open(&temp_dir);
    service.cache().warm()?;
    service.put(CollectionName::Users, obj(json!({"alice": {}, "bob": {}})))?;
    service.put(
        CollectionName::Guesses,
        obj(json!({
            "alice": {"cs-f111": {"midsem": 75.4, "compre": 80}},
            "bob": {"cs-f111": {"midsem": 70}},
        })),
    )?;
    service.put(
        CollectionName::Results,
        obj(json!({"cs-f111": {"midsem": 74.5}})),
    )?;

    let stats = service.stats();
    assert_eq!(stats.total_users, 2);
    assert_eq!(stats.total_predictions, 3);
    assert_eq!(stats.results_set, 1);

    let winners = service.compute_winners();
    let names: Vec<_> = winners
        .iter()
        .filter(|row| row.winner)
        .map(|row| row.client)
        .collect();
    assert_eq!(names, vec!["alice".to_string()]);
    // a second pass sees the same rows
    assert_eq!(winners.iter().count(), 2);

    let health = service.health();
    assert!(health.files_present.values().all(|present| *present));
    assert_eq!(health.cached_keys[&CollectionName::Users], 2);
    assert_eq!(health.snapshots, 0);

    Ok(())
}
