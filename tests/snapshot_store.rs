use std::collections::BTreeMap;
use std::fs;

use tempfile::TempDir;

use telemd::{
    ActiveConfigRecord, ActiveConfigsSnapshot, ActiveMetricRecord, AlertMetadataRecord,
    ConfigKey, ConfigMetadataRecord, DumpReason, FileSnapshotStore, MetadataSnapshot,
    SnapshotStore, StorageError, StoredReport,
};

const KEY: ConfigKey = ConfigKey::new(1000, 7);

fn active_snapshot(remaining_ttl_ns: i64) -> ActiveConfigsSnapshot {
    ActiveConfigsSnapshot {
        captured_elapsed_ns: 1_000,
        configs: vec![ActiveConfigRecord {
            key: KEY,
            metrics: vec![ActiveMetricRecord {
                metric_id: 3,
                remaining_ttl_ns,
            }],
        }],
    }
}

fn report(wall_ns: i64, count: u64) -> StoredReport {
    StoredReport {
        key: KEY,
        reason: DumpReason::DeviceShutdown,
        bucket_start_ns: wall_ns - 10,
        bucket_end_ns: wall_ns,
        wall_ns,
        counts: BTreeMap::from([(10, count)]),
    }
}

fn open_store() -> (TempDir, FileSnapshotStore) {
    let dir = TempDir::new().expect("tempdir");
    let store = FileSnapshotStore::open(dir.path().join("telemd")).expect("store opens");
    (dir, store)
}

#[test]
fn snapshots_are_consumed_once() {
    let (_dir, store) = open_store();
    let active = active_snapshot(500);
    let metadata = MetadataSnapshot {
        captured_wall_ns: 9_000,
        configs: vec![ConfigMetadataRecord {
            key: KEY,
            alerts: vec![AlertMetadataRecord {
                alert_id: 4,
                refractory_ends_wall_sec: 60,
            }],
        }],
    };
    store.write_active_configs(&active).unwrap();
    store.write_metadata(&metadata).unwrap();

    assert_eq!(store.take_active_configs().unwrap(), Some(active));
    assert_eq!(store.take_active_configs().unwrap(), None);
    assert_eq!(store.take_metadata().unwrap(), Some(metadata));
    assert_eq!(store.take_metadata().unwrap(), None);
}

#[test]
fn latest_write_wins() {
    let (_dir, store) = open_store();
    store.write_active_configs(&active_snapshot(1)).unwrap();
    store.write_active_configs(&active_snapshot(2)).unwrap();
    assert_eq!(store.take_active_configs().unwrap(), Some(active_snapshot(2)));
}

#[test]
fn tampered_payload_fails_the_checksum() {
    let (_dir, store) = open_store();
    store.write_active_configs(&active_snapshot(500)).unwrap();

    let path = store.root().join("active_configs.json");
    let text = fs::read_to_string(&path).unwrap();
    fs::write(&path, text.replace("500", "501")).unwrap();

    assert!(matches!(
        store.take_active_configs(),
        Err(StorageError::ChecksumMismatch { .. })
    ));
}

#[test]
fn failed_write_keeps_the_previous_snapshot() {
    let (_dir, store) = open_store();
    store.write_active_configs(&active_snapshot(500)).unwrap();

    // A directory squatting on the temp path makes the next write fail.
    fs::create_dir(store.root().join(".active_configs.json.tmp")).unwrap();
    assert!(matches!(
        store.write_active_configs(&active_snapshot(900)),
        Err(StorageError::Io { .. })
    ));

    assert_eq!(store.take_active_configs().unwrap(), Some(active_snapshot(500)));
}

#[test]
fn reports_are_read_taken_and_purged() {
    let (_dir, store) = open_store();
    store.write_report(&report(100, 1)).unwrap();
    store.write_report(&report(200, 2)).unwrap();
    store.write_report(&report(300, 3)).unwrap();

    let reports = store.read_reports(KEY).unwrap();
    assert_eq!(reports, vec![report(100, 1), report(200, 2), report(300, 3)]);

    assert_eq!(store.purge_reports_before(KEY, 250).unwrap(), 2);
    assert_eq!(store.take_reports(KEY).unwrap(), vec![report(300, 3)]);
    assert!(store.read_reports(KEY).unwrap().is_empty());
    assert!(store.read_reports(ConfigKey::new(1, 1)).unwrap().is_empty());
}

#[test]
fn purge_all_empties_the_store() {
    let (_dir, store) = open_store();
    store.write_active_configs(&active_snapshot(5)).unwrap();
    store.write_report(&report(100, 1)).unwrap();

    store.purge_all().unwrap();
    assert_eq!(store.take_active_configs().unwrap(), None);
    assert!(store.read_reports(KEY).unwrap().is_empty());

    store.write_report(&report(400, 4)).unwrap();
    assert_eq!(store.read_reports(KEY).unwrap().len(), 1);
    store.remove_reports(KEY).unwrap();
    assert!(store.read_reports(KEY).unwrap().is_empty());
}

#[test]
fn reports_with_the_same_timestamps_are_all_kept() {
    let (_dir, store) = open_store();
    store.write_report(&report(100, 1)).unwrap();
    store.write_report(&report(100, 2)).unwrap();

    assert_eq!(
        store.read_reports(KEY).unwrap(),
        vec![report(100, 1), report(100, 2)]
    );
}

#[test]
fn a_corrupt_report_leaves_every_report_in_place() {
    let (_dir, store) = open_store();
    store.write_report(&report(100, 1)).unwrap();
    store.write_report(&report(200, 2)).unwrap();

    let dir = store.root().join("reports").join("1000_7");
    let mut files: Vec<_> = fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    assert_eq!(files.len(), 2);
    fs::write(&files[1], "{not json").unwrap();

    assert!(store.take_reports(KEY).is_err());
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);

    fs::remove_file(&files[1]).unwrap();
    assert_eq!(store.take_reports(KEY).unwrap(), vec![report(100, 1)]);
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
}
