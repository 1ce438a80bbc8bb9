//! Content manager integration tests

mod common;

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use mapcontent::digest::sha1_bytes;
use mapcontent::prefs::{ActivationPointer, Preferences};
use mapcontent::storage::obsolete_marker;
use mapcontent::{Config, ContentError, GeoPoint, KeyValueStore};
use tokio_util::sync::CancellationToken;

fn storage_files(root: &std::path::Path) -> Vec<PathBuf> {
    match fs::read_dir(root.join("storage")) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn test_download_round_trip() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    let local = fixture.download(&manager, "karelia.tmap");

    let hash = sha1_bytes(KARELIA.as_bytes());
    assert_eq!(local.hash, hash);
    assert_eq!(
        local.local_path().unwrap(),
        fixture.root().join("storage").join(format!("{hash}.tmap"))
    );
    assert_eq!(manager.local_items().len(), 1);

    // A fresh manager over the same root sees the same item
    drop(manager);
    let manager = fixture.manager();
    let items = manager.local_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "karelia.tmap");
    assert_eq!(items[0].content_type, TEST_MAP);
    assert_eq!(items[0].hash, hash);
}

#[test]
fn test_download_skips_already_stored_hash() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    let first = fixture.download(&manager, "karelia.tmap");

    // The package body disappears remotely, the catalog entry stays
    fixture
        .transport
        .remove("https://maps.example/pkg/karelia.tmap");
    let second = fixture.download(&manager, "karelia.tmap");

    assert_eq!(first, second);
}

#[test]
fn test_wrong_hash_leaves_nothing_behind() {
    let mut fixture = Fixture::new();
    fixture.publish_as("karelia.tmap", KARELIA, &sha1_bytes(b"tampered"));

    let manager = fixture.manager();
    manager
        .refresh_remote_content_list(&[ROOT_URL.to_string()])
        .unwrap();
    let remote = manager.remote_items()[0].clone();

    let err = manager
        .download_content_item(&remote, None, CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, ContentError::HashMismatch { .. }));

    assert!(storage_files(&fixture.root()).is_empty());
    assert!(manager.local_items().is_empty());
}

#[test]
fn test_cancelled_download_leaves_nothing_behind() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    manager
        .refresh_remote_content_list(&[ROOT_URL.to_string()])
        .unwrap();
    let remote = manager.remote_items()[0].clone();

    let token = CancellationToken::new();
    token.cancel();
    let err = manager
        .download_content_item(&remote, None, token)
        .unwrap_err();
    assert!(matches!(err, ContentError::Cancelled));
    assert!(storage_files(&fixture.root()).is_empty());
}

#[test]
fn test_gzip_download_reports_progress() {
    let fixture = Fixture::new();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(KARELIA.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    fixture
        .transport
        .insert("https://maps.example/pkg/karelia.tmap", compressed.clone());
    fixture.transport.insert(
        ROOT_URL,
        serde_json::json!({
            "items": [{
                "name": "karelia.tmap",
                "type": TEST_MAP,
                "hash": sha1_bytes(KARELIA.as_bytes()).to_uppercase(),
                "url": "pkg/karelia.tmap",
                "size": compressed.len(),
                "compression": "gzip",
            }]
        })
        .to_string(),
    );

    let manager = fixture.manager();
    manager
        .refresh_remote_content_list(&[ROOT_URL.to_string()])
        .unwrap();
    let remote = manager.remote_items()[0].clone();

    let reports = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = reports.clone();
    let local = manager
        .download_content_item(
            &remote,
            Some(Arc::new(move |current, max| sink.lock().push((current, max)))),
            CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(fs::read_to_string(local.local_path().unwrap()).unwrap(), KARELIA);
    let reports = reports.lock();
    assert!(!reports.is_empty());
    assert_eq!(
        reports.last().copied(),
        Some((compressed.len() as u64, compressed.len() as u64))
    );
}

#[test]
fn test_unpack_is_idempotent_and_gates_activation() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    let local = fixture.download(&manager, "karelia.tmap");

    assert_eq!(manager.activate_content_item(&local).unwrap(), None);

    let first = manager.unpack_content_item(&local).unwrap();
    let second = manager.unpack_content_item(&local).unwrap();
    assert_eq!(first, second);
    assert_eq!(unpacks(&fixture), 1);
    assert!(first.join("dataset").is_file());

    let active = manager.activate_content_item(&local).unwrap();
    assert_eq!(active.as_ref(), Some(&first));
    assert_eq!(manager.active_unpacked(TEST_MAP).unwrap(), Some(first));
    assert_eq!(
        manager.active_package(TEST_MAP).unwrap().as_deref(),
        local.local_path()
    );
}

#[test]
fn test_failed_unpack_is_surfaced_and_retried() {
    let mut fixture = Fixture::new();
    fixture.publish("broken.tmap", BROKEN);

    let manager = fixture.manager();
    let local = fixture.download(&manager, "broken.tmap");

    let err = manager.unpack_content_item(&local).unwrap_err();
    assert!(matches!(err, ContentError::Extraction { .. }));
    assert_eq!(manager.activate_content_item(&local).unwrap(), None);

    // No marker, so the next attempt extracts again
    assert!(manager.unpack_content_item(&local).is_err());
    assert_eq!(unpacks(&fixture), 2);

    // The partial directory is reclaimed by GC
    let report = manager.garbage_collect().unwrap();
    assert_eq!(report.removed_unpacked, 1);
    assert_eq!(
        fs::read_dir(fixture.root().join("unpacked")).unwrap().count(),
        0
    );
}

#[test]
fn test_gc_preserves_active_and_reclaims_the_rest() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);
    fixture.publish("moscow.tmap", MOSCOW);

    let manager = fixture.manager();
    let karelia = fixture.download(&manager, "karelia.tmap");
    let moscow = fixture.download(&manager, "moscow.tmap");

    let karelia_unpacked = manager.unpack_content_item(&karelia).unwrap();
    manager.activate_content_item(&karelia).unwrap();
    let moscow_unpacked = manager.unpack_content_item(&moscow).unwrap();

    assert!(manager.delete_content_item(&moscow));
    assert_eq!(manager.local_items().len(), 1);

    let report = manager.garbage_collect().unwrap();
    assert_eq!(report.removed_unpacked, 1);
    assert_eq!(report.removed_packages, 1);
    assert!(report.deactivated.is_empty());

    assert!(karelia.local_path().unwrap().exists());
    assert!(karelia_unpacked.exists());
    assert!(!moscow.local_path().unwrap().exists());
    assert!(!moscow_unpacked.exists());
    assert_eq!(manager.local_items().len(), 1);
}

#[test]
fn test_gc_keeps_downloaded_but_inactive_packages() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    let karelia = fixture.download(&manager, "karelia.tmap");

    let report = manager.garbage_collect().unwrap();
    assert_eq!(report.removed_packages, 0);
    assert!(karelia.local_path().unwrap().exists());
}

#[test]
fn test_gc_tears_down_obsolete_activation() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    let karelia = fixture.download(&manager, "karelia.tmap");
    let unpacked = manager.unpack_content_item(&karelia).unwrap();
    manager.activate_content_item(&karelia).unwrap();

    assert!(manager.delete_content_item(&karelia));
    assert!(obsolete_marker(karelia.local_path().unwrap()).exists());
    // Still active until the next collection
    assert!(unpacked.exists());

    let report = manager.garbage_collect().unwrap();
    assert_eq!(report.deactivated, vec![TEST_MAP.to_string()]);
    assert!(!unpacked.exists());
    assert!(!karelia.local_path().unwrap().exists());
    assert_eq!(manager.active_unpacked(TEST_MAP).unwrap(), None);
}

#[test]
fn test_delete_of_foreign_item_fails() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    manager
        .refresh_remote_content_list(&[ROOT_URL.to_string()])
        .unwrap();
    let remote = manager.remote_items()[0].clone();

    assert!(!manager.delete_content_item(&remote));
}

#[test]
fn test_migration_history_never_contains_current_root() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    fixture.download(&manager, "karelia.tmap");

    let prefs = Preferences::new(fixture.prefs.clone());
    let a = fixture.root();
    let b = fixture.dir.path().join("b");
    let c = fixture.dir.path().join("c");

    for target in [&b, &c, &a, &b, &b] {
        manager.migrate(target).unwrap();
        assert_eq!(&manager.storage_root(), target);
        let history = prefs.migration_history().unwrap();
        assert!(!history.contains(&manager.storage_root()));
    }

    assert_eq!(prefs.storage_root().unwrap(), Some(b.clone()));
    let items = manager.local_items();
    assert_eq!(items.len(), 1);
    assert!(items[0].local_path().unwrap().starts_with(&b));

    // A restarted manager picks up the migrated root
    drop(manager);
    let manager = fixture.manager();
    assert_eq!(manager.storage_root(), b);
}

#[test]
fn test_gc_reclaims_former_roots_without_active_data() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);
    fixture.publish("moscow.tmap", MOSCOW);

    let manager = fixture.manager();
    let karelia = fixture.download(&manager, "karelia.tmap");
    fixture.download(&manager, "moscow.tmap");
    manager.unpack_content_item(&karelia).unwrap();
    let first_active = manager.activate_content_item(&karelia).unwrap().unwrap();

    let first = fixture.root();
    let second = fixture.dir.path().join("second");
    let third = fixture.dir.path().join("third");
    manager.migrate(&second).unwrap();

    // A pointer still naming the first root keeps it alive
    let prefs = Preferences::new(fixture.prefs.clone());
    let moved = prefs.activation(TEST_MAP).unwrap().unwrap();
    assert!(moved.unpacked.starts_with(&second));
    prefs
        .set_activation(
            TEST_MAP,
            &ActivationPointer {
                package: karelia.local_path().unwrap().to_path_buf(),
                unpacked: first_active.clone(),
            },
        )
        .unwrap();

    let report = manager.garbage_collect().unwrap();
    assert!(report.removed_roots.is_empty());
    assert!(first_active.exists());
    assert_eq!(prefs.migration_history().unwrap(), vec![first.clone()]);

    // Once the dataset is re-activated in the current root, both former roots go
    let karelia = manager
        .local_items()
        .iter()
        .find(|i| i.name == "karelia.tmap")
        .cloned()
        .unwrap();
    assert_eq!(manager.unpack_content_item(&karelia).unwrap(), moved.unpacked);
    manager.activate_content_item(&karelia).unwrap().unwrap();
    manager.migrate(&third).unwrap();

    let report = manager.garbage_collect().unwrap();
    assert_eq!(report.removed_roots, vec![first.clone(), second.clone()]);
    assert!(!first.exists());
    assert!(!second.exists());
    assert!(prefs.migration_history().unwrap().is_empty());

    let active = manager.active_unpacked(TEST_MAP).unwrap().unwrap();
    assert!(active.starts_with(&third));
    assert!(active.join("dataset").is_file());
    // Only the active dataset survives in the current root
    assert_eq!(fs::read_dir(third.join("unpacked")).unwrap().count(), 1);
}

#[test]
fn test_active_dataset_follows_migration_and_can_be_torn_down() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    let local = fixture.download(&manager, "karelia.tmap");
    manager.unpack_content_item(&local).unwrap();
    manager.activate_content_item(&local).unwrap().unwrap();

    let target = fixture.dir.path().join("moved");
    manager.migrate(&target).unwrap();

    let active = manager.active_unpacked(TEST_MAP).unwrap().unwrap();
    assert!(active.starts_with(&target));
    assert!(active.join("dataset").is_file());
    assert!(manager
        .active_package(TEST_MAP)
        .unwrap()
        .unwrap()
        .starts_with(&target));

    let item = manager.local_items()[0].clone();
    assert!(manager.delete_content_item(&item));

    let report = manager.garbage_collect().unwrap();
    assert_eq!(report.deactivated, vec![TEST_MAP.to_string()]);
    assert_eq!(report.removed_roots, vec![fixture.root()]);
    assert!(!active.exists());
    assert!(manager.active_unpacked(TEST_MAP).unwrap().is_none());
    assert!(manager.local_items().is_empty());
    assert!(storage_files(&target).is_empty());
}

#[test]
fn test_download_racing_migration_lands_in_new_root() {
    let fixture = Fixture::new();
    let (transport, release, opened) = GatedTransport::new(KARELIA);
    let manager = Arc::new(fixture.manager_with_transport(transport));

    let downloader = {
        let manager = manager.clone();
        let remote = remote_item("karelia.tmap", KARELIA);
        thread::spawn(move || manager.download_content_item(&remote, None, CancellationToken::new()))
    };
    // The package stream is open and parked on the gate
    opened.recv().unwrap();

    let target = fixture.dir.path().join("moved");
    let migrator = {
        let manager = manager.clone();
        let target = target.clone();
        thread::spawn(move || manager.migrate(&target))
    };
    thread::sleep(Duration::from_millis(100));
    release.send(()).unwrap();

    let local = downloader.join().unwrap().unwrap();
    migrator.join().unwrap().unwrap();
    assert_eq!(manager.storage_root(), target);

    manager.garbage_collect().unwrap();
    assert!(!fixture.root().exists());

    let items = manager.local_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].hash, local.hash);
    let package = items[0].local_path().unwrap();
    assert!(package.starts_with(&target));
    assert_eq!(fs::read(package).unwrap(), KARELIA.as_bytes());
}

#[test]
fn test_failed_migration_rolls_back() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    fixture.download(&manager, "karelia.tmap");

    // A file where the target directory should be
    let blocked = fixture.dir.path().join("blocked");
    fs::write(&blocked, b"not a directory").unwrap();

    let err = manager.migrate(&blocked).unwrap_err();
    assert!(matches!(err, ContentError::Migration(_)));
    assert_eq!(manager.storage_root(), fixture.root());
    assert_eq!(fs::read(&blocked).unwrap(), b"not a directory");
    assert!(Preferences::new(fixture.prefs.clone())
        .migration_history()
        .unwrap()
        .is_empty());

    let nested = fixture.root().join("inside");
    assert!(matches!(
        manager.migrate(&nested),
        Err(ContentError::Migration(_))
    ));
}

#[test]
fn test_find_by_region_cached_or_extracted() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);
    fixture.publish("moscow.tmap", MOSCOW);
    fixture.publish("world.tmap", EVERYWHERE);

    let manager = fixture.manager();
    for name in ["karelia.tmap", "moscow.tmap", "world.tmap"] {
        fixture.download(&manager, name);
    }

    let point = GeoPoint::new(61.78, 34.35);
    let names = |items: Vec<mapcontent::ContentItem>| {
        let mut names: Vec<String> = items.into_iter().map(|i| i.name).collect();
        names.sort();
        names
    };

    // First lookup extracts from the packages, second hits the cache
    let extracted = names(manager.find_content_items_by_region(point));
    assert!(manager.regions().get_region("karelia.tmap").is_some());
    let cached = names(manager.find_content_items_by_region(point));

    assert_eq!(extracted, vec!["karelia.tmap", "world.tmap"]);
    assert_eq!(cached, extracted);

    let moscow = names(manager.find_content_items_by_region(GeoPoint::new(55.75, 37.62)));
    assert_eq!(moscow, vec!["moscow.tmap", "world.tmap"]);
}

#[test]
fn test_suggested_items_use_catalog_regions() {
    let fixture = Fixture::new();
    fixture.transport.insert(
        ROOT_URL,
        serde_json::json!({
            "items": [
                {
                    "name": "karelia.tmap", "type": TEST_MAP, "hash": "aa",
                    "url": "pkg/karelia.tmap", "region_id": "karelia", "region": KARELIA
                },
                {
                    "name": "moscow.tmap", "type": TEST_MAP, "hash": "bb",
                    "url": "pkg/moscow.tmap", "region_id": "moscow", "region": MOSCOW
                },
                {
                    "name": "unknown.bin", "type": "unknown", "hash": "cc",
                    "url": "pkg/unknown.bin"
                }
            ]
        })
        .to_string(),
    );

    let manager = fixture.manager();
    let remote = manager
        .refresh_remote_content_list(&[ROOT_URL.to_string()])
        .unwrap();
    assert_eq!(remote.len(), 2);

    let suggested = manager.find_suggested_items(GeoPoint::new(61.78, 34.35));
    assert_eq!(suggested.len(), 1);
    assert_eq!(suggested[0].name, "karelia.tmap");
}

#[test]
fn test_check_updates() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    assert!(!manager.check_updates());

    fixture.download(&manager, "karelia.tmap");
    assert!(!manager.check_updates());

    // Same name, new content
    fixture.publish("karelia.tmap", MOSCOW);
    // A remote-only item never counts
    fixture.publish("other.tmap", KARELIA);
    manager
        .refresh_remote_content_list(&[ROOT_URL.to_string()])
        .unwrap();
    assert!(manager.check_updates());
}

#[test]
fn test_check_updates_false_on_empty_remote() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    fixture.download(&manager, "karelia.tmap");

    fixture.catalog.clear();
    fixture.write_catalog();
    manager
        .refresh_remote_content_list(&[ROOT_URL.to_string()])
        .unwrap();
    assert!(manager.remote_items().is_empty());
    assert!(!manager.check_updates());
}

#[test]
fn test_second_catalog_root_used_when_first_unreachable() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);
    fixture.publish("moscow.tmap", MOSCOW);

    let manager = fixture.manager();
    let remote = manager
        .refresh_remote_content_list(&[
            "https://offline.example/root.json".to_string(),
            ROOT_URL.to_string(),
        ])
        .unwrap();
    assert_eq!(remote.len(), 2);

    let err = manager
        .refresh_remote_content_list(&["https://offline.example/root.json".to_string()])
        .unwrap_err();
    assert!(matches!(err, ContentError::NetworkUnavailable));
    // The previous snapshot survives a failed refresh
    assert_eq!(manager.remote_items().len(), 2);
}

#[test]
fn test_additional_storages_are_listed_and_failures_skipped() {
    let fixture = Fixture::new();
    let extra = fixture.dir.path().join("extra");
    fs::create_dir_all(&extra).unwrap();
    fs::write(extra.join("sideloaded.tmap"), KARELIA).unwrap();

    let config = Config {
        additional_storage_dirs: vec![extra.clone(), fixture.dir.path().join("missing")],
        ..fixture.config()
    };
    let manager = fixture.manager_with(config);

    let items = manager.local_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "sideloaded.tmap");
    assert_eq!(items[0].region_id.as_deref(), Some("sideloaded"));

    // Read-only items can't be deleted through the writable storage
    assert!(!manager.delete_content_item(&items[0]));
    assert!(extra.join("sideloaded.tmap").exists());
}

#[test]
fn test_region_bundle_loaded_after_unpack_and_on_restart() {
    let mut fixture = Fixture::new();
    fixture.publish("karelia.tmap", KARELIA);

    let manager = fixture.manager();
    let karelia = fixture.download(&manager, "karelia.tmap");
    let unpacked = manager.unpack_content_item(&karelia).unwrap();
    manager.activate_content_item(&karelia).unwrap();

    // Datasets may carry finer partitions; drop one in and restart
    fs::create_dir_all(unpacked.join("regions")).unwrap();
    fs::write(unpacked.join("regions").join("moscow-oblast.poly"), MOSCOW).unwrap();

    drop(manager);
    let manager = fixture.manager();
    assert!(manager.regions().get_region("moscow-oblast").is_some());

    let disabled = Config {
        load_region_bundles: false,
        ..fixture.config()
    };
    drop(manager);
    let manager = fixture.manager_with(disabled);
    assert!(manager.regions().get_region("moscow-oblast").is_none());
}

#[test]
fn test_storage_root_persisted_on_first_start() {
    let fixture = Fixture::new();
    let manager = fixture.manager();

    assert_eq!(
        fixture.prefs.get("storage-root-path").unwrap(),
        Some(fixture.root().to_string_lossy().to_string())
    );
    assert!(manager.storage_root().is_absolute());
}
