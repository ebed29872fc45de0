//! Tests for StorageFactory
//!
//! These tests verify:
//! - Config validation and data directory creation
//! - Map name validation and file layout
//! - Single ownership of a map's files
//! - Deleting a map's files
//! - Raw log and index access by name

use durablemap::config::SyncStrategy;
use durablemap::{Config, DurableError, DurableMap, StorageFactory, Utf8Descriptor};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_factory() -> (TempDir, StorageFactory) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path().join("data"))
        .sync_strategy(SyncStrategy::Manual)
        .index_segment_size(4096)
        .build();
    let factory = StorageFactory::new(config).unwrap();
    (temp_dir, factory)
}

fn open_map(factory: &StorageFactory, name: &str) -> DurableMap<Utf8Descriptor, Utf8Descriptor> {
    factory.open_map(name, Utf8Descriptor, Utf8Descriptor).unwrap()
}

// =============================================================================
// Construction
// =============================================================================

#[test]
fn test_creates_data_dir() {
    let (temp, factory) = setup_factory();
    assert!(temp.path().join("data").is_dir());
    assert_eq!(factory.config().index_segment_size, 4096);
}

#[test]
fn test_invalid_config_rejected() {
    let temp = TempDir::new().unwrap();

    let bad_segment = Config::builder()
        .data_dir(temp.path())
        .index_segment_size(3000)
        .build();
    assert!(matches!(
        StorageFactory::new(bad_segment),
        Err(DurableError::Config(_))
    ));

    let bad_sync = Config::builder()
        .data_dir(temp.path())
        .sync_strategy(SyncStrategy::EveryNWrites { count: 0 })
        .build();
    assert!(matches!(
        StorageFactory::new(bad_sync),
        Err(DurableError::Config(_))
    ));

    let bad_capacity = Config::builder()
        .data_dir(temp.path())
        .values_chunk_capacity(0)
        .build();
    assert!(matches!(
        StorageFactory::new(bad_capacity),
        Err(DurableError::Config(_))
    ));
}

// =============================================================================
// Names and Layout
// =============================================================================

#[test]
fn test_paths_layout() {
    let (temp, factory) = setup_factory();
    let paths = factory.paths("users").unwrap();
    let dir = temp.path().join("data");

    assert_eq!(paths.log, dir.join("users.log"));
    assert_eq!(paths.index, dir.join("users.hash"));
    assert_eq!(paths.lock, dir.join("users.lock"));
}

#[test]
fn test_invalid_names_rejected() {
    let (_temp, factory) = setup_factory();
    for name in ["", ".", "..", "a/b", "a\\b", "nul\0byte"] {
        assert!(
            matches!(factory.paths(name), Err(DurableError::Usage(_))),
            "name {:?} should be rejected",
            name
        );
    }
    assert!(factory.paths("orders-2024.v2").is_ok());
}

#[test]
fn test_maps_are_independent() {
    let (_temp, factory) = setup_factory();
    let users = open_map(&factory, "users");
    let orders = open_map(&factory, "orders");

    users.put(&"id".to_string(), &"alice".to_string()).unwrap();
    orders.put(&"id".to_string(), &"order-1".to_string()).unwrap();

    assert_eq!(users.get(&"id".to_string()).unwrap(), Some("alice".to_string()));
    assert_eq!(orders.get(&"id".to_string()).unwrap(), Some("order-1".to_string()));
}

// =============================================================================
// Ownership
// =============================================================================

#[test]
fn test_map_opened_twice_is_locked() {
    let (_temp, factory) = setup_factory();
    let first = open_map(&factory, "shared");

    assert!(matches!(
        factory.open_map("shared", Utf8Descriptor, Utf8Descriptor),
        Err(DurableError::Locked(_))
    ));
    assert!(matches!(
        factory.open_values_map("shared", Utf8Descriptor, Utf8Descriptor),
        Err(DurableError::Locked(_))
    ));

    drop(first);
    assert!(factory.open_map("shared", Utf8Descriptor, Utf8Descriptor).is_ok());
}

#[test]
fn test_delete_files() {
    let (_temp, factory) = setup_factory();
    let paths = factory.paths("doomed").unwrap();
    {
        let map = open_map(&factory, "doomed");
        map.put(&"k".to_string(), &"v".to_string()).unwrap();

        // Cannot delete while open
        assert!(matches!(
            factory.delete_files("doomed"),
            Err(DurableError::Locked(_))
        ));
        map.close().unwrap();
    }

    factory.delete_files("doomed").unwrap();
    assert!(!paths.log.exists());
    assert!(!paths.index.exists());
    assert!(!paths.lock.exists());

    // Deleting a map that does not exist is fine
    factory.delete_files("doomed").unwrap();

    let map = open_map(&factory, "doomed");
    assert!(map.is_empty());
}

// =============================================================================
// Raw Access
// =============================================================================

#[test]
fn test_open_raw_log_and_index() {
    let (_temp, factory) = setup_factory();

    let log = factory.open_log("raw").unwrap();
    let id = log.append_fixed(b"payload", false).unwrap().id();
    log.close().unwrap();

    let mut index = factory.open_index("raw").unwrap();
    index.put(99, id).unwrap();
    index.close().unwrap();

    let log = factory.open_log("raw").unwrap();
    let index = factory.open_index("raw").unwrap();
    let found = index.get(99).unwrap();
    assert_eq!(&log.read(found).unwrap().read().unwrap()[..], b"payload");
    assert_eq!(index.segment_size(), 4096);
}
