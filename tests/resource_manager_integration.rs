//! Integration tests for the resource manager with real buffers.

use purgemem::{ManagerConfig, PageTableMode, PurgeableBuffer, ResourceManager};
use std::sync::Arc;

fn buffer(fill: u8) -> Arc<PurgeableBuffer> {
    Arc::new(PurgeableBuffer::with_page_table_mode(
        64,
        Box::new(move |data: &mut [u8]| {
            data.fill(fill);
            true
        }),
        PageTableMode::Emulated,
    ))
}

fn manager(capacity: usize) -> ResourceManager {
    ResourceManager::new(ManagerConfig {
        pool_size: 4,
        lru_capacity: capacity,
    })
}

#[test]
fn test_capacity_one_pins_evicted() {
    let manager = manager(200);
    manager.set_lru_cache_capacity(1).unwrap();

    let (a, b) = (buffer(1), buffer(2));
    manager.add_resource(a.clone());
    manager.wait_idle();
    manager.add_resource(b.clone());
    manager.wait_idle();

    assert_eq!(manager.lru_ids(), vec![b.id()]);
    assert!(!manager.contains(a.id()));
    assert_eq!(a.pin_status(), 1);
    assert_eq!(b.pin_status(), 0);

    // A pinned buffer keeps its pages through reclaim.
    drop(a.read().unwrap());
    assert_eq!(a.reclaim_unpinned(), 0);
    drop(b.read().unwrap());
    assert_eq!(b.reclaim_unpinned(), 1);
}

#[test]
fn test_evicted_buffer_stays_pinned_across_resize() {
    let manager = manager(1);
    let (a, b) = (buffer(1), buffer(2));
    manager.add_resource(a.clone());
    manager.wait_idle();
    manager.add_resource(b.clone());
    manager.wait_idle();
    assert_eq!(a.pin_status(), 1);

    a.resize_data(64).unwrap();
    assert_eq!(a.read().unwrap()[0], 1);
    assert_eq!(a.pin_status(), 1);
    assert_eq!(a.reclaim_unpinned(), 0);
}

#[test]
fn test_keeps_most_recent_in_order() {
    let manager = manager(3);
    let buffers: Vec<_> = (0..6).map(buffer).collect();
    for b in &buffers {
        manager.add_resource(b.clone());
        manager.wait_idle();
    }

    let expected: Vec<_> = buffers[3..].iter().rev().map(|b| b.id()).collect();
    assert_eq!(manager.lru_ids(), expected);
    for b in &buffers[..3] {
        assert!(b.pin_status() > 0);
    }
    for b in &buffers[3..] {
        assert_eq!(b.pin_status(), 0);
    }

    manager.set_recent_used_resource(&*buffers[3]);
    assert_eq!(manager.lru_ids()[0], buffers[3].id());
    assert_eq!(manager.stats().evictions, 3);
}

#[test]
fn test_remove_resource_fails_future_access() {
    let manager = manager(10);
    let a = buffer(9);
    manager.add_resource(a.clone());
    manager.wait_idle();

    manager.remove_resource(a.clone());
    assert!(!a.is_data_valid());
    assert!(!a.begin_read());
    assert!(a.write().is_none());

    manager.wait_idle();
    assert!(manager.is_empty());
}

#[test]
fn test_bulk_access_keeps_buffers_resident() {
    let manager = manager(10);
    let buffers: Vec<_> = (0..4).map(buffer).collect();
    for b in &buffers {
        manager.add_resource(b.clone());
    }
    manager.wait_idle();

    assert_eq!(manager.begin_access_purgeable_mem(), 4);
    for b in &buffers {
        assert_eq!(b.pin_status(), 1);
        assert_eq!(b.rebuild_count(), 1);
        assert_eq!(b.reclaim_unpinned(), 0);
    }

    assert_eq!(manager.end_access_purgeable_mem(), 4);
    for b in &buffers {
        assert_eq!(b.pin_status(), 0);
        assert_eq!(b.reclaim_unpinned(), 1);
    }

    // Next pass rebuilds what was reclaimed.
    assert_eq!(manager.begin_access_purgeable_mem(), 4);
    assert!(buffers.iter().all(|b| b.rebuild_count() == 2));
    assert_eq!(manager.end_access_purgeable_mem(), 4);
}

#[test]
fn test_bulk_access_on_empty_manager() {
    let manager = manager(10);
    assert_eq!(manager.begin_access_purgeable_mem(), 0);
    assert_eq!(manager.end_access_purgeable_mem(), 0);
}

#[test]
fn test_remove_last_resource() {
    let manager = manager(10);
    let (a, b) = (buffer(1), buffer(2));
    manager.add_resource(a.clone());
    manager.wait_idle();
    manager.add_resource(b.clone());
    manager.wait_idle();

    assert_eq!(manager.remove_last_resource(), Some(a.id()));
    assert_eq!(a.pin_status(), 1);
    assert_eq!(manager.lru_ids(), vec![b.id()]);

    manager.clear();
    assert_eq!(manager.remove_last_resource(), None);
}

#[test]
fn test_config_from_lookup_drives_manager() {
    let config = ManagerConfig::from_lookup(|key| match key {
        "PURGEABLE_LRU_CACHE_CAPACITY" => Some("2".to_string()),
        "PURGEABLE_THREAD_POOL_TASK_NUM" => Some("999".to_string()),
        _ => None,
    });
    assert_eq!(config.pool_size, 4);

    let manager = ResourceManager::new(config);
    assert_eq!(manager.lru_capacity(), 2);
}
