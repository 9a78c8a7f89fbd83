//! Configuration constants and manager settings.

use tracing::warn;

/// Size of a page in bytes (4KB).
///
/// The user-extended page table keeps one 64-bit entry per 4KB page, so this
/// is also the granularity of pin/unpin and presence tracking.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Hard ceiling on a purgeable buffer (1GB, exclusive).
pub const MAX_PURGEABLE_SIZE: usize = 1024 * 1024 * 1024;

/// Number of times the builder chain is replayed before a Begin* gives up.
pub const MAX_REBUILD_ATTEMPTS: u32 = 3;

/// Environment variable holding the worker pool size.
pub const THREAD_POOL_TASK_NUM_ENV: &str = "PURGEABLE_THREAD_POOL_TASK_NUM";

/// Environment variable holding the LRU cache capacity.
pub const LRU_CACHE_CAPACITY_ENV: &str = "PURGEABLE_LRU_CACHE_CAPACITY";

pub const DEFAULT_THREAD_POOL_TASK_NUM: usize = 4;
pub const MIN_THREAD_POOL_TASK_NUM: usize = 1;
pub const MAX_THREAD_POOL_TASK_NUM: usize = 20;

pub const DEFAULT_LRU_CACHE_CAPACITY: usize = 200;
pub const MIN_LRU_CACHE_CAPACITY: usize = 1;
pub const MAX_LRU_CACHE_CAPACITY: usize = 2000;

/// Round `val` up to a multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
pub fn round_up(val: usize, align: usize) -> Option<usize> {
    if align == 0 {
        return Some(val);
    }
    val.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Round `val` down to a multiple of `align` (a power of two).
#[inline]
pub fn round_down(val: usize, align: usize) -> usize {
    if align == 0 {
        return val;
    }
    val & !(align - 1)
}

/// Whether `size` is acceptable for a purgeable buffer.
#[inline]
pub fn is_valid_size(size: usize) -> bool {
    size > 0 && size < MAX_PURGEABLE_SIZE
}

/// Settings for the [`ResourceManager`](crate::manager::ResourceManager).
///
/// Read once, clamped to hardcoded bounds. Bad values are logged and
/// replaced by the defaults, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Number of worker threads for background cache and bulk-access tasks.
    pub pool_size: usize,
    /// Number of buffers kept in the LRU cache.
    pub lru_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_THREAD_POOL_TASK_NUM,
            lru_capacity: DEFAULT_LRU_CACHE_CAPACITY,
        }
    }
}

impl ManagerConfig {
    /// Read the settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the settings through `lookup`, which maps a key to its raw value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let pool_size = read_clamped(
            &lookup,
            THREAD_POOL_TASK_NUM_ENV,
            DEFAULT_THREAD_POOL_TASK_NUM,
            MIN_THREAD_POOL_TASK_NUM,
            MAX_THREAD_POOL_TASK_NUM,
        );
        let lru_capacity = read_clamped(
            &lookup,
            LRU_CACHE_CAPACITY_ENV,
            DEFAULT_LRU_CACHE_CAPACITY,
            MIN_LRU_CACHE_CAPACITY,
            MAX_LRU_CACHE_CAPACITY,
        );
        Self {
            pool_size,
            lru_capacity,
        }
    }

    /// Replace any field outside its range with its default.
    ///
    /// Applied to every config a manager is built from, since the fields
    /// are public and need not come from [`from_lookup`](Self::from_lookup).
    pub fn sanitized(self) -> Self {
        Self {
            pool_size: in_range_or_default(
                "pool_size",
                self.pool_size,
                DEFAULT_THREAD_POOL_TASK_NUM,
                MIN_THREAD_POOL_TASK_NUM,
                MAX_THREAD_POOL_TASK_NUM,
            ),
            lru_capacity: in_range_or_default(
                "lru_capacity",
                self.lru_capacity,
                DEFAULT_LRU_CACHE_CAPACITY,
                MIN_LRU_CACHE_CAPACITY,
                MAX_LRU_CACHE_CAPACITY,
            ),
        }
    }
}

fn in_range_or_default(field: &str, value: usize, default: usize, min: usize, max: usize) -> usize {
    if (min..=max).contains(&value) {
        return value;
    }
    warn!(field, value, min, max, default, "setting out of range, using default");
    default
}

fn read_clamped<F>(lookup: &F, key: &str, default: usize, min: usize, max: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<i64>() {
        Ok(v) if v >= min as i64 && v <= max as i64 => v as usize,
        Ok(v) => {
            warn!(key, value = v, min, max, default, "setting out of range, using default");
            default
        }
        Err(_) => {
            warn!(key, value = %raw, default, "setting is not a number, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(PAGE_SIZE.is_power_of_two());
        assert_eq!(1 << PAGE_SHIFT, PAGE_SIZE);
    }

    #[test]
    fn test_round_up_down() {
        assert_eq!(round_up(1, PAGE_SIZE), Some(4096));
        assert_eq!(round_up(4096, PAGE_SIZE), Some(4096));
        assert_eq!(round_up(4097, PAGE_SIZE), Some(8192));
        assert_eq!(round_up(usize::MAX, PAGE_SIZE), None);
        assert_eq!(round_down(8191, PAGE_SIZE), 4096);
    }

    #[test]
    fn test_valid_size() {
        assert!(!is_valid_size(0));
        assert!(is_valid_size(27));
        assert!(!is_valid_size(MAX_PURGEABLE_SIZE));
    }

    #[test]
    fn test_config_defaults_when_missing() {
        let config = ManagerConfig::from_lookup(|_| None);
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn test_config_reads_valid_values() {
        let config = ManagerConfig::from_lookup(lookup_from(&[
            (THREAD_POOL_TASK_NUM_ENV, "8"),
            (LRU_CACHE_CAPACITY_ENV, " 100 "),
        ]));
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.lru_capacity, 100);
    }

    #[test]
    fn test_config_out_of_range_falls_back() {
        let config = ManagerConfig::from_lookup(lookup_from(&[
            (THREAD_POOL_TASK_NUM_ENV, "21"),
            (LRU_CACHE_CAPACITY_ENV, "-1"),
        ]));
        assert_eq!(config.pool_size, DEFAULT_THREAD_POOL_TASK_NUM);
        assert_eq!(config.lru_capacity, DEFAULT_LRU_CACHE_CAPACITY);
    }

    #[test]
    fn test_sanitized_replaces_out_of_range_fields() {
        let config = ManagerConfig {
            pool_size: 0,
            lru_capacity: 5000,
        }
        .sanitized();
        assert_eq!(config, ManagerConfig::default());

        let config = ManagerConfig {
            pool_size: 999,
            lru_capacity: 1,
        }
        .sanitized();
        assert_eq!(config.pool_size, DEFAULT_THREAD_POOL_TASK_NUM);
        assert_eq!(config.lru_capacity, 1);

        let custom = ManagerConfig {
            pool_size: MAX_THREAD_POOL_TASK_NUM,
            lru_capacity: MAX_LRU_CACHE_CAPACITY,
        };
        assert_eq!(custom.sanitized(), custom);
    }

    #[test]
    fn test_config_garbage_falls_back() {
        let config = ManagerConfig::from_lookup(lookup_from(&[(THREAD_POOL_TASK_NUM_ENV, "many")]));
        assert_eq!(config.pool_size, DEFAULT_THREAD_POOL_TASK_NUM);
    }
}
