//! Process-wide tunables, read once from the environment.
use std::env;

use crate::chunk;

const DEFAULT_QUARANTINE_BYTES: usize = 256 << 20;
const DEFAULT_MAX_THREAD_LOCAL_QUARANTINE: usize = 1 << 20;
const DEFAULT_LARGE_MALLOC_LIMIT: usize = 3 << 30;

pub struct Config {
    pub redzone_size: usize,
    pub quarantine_size_bytes: usize,
    pub max_thread_local_quarantine_bytes: usize,
    pub large_malloc_limit_bytes: usize,
    pub stats_enabled: bool,
    pub debug: bool,
}

/// The red-zone must be large enough to hold a chunk header, since the
/// header always lives at exactly `user_ptr - redzone_size`. The default
/// is the smallest power of two that fits it.
fn min_redzone() -> usize {
    chunk::header_size().next_power_of_two()
}

fn default_redzone() -> usize {
    min_redzone()
}

fn parse_usize_env(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(val) => match val.parse::<usize>() {
            Ok(parsed) if parsed > 0 => parsed,
            _ => {
                log::warn!("{} has invalid value {:?}, using default {}", name, val, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_bool_env(name: &str) -> bool {
    matches!(
        env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}

fn is_power_of_two(x: usize) -> bool {
    x > 0 && (x & (x - 1)) == 0
}

impl Config {
    fn from_env() -> Self {
        let default_redzone = default_redzone();
        let floor = min_redzone();
        let mut redzone_size = parse_usize_env("WARDEN_ALLOC_REDZONE", default_redzone);
        if !is_power_of_two(redzone_size) || redzone_size < floor {
            log::warn!(
                "WARDEN_ALLOC_REDZONE={} is not a power of two >= {}, using default {}",
                redzone_size,
                floor,
                default_redzone
            );
            redzone_size = default_redzone;
        }

        Config {
            redzone_size,
            quarantine_size_bytes: parse_usize_env(
                "WARDEN_ALLOC_QUARANTINE_BYTES",
                DEFAULT_QUARANTINE_BYTES,
            ),
            max_thread_local_quarantine_bytes: parse_usize_env(
                "WARDEN_ALLOC_MAX_THREAD_LOCAL_QUARANTINE_BYTES",
                DEFAULT_MAX_THREAD_LOCAL_QUARANTINE,
            ),
            large_malloc_limit_bytes: parse_usize_env(
                "WARDEN_ALLOC_LARGE_MALLOC_BYTES",
                DEFAULT_LARGE_MALLOC_LIMIT,
            ),
            stats_enabled: parse_bool_env("WARDEN_ALLOC_STATS"),
            debug: parse_bool_env("WARDEN_ALLOC_DEBUG"),
        }
    }
}

lazy_static::lazy_static! {
    static ref CONFIG: Config = Config::from_env();
}

/// Returns the process-wide configuration, parsed once on first access.
#[inline]
pub fn get() -> &'static Config {
    &CONFIG
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        assert!(is_power_of_two(default_redzone()));
        assert!(default_redzone() >= min_redzone());
        assert!(DEFAULT_QUARANTINE_BYTES > DEFAULT_MAX_THREAD_LOCAL_QUARANTINE);
    }

    #[test]
    fn config_is_idempotent() {
        let a = get() as *const Config;
        let b = get() as *const Config;
        assert_eq!(a, b);
    }

    #[test]
    fn redzone_always_fits_the_header() {
        assert!(get().redzone_size >= chunk::header_size());
    }
}
