//! Runtime configuration for the search-index update pipeline.
//!
//! All limits are loaded from process environment variables with strict
//! validation and sensible defaults, so deployments stay explicit and
//! reproducible for operators.

use std::time::Duration;

use crate::error::{Error, Result};

const ENV_MAX_ARRAY_SIZE: &str = "TWINDEX_SEARCH_MAX_ARRAY_SIZE";
const ENV_MAX_BULK_SIZE: &str = "TWINDEX_SEARCH_MAX_BULK_SIZE";
const ENV_MAX_BULK_DELAY_MS: &str = "TWINDEX_SEARCH_MAX_BULK_DELAY_MS";
const ENV_PARALLELISM: &str = "TWINDEX_SEARCH_PARALLELISM";
const ENV_PATCH_SIZE_THRESHOLD: &str = "TWINDEX_SEARCH_PATCH_SIZE_THRESHOLD";
const ENV_THING_CACHE_CAPACITY: &str = "TWINDEX_SEARCH_THING_CACHE_CAPACITY";
const ENV_THING_CACHE_TTL_SECS: &str = "TWINDEX_SEARCH_THING_CACHE_TTL_SECS";
const ENV_THING_CACHE_RETRY_DELAY_MS: &str = "TWINDEX_SEARCH_THING_CACHE_RETRY_DELAY_MS";
const ENV_POLICY_CACHE_CAPACITY: &str = "TWINDEX_SEARCH_POLICY_CACHE_CAPACITY";
const ENV_POLICY_CACHE_TTL_SECS: &str = "TWINDEX_SEARCH_POLICY_CACHE_TTL_SECS";
const ENV_POLICY_CACHE_RETRY_DELAY_MS: &str = "TWINDEX_SEARCH_POLICY_CACHE_RETRY_DELAY_MS";
const ENV_ASK_TIMEOUT_MS: &str = "TWINDEX_SEARCH_ASK_TIMEOUT_MS";
const ENV_ASK_RETRIES: &str = "TWINDEX_SEARCH_ASK_RETRIES";
const ENV_ASK_BACKOFF_MS: &str = "TWINDEX_SEARCH_ASK_BACKOFF_MS";
const ENV_WRITE_MAX_RETRIES: &str = "TWINDEX_SEARCH_WRITE_MAX_RETRIES";
const ENV_WRITE_RETRY_DELAY_MS: &str = "TWINDEX_SEARCH_WRITE_RETRY_DELAY_MS";
const ENV_IDLE_TIMEOUT_SECS: &str = "TWINDEX_SEARCH_UPDATER_IDLE_TIMEOUT_SECS";
const ENV_DRAIN_TIMEOUT_SECS: &str = "TWINDEX_SEARCH_SHUTDOWN_DRAIN_TIMEOUT_SECS";
const ENV_STASH_CAPACITY: &str = "TWINDEX_SEARCH_STASH_CAPACITY";

/// Bounds for one entity-keyed cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Maximum number of cached entries.
    pub capacity: usize,
    /// Time after which a cached entry is reloaded.
    pub ttl: Duration,
    /// Delay before a forced reload is re-attempted.
    pub retry_delay: Duration,
}

/// Timeout and retry behavior for outbound asks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskRetrySettings {
    /// Timeout for a single ask attempt.
    pub timeout: Duration,
    /// Number of retries after the first attempt.
    pub retries: u32,
    /// Base backoff; doubles per retry.
    pub backoff: Duration,
}

/// Runtime configuration for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchConfig {
    /// Arrays longer than this in the projected search document are
    /// truncated and marked.
    pub max_array_size: usize,
    /// Bulk partition count and maximum batch size.
    pub max_bulk_size: usize,
    /// Maximum latency before a partial batch is flushed.
    pub max_bulk_delay: Duration,
    /// Enforcement parallelism for batch processing.
    pub parallelism: usize,
    /// Serialized diff size above which a full replacement is written.
    pub patch_size_threshold: usize,
    /// Bounds for the twin-snapshot cache.
    pub thing_cache: CacheSettings,
    /// Bounds for the policy-enforcer cache.
    pub policy_cache: CacheSettings,
    /// Outbound ask behavior (twin retrieval, policy load).
    pub ask: AskRetrySettings,
    /// Retries for transient bulk-write failures.
    pub write_max_retries: u32,
    /// Base delay between bulk-write retries; doubles per attempt.
    pub write_retry_delay: Duration,
    /// Idle time after which an updater task terminates itself.
    pub idle_timeout: Duration,
    /// Time allowed for draining in-flight writes at shutdown.
    pub drain_timeout: Duration,
    /// Bounded stash size per updater; overflow forces a full refresh.
    pub stash_capacity: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_array_size: 100,
            max_bulk_size: 250,
            max_bulk_delay: Duration::from_millis(1_000),
            parallelism: 16,
            patch_size_threshold: 16_384,
            thing_cache: CacheSettings {
                capacity: 1_000,
                ttl: Duration::from_secs(120),
                retry_delay: Duration::from_millis(1_000),
            },
            policy_cache: CacheSettings {
                capacity: 1_000,
                ttl: Duration::from_secs(120),
                retry_delay: Duration::from_millis(1_000),
            },
            ask: AskRetrySettings {
                timeout: Duration::from_secs(5),
                retries: 3,
                backoff: Duration::from_millis(500),
            },
            write_max_retries: 5,
            write_retry_delay: Duration::from_millis(1_000),
            idle_timeout: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(10),
            stash_capacity: 1_000,
        }
    }
}

impl SearchConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not an
    /// unsigned integer, or is zero for a key that requires a positive
    /// value (the retry-count keys accept zero).
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not an
    /// unsigned integer, or is zero for a key that requires a positive
    /// value (the retry-count keys accept zero).
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            max_array_size: parse_positive(&get_env, ENV_MAX_ARRAY_SIZE, defaults.max_array_size)?,
            max_bulk_size: parse_positive(&get_env, ENV_MAX_BULK_SIZE, defaults.max_bulk_size)?,
            max_bulk_delay: parse_millis(&get_env, ENV_MAX_BULK_DELAY_MS, defaults.max_bulk_delay)?,
            parallelism: parse_positive(&get_env, ENV_PARALLELISM, defaults.parallelism)?,
            patch_size_threshold: parse_positive(
                &get_env,
                ENV_PATCH_SIZE_THRESHOLD,
                defaults.patch_size_threshold,
            )?,
            thing_cache: CacheSettings {
                capacity: parse_positive(
                    &get_env,
                    ENV_THING_CACHE_CAPACITY,
                    defaults.thing_cache.capacity,
                )?,
                ttl: parse_secs(&get_env, ENV_THING_CACHE_TTL_SECS, defaults.thing_cache.ttl)?,
                retry_delay: parse_millis(
                    &get_env,
                    ENV_THING_CACHE_RETRY_DELAY_MS,
                    defaults.thing_cache.retry_delay,
                )?,
            },
            policy_cache: CacheSettings {
                capacity: parse_positive(
                    &get_env,
                    ENV_POLICY_CACHE_CAPACITY,
                    defaults.policy_cache.capacity,
                )?,
                ttl: parse_secs(
                    &get_env,
                    ENV_POLICY_CACHE_TTL_SECS,
                    defaults.policy_cache.ttl,
                )?,
                retry_delay: parse_millis(
                    &get_env,
                    ENV_POLICY_CACHE_RETRY_DELAY_MS,
                    defaults.policy_cache.retry_delay,
                )?,
            },
            ask: AskRetrySettings {
                timeout: parse_millis(&get_env, ENV_ASK_TIMEOUT_MS, defaults.ask.timeout)?,
                retries: parse_u32(&get_env, ENV_ASK_RETRIES, defaults.ask.retries)?,
                backoff: parse_millis(&get_env, ENV_ASK_BACKOFF_MS, defaults.ask.backoff)?,
            },
            write_max_retries: parse_u32(
                &get_env,
                ENV_WRITE_MAX_RETRIES,
                defaults.write_max_retries,
            )?,
            write_retry_delay: parse_millis(
                &get_env,
                ENV_WRITE_RETRY_DELAY_MS,
                defaults.write_retry_delay,
            )?,
            idle_timeout: parse_secs(&get_env, ENV_IDLE_TIMEOUT_SECS, defaults.idle_timeout)?,
            drain_timeout: parse_secs(&get_env, ENV_DRAIN_TIMEOUT_SECS, defaults.drain_timeout)?,
            stash_capacity: parse_positive(&get_env, ENV_STASH_CAPACITY, defaults.stash_capacity)?,
        })
    }
}

fn parse_raw<F>(get_env: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(None);
    };
    raw.parse::<u64>()
        .map(Some)
        .map_err(|_| Error::configuration(format!("{key} must be an unsigned integer, got '{raw}'")))
}

fn require_positive(key: &str, value: u64) -> Result<u64> {
    if value == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(value)
}

fn parse_positive<F>(get_env: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_raw(get_env, key)? {
        Some(value) => {
            let value = require_positive(key, value)?;
            usize::try_from(value).map_err(|_| {
                Error::configuration(format!("{key} value {value} exceeds supported range"))
            })
        }
        None => Ok(default),
    }
}

/// Retry counts: zero is a legitimate "attempt once, never retry".
fn parse_u32<F>(get_env: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_raw(get_env, key)? {
        Some(value) => u32::try_from(value).map_err(|_| {
            Error::configuration(format!("{key} value {value} exceeds supported range"))
        }),
        None => Ok(default),
    }
}

fn parse_millis<F>(get_env: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_raw(get_env, key)? {
        Some(value) => Ok(Duration::from_millis(require_positive(key, value)?)),
        None => Ok(default),
    }
}

fn parse_secs<F>(get_env: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_raw(get_env, key)? {
        Some(value) => Ok(Duration::from_secs(require_positive(key, value)?)),
        None => Ok(default),
    }
}
