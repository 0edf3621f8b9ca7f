//! Process-wide runtime knobs.
//!
//! Read once by whoever needs them (coroutine creation, `hook::connect`, the reactor
//! idle loop). Changing them affects coroutines and calls made afterwards only.

use std::env;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// 默认协程栈大小 128 KiB
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_POLL_TIMEOUT: Duration = Duration::from_millis(3000);

static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::from_env()));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Stack size in bytes used when a coroutine is created with size 0.
    pub stack_size: usize,
    /// Timeout applied by `hook::connect`. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// Upper bound on a single readiness wait in the reactor idle loop.
    pub max_poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            max_poll_timeout: DEFAULT_MAX_POLL_TIMEOUT,
        }
    }
}

impl Config {
    /// Defaults, overridden by `MINI_RT_STACK_SIZE`, `MINI_RT_CONNECT_TIMEOUT_MS`
    /// and `MINI_RT_MAX_POLL_MS` when they parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = env_number("MINI_RT_STACK_SIZE") {
            config.stack_size = size as usize;
        }
        if let Some(ms) = env_number("MINI_RT_CONNECT_TIMEOUT_MS") {
            // 0 means no timeout at all
            config.connect_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = env_number("MINI_RT_MAX_POLL_MS") {
            config.max_poll_timeout = Duration::from_millis(ms.max(1));
        }
        config
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_poll_timeout(mut self, timeout: Duration) -> Self {
        self.max_poll_timeout = timeout;
        self
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

/// Snapshot of the current configuration.
pub fn get() -> Config {
    CONFIG.read().clone()
}

/// Replace the process-wide configuration.
pub fn set(config: Config) {
    let mut current = CONFIG.write();
    if *current != config {
        log::info!("runtime config changed: {:?} -> {:?}", *current, config);
        *current = config;
    }
}
