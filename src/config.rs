use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{info, warn};

use crate::pipeline::{
    DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_MAX_DELIVERIES_PER_POLL, DEFAULT_MAX_THUMBNAIL_WIDTH,
    DEFAULT_PREFETCH_WINDOW, DEFAULT_PRELOAD_NICE, DEFAULT_USER_AGENT,
};

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_PATH_ENV: &str = "THUMBFETCH_CONFIG";
pub const DISABLE_PREFETCH_ENV: &str = "THUMBFETCH_DISABLE_PREFETCH";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    /// `None` sizes the cache from available memory.
    pub cache_capacity_bytes: Option<usize>,
    pub prefetch_window: usize,
    pub prefetch_enabled: bool,
    pub preload_nice: i32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// `None` keeps decoded images at full size.
    pub max_thumbnail_width: Option<u32>,
    pub max_deliveries_per_poll: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: None,
            prefetch_window: DEFAULT_PREFETCH_WINDOW,
            prefetch_enabled: true,
            preload_nice: DEFAULT_PRELOAD_NICE,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_thumbnail_width: Some(DEFAULT_MAX_THUMBNAIL_WIDTH),
            max_deliveries_per_poll: DEFAULT_MAX_DELIVERIES_PER_POLL,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    cache_capacity_bytes: Option<usize>,
    #[serde(alias = "cache_capacity_kb")]
    cache_capacity_kib: Option<usize>,
    prefetch_window: Option<usize>,
    prefetch_enabled: Option<bool>,
    preload_nice: Option<i32>,
    http_timeout_secs: Option<u64>,
    user_agent: Option<String>,
    max_thumbnail_width: Option<u32>,
    max_deliveries_per_poll: Option<usize>,
}

/// Config path: `$THUMBFETCH_CONFIG` if set, else `config.json` in the working dir.
pub fn config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

pub fn load_config() -> AppConfig {
    let mut cfg = load_config_from(&config_path());
    if env::var_os(DISABLE_PREFETCH_ENV).is_some() {
        info!("Prefetch disabled via {DISABLE_PREFETCH_ENV}");
        cfg.prefetch_enabled = false;
    }
    cfg
}

/// Read and validate a config file. Missing or broken files fall back to defaults.
pub fn load_config_from(cfg_path: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();

    let raw = match fs::read_to_string(cfg_path) {
        Ok(raw) => raw,
        Err(_) => {
            info!("No {} found; using defaults", cfg_path.display());
            return cfg;
        }
    };

    let parsed = match serde_json::from_str::<RawConfig>(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                "Failed to parse {} ({}). Using defaults.",
                cfg_path.display(),
                err
            );
            return cfg;
        }
    };

    match (parsed.cache_capacity_bytes, parsed.cache_capacity_kib) {
        (Some(0), _) | (None, Some(0)) => {
            warn!("cache capacity of 0 ignored; sizing from available memory.")
        }
        (Some(bytes), _) => cfg.cache_capacity_bytes = Some(bytes),
        (None, Some(kib)) => cfg.cache_capacity_bytes = Some(kib.saturating_mul(1024)),
        (None, None) => {}
    }
    if let Some(window) = parsed.prefetch_window {
        cfg.prefetch_window = window;
    }
    if let Some(enabled) = parsed.prefetch_enabled {
        cfg.prefetch_enabled = enabled;
    }
    if let Some(nice) = parsed.preload_nice {
        if (1..=19).contains(&nice) {
            cfg.preload_nice = nice;
        } else {
            warn!(
                "preload_nice `{nice}` must be in 1..=19 (below default priority); using {}.",
                DEFAULT_PRELOAD_NICE
            );
        }
    }
    match parsed.http_timeout_secs {
        Some(0) => warn!("http_timeout_secs of 0 ignored."),
        Some(secs) => cfg.http_timeout_secs = secs,
        None => {}
    }
    if let Some(ua) = parsed.user_agent.filter(|s| !s.trim().is_empty()) {
        cfg.user_agent = ua;
    }
    if let Some(width) = parsed.max_thumbnail_width {
        cfg.max_thumbnail_width = (width > 0).then_some(width);
    }
    if let Some(n) = parsed.max_deliveries_per_poll {
        cfg.max_deliveries_per_poll = n.max(1);
    }

    info!("Loaded config from {}", cfg_path.display());
    cfg
}
