//! Client configuration.
//!
//! Provides `ClientConfig`, the public Supabase endpoint/key pair plus the sync
//! tuning knobs. Values are layered: defaults, then an optional JSON file, then
//! environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_FRESHNESS_WINDOW_SECS: u64 = 5 * 60;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CACHE_MAX_RECORDS: usize = 1_000;

/// Client configuration.
///
/// These values are safe-to-ship public endpoints/keys. Secret credentials
/// must never be stored here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub supabase_anon_key: Option<String>,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Tuning for cache freshness, retries and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Maximum age of a cached snapshot before reads go to the server
    pub freshness_window_secs: u64,
    /// Failed sends before a queued write is dead-lettered
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Remote calls slower than this count as connectivity failures
    pub request_timeout_secs: u64,
    pub cache_max_records_per_user: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            freshness_window_secs: DEFAULT_FRESHNESS_WINDOW_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            cache_max_records_per_user: DEFAULT_CACHE_MAX_RECORDS,
        }
    }
}

impl SyncSettings {
    pub const fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file. A missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
        let mut config = serde_json::from_str::<Self>(&raw)
            .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))?;
        config.normalize();
        Ok(config)
    }

    /// Overlay values from an environment lookup (later wins).
    #[must_use]
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = normalize_text_option(lookup("SUPABASE_URL")) {
            self.supabase_url = Some(url);
        }
        if let Some(key) = normalize_text_option(lookup("SUPABASE_ANON_KEY")) {
            self.supabase_anon_key = Some(key);
        }
        if let Some(secs) = parse_env_number(&lookup, "SOLACE_FRESHNESS_WINDOW_SECS") {
            self.sync.freshness_window_secs = secs;
        }
        if let Some(retries) = parse_env_number(&lookup, "SOLACE_MAX_RETRIES") {
            self.sync.max_retries = retries;
        }
        self.normalize();
        self
    }

    /// Overlay values from the process environment.
    #[must_use]
    pub fn with_process_env(self) -> Self {
        self.with_env(|name| std::env::var(name).ok())
    }

    /// Returns the `(url, anon_key)` pair if both are configured.
    pub fn supabase(&self) -> Result<Option<(String, String)>, String> {
        match (
            normalize_text_option(self.supabase_url.clone()),
            normalize_text_option(self.supabase_anon_key.clone()),
        ) {
            (None, None) => Ok(None),
            (Some(url), Some(key)) => {
                if is_http_url(&url) {
                    Ok(Some((url.trim_end_matches('/').to_string(), key)))
                } else {
                    Err("supabase_url must include http:// or https://".to_string())
                }
            }
            _ => Err("supabase_url and supabase_anon_key must be set together".to_string()),
        }
    }

    fn normalize(&mut self) {
        self.supabase_url = normalize_text_option(self.supabase_url.clone());
        self.supabase_anon_key = normalize_text_option(self.supabase_anon_key.clone());
        self.sync.max_retries = self.sync.max_retries.max(1);
        self.sync.backoff_max_ms = self.sync.backoff_max_ms.max(self.sync.backoff_base_ms);
        self.sync.request_timeout_secs = self.sync.request_timeout_secs.max(1);
    }
}

fn parse_env_number<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = normalize_text_option(lookup(name))?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {}", name, raw);
            None
        }
    }
}
