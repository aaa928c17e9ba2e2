//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use crate::identity::{DEFAULT_PREFIX, DEFAULT_SHORT_ID_LEN};
use crate::transfer::DEFAULT_CHUNK_SIZE;

/// Machine and transfer configuration. File: ~/.config/paircode/config.toml.
/// Env overrides: PAIRCODE_PREFIX, PAIRCODE_SHORT_ID_LEN,
/// PAIRCODE_CONNECT_TIMEOUT_TICKS, PAIRCODE_CHUNK_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Namespace prefix for qualified ids. Both peers must agree.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Decimal digits in a short id (default 6).
    #[serde(default = "default_short_id_len")]
    pub short_id_len: usize,
    /// Ticks a connection attempt may stay PENDING before it is failed
    /// (default 5; hosts tick roughly once per second).
    #[serde(default = "default_connect_timeout_ticks")]
    pub connect_timeout_ticks: u64,
    /// Outgoing file chunk size in bytes (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}
fn default_short_id_len() -> usize {
    DEFAULT_SHORT_ID_LEN
}
fn default_connect_timeout_ticks() -> u64 {
    5
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            short_id_len: default_short_id_len(),
            connect_timeout_ticks: default_connect_timeout_ticks(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("PAIRCODE_PREFIX") {
        if !s.is_empty() {
            c.prefix = s;
        }
    }
    if let Ok(s) = std::env::var("PAIRCODE_SHORT_ID_LEN") {
        if let Ok(n) = s.parse::<usize>() {
            c.short_id_len = n;
        }
    }
    if let Ok(s) = std::env::var("PAIRCODE_CONNECT_TIMEOUT_TICKS") {
        if let Ok(n) = s.parse::<u64>() {
            c.connect_timeout_ticks = n;
        }
    }
    if let Ok(s) = std::env::var("PAIRCODE_CHUNK_SIZE") {
        if let Ok(n) = s.parse::<usize>() {
            c.chunk_size = n;
        }
    }
    c
}

/// Parse a TOML config document. Missing fields fall back to defaults.
pub fn from_toml_str(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/paircode/config.toml"));
    }
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = from_toml_str(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.prefix, DEFAULT_PREFIX);
        assert_eq!(c.short_id_len, 6);
        assert_eq!(c.connect_timeout_ticks, 5);
        assert_eq!(c.chunk_size, 64 * 1024);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let c = from_toml_str("prefix = \"LAB\"\nconnect_timeout_ticks = 10\n").unwrap();
        assert_eq!(c.prefix, "LAB");
        assert_eq!(c.connect_timeout_ticks, 10);
        assert_eq!(c.short_id_len, 6);
        assert_eq!(c.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(from_toml_str("bogus = 1\n").is_err());
    }
}
