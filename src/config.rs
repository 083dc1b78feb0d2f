use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::lock::ReadTuning;
use crate::types::MAX_PAGE_SIZE;

/// Smallest region that still fits a full 64 KiB block plus its length prefix.
pub const MIN_CHANNEL_CAPACITY_BYTES: usize = MAX_PAGE_SIZE as usize + 8;

fn default_channel_capacity_bytes() -> usize {
    128 * 1024
}

fn default_lock_timeout_ms() -> u64 {
    500
}

fn default_sequential_span_blocks() -> i64 {
    10
}

fn default_cursor_window_blocks() -> i64 {
    100
}

fn default_worker_thread_name() -> String {
    "blockvfs-worker".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_channel_capacity_bytes")]
    pub channel_capacity_bytes: usize,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_sequential_span_blocks")]
    pub sequential_span_blocks: i64,
    #[serde(default = "default_cursor_window_blocks")]
    pub cursor_window_blocks: i64,
    #[serde(default = "default_worker_thread_name")]
    pub worker_thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_capacity_bytes: default_channel_capacity_bytes(),
            lock_timeout_ms: default_lock_timeout_ms(),
            sequential_span_blocks: default_sequential_span_blocks(),
            cursor_window_blocks: default_cursor_window_blocks(),
            worker_thread_name: default_worker_thread_name(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw).context("failed to parse blockvfs config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity_bytes < MIN_CHANNEL_CAPACITY_BYTES {
            bail!("channel_capacity_bytes must be >= {MIN_CHANNEL_CAPACITY_BYTES}");
        }
        if self.lock_timeout_ms == 0 {
            bail!("lock_timeout_ms must be > 0");
        }
        if self.sequential_span_blocks < 2 {
            bail!("sequential_span_blocks must be >= 2");
        }
        if self.cursor_window_blocks < 1 {
            bail!("cursor_window_blocks must be >= 1");
        }
        if self.worker_thread_name.trim().is_empty() {
            bail!("worker_thread_name must not be empty");
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn read_tuning(&self) -> ReadTuning {
        ReadTuning {
            sequential_span: self.sequential_span_blocks,
            cursor_window: self.cursor_window_blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn unique_path() -> std::path::PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("blockvfs-config-test-{stamp}.toml"))
    }

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().expect("defaults must validate");
        let cfg = Config::from_toml("").expect("empty config uses defaults");
        assert_eq!(cfg.lock_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.sequential_span_blocks, 10);
        assert_eq!(cfg.cursor_window_blocks, 100);
    }

    #[test]
    fn load_from_file_reads_overrides() {
        let path = unique_path();
        std::fs::write(&path, "lock_timeout_ms = 50\ncursor_window_blocks = 8\n")
            .expect("write config");
        let cfg = Config::load_from_file(&path).expect("load should succeed");
        assert_eq!(cfg.lock_timeout_ms, 50);
        assert_eq!(cfg.cursor_window_blocks, 8);
        assert_eq!(cfg.channel_capacity_bytes, 128 * 1024);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn validate_rejects_small_channel_and_zero_timeout() {
        let mut cfg = Config::default();
        cfg.channel_capacity_bytes = 4096;
        let err = cfg.validate().expect_err("small channel must fail");
        assert!(
            err.to_string().contains("channel_capacity_bytes must be >="),
            "unexpected error: {err}"
        );

        let mut cfg = Config::default();
        cfg.lock_timeout_ms = 0;
        let err = cfg.validate().expect_err("zero timeout must fail");
        assert!(
            err.to_string().contains("lock_timeout_ms must be > 0"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_rejects_heuristic_bounds() {
        let mut cfg = Config::default();
        cfg.sequential_span_blocks = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.cursor_window_blocks = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.worker_thread_name = "  ".to_owned();
        let err = cfg.validate().expect_err("blank name must fail");
        assert!(
            err.to_string().contains("worker_thread_name must not be empty"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn load_from_missing_file_has_context() {
        let err = Config::load_from_file(&unique_path()).expect_err("missing file");
        assert!(err.to_string().contains("failed to read config file"), "unexpected error: {err}");
    }
}
