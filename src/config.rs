//! Engine tuning knobs.
//!
//! The defaults match the reference drive. They can be overridden from a TOML file, every
//! field is optional:
//!
//! ```toml
//! ring_slots = 16
//! max_retries = 10
//! hold_sectors = 30
//!
//! [timeouts]
//! spin_up = 300
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of 2048 byte slots in the sector ring
    pub ring_slots: usize,
    /// Read retry budget, reset whenever a fresh read command is issued
    pub max_retries: u32,
    /// Number of clean sectors to read at single speed after a demotion before going back to
    /// double speed
    pub hold_sectors: u32,
    /// Never use the double speed read command, even if the drive supports it
    pub force_single_speed: bool,
    /// Maximum number of sectors decoded within a single tick
    pub sectors_per_tick: u32,
    /// Number of times the state machine may go back to spin-up for a single demand before
    /// giving up
    pub restart_limit: u32,
    /// Maximum number of Q-channel queries while scanning the TOC
    pub toc_poll_limit: u32,
    /// Tick frequency the scheduler is expected to use
    pub tick_hz: u32,
    pub timeouts: Timeouts,
    pub spin: SpinLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            ring_slots: 16,
            max_retries: 10,
            hold_sectors: 30,
            force_single_speed: false,
            sectors_per_tick: 8,
            restart_limit: 3,
            toc_poll_limit: 300,
            tick_hz: 100,
            timeouts: Timeouts::default(),
            spin: SpinLimits::default(),
        }
    }
}

/// Per-state budgets, in ticks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub spin_up: u32,
    pub mode_select: u32,
    pub read: u32,
    /// Fixed delay the drive needs after a stop before it can be queried again
    pub stop_settle: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            spin_up: 300,
            mode_select: 100,
            read: 300,
            stop_settle: 2,
        }
    }
}

/// Busy-wait bounds, in reads of the flag register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinLimits {
    /// Waiting for the drive to accept a command byte
    pub command: u32,
    /// Waiting for a status byte within a tick
    pub status: u32,
    /// Waiting for each byte of a multi-byte reply
    pub reply: u32,
    /// Residual status bytes drained per tick while stopping
    pub residual: u32,
}

impl Default for SpinLimits {
    fn default() -> Self {
        SpinLimits {
            command: 1000,
            status: 100,
            reply: 2000,
            residual: 16,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_slots < 2 {
            let msg = format!("ring_slots must be at least 2, got {}", self.ring_slots);
            return Err(ConfigError::Invalid(msg));
        }

        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries can't be 0".into()));
        }

        if self.sectors_per_tick == 0 {
            return Err(ConfigError::Invalid("sectors_per_tick can't be 0".into()));
        }

        if self.tick_hz == 0 {
            return Err(ConfigError::Invalid("tick_hz can't be 0".into()));
        }

        Ok(())
    }
}

/// Load the configuration from `path`. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let contents = fs::read_to_string(path)?;
    let config: EngineConfig = toml::from_str(&contents)?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config_from(Path::new("/nonexistent/polled-cdrom.toml")).unwrap();

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.ring_slots, 16);
        assert_eq!(config.hold_sectors, 30);
        assert_eq!(config.toc_poll_limit, 300);
    }

    #[test]
    fn partial_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drive.toml");

        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "max_retries = 5").unwrap();
        writeln!(f, "force_single_speed = true").unwrap();
        writeln!(f, "[timeouts]").unwrap();
        writeln!(f, "read = 50").unwrap();
        drop(f);

        let config = load_config_from(&path).unwrap();

        assert_eq!(config.max_retries, 5);
        assert!(config.force_single_speed);
        assert_eq!(config.timeouts.read, 50);
        // Untouched fields keep their defaults
        assert_eq!(config.timeouts.spin_up, 300);
        assert_eq!(config.ring_slots, 16);
    }

    #[test]
    fn malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drive.toml");
        fs::write(&path, "ring_slots = \"many\"").unwrap();

        match load_config_from(&path) {
            Err(ConfigError::Parse(_)) => (),
            r => panic!("unexpected result {:?}", r),
        }
    }

    #[test]
    fn rejects_tiny_ring() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drive.toml");
        fs::write(&path, "ring_slots = 1").unwrap();

        match load_config_from(&path) {
            Err(ConfigError::Invalid(_)) => (),
            r => panic!("unexpected result {:?}", r),
        }
    }
}
