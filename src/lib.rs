//! Polled read engine for single-command-byte, no-DMA CD-ROM controllers

#[macro_use]
extern crate log;

pub mod cdrom;
pub mod config;
pub mod error;
pub mod logger;

pub use crate::cdrom::{DiscStatus, Engine, EngineState};
pub use crate::config::{load_config_from, EngineConfig};
pub use crate::error::{ConfigError, DiscFault, EngineError, ProtocolError, ReadError};
