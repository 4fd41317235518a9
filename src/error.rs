use std::io;
use thiserror::Error;

/// Handshake-level failures. These never leave the read state machine or the TOC reader, they
/// are retried or converted there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The drive never dropped its busy flag while we were trying to send a command
    #[error("drive not accepting commands")]
    NotReady,
    /// No reply within the polling budget
    #[error("timed out waiting for the drive")]
    Timeout,
    /// The drive answered something we can't make sense of (command check, bad BCD...)
    #[error("unexpected byte from drive: 0x{0:02x}")]
    UnexpectedByte(u8),
}

/// Conditions of the medium itself. Not retried here, the caller decides what to do (ask the
/// user to close the tray etc...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiscFault {
    #[error("drive door is open")]
    DoorOpen,
    #[error("no disc in drive")]
    NoDisc,
    #[error("disc has been changed")]
    DiscChanged,
}

/// Reason a read demand was failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error(transparent)]
    Disc(#[from] DiscFault),
    /// The retry budget ran out at the current speed tier
    #[error("giving up on block {block}")]
    ReadExhausted { block: u32 },
    /// The drive can't address this block
    #[error("block {block} can't be addressed by the drive")]
    OutOfRange { block: u32 },
}

/// Errors returned by the direct (ioctl-style) entry points of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The command channel is in use by the read state machine
    #[error("drive busy")]
    Busy,
    #[error(transparent)]
    Disc(#[from] DiscFault),
    #[error("drive unresponsive: {0}")]
    Unresponsive(#[source] ProtocolError),
}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        EngineError::Unresponsive(e)
    }
}

/// Configuration file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Read(#[from] io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
