//! Register-level protocol
//!
//! The drive has two registers: a data register used for command bytes, replies and sector
//! data, and a flag register telling us what's waiting on the data register. There's no DMA
//! and interrupts are unreliable so everything here is a bounded busy-wait on the flag
//! register: we never sleep, we either get an answer within `limit` reads or give up.

use std::fmt;

use crate::error::ProtocolError;

/// Byte-level access to the drive's registers, provided by the host.
pub trait Port {
    /// Write one byte to the command register
    fn write_cmd_byte(&mut self, b: u8);

    /// Read the flag register
    fn read_status_byte(&mut self) -> u8;

    /// Read one byte from the data register
    fn read_data_byte(&mut self) -> u8;

    /// Send `opcode` followed by up to 6 parameter bytes. Fails with `NotReady` if the drive
    /// doesn't drop its busy flag within `limit` polls.
    fn send_command(&mut self, opcode: u8, params: &[u8], limit: u32) -> Result<(), ProtocolError> {
        debug_assert!(params.len() <= 6);

        if !self.spin_until(limit, |f| f & flags::BUSY == 0) {
            return Err(ProtocolError::NotReady);
        }

        trace!("CD command 0x{:02x} {:02x?}", opcode, params);

        self.write_cmd_byte(opcode);
        for &p in params {
            self.write_cmd_byte(p);
        }

        Ok(())
    }

    /// Wait for a status byte and return it
    fn read_status(&mut self, limit: u32) -> Result<StatusByte, ProtocolError> {
        let b = self.read_raw_byte(limit)?;

        let status = StatusByte(b);

        if status.command_check() {
            return Err(ProtocolError::UnexpectedByte(b));
        }

        Ok(status)
    }

    /// Wait for the next reply byte and return it, without interpreting it
    fn read_raw_byte(&mut self, limit: u32) -> Result<u8, ProtocolError> {
        if self.spin_until(limit, |f| f & flags::STATUS_N == 0) {
            Ok(self.read_data_byte())
        } else {
            Err(ProtocolError::Timeout)
        }
    }

    /// Read a BCD reply byte and convert it to binary
    fn read_bcd_byte(&mut self, limit: u32) -> Result<u8, ProtocolError> {
        let b = self.read_raw_byte(limit)?;

        if super::msf::is_bcd(b) {
            Ok(super::msf::bcd_to_bin(b))
        } else {
            Err(ProtocolError::UnexpectedByte(b))
        }
    }

    /// Throw away whatever is left of a reply, at most `limit` bytes
    fn discard_reply(&mut self, limit: u32) {
        for _ in 0..limit {
            if !self.status_ready() {
                break;
            }

            let b = self.read_data_byte();
            trace!("CD: discarding reply byte 0x{:02x}", b);
        }
    }

    /// Poll the flag register at most `limit` times until `ready` returns true
    fn spin_until<F: Fn(u8) -> bool>(&mut self, limit: u32, ready: F) -> bool {
        for _ in 0..limit {
            if ready(self.read_status_byte()) {
                return true;
            }
        }

        false
    }

    /// Returns true if the flag register says a sector is waiting on the data register (and no
    /// reply byte is in front of it)
    fn data_ready(&mut self) -> bool {
        let f = self.read_status_byte();

        f & flags::STATUS_N != 0 && f & flags::DATA_N == 0
    }

    /// Returns true if a reply byte is waiting
    fn status_ready(&mut self) -> bool {
        self.read_status_byte() & flags::STATUS_N == 0
    }
}

/// Flag register bits
pub mod flags {
    /// Drive can't accept command bytes right now
    pub const BUSY: u8 = 0x01;
    /// Active low: sector data available
    pub const DATA_N: u8 = 0x02;
    /// Active low: reply byte available
    pub const STATUS_N: u8 = 0x04;
}

/// Command opcodes
pub mod opcode {
    pub const GET_DISC_INFO: u8 = 0x10;
    pub const GET_Q_CHANNEL: u8 = 0x20;
    pub const GET_STATUS: u8 = 0x40;
    /// One parameter, see `mode`
    pub const SET_MODE: u8 = 0x50;
    /// Read at 1x. Parameters: start MSF, end MSF (exclusive), BCD
    pub const READ_1X: u8 = 0xc0;
    /// Read at 2x, same parameters as `READ_1X`
    pub const READ_2X: u8 = 0xc1;
    pub const GET_VERSION: u8 = 0xdc;
    pub const STOP: u8 = 0xf0;
    pub const EJECT: u8 = 0xf6;
}

/// Parameter values for `SET_MODE`
pub mod mode {
    /// Cooked 2048 byte data sectors
    pub const DATA: u8 = 0x01;
    /// Q-channel returns the lead-in TOC entries
    pub const TOC: u8 = 0x05;
}

/// Drive status byte, returned in front of most replies
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct StatusByte(pub u8);

impl StatusByte {
    pub const COMMAND_CHECK: u8 = 0x01;
    pub const BUSY: u8 = 0x02;
    pub const READ_ERROR: u8 = 0x04;
    pub const DISC_CHANGED: u8 = 0x20;
    pub const READY: u8 = 0x40;
    pub const DOOR_OPEN: u8 = 0x80;

    pub fn command_check(self) -> bool {
        self.0 & Self::COMMAND_CHECK != 0
    }

    pub fn busy(self) -> bool {
        self.0 & Self::BUSY != 0
    }

    pub fn read_error(self) -> bool {
        self.0 & Self::READ_ERROR != 0
    }

    pub fn disc_changed(self) -> bool {
        self.0 & Self::DISC_CHANGED != 0
    }

    pub fn ready(self) -> bool {
        self.0 & Self::READY != 0
    }

    pub fn door_open(self) -> bool {
        self.0 & Self::DOOR_OPEN != 0
    }

    /// Returns the fault preventing any disc access, if any. A changed disc is not one of
    /// them, it's up to the caller to decide what a change means in its current state.
    pub fn medium_fault(self) -> Option<crate::error::DiscFault> {
        use crate::error::DiscFault;

        if self.door_open() {
            Some(DiscFault::DoorOpen)
        } else if !self.ready() {
            Some(DiscFault::NoDisc)
        } else {
            None
        }
    }
}

impl fmt::Debug for StatusByte {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StatusByte(0x{:02x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscFault;

    /// Scripted port: the flag register returns `flag` forever, the data register pops `data`
    struct Scripted {
        flag: u8,
        data: Vec<u8>,
        written: Vec<u8>,
        flag_reads: u32,
    }

    impl Port for Scripted {
        fn write_cmd_byte(&mut self, b: u8) {
            self.written.push(b);
        }

        fn read_status_byte(&mut self) -> u8 {
            self.flag_reads += 1;
            self.flag
        }

        fn read_data_byte(&mut self) -> u8 {
            self.data.remove(0)
        }
    }

    fn scripted(flag: u8, data: &[u8]) -> Scripted {
        Scripted {
            flag,
            data: data.to_vec(),
            written: Vec::new(),
            flag_reads: 0,
        }
    }

    #[test]
    fn send_command_writes_opcode_then_params() {
        let mut p = scripted(flags::DATA_N | flags::STATUS_N, &[]);

        p.send_command(opcode::SET_MODE, &[mode::DATA], 10).unwrap();

        assert_eq!(p.written, vec![0x50, 0x01]);
    }

    #[test]
    fn send_command_not_ready() {
        let mut p = scripted(flags::BUSY, &[]);

        assert_eq!(
            p.send_command(opcode::STOP, &[], 25),
            Err(ProtocolError::NotReady)
        );
        assert!(p.written.is_empty());
        assert_eq!(p.flag_reads, 25);
    }

    #[test]
    fn read_status_timeout_is_bounded() {
        let mut p = scripted(flags::DATA_N | flags::STATUS_N, &[]);

        assert_eq!(p.read_status(40), Err(ProtocolError::Timeout));
        assert_eq!(p.flag_reads, 40);
    }

    #[test]
    fn read_status_decodes() {
        let mut p = scripted(flags::DATA_N, &[0xc0, 0x01]);

        let s = p.read_status(1).unwrap();
        assert!(s.door_open());
        assert!(s.ready());
        assert_eq!(s.medium_fault(), Some(DiscFault::DoorOpen));

        assert_eq!(p.read_status(1), Err(ProtocolError::UnexpectedByte(0x01)));
    }

    #[test]
    fn bcd_reply_validation() {
        let mut p = scripted(flags::DATA_N, &[0x42, 0x4f]);

        assert_eq!(p.read_bcd_byte(1), Ok(42));
        assert_eq!(p.read_bcd_byte(1), Err(ProtocolError::UnexpectedByte(0x4f)));
    }

    #[test]
    fn status_has_priority_over_data() {
        let mut p = scripted(0, &[]);

        assert!(p.status_ready());
        assert!(!p.data_ready());

        p.flag = flags::STATUS_N;
        assert!(p.data_ready());
    }

    #[test]
    fn discard_is_bounded() {
        let mut p = scripted(flags::DATA_N, &[1, 2, 3, 4, 5]);

        p.discard_reply(3);
        assert_eq!(p.data, vec![4, 5]);
    }

    #[test]
    fn no_disc() {
        assert_eq!(StatusByte(0).medium_fault(), Some(DiscFault::NoDisc));
        assert_eq!(StatusByte(StatusByte::READY).medium_fault(), None);
    }
}
