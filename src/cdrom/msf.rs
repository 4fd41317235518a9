//! Disc addressing: BCD bytes and Minute/Second/Frame timestamps
//!
//! The drive speaks BCD MSF exclusively, the block layer speaks logical block numbers. Block 0
//! is at 00:02:00, the first 150 frames are the lead-in pregap.

use std::fmt;

/// Number of frames (sectors) per second of disc time
pub const FRAMES_PER_SECOND: u32 = 75;
/// Number of frames (sectors) per minute of disc time
pub const FRAMES_PER_MINUTE: u32 = 60 * FRAMES_PER_SECOND;
/// Length of the lead-in pregap in front of logical block 0
pub const LEAD_IN_FRAMES: u32 = 2 * FRAMES_PER_SECOND;
/// Number of frames a BCD timestamp can address, up to 99:59:74
pub const MSF_FRAMES: u32 = 100 * FRAMES_PER_MINUTE;
/// Last logical block with a BCD timestamp. Since read commands take an exclusive end address
/// the last block that can actually be read is the one before.
pub const MAX_LBA: u32 = MSF_FRAMES - LEAD_IN_FRAMES - 1;

/// Convert a packed BCD byte to binary. Nibbles above 9 are not rejected, use `is_bcd` first
/// if the byte comes from the drive.
pub fn bcd_to_bin(b: u8) -> u8 {
    (b >> 4) * 10 + (b & 0xf)
}

/// Convert a binary value to packed BCD. Values above 99 wrap around.
pub fn bin_to_bcd(v: u8) -> u8 {
    let v = v % 100;

    ((v / 10) << 4) | (v % 10)
}

/// Returns true if both nibbles of `b` are valid decimal digits
pub fn is_bcd(b: u8) -> bool {
    (b >> 4) < 10 && (b & 0xf) < 10
}

/// A disc timestamp, stored in binary (not BCD)
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Msf {
    pub m: u8,
    pub s: u8,
    pub f: u8,
}

impl Msf {
    pub fn new(m: u8, s: u8, f: u8) -> Msf {
        Msf { m, s, f }
    }

    /// Timestamp of logical block `lba`, `None` past `MAX_LBA`
    pub fn try_from_lba(lba: u32) -> Option<Msf> {
        if lba > MAX_LBA {
            None
        } else {
            Some(Msf::from_lba(lba))
        }
    }

    /// Timestamp of logical block `lba`. Minutes wrap above 99, use `try_from_lba` for anything
    /// that's sent to the drive.
    pub fn from_lba(lba: u32) -> Msf {
        let frames = lba.saturating_add(LEAD_IN_FRAMES);

        let m = (frames / FRAMES_PER_MINUTE) % 100;
        let s = (frames / FRAMES_PER_SECOND) % 60;
        let f = frames % FRAMES_PER_SECOND;

        Msf::new(m as u8, s as u8, f as u8)
    }

    /// Logical block at this timestamp. Timestamps within the lead-in map to block 0.
    pub fn to_lba(self) -> u32 {
        self.frame_index().saturating_sub(LEAD_IN_FRAMES)
    }

    /// Absolute frame count from 00:00:00, lead-in included
    pub fn frame_index(self) -> u32 {
        u32::from(self.f)
            + u32::from(self.s) * FRAMES_PER_SECOND
            + u32::from(self.m) * FRAMES_PER_MINUTE
    }

    /// Decode three BCD bytes as sent by the drive
    pub fn from_bcd(bcd: [u8; 3]) -> Msf {
        Msf::new(bcd_to_bin(bcd[0]), bcd_to_bin(bcd[1]), bcd_to_bin(bcd[2]))
    }

    /// Encode as three BCD bytes for a command parameter block
    pub fn to_bcd(self) -> [u8; 3] {
        [bin_to_bcd(self.m), bin_to_bcd(self.s), bin_to_bcd(self.f)]
    }
}

impl fmt::Display for Msf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.m, self.s, self.f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_zero_is_after_the_pregap() {
        assert_eq!(Msf::from_lba(0), Msf::new(0, 2, 0));
        assert_eq!(Msf::new(0, 2, 0).to_lba(), 0);
    }

    #[test]
    fn lba_formula() {
        // lba = frame + 75 * sec + 4500 * min - 150
        let msf = Msf::new(12, 34, 56);

        assert_eq!(msf.to_lba(), 56 + 75 * 34 + 4500 * 12 - 150);
        assert_eq!(Msf::from_lba(msf.to_lba()), msf);
        assert_eq!(Msf::from_lba(4499 - 150), Msf::new(0, 59, 74));
    }

    #[test]
    fn addressable_range() {
        assert_eq!(MAX_LBA, 449_849);
        assert_eq!(Msf::try_from_lba(MAX_LBA), Some(Msf::new(99, 59, 74)));
        assert_eq!(Msf::try_from_lba(MAX_LBA + 1), None);
        assert_eq!(Msf::try_from_lba(450_000), None);
        assert_eq!(Msf::try_from_lba(u32::MAX), None);
    }

    #[test]
    fn lead_in_saturates() {
        assert_eq!(Msf::new(0, 1, 10).to_lba(), 0);
    }

    #[test]
    fn bcd_conversions() {
        assert_eq!(bcd_to_bin(0x42), 42);
        assert_eq!(bin_to_bcd(42), 0x42);
        assert_eq!(bin_to_bcd(99), 0x99);
        assert_eq!(bin_to_bcd(100), 0x00);
        assert!(is_bcd(0x59));
        assert!(!is_bcd(0x5a));
        assert!(!is_bcd(0xa0));

        let msf = Msf::new(74, 59, 74);
        assert_eq!(msf.to_bcd(), [0x74, 0x59, 0x74]);
        assert_eq!(Msf::from_bcd([0x74, 0x59, 0x74]), msf);
    }

    #[test]
    fn display() {
        assert_eq!(Msf::new(1, 2, 3).to_string(), "01:02:03");
    }
}
