//! Disc information and table of contents, read through the Q subchannel
//!
//! The drive doesn't have a "read TOC" command. Instead it can be put in a special mode where
//! the Q-channel query returns the lead-in entries, one pointer at a time, in whatever order the
//! head happens to read them. We keep querying until we've seen every track or we run out of
//! patience.

use fnv::FnvHashMap;
use thiserror::Error;

use super::msf::{is_bcd, bcd_to_bin, Msf};
use super::port::{mode, opcode, Port, StatusByte};
use crate::config::SpinLimits;
use crate::error::{DiscFault, EngineError, ProtocolError};

/// Reply to the disc info command
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DiscInfo {
    pub first_track: u8,
    pub last_track: u8,
    /// Start of the lead-out, i.e. the length of the disc
    pub lead_out: Msf,
    pub first_track_start: Msf,
}

impl DiscInfo {
    pub fn track_count(&self) -> usize {
        if self.last_track < self.first_track {
            0
        } else {
            usize::from(self.last_track - self.first_track) + 1
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TocEntry {
    pub track: u8,
    /// Control/ADR nibbles from the Q subchannel
    pub ctrl_addr: u8,
    pub start: Msf,
}

impl TocEntry {
    pub fn is_data(&self) -> bool {
        self.ctrl_addr & 0x40 != 0
    }

    pub fn start_lba(&self) -> u32 {
        self.start.to_lba()
    }
}

/// Soft failure of the TOC scan: some tracks never showed up within the poll budget
#[derive(Clone, PartialEq, Eq, Debug, Error)]
#[error("incomplete TOC, tracks {missing:?} not found")]
pub struct TocIncomplete {
    pub missing: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Toc {
    pub first_track: u8,
    pub last_track: u8,
    pub lead_out: Msf,
    /// Entries found, sorted by track number
    pub entries: Vec<TocEntry>,
    /// Set if the scan gave up before finding every track
    pub incomplete: Option<TocIncomplete>,
}

impl Toc {
    pub fn track(&self, track: u8) -> Option<&TocEntry> {
        self.entries.iter().find(|e| e.track == track)
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete.is_none()
    }
}

/// Decoded Q subchannel frame
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct QChannel {
    pub ctrl_addr: u8,
    /// Track number, 0 in the lead-in
    pub track: u8,
    /// Index within the track, or TOC pointer in the lead-in. Not converted from BCD because
    /// the lead-in uses the non-BCD pointers 0xa0-0xa2.
    pub point_index: u8,
    pub track_time: Msf,
    /// Absolute position, or the pointed track's start in the lead-in
    pub disc_time: Msf,
}

/// What we know about the disc in the drive. Cleared whenever the disc may have changed.
#[derive(Default)]
pub struct DiskSession {
    /// Latched until the disc info is successfully read again
    pub changed: bool,
    pub info: Option<DiscInfo>,
    pub toc: Option<Toc>,
}

impl DiskSession {
    pub fn invalidate(&mut self) {
        self.info = None;
        self.toc = None;
    }

    pub fn toc_valid(&self) -> bool {
        self.toc.is_some()
    }
}

/// Read the status byte in front of a reply and make sure the disc can be trusted
fn check_medium<P: Port>(port: &mut P, spin: &SpinLimits) -> Result<StatusByte, EngineError> {
    let status = port.read_status(spin.reply)?;

    let fault = match status.medium_fault() {
        Some(fault) => fault,
        None if status.disc_changed() => DiscFault::DiscChanged,
        None => return Ok(status),
    };

    Err(fault.into())
}

/// Send `op` and decode the reply that follows its status byte. If anything goes wrong the rest
/// of the reply is dropped so that it doesn't end up in front of the next one.
fn query<P, T, F>(
    port: &mut P,
    op: u8,
    params: &[u8],
    spin: &SpinLimits,
    decode: F,
) -> Result<T, EngineError>
where
    P: Port,
    F: FnOnce(&mut P) -> Result<T, EngineError>,
{
    port.send_command(op, params, spin.command)?;

    let reply = match check_medium(port, spin) {
        Ok(_) => decode(&mut *port),
        Err(e) => Err(e),
    };

    if reply.is_err() {
        port.discard_reply(spin.residual);
    }

    reply
}

fn read_msf<P: Port>(port: &mut P, limit: u32) -> Result<Msf, ProtocolError> {
    let m = port.read_bcd_byte(limit)?;
    let s = port.read_bcd_byte(limit)?;
    let f = port.read_bcd_byte(limit)?;

    Ok(Msf::new(m, s, f))
}

pub fn read_disc_info<P: Port>(port: &mut P, spin: &SpinLimits) -> Result<DiscInfo, EngineError> {
    let limit = spin.reply;

    query(port, opcode::GET_DISC_INFO, &[], spin, |port| {
        let first_track = port.read_bcd_byte(limit)?;
        let last_track = port.read_bcd_byte(limit)?;
        let lead_out = read_msf(port, limit)?;
        let first_track_start = read_msf(port, limit)?;

        Ok(DiscInfo {
            first_track,
            last_track,
            lead_out,
            first_track_start,
        })
    })
}

pub fn read_q_channel<P: Port>(port: &mut P, spin: &SpinLimits) -> Result<QChannel, EngineError> {
    let limit = spin.reply;

    query(port, opcode::GET_Q_CHANNEL, &[], spin, |port| {
        let ctrl_addr = port.read_raw_byte(limit)?;
        let track = port.read_bcd_byte(limit)?;
        let point_index = port.read_raw_byte(limit)?;
        let track_time = read_msf(port, limit)?;
        // Always 0
        let _ = port.read_raw_byte(limit)?;
        let disc_time = read_msf(port, limit)?;

        Ok(QChannel {
            ctrl_addr,
            track,
            point_index,
            track_time,
            disc_time,
        })
    })
}

fn set_mode<P: Port>(port: &mut P, m: u8, spin: &SpinLimits) -> Result<(), EngineError> {
    query(port, opcode::SET_MODE, &[m], spin, |_| Ok(()))
}

/// Scan the lead-in for the start of every track in `info`. The drive is put back in data mode
/// afterwards, even if the scan failed.
pub fn read_toc<P: Port>(
    port: &mut P,
    info: &DiscInfo,
    poll_limit: u32,
    spin: &SpinLimits,
) -> Result<Toc, EngineError> {
    set_mode(port, mode::TOC, spin)?;

    let scan = scan_lead_in(port, info, poll_limit, spin);

    let restore = set_mode(port, mode::DATA, spin);

    let toc = scan?;
    restore?;

    if let Some(ref e) = toc.incomplete {
        warn!("CD: {}", e);
    } else {
        debug!("CD: TOC read, {} tracks", toc.entries.len());
    }

    Ok(toc)
}

fn scan_lead_in<P: Port>(
    port: &mut P,
    info: &DiscInfo,
    poll_limit: u32,
    spin: &SpinLimits,
) -> Result<Toc, EngineError> {
    let wanted = info.track_count();
    let mut found: FnvHashMap<u8, TocEntry> = FnvHashMap::default();

    for _ in 0..poll_limit {
        if found.len() >= wanted {
            break;
        }

        let q = read_q_channel(port, spin)?;

        if q.track != 0 || !is_bcd(q.point_index) {
            // Not a lead-in track pointer (0xa0-0xa2 entries describe the session, we already
            // have that from the disc info)
            continue;
        }

        let track = bcd_to_bin(q.point_index);

        if track < info.first_track || track > info.last_track {
            continue;
        }

        found.entry(track).or_insert(TocEntry {
            track,
            ctrl_addr: q.ctrl_addr,
            start: q.disc_time,
        });
    }

    let missing: Vec<u8> = (info.first_track..=info.last_track)
        .filter(|t| !found.contains_key(t))
        .collect();

    let mut entries: Vec<TocEntry> = found.into_iter().map(|(_, e)| e).collect();
    entries.sort_by_key(|e| e.track);

    Ok(Toc {
        first_track: info.first_track,
        last_track: info.last_track,
        lead_out: info.lead_out,
        entries,
        incomplete: if missing.is_empty() {
            None
        } else {
            Some(TocIncomplete { missing })
        },
    })
}
