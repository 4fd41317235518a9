//! Simulated drive
//!
//! Deterministic model of the drive's register interface, good enough to exercise every path of
//! the engine without hardware: sector streaming at both speeds, read errors injected per
//! block, door and disc changes, the TOC scan mode and a couple of broken-drive behaviours
//! (stuck busy flag, drive that never answers).
//!
//! Replies are computed when the command executes, like the real thing: a status byte that was
//! queued before the door opened still says the door is closed.

use std::collections::VecDeque;

use fnv::FnvHashMap;

use super::msf::{bin_to_bcd, Msf};
use super::port::{flags, mode, opcode, Port, StatusByte};
use super::ring::SECTOR_SIZE;

/// One track of a simulated disc
#[derive(Clone, Debug)]
pub struct SimTrack {
    pub number: u8,
    pub start: u32,
    pub data: bool,
}

#[derive(Clone, Debug)]
pub struct SimDisc {
    /// Number of readable blocks
    pub blocks: u32,
    /// Never empty, the constructors always lay out the data track
    tracks: Vec<SimTrack>,
    /// Mixed into the sector contents so that two discs don't look the same
    pub seed: u8,
}

impl SimDisc {
    /// Single data track disc
    pub fn data(blocks: u32, seed: u8) -> SimDisc {
        SimDisc {
            blocks,
            tracks: vec![SimTrack {
                number: 1,
                start: 0,
                data: true,
            }],
            seed,
        }
    }

    /// Data track followed by `audio` audio tracks of equal length
    pub fn mixed(blocks: u32, audio: u8, seed: u8) -> SimDisc {
        let mut disc = SimDisc::data(blocks, seed);
        let len = blocks / (u32::from(audio) + 1);

        for n in 0..audio {
            disc.tracks.push(SimTrack {
                number: n + 2,
                start: len * (u32::from(n) + 1),
                data: false,
            });
        }

        disc
    }

    pub fn tracks(&self) -> &[SimTrack] {
        &self.tracks
    }

    /// Contents of `block`
    pub fn sector(&self, block: u32) -> Vec<u8> {
        sector_pattern(self.seed, block)
    }

    /// Track `block` belongs to
    fn track_at(&self, block: u32) -> Option<&SimTrack> {
        self.tracks.iter().rev().find(|t| t.start <= block)
    }
}

/// Deterministic sector contents
pub fn sector_pattern(seed: u8, block: u32) -> Vec<u8> {
    (0..SECTOR_SIZE).map(|i| pattern_byte(seed, block, i)).collect()
}

fn pattern_byte(seed: u8, block: u32, i: usize) -> u8 {
    let b = (block.wrapping_mul(0x9e37_79b1) >> 24) as u8;

    b ^ (block as u8) ^ (i as u8) ^ ((i >> 8) as u8).wrapping_mul(seed | 1)
}

/// Relative time within a track, no lead-in offset
fn duration(frames: u32) -> Msf {
    Msf::new(
        (frames / 4500) as u8,
        ((frames / 75) % 60) as u8,
        (frames % 75) as u8,
    )
}

struct Stream {
    next: u32,
    end: u32,
    /// Byte offset within `next`
    byte: usize,
    /// Flag reads left before `next` becomes available
    wait: u32,
    double_speed: bool,
}

pub struct SimDrive {
    disc: Option<SimDisc>,
    door_open: bool,
    /// Disc changed since the last status report
    changed: bool,
    double_speed_capable: bool,
    mode: u8,
    /// Opcode being received and its parameters so far
    pending: Option<(u8, Vec<u8>)>,
    reply: VecDeque<u8>,
    /// Flag reads left before the reply becomes visible
    reply_wait: u32,
    reply_delay: u32,
    stream: Option<Stream>,
    data_latency: u32,
    /// Block where the head last was, for Q-channel position reports
    position: u32,
    read_errors: FnvHashMap<u32, u32>,
    /// Tracks never reported by the lead-in scan
    hidden_tracks: Vec<u8>,
    /// Lead-in pointer rotation
    q_cursor: usize,
    stuck_busy: bool,
    silent: bool,
    /// Opcodes accepted but never answered
    ignored: Vec<u8>,
    commands: Vec<u8>,
    reads: Vec<(u8, u32, u32)>,
    flag_reads: u64,
}

impl SimDrive {
    pub fn new(disc: Option<SimDisc>, double_speed_capable: bool) -> SimDrive {
        SimDrive {
            disc,
            door_open: false,
            changed: false,
            double_speed_capable,
            mode: mode::DATA,
            pending: None,
            reply: VecDeque::new(),
            reply_wait: 0,
            reply_delay: 0,
            stream: None,
            data_latency: 0,
            position: 0,
            read_errors: FnvHashMap::default(),
            hidden_tracks: Vec::new(),
            q_cursor: 0,
            stuck_busy: false,
            silent: false,
            ignored: Vec::new(),
            commands: Vec::new(),
            reads: Vec::new(),
            flag_reads: 0,
        }
    }

    pub fn disc(&self) -> Option<&SimDisc> {
        self.disc.as_ref()
    }

    /// Every opcode received so far
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    /// Every read command received so far: opcode, start block, end block
    pub fn reads(&self) -> &[(u8, u32, u32)] {
        &self.reads
    }

    pub fn flag_reads(&self) -> u64 {
        self.flag_reads
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    /// Make replies invisible for `polls` reads of the flag register
    pub fn set_reply_delay(&mut self, polls: u32) {
        self.reply_delay = polls;
    }

    /// Flag reads between two sectors while streaming
    pub fn set_data_latency(&mut self, polls: u32) {
        self.data_latency = polls;
    }

    /// Fail the next `times` attempts at reading `block`
    pub fn inject_read_error(&mut self, block: u32, times: u32) {
        self.read_errors.insert(block, times);
    }

    pub fn hide_track(&mut self, track: u8) {
        self.hidden_tracks.push(track);
    }

    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Accept commands but never answer them
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Accept `op` but never answer it
    pub fn ignore_opcode(&mut self, op: u8) {
        self.ignored.push(op);
    }

    pub fn open_door(&mut self) {
        self.door_open = true;
        self.changed = true;
        self.abort_stream();
    }

    pub fn close_door(&mut self) {
        self.door_open = false;
    }

    /// Swap the disc without going through the door, as far as the engine can tell
    pub fn swap_disc(&mut self, disc: Option<SimDisc>) {
        self.disc = disc;
        self.changed = true;
        self.abort_stream();
    }

    /// The drive reports an interrupted read with an unsolicited status byte
    fn abort_stream(&mut self) {
        if self.stream.take().is_some() {
            self.push_status(0);
        }
    }

    fn status(&self) -> u8 {
        let mut s = 0;

        if self.door_open {
            s |= StatusByte::DOOR_OPEN;
        } else if self.disc.is_some() {
            s |= StatusByte::READY;
        }

        if self.changed {
            s |= StatusByte::DISC_CHANGED;
        }

        if self.stream.is_some() {
            s |= StatusByte::BUSY;
        }

        s
    }

    fn push_status(&mut self, extra: u8) {
        let s = self.status() | extra;

        self.push_reply(&[s]);
        // Reported once
        self.changed = false;
    }

    fn push_reply(&mut self, bytes: &[u8]) {
        if self.reply.is_empty() {
            self.reply_wait = self.reply_delay;
        }

        self.reply.extend(bytes);
    }

    fn disc_accessible(&self) -> bool {
        !self.door_open && self.disc.is_some()
    }

    fn expected_params(op: u8) -> usize {
        match op {
            opcode::SET_MODE => 1,
            opcode::READ_1X | opcode::READ_2X => 6,
            _ => 0,
        }
    }

    fn execute(&mut self, op: u8, params: &[u8]) {
        self.commands.push(op);

        if self.silent || self.ignored.contains(&op) {
            return;
        }

        match op {
            opcode::GET_STATUS => self.push_status(0),
            opcode::SET_MODE => {
                self.stream = None;
                self.mode = params[0];
                self.q_cursor = 0;
                self.push_status(0);
            }
            opcode::READ_1X | opcode::READ_2X => self.start_read(op, params),
            opcode::STOP => {
                self.stream = None;
                self.push_status(0);
            }
            opcode::EJECT => {
                self.stream = None;
                self.door_open = true;
                self.changed = true;
                self.push_status(0);
            }
            opcode::GET_VERSION => {
                self.push_status(0);
                let kind = if self.double_speed_capable { b'D' } else { b'M' };
                self.push_reply(&[kind, 0x10]);
            }
            opcode::GET_DISC_INFO => self.disc_info(),
            opcode::GET_Q_CHANNEL => self.q_channel(),
            _ => self.push_status(StatusByte::COMMAND_CHECK),
        }
    }

    fn start_read(&mut self, op: u8, params: &[u8]) {
        self.stream = None;

        let blocks = match self.disc {
            Some(ref d) if !self.door_open => d.blocks,
            _ => {
                self.push_status(0);
                return;
            }
        };

        let start = Msf::from_bcd([params[0], params[1], params[2]]).to_lba();
        let end = Msf::from_bcd([params[3], params[4], params[5]]).to_lba();

        self.reads.push((op, start, end));

        if start >= blocks || start >= end {
            self.push_status(StatusByte::COMMAND_CHECK);
            return;
        }

        self.stream = Some(Stream {
            next: start,
            end: end.min(blocks),
            byte: 0,
            wait: self.data_latency,
            double_speed: op == opcode::READ_2X,
        });
    }

    fn disc_info(&mut self) {
        self.push_status(0);

        if !self.disc_accessible() {
            return;
        }

        let (first, last, lead_out, first_start) = match self.disc {
            Some(ref d) => match (d.tracks.first(), d.tracks.last()) {
                (Some(first), Some(last)) => (
                    first.number,
                    last.number,
                    Msf::from_lba(d.blocks),
                    Msf::from_lba(first.start),
                ),
                _ => return,
            },
            None => return,
        };

        let mut r = vec![bin_to_bcd(first), bin_to_bcd(last)];
        r.extend_from_slice(&lead_out.to_bcd());
        r.extend_from_slice(&first_start.to_bcd());

        self.push_reply(&r);
    }

    fn q_channel(&mut self) {
        self.push_status(0);

        if !self.disc_accessible() {
            return;
        }

        let frame = match self.disc {
            Some(ref d) if self.mode == mode::TOC => {
                // Lead-in: track pointers followed by the three session pointers
                let visible: Vec<&SimTrack> = d
                    .tracks
                    .iter()
                    .filter(|t| !self.hidden_tracks.contains(&t.number))
                    .collect();
                let slots = visible.len() + 3;
                let i = self.q_cursor % slots;

                let (ctrl, point, start) = if i < visible.len() {
                    let t = visible[i];
                    let ctrl = if t.data { 0x41 } else { 0x01 };
                    (ctrl, bin_to_bcd(t.number), Msf::from_lba(t.start))
                } else {
                    (0x41, 0xa0 + (i - visible.len()) as u8, Msf::default())
                };

                self.q_cursor += 1;

                let mut r = vec![ctrl, 0x00, point, 0x00, 0x00, 0x00, 0x00];
                r.extend_from_slice(&start.to_bcd());
                r
            }
            Some(ref d) => {
                let block = self.stream.as_ref().map_or(self.position, |s| s.next);
                let t = match d.track_at(block) {
                    Some(t) => t,
                    None => return,
                };
                let ctrl = if t.data { 0x41 } else { 0x01 };

                let mut r = vec![ctrl, bin_to_bcd(t.number), 0x01];
                r.extend_from_slice(&duration(block - t.start).to_bcd());
                r.push(0x00);
                r.extend_from_slice(&Msf::from_lba(block).to_bcd());
                r
            }
            None => return,
        };

        self.push_reply(&frame);
    }

    /// Called on every flag read while streaming
    fn advance_stream(&mut self) {
        let failed = match self.stream {
            Some(ref mut s) if s.byte == 0 => {
                if s.wait > 0 {
                    s.wait -= 1;
                    return;
                }

                match self.read_errors.get_mut(&s.next) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        true
                    }
                    _ => false,
                }
            }
            _ => false,
        };

        if failed {
            self.stream = None;
            self.push_status(StatusByte::READ_ERROR);
        }
    }

    fn data_available(&self) -> bool {
        match self.stream {
            Some(ref s) => s.byte > 0 || s.wait == 0,
            None => false,
        }
    }

    fn next_data_byte(&mut self) -> u8 {
        let (block, byte) = match self.stream {
            Some(ref s) => (s.next, s.byte),
            None => return 0xff,
        };

        let b = match self.disc {
            Some(ref d) => pattern_byte(d.seed, block, byte),
            None => 0xff,
        };

        let latency = self.data_latency;

        let done = match self.stream {
            Some(ref mut s) => {
                s.byte += 1;

                if s.byte == SECTOR_SIZE {
                    s.byte = 0;
                    s.next += 1;
                    s.wait = latency;
                }

                s.next >= s.end
            }
            None => false,
        };

        if done {
            self.position = block + 1;
            self.stream = None;
        }

        b
    }

    /// True if the current stream runs at double speed
    pub fn streaming_double_speed(&self) -> Option<bool> {
        self.stream.as_ref().map(|s| s.double_speed)
    }
}

impl Port for SimDrive {
    fn write_cmd_byte(&mut self, b: u8) {
        let (op, params) = match self.pending.take() {
            Some((op, mut params)) => {
                params.push(b);
                (op, params)
            }
            None => (b, Vec::new()),
        };

        if params.len() >= SimDrive::expected_params(op) {
            self.execute(op, &params);
        } else {
            self.pending = Some((op, params));
        }
    }

    fn read_status_byte(&mut self) -> u8 {
        self.flag_reads += 1;

        if self.reply.is_empty() {
            self.advance_stream();
        }

        let mut f = flags::DATA_N | flags::STATUS_N;

        if self.stuck_busy {
            f |= flags::BUSY;
        }

        if !self.reply.is_empty() {
            if self.reply_wait > 0 {
                self.reply_wait -= 1;
            } else {
                f &= !flags::STATUS_N;
            }
        } else if self.data_available() {
            f &= !flags::DATA_N;
        }

        f
    }

    fn read_data_byte(&mut self) -> u8 {
        if self.reply_wait == 0 {
            if let Some(b) = self.reply.pop_front() {
                return b;
            }
        }

        self.next_data_byte()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_disc_layout() {
        let disc = SimDisc::mixed(4000, 3, 1);

        let numbers: Vec<u8> = disc.tracks().iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert!(disc.tracks()[0].data);
        assert!(disc.tracks()[1..].iter().all(|t| !t.data));

        assert_eq!(disc.track_at(0).map(|t| t.number), Some(1));
        assert_eq!(disc.track_at(999).map(|t| t.number), Some(1));
        assert_eq!(disc.track_at(1000).map(|t| t.number), Some(2));
        assert_eq!(disc.track_at(3999).map(|t| t.number), Some(4));
    }

    #[test]
    fn data_disc_has_a_track() {
        let disc = SimDisc::data(10, 0);

        assert_eq!(disc.tracks().len(), 1);
        assert_eq!(disc.track_at(5).map(|t| t.start), Some(0));
    }

    #[test]
    fn disc_info_reply() {
        let mut drive = SimDrive::new(Some(SimDisc::mixed(3000, 2, 0)), true);

        drive.send_command(opcode::GET_DISC_INFO, &[], 10).unwrap();

        let status = drive.read_status(10).unwrap();
        assert!(status.medium_fault().is_none());

        let first = drive.read_bcd_byte(10).unwrap();
        let last = drive.read_bcd_byte(10).unwrap();

        assert_eq!((first, last), (1, 3));
    }

    #[test]
    fn ignored_opcode_gets_no_reply() {
        let mut drive = SimDrive::new(Some(SimDisc::data(10, 0)), true);

        drive.ignore_opcode(opcode::SET_MODE);
        drive.send_command(opcode::SET_MODE, &[mode::TOC], 10).unwrap();

        assert!(!drive.status_ready());
        assert_eq!(drive.commands(), &[opcode::SET_MODE]);

        drive.send_command(opcode::GET_STATUS, &[], 10).unwrap();
        assert!(drive.status_ready());
    }
}
