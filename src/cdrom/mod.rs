//! CD-ROM read engine
//!
//! Drives a single-command-byte, no-DMA CD controller entirely by polling. The host calls
//! `tick` at a steady rate, posts read demands and drains the sectors as they show up in the
//! ring. Nothing here ever blocks: every wait on the hardware is a bounded busy-loop.

use std::cmp::min;

use crate::config::EngineConfig;
use crate::error::{DiscFault, EngineError, ReadError};

use self::controller::Controller;
use self::msf::MAX_LBA;
use self::port::{opcode, Port, StatusByte};
use self::ring::{ReadDemand, RingBuffer, SECTOR_SIZE};
use self::speed::{SpeedController, SpeedMode};
use self::toc::{DiscInfo, DiskSession, QChannel, Toc};

mod controller;
pub mod msf;
pub mod port;
pub mod ring;
pub mod sim;
pub mod speed;
pub mod toc;

pub use self::controller::EngineState;

/// Drive state as seen by the ioctl layer
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DiscStatus {
    pub ready: bool,
    pub door_open: bool,
    /// Latched until the disc info is read again
    pub changed: bool,
}

/// One engine per physical drive
pub struct Engine<P: Port> {
    port: P,
    config: EngineConfig,
    ring: RingBuffer,
    speed: SpeedController,
    session: DiskSession,
    controller: Controller,
    demand: Option<ReadDemand>,
    /// Part of the current demand came off the disc already, it can't survive a disc change
    demand_started: bool,
    completion: Option<Result<(), ReadError>>,
    /// Last status byte received from the drive
    last_status: StatusByte,
}

impl<P: Port> Engine<P> {
    /// Build an engine without probing the drive. Double speed is used unless the
    /// configuration forces single speed.
    pub fn new(port: P, config: EngineConfig) -> Engine<P> {
        let high_capable = !config.force_single_speed;

        Engine::with_speed(port, config, high_capable)
    }

    /// Build an engine after asking the drive what it's capable of
    pub fn attach(mut port: P, config: EngineConfig) -> Result<Engine<P>, EngineError> {
        let spin = &config.spin;

        port.send_command(opcode::GET_VERSION, &[], spin.command)?;

        let status = port.read_status(spin.reply)?;
        let kind = port.read_raw_byte(spin.reply)?;
        let version = port.read_raw_byte(spin.reply)?;

        let double_speed = kind == b'D';

        info!(
            "CD: drive version 0x{:02x}, {} speed",
            version,
            if double_speed { "double" } else { "single" }
        );

        let high_capable = double_speed && !config.force_single_speed;

        let mut engine = Engine::with_speed(port, config, high_capable);

        engine.last_status = status;

        Ok(engine)
    }

    fn with_speed(port: P, config: EngineConfig, high_capable: bool) -> Engine<P> {
        let slots = config.ring_slots.max(2);

        let speed = SpeedController::new(high_capable, config.max_retries, config.hold_sectors);

        Engine {
            port,
            ring: RingBuffer::new(slots),
            speed,
            session: DiskSession::default(),
            controller: Controller::new(),
            demand: None,
            demand_started: false,
            completion: None,
            last_status: StatusByte(StatusByte::READY),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.controller.state()
    }

    pub fn speed(&self) -> &SpeedController {
        &self.speed
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn demand(&self) -> Option<ReadDemand> {
        self.demand
    }

    pub fn toc_valid(&self) -> bool {
        self.session.toc_valid()
    }

    /// Ask for `count` sectors starting at `start`. If the new range starts exactly where the
    /// current demand ends it's appended to it, otherwise it replaces it.
    ///
    /// A range running past `MAX_LBA` can't be read at all. It replaces the current demand and
    /// fails right away.
    pub fn post_demand(&mut self, start: u32, count: u32) {
        let new = ReadDemand::from_blocks(start, count);

        if count > 0 && u64::from(start) + u64::from(count) > u64::from(MAX_LBA) {
            let err = ReadError::OutOfRange {
                block: start.max(MAX_LBA),
            };

            error!("CD: demand {}+{} rejected: {}", start, count, err);

            self.demand = None;
            self.demand_started = false;
            self.completion = Some(Err(err));
            return;
        }

        if let Some(ref mut d) = self.demand {
            if d.end_offset() == new.offset {
                debug!("CD: extending demand by {} sectors", count);
                d.remaining += new.remaining;
                return;
            }
        }

        debug!("CD: new demand {}+{}", start, count);

        self.demand_started = false;

        if new.is_satisfied() {
            self.demand = None;
            self.completion = Some(Ok(()));
        } else {
            self.demand = Some(new);
        }
    }

    /// Drop the current demand. The state machine winds down on its next tick.
    pub fn cancel_demand(&mut self) {
        if self.demand.take().is_some() {
            debug!("CD: demand cancelled");
        }
    }

    /// Outcome of the last finished demand, returned once. It's kept until taken: posting a new
    /// demand doesn't clear it, but the next demand to finish overwrites it.
    pub fn take_completion(&mut self) -> Option<Result<(), ReadError>> {
        self.completion.take()
    }

    /// Advance the read state machine by one scheduling quantum
    pub fn tick(&mut self) {
        controller::tick(self);
    }

    /// The drive raised an interrupt. We don't trust them enough to do anything special, it
    /// just gets us an extra tick.
    pub fn on_interrupt(&mut self) {
        self.tick();
    }

    /// Copy up to `len` bytes starting at absolute offset `byte_offset` out of the ring.
    /// Returns the number of bytes copied, which stops at the first sector not yet in the ring.
    pub fn drain(&mut self, buf: &mut [u8], byte_offset: u64, len: usize) -> usize {
        let len = min(len, buf.len());
        let dst = &mut buf[..len];

        match self.demand {
            Some(ref mut d) if d.offset == byte_offset => {
                let n = self.ring.drain(dst, d);
                let done = d.is_satisfied();

                if n > 0 {
                    self.demand_started = true;
                }

                if done {
                    debug!("CD: demand complete");
                    self.demand = None;
                    self.completion = Some(Ok(()));
                }

                n
            }
            _ => {
                // Not the demand's head, serve whatever we have without touching the demand
                let mut adhoc = ReadDemand {
                    offset: byte_offset,
                    remaining: len as u64,
                };

                self.ring.drain(dst, &mut adhoc)
            }
        }
    }

    /// First block of the current look-ahead window that isn't in the ring yet
    fn next_needed_block(&self) -> Option<u32> {
        let d = self.demand?;

        if d.is_satisfied() {
            return None;
        }

        let start = d.block();
        let end = min(
            d.end_block(),
            start.saturating_add(self.ring.capacity() as u32),
        );

        (start..end).find(|&b| !self.ring.contains(b))
    }

    fn check_idle(&self) -> Result<(), EngineError> {
        if self.state() == EngineState::Idle {
            Ok(())
        } else {
            Err(EngineError::Busy)
        }
    }

    /// Forget everything about the disc in the drive
    fn forget_disc(&mut self) {
        self.ring.invalidate_all();
        self.session.invalidate();
        self.session.changed = true;
        self.controller.forget_disc();
    }

    /// The disc went away or was replaced. A demand that already got sectors from the old disc
    /// fails with `fault`, one that hasn't started yet is served from whatever is in the drive
    /// now.
    fn disc_changed(&mut self, fault: DiscFault) {
        debug!("CD: {}, invalidating caches", fault);

        self.forget_disc();

        if self.demand_started && self.demand.take().is_some() {
            error!("CD: read failed: {}", fault);
            self.completion = Some(Err(fault.into()));
        }
    }

    /// Drive status. Queried from the hardware when the state machine is idle, otherwise we
    /// return the last status it received.
    pub fn disc_status(&mut self) -> DiscStatus {
        if self.check_idle().is_ok() {
            let command = self.config.spin.command;
            let reply = self.config.spin.reply;

            let status = match self.port.send_command(opcode::GET_STATUS, &[], command) {
                Ok(()) => self.port.read_status(reply),
                Err(e) => Err(e),
            };

            match status {
                Ok(s) => {
                    self.last_status = s;

                    if let Some(fault) = s.medium_fault() {
                        self.disc_changed(fault);
                    } else if s.disc_changed() {
                        self.disc_changed(DiscFault::DiscChanged);
                    }
                }
                Err(e) => warn!("CD: status query failed: {}", e),
            }
        }

        let s = self.last_status;

        DiscStatus {
            ready: s.medium_fault().is_none(),
            door_open: s.door_open(),
            changed: self.session.changed,
        }
    }

    /// Track range and disc length, cached until the disc changes
    pub fn disc_info(&mut self) -> Result<DiscInfo, EngineError> {
        self.check_idle()?;

        if let Some(info) = self.session.info {
            return Ok(info);
        }

        let info = match toc::read_disc_info(&mut self.port, &self.config.spin) {
            Err(EngineError::Disc(DiscFault::DiscChanged)) => {
                // The change bit is reported once, so the next query tells us about the new
                // disc
                info!("CD: disc changed");
                self.disc_changed(DiscFault::DiscChanged);
                toc::read_disc_info(&mut self.port, &self.config.spin)
            }
            r => r,
        };

        let info = match info {
            Ok(i) => i,
            Err(e) => {
                if let EngineError::Disc(fault) = e {
                    self.disc_changed(fault);
                }
                return Err(e);
            }
        };

        debug!(
            "CD: tracks {}-{}, lead-out {}",
            info.first_track, info.last_track, info.lead_out
        );

        self.session.info = Some(info);
        self.session.changed = false;

        Ok(info)
    }

    /// Table of contents. An incomplete TOC is returned but not cached, the next call scans
    /// again.
    pub fn toc(&mut self) -> Result<Toc, EngineError> {
        self.check_idle()?;

        if let Some(ref toc) = self.session.toc {
            return Ok(toc.clone());
        }

        let info = self.disc_info()?;

        let toc = toc::read_toc(
            &mut self.port,
            &info,
            self.config.toc_poll_limit,
            &self.config.spin,
        );

        // We've touched the drive mode
        self.controller.reset_mode();

        let toc = match toc {
            Ok(t) => t,
            Err(e) => {
                if let EngineError::Disc(fault) = e {
                    self.disc_changed(fault);
                }
                return Err(e);
            }
        };

        if toc.is_complete() {
            self.session.toc = Some(toc.clone());
        }

        Ok(toc)
    }

    /// Current Q subchannel frame
    pub fn q_channel(&mut self) -> Result<QChannel, EngineError> {
        self.check_idle()?;

        let q = toc::read_q_channel(&mut self.port, &self.config.spin);

        if let Err(EngineError::Disc(fault)) = q {
            self.disc_changed(fault);
        }

        q
    }

    pub fn eject(&mut self) -> Result<(), EngineError> {
        self.check_idle()?;

        let spin = &self.config.spin;

        self.port.send_command(opcode::EJECT, &[], spin.command)?;
        let status = self.port.read_status(spin.reply)?;

        self.last_status = status;

        info!("CD: ejected");

        self.disc_changed(DiscFault::DoorOpen);

        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.check_idle()?;

        let spin = &self.config.spin;

        self.port.send_command(opcode::STOP, &[], spin.command)?;
        let status = self.port.read_status(spin.reply)?;

        self.last_status = status;

        if status.disc_changed() {
            self.disc_changed(DiscFault::DiscChanged);
        }

        Ok(())
    }

    /// Current transfer speed
    pub fn speed_mode(&self) -> SpeedMode {
        self.speed.mode()
    }

    /// Number of bytes in a sector
    pub fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }
}
