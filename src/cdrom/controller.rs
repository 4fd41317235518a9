//! Read state machine
//!
//! Driven by `tick`, once per scheduler quantum. Each state has an entry action (usually sending
//! a command) and then polls the drive until it gets what it's waiting for or its tick budget
//! runs out. A single tick may chain several states when the drive answers right away, the
//! number of steps per tick is capped so a tick always returns in bounded time.
//!
//! The drive never tells us when it's done with a read command, we count sectors ourselves.

use std::cmp::min;

use super::msf::{Msf, MAX_LBA};
use super::port::{flags, mode, opcode, Port, StatusByte};
use super::speed::Verdict;
use super::Engine;
use crate::error::{DiscFault, ProtocolError, ReadError};

/// Upper bound on the number of state steps within a single tick
const MAX_STEPS_PER_TICK: u32 = 16;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EngineState {
    /// Nothing to do, waiting for a demand
    Idle,
    /// Waiting for the drive status
    SpinUp,
    /// Waiting for the data mode to be acknowledged
    ModeSelect,
    /// Sending the read command
    IssueRead,
    /// Receiving sectors
    DrainData,
    /// Stop sent, waiting for the drive to settle
    Stopping,
}

/// Outcome of a state step
enum Flow {
    /// State changed, run the new one within the same tick
    Continue,
    /// Wait for the next tick
    Yield,
}

/// Read command in flight
#[derive(Copy, Clone, Debug)]
struct Stream {
    /// Next block we expect from the drive
    next: u32,
    /// First block past the end of the command
    end: u32,
}

pub struct Controller {
    state: EngineState,
    /// True once the entry action of `state` has been performed
    entered: bool,
    /// Ticks left before the current state times out
    timeout: u32,
    stream: Option<Stream>,
    /// Number of times we went back to spin-up for the current demand
    restarts: u32,
    /// If true the next read command starts a new retry window
    fresh_read: bool,
    /// Data mode has been set since the last disc change
    mode_confirmed: bool,
    /// Ticks left before the drive can be queried again after a stop
    settle: u32,
    #[cfg(test)]
    pub history: Vec<EngineState>,
}

impl Controller {
    pub fn new() -> Controller {
        Controller {
            state: EngineState::Idle,
            entered: false,
            timeout: 0,
            stream: None,
            restarts: 0,
            fresh_read: true,
            mode_confirmed: false,
            settle: 0,
            #[cfg(test)]
            history: vec![EngineState::Idle],
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Forget the drive mode, the next read goes through mode select again
    pub fn reset_mode(&mut self) {
        self.mode_confirmed = false;
    }

    /// The disc is gone, so is anything we were reading from it
    pub fn forget_disc(&mut self) {
        self.reset_mode();
        self.stream = None;
    }

    /// Consume one tick of the state budget, returns true if it just ran out
    fn expired(&mut self) -> bool {
        self.timeout = self.timeout.saturating_sub(1);

        self.timeout == 0
    }
}

pub fn tick<P: Port>(e: &mut Engine<P>) {
    for _ in 0..MAX_STEPS_PER_TICK {
        let flow = match e.controller.state {
            EngineState::Idle => idle(e),
            EngineState::SpinUp => spin_up(e),
            EngineState::ModeSelect => mode_select(e),
            EngineState::IssueRead => issue_read(e),
            EngineState::DrainData => drain_data(e),
            EngineState::Stopping => stopping(e),
        };

        if let Flow::Yield = flow {
            return;
        }
    }
}

fn goto<P: Port>(e: &mut Engine<P>, state: EngineState) -> Flow {
    let t = &e.config.timeouts;

    let timeout = match state {
        EngineState::SpinUp => t.spin_up,
        EngineState::ModeSelect => t.mode_select,
        EngineState::IssueRead | EngineState::DrainData => t.read,
        EngineState::Idle | EngineState::Stopping => 0,
    };

    debug!("CD: {:?} -> {:?}", e.controller.state, state);

    let c = &mut e.controller;

    c.state = state;
    c.entered = false;
    c.timeout = timeout;

    #[cfg(test)]
    c.history.push(state);

    Flow::Continue
}

/// Fail the current demand and forget everything we know about the disc if it's a medium
/// problem
fn fail<P: Port>(e: &mut Engine<P>, err: ReadError) {
    error!("CD: read failed: {}", err);

    if let ReadError::Disc(fault) = err {
        debug!("CD: {}, invalidating caches", fault);
        e.forget_disc();
    }

    // Cancelled demands don't get a completion
    if e.demand.take().is_some() {
        e.completion = Some(Err(err));
    }
}

/// Disc change reported outside of a read command. Returns false if it took the demand down
/// with it.
fn disc_changed<P: Port>(e: &mut Engine<P>) -> bool {
    info!("CD: disc changed");

    e.disc_changed(DiscFault::DiscChanged);

    e.demand.is_some()
}

/// Count a restart of the sequence. Returns false (after failing the demand) if we've restarted
/// too many times already.
fn restart<P: Port>(e: &mut Engine<P>) -> bool {
    e.controller.restarts += 1;

    if e.controller.restarts > e.config.restart_limit {
        let block = e.demand.map_or(0, |d| d.block());
        fail(e, ReadError::ReadExhausted { block });
        return false;
    }

    true
}

/// Read the status byte waiting on the data register, `None` if it's not there yet
fn poll_status<P: Port>(e: &mut Engine<P>) -> Option<Result<StatusByte, ProtocolError>> {
    if !e.port.status_ready() {
        return None;
    }

    let status = e.port.read_status(e.config.spin.status);

    if let Ok(s) = status {
        e.last_status = s;
    }

    Some(status)
}

fn idle<P: Port>(e: &mut Engine<P>) -> Flow {
    if e.next_needed_block().is_none() {
        return Flow::Yield;
    }

    e.controller.restarts = 0;
    e.controller.fresh_read = true;

    goto(e, EngineState::SpinUp)
}

fn spin_up<P: Port>(e: &mut Engine<P>) -> Flow {
    if !e.controller.entered {
        // Whatever is left of an earlier reply would be taken for our status
        e.port.discard_reply(e.config.spin.residual);

        match e.port.send_command(opcode::GET_STATUS, &[], e.config.spin.command) {
            Ok(()) => e.controller.entered = true,
            Err(err) => debug!("CD: get status: {}", err),
        }
    }

    let status = match poll_status(e) {
        Some(Ok(s)) if e.controller.entered => s,
        Some(Ok(_)) => {
            // Leftover from a previous command, our own reply is still to come
            return Flow::Continue;
        }
        Some(Err(err)) => {
            debug!("CD: spin-up: {}", err);
            return spin_up_wait(e);
        }
        None => return spin_up_wait(e),
    };

    if let Some(fault) = status.medium_fault() {
        fail(e, fault.into());
        return goto(e, EngineState::Idle);
    }

    if status.disc_changed() && !disc_changed(e) {
        return goto(e, EngineState::Idle);
    }

    if e.controller.mode_confirmed {
        goto(e, EngineState::IssueRead)
    } else {
        goto(e, EngineState::ModeSelect)
    }
}

fn spin_up_wait<P: Port>(e: &mut Engine<P>) -> Flow {
    if !e.controller.expired() {
        return Flow::Yield;
    }

    warn!("CD: spin-up timed out");

    restart(e);

    goto(e, EngineState::Stopping)
}

fn mode_select<P: Port>(e: &mut Engine<P>) -> Flow {
    if !e.controller.entered {
        if let Some(fault) = e.last_status.medium_fault() {
            fail(e, fault.into());
            return goto(e, EngineState::Idle);
        }

        match e.port.send_command(opcode::SET_MODE, &[mode::DATA], e.config.spin.command) {
            Ok(()) => e.controller.entered = true,
            Err(err) => {
                debug!("CD: set mode: {}", err);
                return mode_select_wait(e);
            }
        }
    }

    let status = match poll_status(e) {
        Some(Ok(s)) => s,
        Some(Err(err)) => {
            debug!("CD: mode select: {}", err);
            return mode_select_wait(e);
        }
        None => return mode_select_wait(e),
    };

    if let Some(fault) = status.medium_fault() {
        fail(e, fault.into());
        return goto(e, EngineState::Idle);
    }

    if status.disc_changed() {
        if !disc_changed(e) || !restart(e) {
            return goto(e, EngineState::Idle);
        }

        return goto(e, EngineState::SpinUp);
    }

    e.controller.mode_confirmed = true;

    goto(e, EngineState::IssueRead)
}

fn mode_select_wait<P: Port>(e: &mut Engine<P>) -> Flow {
    if !e.controller.expired() {
        return Flow::Yield;
    }

    warn!("CD: mode select timed out");

    if !restart(e) {
        return goto(e, EngineState::Stopping);
    }

    goto(e, EngineState::SpinUp)
}

fn issue_read<P: Port>(e: &mut Engine<P>) -> Flow {
    let (needed, demand) = match (e.next_needed_block(), e.demand) {
        (Some(b), Some(d)) => (b, d),
        _ => return goto(e, EngineState::Stopping),
    };

    if let Some(fault) = e.last_status.medium_fault() {
        fail(e, fault.into());
        return goto(e, EngineState::Idle);
    }

    if e.controller.fresh_read {
        e.speed.reset_budget();
        e.controller.fresh_read = false;
    }

    // Never read further than one ring's worth past the consumer, we'd overwrite sectors it
    // hasn't seen yet
    let window_end = demand.block().saturating_add(e.ring.capacity() as u32);
    let end = min(demand.end_block(), window_end);

    let (start_msf, end_msf) = match (Msf::try_from_lba(needed), Msf::try_from_lba(end)) {
        (Some(from), Some(to)) => (from.to_bcd(), to.to_bcd()),
        _ => {
            let block = needed.max(MAX_LBA);
            fail(e, ReadError::OutOfRange { block });
            return goto(e, EngineState::Stopping);
        }
    };

    let params = [
        start_msf[0],
        start_msf[1],
        start_msf[2],
        end_msf[0],
        end_msf[1],
        end_msf[2],
    ];

    let op = e.speed.read_opcode();

    if let Err(err) = e.port.send_command(op, &params, e.config.spin.command) {
        debug!("CD: read command: {}", err);

        if !e.controller.expired() {
            return Flow::Yield;
        }

        warn!("CD: drive won't take the read command");
        restart(e);
        return goto(e, EngineState::Stopping);
    }

    debug!(
        "CD: reading blocks {}..{} at {:?} speed",
        needed,
        end,
        e.speed.mode()
    );

    e.controller.stream = Some(Stream { next: needed, end });

    goto(e, EngineState::DrainData)
}

fn drain_data<P: Port>(e: &mut Engine<P>) -> Flow {
    let max_sectors = e.config.sectors_per_tick;
    // Bounds the loop if the drive keeps sending us stray status bytes
    let max_polls = max_sectors + e.config.spin.residual;

    let mut sectors = 0;

    for _ in 0..max_polls {
        let stream = match e.controller.stream {
            Some(s) => s,
            None if e.next_needed_block().is_some() => return goto(e, EngineState::IssueRead),
            None => return goto(e, EngineState::Stopping),
        };

        // Make sure we're still reading what the consumer needs. The demand may have been
        // replaced, or it's not draining and we've caught up with the look-ahead window. Blocks
        // the stream goes over that are already cached are simply read again.
        match e.next_needed_block() {
            None => {
                debug!("CD: nothing left to read, stopping");
                return goto(e, EngineState::Stopping);
            }
            Some(needed) if needed < stream.next || needed >= stream.end => {
                debug!(
                    "CD: consumer needs block {}, drive is at {}, restarting read",
                    needed, stream.next
                );
                e.controller.stream = None;
                e.controller.fresh_read = true;
                return goto(e, EngineState::IssueRead);
            }
            Some(_) => (),
        }

        if sectors >= max_sectors {
            return Flow::Yield;
        }

        let f = e.port.read_status_byte();

        if f & flags::STATUS_N == 0 {
            let status = StatusByte(e.port.read_data_byte());
            e.last_status = status;

            if let Some(flow) = handle_stream_status(e, status) {
                return flow;
            }
        } else if f & flags::DATA_N == 0 {
            receive_sector(e, stream);
            sectors += 1;
        } else if sectors > 0 {
            return Flow::Yield;
        } else {
            if !e.controller.expired() {
                return Flow::Yield;
            }

            warn!("CD: timeout waiting for block {}", stream.next);

            return read_error(e, stream.next);
        }
    }

    Flow::Yield
}

/// Status byte received while streaming. Returns `None` if we can keep going.
fn handle_stream_status<P: Port>(e: &mut Engine<P>, status: StatusByte) -> Option<Flow> {
    if let Some(fault) = status.medium_fault() {
        fail(e, fault.into());
        return Some(goto(e, EngineState::Idle));
    }

    if status.disc_changed() {
        fail(e, DiscFault::DiscChanged.into());
        return Some(goto(e, EngineState::Stopping));
    }

    if status.read_error() || status.command_check() {
        let block = e.controller.stream.map_or(0, |s| s.next);
        warn!("CD: read error at block {} (status {:?})", block, status);
        return Some(read_error(e, block));
    }

    trace!("CD: stray status {:?} while streaming", status);

    None
}

fn read_error<P: Port>(e: &mut Engine<P>, block: u32) -> Flow {
    e.controller.stream = None;
    e.ring.abandon_fill();

    match e.speed.record_error() {
        Verdict::Retry => goto(e, EngineState::IssueRead),
        Verdict::GiveUp => {
            fail(e, ReadError::ReadExhausted { block });
            goto(e, EngineState::Stopping)
        }
    }
}

fn receive_sector<P: Port>(e: &mut Engine<P>, stream: Stream) {
    let block = stream.next;

    let index = e.ring.begin_fill(block);

    {
        let buf = e.ring.fill_buffer(index);

        for b in buf.iter_mut() {
            *b = e.port.read_data_byte();
        }
    }

    e.ring.commit_fill(index, block);
    e.speed.record_success();

    if e.demand.is_some() {
        e.demand_started = true;
    }

    trace!("CD: block {} -> slot {}", block, index);

    // Progress, give the state a fresh budget
    e.controller.timeout = e.config.timeouts.read;

    let next = block + 1;

    e.controller.stream = if next < stream.end {
        Some(Stream { next, end: stream.end })
    } else {
        None
    };

    if e.controller.stream.is_none() && e.next_needed_block().is_some() {
        // Command done but the demand goes on, new window
        e.controller.fresh_read = true;
    }
}

fn stopping<P: Port>(e: &mut Engine<P>) -> Flow {
    if !e.controller.entered {
        e.controller.entered = true;
        e.controller.stream = None;
        e.ring.abandon_fill();
        e.controller.settle = e.config.timeouts.stop_settle;

        if let Err(err) = e.port.send_command(opcode::STOP, &[], e.config.spin.command) {
            warn!("CD: stop: {}", err);
        }
    }

    // Whatever the drive still has to say
    for _ in 0..e.config.spin.residual {
        if !e.port.status_ready() {
            break;
        }

        let status = StatusByte(e.port.read_data_byte());

        if !status.command_check() {
            e.last_status = status;
        }

        if status.disc_changed() {
            disc_changed(e);
        }
    }

    if e.controller.settle > 0 {
        e.controller.settle -= 1;
        return Flow::Yield;
    }

    if e.next_needed_block().is_some() {
        e.controller.fresh_read = true;
        goto(e, EngineState::SpinUp)
    } else {
        goto(e, EngineState::Idle)
    }
}
