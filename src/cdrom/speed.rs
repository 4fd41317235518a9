//! Transfer speed and read retry policy
//!
//! Reading at double speed makes the drive a lot more sensitive to scratched or otherwise
//! marginal media. The first read error seen with a fresh retry budget drops us to single speed
//! for `hold_sectors` clean sectors, after which we try double speed again. Only the first error
//! of a budget window demotes: subsequent errors just burn retries, whatever the tier. Some
//! known-bad media only read with this exact sequence.

use super::port::opcode;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SpeedMode {
    High,
    Low,
}

/// What to do after a read error
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Verdict {
    /// Reissue the read command
    Retry,
    /// Retry budget exhausted, fail the demand
    GiveUp,
}

pub struct SpeedController {
    mode: SpeedMode,
    /// Clean sectors left to read at low speed before promoting back to `High`
    hold_counter: u32,
    retries_remaining: u32,
    /// Full retry budget
    max_retries: u32,
    hold_sectors: u32,
    /// False if the drive can't do double speed at all
    high_capable: bool,
}

impl SpeedController {
    pub fn new(high_capable: bool, max_retries: u32, hold_sectors: u32) -> SpeedController {
        SpeedController {
            mode: if high_capable {
                SpeedMode::High
            } else {
                SpeedMode::Low
            },
            hold_counter: 0,
            retries_remaining: max_retries,
            max_retries,
            hold_sectors,
            high_capable,
        }
    }

    pub fn mode(&self) -> SpeedMode {
        self.mode
    }

    pub fn hold_counter(&self) -> u32 {
        self.hold_counter
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    /// Read opcode for the current tier
    pub fn read_opcode(&self) -> u8 {
        match self.mode {
            SpeedMode::High => opcode::READ_2X,
            SpeedMode::Low => opcode::READ_1X,
        }
    }

    /// Called whenever a fresh read command is issued
    pub fn reset_budget(&mut self) {
        self.retries_remaining = self.max_retries;
    }

    /// A sector was decoded successfully
    pub fn record_success(&mut self) {
        if self.mode != SpeedMode::Low || self.hold_counter == 0 {
            return;
        }

        self.hold_counter -= 1;

        if self.hold_counter == 0 && self.high_capable {
            info!("CD: clean run, back to double speed");
            self.mode = SpeedMode::High;
        }
    }

    /// A read failed
    pub fn record_error(&mut self) -> Verdict {
        if self.mode == SpeedMode::High && self.retries_remaining == self.max_retries {
            warn!(
                "CD: read error, switching to single speed for {} sectors",
                self.hold_sectors
            );

            self.mode = SpeedMode::Low;
            self.hold_counter = self.hold_sectors;
            self.retries_remaining = self.max_retries;

            return Verdict::Retry;
        }

        self.retries_remaining = self.retries_remaining.saturating_sub(1);

        if self.retries_remaining == 0 {
            Verdict::GiveUp
        } else {
            warn!(
                "CD: read error at {:?} speed, {} retries left",
                self.mode, self.retries_remaining
            );
            Verdict::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETRIES: u32 = 5;
    const HOLD: u32 = 30;

    #[test]
    fn starts_high_if_capable() {
        let s = SpeedController::new(true, RETRIES, HOLD);
        assert_eq!(s.mode(), SpeedMode::High);
        assert_eq!(s.read_opcode(), opcode::READ_2X);
        assert_eq!(s.retries_remaining(), RETRIES);
        assert_eq!(s.hold_counter(), 0);

        let s = SpeedController::new(false, RETRIES, HOLD);
        assert_eq!(s.mode(), SpeedMode::Low);
        assert_eq!(s.read_opcode(), opcode::READ_1X);
    }

    #[test]
    fn single_error_demotes() {
        let mut s = SpeedController::new(true, RETRIES, HOLD);

        assert_eq!(s.record_error(), Verdict::Retry);
        assert_eq!(s.mode(), SpeedMode::Low);
        assert_eq!(s.hold_counter(), HOLD);
        assert_eq!(s.retries_remaining(), RETRIES);
        assert_eq!(s.read_opcode(), opcode::READ_1X);
    }

    #[test]
    fn promotes_after_hold_run() {
        let mut s = SpeedController::new(true, RETRIES, HOLD);
        s.record_error();

        for _ in 0..HOLD - 1 {
            s.record_success();
            assert_eq!(s.mode(), SpeedMode::Low);
        }

        s.record_success();
        assert_eq!(s.mode(), SpeedMode::High);
        assert_eq!(s.hold_counter(), 0);
    }

    #[test]
    fn error_in_hold_run_keeps_counter() {
        let mut s = SpeedController::new(true, RETRIES, HOLD);
        s.record_error();

        for _ in 0..HOLD - 1 {
            s.record_success();
        }
        assert_eq!(s.hold_counter(), 1);

        assert_eq!(s.record_error(), Verdict::Retry);
        assert_eq!(s.mode(), SpeedMode::Low);
        // Not reset, not promoted
        assert_eq!(s.hold_counter(), 1);
        assert_eq!(s.retries_remaining(), RETRIES - 1);

        s.record_success();
        assert_eq!(s.mode(), SpeedMode::High);
    }

    #[test]
    fn low_speed_exhaustion() {
        let mut s = SpeedController::new(true, RETRIES, HOLD);
        s.record_error();

        for _ in 0..RETRIES - 1 {
            assert_eq!(s.record_error(), Verdict::Retry);
        }

        assert_eq!(s.record_error(), Verdict::GiveUp);
        assert_eq!(s.mode(), SpeedMode::Low);
    }

    #[test]
    fn only_first_error_of_window_demotes() {
        let mut s = SpeedController::new(true, RETRIES, 2);

        s.record_error();
        // Burns a retry at low speed
        s.record_error();
        s.record_success();
        s.record_success();
        assert_eq!(s.mode(), SpeedMode::High);
        assert_eq!(s.retries_remaining(), RETRIES - 1);

        // Same budget window, not at the top anymore: no demotion
        assert_eq!(s.record_error(), Verdict::Retry);
        assert_eq!(s.mode(), SpeedMode::High);
        assert_eq!(s.retries_remaining(), RETRIES - 2);

        // Fresh window, demotes again
        s.reset_budget();
        s.record_error();
        assert_eq!(s.mode(), SpeedMode::Low);
    }

    #[test]
    fn single_speed_drive_never_promotes() {
        let mut s = SpeedController::new(false, RETRIES, 1);

        assert_eq!(s.record_error(), Verdict::Retry);
        assert_eq!(s.hold_counter(), 0);

        for _ in 0..10 {
            s.record_success();
        }
        assert_eq!(s.mode(), SpeedMode::Low);
    }
}
