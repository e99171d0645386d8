/*!
bus::keyboard - PC/XT keyboard interface clock-line protocol.

The real interface resets by toggling the keyboard's clock line (PPI port B
bit 6) and, after a programmed tick delay, the keyboard re-announces itself
by sending 0xAA. Scancodes from `send_scancode` sit in a one-entry queue
until consumed.
*/

const RESET_TICKS: u32 = 10;
const RESET_BYTE_DELAY_TICKS: u32 = 1;
const RESET_BYTE: u8 = 0xAA;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetPhase {
    Idle,
    ClockLow(u32),
    AwaitingByteDelay(u32),
}

pub struct Keyboard {
    clock_line_high: bool,
    reset_phase: ResetPhase,
    pending: Vec<u8>,
}

impl Keyboard {
    pub fn new() -> Self {
        Self {
            clock_line_high: true,
            reset_phase: ResetPhase::Idle,
            pending: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn set_clock_line_state(&mut self, high: bool) {
        let falling = self.clock_line_high && !high;
        self.clock_line_high = high;
        if falling {
            self.reset_phase = ResetPhase::ClockLow(RESET_TICKS);
        }
    }

    pub fn push_scancode(&mut self, scancode: u8) {
        self.pending.push(scancode);
    }

    pub fn get_scancode(&mut self) -> Option<u8> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    /// Advance by one keyboard-subsystem tick. Returns a byte that should be
    /// latched into the PPI's port A and (via `Bus`) raise IRQ1, if any.
    pub fn tick(&mut self) -> Option<u8> {
        match self.reset_phase {
            ResetPhase::Idle => None,
            ResetPhase::ClockLow(remaining) => {
                if remaining == 0 {
                    self.reset_phase = ResetPhase::AwaitingByteDelay(RESET_BYTE_DELAY_TICKS);
                } else {
                    self.reset_phase = ResetPhase::ClockLow(remaining - 1);
                }
                None
            }
            ResetPhase::AwaitingByteDelay(remaining) => {
                if remaining == 0 {
                    self.reset_phase = ResetPhase::Idle;
                    Some(RESET_BYTE)
                } else {
                    self.reset_phase = ResetPhase::AwaitingByteDelay(remaining - 1);
                    None
                }
            }
        }
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_line_falling_edge_starts_reset_sequence() {
        let mut kb = Keyboard::new();
        kb.set_clock_line_state(false);
        for _ in 0..RESET_TICKS {
            assert_eq!(kb.tick(), None);
        }
        assert_eq!(kb.tick(), Some(0xAA));
    }

    #[test]
    fn scancode_queue_is_fifo() {
        let mut kb = Keyboard::new();
        kb.push_scancode(0x1E);
        kb.push_scancode(0x1F);
        assert_eq!(kb.get_scancode(), Some(0x1E));
        assert_eq!(kb.get_scancode(), Some(0x1F));
        assert_eq!(kb.get_scancode(), None);
    }

    #[test]
    fn no_reset_activity_without_clock_edge() {
        let mut kb = Keyboard::new();
        for _ in 0..50 {
            assert_eq!(kb.tick(), None);
        }
    }
}
