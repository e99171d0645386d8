/*!
bus::pic - 8259A programmable interrupt controller.

Single-chip, 8-line, 86-mode configuration as wired on the PC/XT: ICW1-4
initialization sequence, OCW1-3 command protocol, edge-triggered IRR,
priority rotation on EOI, and the two-byte INTA vector handshake (86-mode;
the 8080-mode three-byte CALL sequence is not wired on this platform and is
out of scope).
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStep {
    None,
    ExpectIcw2,
    ExpectIcw3,
    ExpectIcw4,
}

pub struct Pic8259 {
    irr: u8,
    isr: u8,
    imr: u8,
    icw1: u8,
    icw2: u8, // vector base
    icw4: u8,
    init_step: InitStep,
    auto_eoi: bool,
    rotate_in_auto_eoi: bool,
    read_isr_on_status_read: bool,
    priority_base: u8,
    poll_mode_pending: bool,
}

impl Pic8259 {
    pub fn new() -> Self {
        Self {
            irr: 0,
            isr: 0,
            imr: 0xFF,
            icw1: 0,
            icw2: 0,
            icw4: 0,
            init_step: InitStep::None,
            auto_eoi: false,
            rotate_in_auto_eoi: false,
            read_isr_on_status_read: false,
            priority_base: 0,
            poll_mode_pending: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn set_irq_line(&mut self, line: u8, asserted: bool) {
        debug_assert!(line < 8);
        let bit = 1 << line;
        if asserted {
            self.irr |= bit;
        } else {
            self.irr &= !bit;
        }
    }

    /// Highest-priority unmasked, unserviced line, honoring rotation.
    fn highest_priority_pending(&self) -> Option<u8> {
        for offset in 0..8u8 {
            let line = (self.priority_base + offset) % 8;
            let bit = 1 << line;
            if self.irr & bit != 0 && self.imr & bit == 0 {
                return Some(line);
            }
        }
        None
    }

    pub fn interrupt_pending(&self) -> bool {
        self.highest_priority_pending().is_some()
    }

    /// Edge-triggered IRQ assertion, as raised by device ticks on the Bus.
    pub fn raise_irq(&mut self, line: u8) {
        self.set_irq_line(line, true);
    }

    pub fn clear_irq_line(&mut self, line: u8) {
        self.set_irq_line(line, false);
    }

    /// First byte of the INTA handshake: latch ISR, clear IRR, return the
    /// vector byte for the second INTA pulse (or run poll mode).
    pub fn acknowledge(&mut self) -> Option<u8> {
        let line = self.highest_priority_pending()?;
        let bit = 1 << line;
        self.irr &= !bit;
        self.isr |= bit;
        if self.auto_eoi {
            self.isr &= !bit;
            if self.rotate_in_auto_eoi {
                self.priority_base = (line + 1) % 8;
            }
        }
        Some(self.icw2.wrapping_add(line))
    }

    pub fn read_port(&mut self, port: u8) -> u8 {
        if port & 1 == 0 {
            if self.poll_mode_pending {
                self.poll_mode_pending = false;
                self.highest_priority_pending().map(|l| 0x80 | l).unwrap_or(0)
            } else if self.read_isr_on_status_read {
                self.isr
            } else {
                self.irr
            }
        } else {
            self.imr
        }
    }

    pub fn write_port(&mut self, port: u8, value: u8) {
        if port & 1 == 0 {
            self.write_command(value);
        } else {
            self.write_data(value);
        }
    }

    fn write_command(&mut self, value: u8) {
        if value & 0x10 != 0 {
            // ICW1
            self.icw1 = value;
            self.irr = 0;
            self.isr = 0;
            self.imr = 0;
            self.priority_base = 0;
            self.auto_eoi = false;
            self.init_step = InitStep::ExpectIcw2;
            return;
        }

        if value & 0x08 != 0 {
            // OCW3: poll command / read register select
            if value & 0x04 != 0 {
                self.poll_mode_pending = true;
            }
            if value & 0x02 != 0 {
                self.read_isr_on_status_read = value & 0x01 != 0;
            }
            return;
        }

        // OCW2: EOI and rotation commands.
        let eoi_kind = value >> 5;
        match eoi_kind {
            0b001 => {
                // non-specific EOI
                if let Some(line) = (0..8u8).find(|&l| self.isr & (1 << l) != 0) {
                    self.isr &= !(1 << line);
                }
            }
            0b011 => {
                // specific EOI
                let line = value & 0x07;
                self.isr &= !(1 << line);
            }
            0b101 => {
                // rotate on non-specific EOI
                if let Some(line) = (0..8u8).find(|&l| self.isr & (1 << l) != 0) {
                    self.isr &= !(1 << line);
                    self.priority_base = (line + 1) % 8;
                }
            }
            0b111 => {
                // rotate on specific EOI
                let line = value & 0x07;
                self.isr &= !(1 << line);
                self.priority_base = (line + 1) % 8;
            }
            _ => {}
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.init_step {
            InitStep::ExpectIcw2 => {
                self.icw2 = value & 0xF8;
                self.init_step = if self.icw1 & 0x02 != 0 {
                    InitStep::ExpectIcw4
                } else {
                    InitStep::ExpectIcw3
                };
            }
            InitStep::ExpectIcw3 => {
                self.init_step = if self.icw1 & 0x01 != 0 {
                    InitStep::ExpectIcw4
                } else {
                    InitStep::None
                };
            }
            InitStep::ExpectIcw4 => {
                self.icw4 = value;
                self.auto_eoi = value & 0x02 != 0;
                self.init_step = InitStep::None;
            }
            InitStep::None => {
                self.imr = value; // OCW1
            }
        }
    }
}

impl Default for Pic8259 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized() -> Pic8259 {
        let mut pic = Pic8259::new();
        pic.write_port(0, 0x11); // ICW1: edge, needs ICW4
        pic.write_port(1, 0x08); // ICW2: vector base 0x08
        pic.write_port(1, 0x00); // ICW3 (ignored, single chip)
        pic.write_port(1, 0x01); // ICW4: 86-mode, no auto-EOI
        pic
    }

    #[test]
    fn masked_irq_does_not_assert_pending() {
        let mut pic = initialized();
        pic.write_port(1, 0xFF); // mask everything
        pic.set_irq_line(0, true);
        assert!(!pic.interrupt_pending());
    }

    #[test]
    fn acknowledge_returns_base_plus_line_and_sets_isr() {
        let mut pic = initialized();
        pic.set_irq_line(1, true);
        let vector = pic.acknowledge().unwrap();
        assert_eq!(vector, 0x09);
        assert_eq!(pic.isr, 0x02);
        assert_eq!(pic.irr, 0);
    }

    #[test]
    fn non_specific_eoi_clears_isr() {
        let mut pic = initialized();
        pic.set_irq_line(3, true);
        pic.acknowledge().unwrap();
        pic.write_port(0, 0x20);
        assert_eq!(pic.isr, 0);
    }

    #[test]
    fn lower_numbered_line_has_higher_priority_by_default() {
        let mut pic = initialized();
        pic.set_irq_line(5, true);
        pic.set_irq_line(1, true);
        let vector = pic.acknowledge().unwrap();
        assert_eq!(vector, 0x09); // line 1, not line 5
    }
}
