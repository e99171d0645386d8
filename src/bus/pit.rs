/*!
bus::pit - 8253 programmable interval timer.

Three independent 16-bit counters. Counter 0 drives IRQ0 (the system tick),
counter 1 historically requested DRAM refresh DMA (modelled as a plain
square-wave output, unconnected), counter 2 gates the PC speaker through
PPI port B. Only modes 0, 2, and 3 are exercised by BIOS code in practice
and are implemented with full gate semantics; modes 1, 4, 5 run the same
countdown without their triggered-start nuance.
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    LatchOnly,
    LowByte,
    HighByte,
    LowThenHigh,
}

struct Counter {
    mode: u8,
    access: AccessMode,
    reload: u16,
    count: u16,
    latch: Option<u16>,
    awaiting_high_byte: bool,
    gate: bool,
    output: bool,
    armed: bool, // waiting for a reload write (or gate rising edge) to start counting
}

impl Counter {
    fn new() -> Self {
        Self {
            mode: 0,
            access: AccessMode::LowThenHigh,
            reload: 0,
            count: 0,
            latch: None,
            awaiting_high_byte: false,
            gate: true,
            output: true,
            armed: true,
        }
    }

    fn set_gate(&mut self, gate: bool) {
        let rising = gate && !self.gate;
        self.gate = gate;
        if rising && matches!(self.mode, 1 | 5) {
            self.count = self.reload;
            self.armed = false;
        }
    }

    fn write_reload_byte(&mut self, byte: u8) {
        match self.access {
            AccessMode::LowByte => self.reload = (self.reload & 0xFF00) | byte as u16,
            AccessMode::HighByte => self.reload = (self.reload & 0x00FF) | ((byte as u16) << 8),
            AccessMode::LowThenHigh => {
                if self.awaiting_high_byte {
                    self.reload = (self.reload & 0x00FF) | ((byte as u16) << 8);
                    self.awaiting_high_byte = false;
                } else {
                    self.reload = (self.reload & 0xFF00) | byte as u16;
                    self.awaiting_high_byte = true;
                }
            }
            AccessMode::LatchOnly => {}
        }
        let write_complete = !matches!(self.access, AccessMode::LowThenHigh) || !self.awaiting_high_byte;
        if write_complete {
            self.count = self.reload;
            self.armed = false;
            self.output = !matches!(self.mode, 2 | 3);
        }
    }

    fn read_byte(&mut self) -> u8 {
        let value = if let Some(latched) = self.latch {
            latched
        } else {
            self.count
        };
        match self.access {
            AccessMode::HighByte => {
                self.latch = None;
                (value >> 8) as u8
            }
            AccessMode::LowByte | AccessMode::LatchOnly => {
                self.latch = None;
                value as u8
            }
            AccessMode::LowThenHigh => {
                if self.awaiting_high_byte {
                    self.awaiting_high_byte = false;
                    self.latch = None;
                    (value >> 8) as u8
                } else {
                    self.awaiting_high_byte = true;
                    value as u8
                }
            }
        }
    }

    fn latch_count(&mut self) {
        if self.latch.is_none() {
            self.latch = Some(self.count);
        }
    }

    /// Advance by one PIT tick (master clock / 4). Returns the rising-edge
    /// flag on OUT, used by counter 0 to pulse IRQ0.
    fn tick(&mut self) -> bool {
        if self.armed || !self.gate {
            return false;
        }

        let before = self.output;
        match self.mode {
            0 => {
                if self.count == 0 {
                    self.output = true;
                } else {
                    self.count = self.count.wrapping_sub(1);
                    self.output = self.count == 0;
                }
            }
            2 => {
                if self.count <= 1 {
                    self.output = false;
                    self.count = self.reload;
                } else {
                    self.count -= 1;
                    self.output = true;
                }
            }
            3 => {
                let step = 2;
                if self.count <= step {
                    self.output = !self.output;
                    self.count = self.reload;
                } else {
                    self.count -= step;
                }
            }
            _ => {
                self.count = self.count.wrapping_sub(1);
                self.output = self.count == 0;
            }
        }
        !before && self.output
    }
}

pub struct Pit8253 {
    counters: [Counter; 3],
    elapsed_ticks: u64,
}

impl Pit8253 {
    pub fn new() -> Self {
        Self {
            counters: [Counter::new(), Counter::new(), Counter::new()],
            elapsed_ticks: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn elapsed_ticks(&self) -> u64 {
        self.elapsed_ticks
    }

    pub fn counter2_gate(&mut self, gate: bool) {
        self.counters[2].set_gate(gate);
    }

    pub fn counter2_output(&self) -> bool {
        self.counters[2].output
    }

    pub fn write_control(&mut self, value: u8) {
        let select = value >> 6;
        if select == 3 {
            return; // read-back command, not wired on the PC/XT BIOS path
        }
        let access_bits = (value >> 4) & 0x3;
        if access_bits == 0 {
            self.counters[select as usize].latch_count();
            return;
        }
        let counter = &mut self.counters[select as usize];
        counter.access = match access_bits {
            1 => AccessMode::LowByte,
            2 => AccessMode::HighByte,
            _ => AccessMode::LowThenHigh,
        };
        counter.mode = (value >> 1) & 0x7;
        counter.awaiting_high_byte = false;
        counter.armed = true;
    }

    pub fn write_data(&mut self, counter: usize, value: u8) {
        self.counters[counter].write_reload_byte(value);
    }

    pub fn read_data(&mut self, counter: usize) -> u8 {
        self.counters[counter].read_byte()
    }

    /// Bus-facing port access: ports 0-2 are counter data registers, port 3
    /// is the control word register (write-only; reads back open bus).
    pub fn read_port(&mut self, port: u8) -> u8 {
        if port < 3 {
            self.read_data(port as usize)
        } else {
            0xFF
        }
    }

    pub fn write_port(&mut self, port: u8, value: u8) {
        if port < 3 {
            self.write_data(port as usize, value);
        } else {
            self.write_control(value);
        }
    }

    /// Advance one counter (0, 1, or 2) by one PIT tick. Returns whether its
    /// output just rose.
    pub fn tick(&mut self, counter: usize) -> bool {
        if counter == 0 {
            self.elapsed_ticks += 1;
        }
        self.counters[counter].tick()
    }
}

impl Default for Pit8253 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode3_square_wave_toggles_output_at_half_period() {
        let mut pit = Pit8253::new();
        pit.write_control(0b00_11_011_0); // counter 0, LSB+MSB, mode 3
        pit.write_data(0, 4);
        pit.write_data(0, 0);
        let mut toggles = 0;
        for _ in 0..8 {
            if pit.tick(0) {
                toggles += 1;
            }
        }
        assert!(toggles >= 1);
    }

    #[test]
    fn mode2_rate_generator_pulses_every_reload() {
        let mut pit = Pit8253::new();
        pit.write_control(0b00_11_010_0); // counter 0, mode 2
        pit.write_data(0, 4);
        pit.write_data(0, 0);
        let mut pulses = 0;
        for _ in 0..20 {
            if pit.tick(0) {
                pulses += 1;
            }
        }
        assert!(pulses >= 2);
    }

    #[test]
    fn latch_freezes_count_across_reads() {
        let mut pit = Pit8253::new();
        pit.write_control(0b00_11_000_0); // counter 0, LSB+MSB, mode 0
        pit.write_data(0, 0x34);
        pit.write_data(0, 0x12);
        pit.write_control(0b00_00_000_0); // latch counter 0
        let lo = pit.read_data(0);
        pit.tick(0);
        pit.tick(0);
        let hi = pit.read_data(0);
        assert_eq!(lo, 0x34);
        assert_eq!(hi, 0x12);
    }
}
