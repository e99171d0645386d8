/*!
bus::crtc - 6845 CRT controller character-time state machine.

Counts character clocks within a scanline (HCC), scanlines within a
character row (VLC), and character rows within a frame (VCC), driven by the
14 programmable timing registers. `den`/`hsync`/`vsync`/`hblank`/`vblank`
are pure functions of those counters against the programmed register
values, matching the chip's behaviour of deriving all status outputs
combinationally rather than from separate latches.

Past the end of the last character row the chip can insert a handful of
extra scanlines before restarting the frame (register 5, "vertical total
adjust") to fine-tune the total scanline count against a fixed-rate
monitor; `vertical_adjust` tracks how many of those padding scanlines
remain.
*/

pub const REGISTER_COUNT: usize = 18;

pub struct Crtc6845 {
    registers: [u8; REGISTER_COUNT],
    address_register: u8,
    hcc: u8,
    vlc: u8,
    vcc: u8,
    hsc: u8,
    vsc: u8,
    vma: u16,
    vma_row_start: u16,
    vertical_adjust: Option<u8>,
    cursor_blink_counter: u16,
}

impl Crtc6845 {
    pub fn new() -> Self {
        Self {
            registers: [0; REGISTER_COUNT],
            address_register: 0,
            hcc: 0,
            vlc: 0,
            vcc: 0,
            hsc: 0,
            vsc: 0,
            vma: 0,
            vma_row_start: 0,
            vertical_adjust: None,
            cursor_blink_counter: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn write_address(&mut self, value: u8) {
        self.address_register = value & 0x1F;
    }

    pub fn write_data(&mut self, value: u8) {
        if (self.address_register as usize) < REGISTER_COUNT {
            self.registers[self.address_register as usize] = value;
        }
    }

    pub fn read_data(&self) -> u8 {
        match self.address_register {
            14 => (self.cursor_address() >> 8) as u8,
            15 => self.cursor_address() as u8,
            _ => 0xFF,
        }
    }

    fn reg(&self, index: usize) -> u8 {
        self.registers[index]
    }

    fn horizontal_total(&self) -> u8 {
        self.reg(0)
    }

    fn horizontal_displayed(&self) -> u8 {
        self.reg(1)
    }

    fn hsync_start(&self) -> u8 {
        self.reg(2)
    }

    fn hsync_width(&self) -> u8 {
        self.reg(3) & 0x0F
    }

    fn vertical_total(&self) -> u8 {
        self.reg(4)
    }

    fn vertical_total_adjust(&self) -> u8 {
        self.reg(5) & 0x1F
    }

    fn vertical_displayed(&self) -> u8 {
        self.reg(6)
    }

    fn vsync_start(&self) -> u8 {
        self.reg(7)
    }

    fn max_scanline(&self) -> u8 {
        self.reg(9) & 0x1F
    }

    /// Bits 6-5 of R10: 00 = solid (always on), 01 = disabled, 10 = blink at
    /// 1/16 frame rate, 11 = blink at 1/32 frame rate.
    fn cursor_mode(&self) -> u8 {
        (self.reg(10) >> 5) & 0x03
    }

    fn cursor_start_scanline(&self) -> u8 {
        self.reg(10) & 0x1F
    }

    fn cursor_end_scanline(&self) -> u8 {
        self.reg(11) & 0x1F
    }

    pub fn cursor_address(&self) -> u16 {
        ((self.reg(14) as u16) << 8) | self.reg(15) as u16
    }

    pub fn start_address(&self) -> u16 {
        ((self.reg(12) as u16) << 8) | self.reg(13) as u16
    }

    pub fn vma(&self) -> u16 {
        self.vma
    }

    pub fn vlc(&self) -> u8 {
        self.vlc
    }

    pub fn den(&self) -> bool {
        self.hcc < self.horizontal_displayed() && self.vcc < self.vertical_displayed()
    }

    pub fn hblank(&self) -> bool {
        self.hcc >= self.horizontal_displayed()
    }

    pub fn vblank(&self) -> bool {
        self.vcc >= self.vertical_displayed() || self.vertical_adjust.is_some()
    }

    /// Non-displayed horizontal interval before sync starts, during an
    /// otherwise-active display row (the porch between `den` going low and
    /// `hsync` going high).
    pub fn hborder(&self) -> bool {
        self.hcc >= self.horizontal_displayed()
            && self.hcc < self.hsync_start()
            && self.vcc < self.vertical_displayed()
    }

    /// Non-displayed vertical interval before sync starts, during an
    /// otherwise-active display column.
    pub fn vborder(&self) -> bool {
        self.vcc >= self.vertical_displayed()
            && self.vcc < self.vsync_start()
            && self.hcc < self.horizontal_displayed()
            && self.vertical_adjust.is_none()
    }

    pub fn hsync(&self) -> bool {
        let start = self.hsync_start();
        self.hcc >= start && self.hcc < start.saturating_add(self.hsync_width().max(1))
    }

    pub fn vsync(&self) -> bool {
        let start = self.vsync_start();
        self.vcc == start
    }

    fn cursor_scanline_bitmap(&self) -> u32 {
        let start = self.cursor_start_scanline().min(31);
        let end = self.cursor_end_scanline().min(31);
        let mut bitmap: u32 = 0;
        if start <= end {
            for line in start..=end {
                bitmap |= 1 << line;
            }
        } else {
            // Start past end: the documented 6845 behaviour wraps, covering
            // both tails of the scanline range.
            for line in start..=31 {
                bitmap |= 1 << line;
            }
            for line in 0..=end {
                bitmap |= 1 << line;
            }
        }
        bitmap
    }

    fn blink_gate(&self) -> bool {
        match self.cursor_mode() {
            2 => (self.cursor_blink_counter / 16) % 2 == 0,
            3 => (self.cursor_blink_counter / 32) % 2 == 0,
            _ => true,
        }
    }

    /// `cursor_enabled ∧ (vma == cursor_address) ∧ rowbit ∧ (blink_gate ∨ solid)`.
    pub fn cursor(&self) -> bool {
        if self.cursor_mode() == 1 {
            return false;
        }
        let rowbit = (self.cursor_scanline_bitmap() >> (self.vlc & 0x1F)) & 1 != 0;
        let solid = self.cursor_mode() == 0;
        self.vma == self.cursor_address() && rowbit && (self.blink_gate() || solid)
    }

    /// Advance by one character-clock. Returns true on the tick that enters
    /// vsync (used by `Cga` to swap its double-buffered framebuffer).
    pub fn tick(&mut self) -> bool {
        let was_vsync = self.vsync();
        self.step_counters();
        let entering_vsync = !was_vsync && self.vsync();
        if entering_vsync {
            self.cursor_blink_counter = self.cursor_blink_counter.wrapping_add(1);
        }
        entering_vsync
    }

    fn step_counters(&mut self) {
        self.vma = self.vma.wrapping_add(1);
        let total = self.horizontal_total();
        if self.hcc >= total {
            self.hcc = 0;
            if let Some(remaining) = self.vertical_adjust {
                if remaining <= 1 {
                    self.vertical_adjust = None;
                    self.vcc = 0;
                    self.vlc = 0;
                    self.vma_row_start = self.start_address();
                    self.vma = self.vma_row_start;
                } else {
                    self.vertical_adjust = Some(remaining - 1);
                }
                return;
            }
            self.vma = self.vma_row_start;
            if self.vlc >= self.max_scanline() {
                self.vlc = 0;
                self.vma_row_start = self.vma_row_start.wrapping_add(self.horizontal_displayed() as u16);
                self.vma = self.vma_row_start;
                let vtotal = self.vertical_total();
                if self.vcc >= vtotal {
                    let adjust = self.vertical_total_adjust();
                    if adjust > 0 {
                        self.vertical_adjust = Some(adjust);
                    } else {
                        self.vcc = 0;
                        self.vma_row_start = self.start_address();
                        self.vma = self.vma_row_start;
                    }
                } else {
                    self.vcc = self.vcc.wrapping_add(1);
                }
            } else {
                self.vlc += 1;
            }
        } else {
            self.hcc += 1;
        }
    }
}

impl Default for Crtc6845 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programmed() -> Crtc6845 {
        let mut crtc = Crtc6845::new();
        let regs: [(u8, u8); 8] = [
            (0, 100), // horizontal total
            (1, 80),  // horizontal displayed
            (2, 90),  // hsync start
            (3, 10),  // sync widths
            (4, 25),  // vertical total
            (6, 25),  // vertical displayed
            (7, 25),  // vsync start
            (9, 7),   // max scanline
        ];
        for (index, value) in regs {
            crtc.write_address(index);
            crtc.write_data(value);
        }
        crtc
    }

    #[test]
    fn den_and_hblank_are_mutually_exclusive() {
        let mut crtc = programmed();
        for _ in 0..300 {
            assert_ne!(crtc.den(), crtc.hblank() && crtc.den());
            crtc.tick();
        }
    }

    #[test]
    fn den_is_false_during_hblank_region() {
        let mut crtc = programmed();
        for _ in 0..81 {
            crtc.tick();
        }
        assert!(crtc.hblank());
        assert!(!crtc.den());
    }

    #[test]
    fn cursor_address_reads_back_programmed_registers() {
        let mut crtc = Crtc6845::new();
        crtc.write_address(14);
        crtc.write_data(0x12);
        crtc.write_address(15);
        crtc.write_data(0x34);
        assert_eq!(crtc.cursor_address(), 0x1234);
    }

    #[test]
    fn den_implies_no_blank_or_border_signal() {
        let mut crtc = programmed();
        crtc.write_address(5);
        crtc.write_data(3); // exercise the vertical-total-adjust tail too
        for _ in 0..600 {
            if crtc.den() {
                assert!(!crtc.hblank());
                assert!(!crtc.vblank());
                assert!(!crtc.hborder());
                assert!(!crtc.vborder());
            }
            crtc.tick();
        }
    }

    #[test]
    fn cursor_asserts_only_at_cursor_address_in_solid_mode() {
        let mut crtc = Crtc6845::new();
        crtc.write_address(10);
        crtc.write_data(0x00); // solid, start scanline 0
        crtc.write_address(11);
        crtc.write_data(0x07); // end scanline 7
        crtc.write_address(14);
        crtc.write_data(0);
        crtc.write_address(15);
        crtc.write_data(0); // cursor at VMA 0
        assert!(crtc.cursor());
    }

    #[test]
    fn cursor_mode_disabled_never_asserts() {
        let mut crtc = Crtc6845::new();
        crtc.write_address(10);
        crtc.write_data(0x20); // mode bits 01 = disabled
        crtc.write_address(11);
        crtc.write_data(0x07);
        assert!(!crtc.cursor());
    }

    #[test]
    fn vertical_total_adjust_delays_frame_wrap() {
        let mut crtc = programmed();
        crtc.write_address(5);
        crtc.write_data(4); // 4 extra scanlines past vertical total
        let ticks_per_scanline = 101u32; // horizontal total (100) + 1
        let scanlines_per_row = 8u32; // max scanline (7) + 1
        let rows_per_frame = 26u32; // vertical total (25) rows run before the row whose completion checks vcc >= vertical total and triggers the adjust tail
        let ticks_per_frame = ticks_per_scanline * scanlines_per_row * rows_per_frame;

        // Run exactly one full frame's worth of character clocks, landing
        // partway through the adjust tail. Without register 5, vcc would
        // already have wrapped back to 0 by here.
        for _ in 0..(ticks_per_frame + 2 * ticks_per_scanline) {
            crtc.tick();
        }
        assert!(crtc.vblank());

        // Drain the rest of the adjust tail; the frame should now have
        // wrapped and resumed normal display.
        for _ in 0..(2 * ticks_per_scanline) {
            crtc.tick();
        }
        assert!(!crtc.vblank());
    }
}
