/*!
Bus abstraction mapping the 8088's address and I/O space to RAM, ROM, and
every chipset device, and orchestrating their shared master clock.

Physical address map:
- 0x00000-0xB7FFF: conventional RAM (736 KiB)
- 0xB8000-0xBBFFF: CGA video aperture (16 KiB, mirrored across VRAM)
- 0xBC000-0xFDFFF: open bus (reads 0xFF, writes ignored)
- 0xFE000-0xFFFFF: BIOS ROM (8 KiB, mirrored to fill the 8 KiB window)

I/O port map, masked in 32-byte bands:
- 0x00-0x1F: DMAC (8237)
- 0x20-0x3F: PIC (8259)
- 0x40-0x5F: PIT (8253)
- 0x60-0x7F: PPI (8255)
- 0x80-0x9F: DMA page registers (non-linear: 0x87->ch0, 0x83->ch1, 0x81->ch2, 0x82->ch3)
- 0xA0-0xBF: NMI mask register
- 0x3C0-0x3CF: CGA
- 0x3E0-0x3E7: FDC

Notes:
- `tick()` advances every device by one master clock (1/3 of a CPU cycle at
  the 8088's default clock divider): CRTC every tick, PIT every 4 ticks,
  PPI/keyboard sampling every 16 ticks, keyboard/FDC timer-scale effects
  every 2^14 ticks, and the DMA hold/transfer state machine every tick.
- A CPU bus cycle and an active DMA transfer are never concurrent; CPU
  access during DMA S1..S4 is not modeled as stalled (the CPU's own cycle
  budget already accounts for bus contention via wait states), matching the
  model's single-threaded cooperative scheduling rule.
*/

mod cga;
mod crtc;
mod dmac;
mod fdc;
mod keyboard;
mod pic;
mod pit;
mod ppi;
mod ram;

use cga::Cga;
use dmac::Dma8237;
use fdc::Fdc765;
use keyboard::Keyboard;
use pic::Pic8259;
use pit::Pit8253;
use ppi::Ppi8255;
use ram::{Ram, Rom};

use crate::error::{EmulatorError, Result};

const PIT_TICK_PERIOD: u64 = 4;
const PPI_SAMPLE_PERIOD: u64 = 16;
const SLOW_DEVICE_PERIOD: u64 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaState {
    Idle,
    Dreq,
    Hrq,
    HoldWait,
    PreAen,
    Aen,
    S0,
    S1,
    S2,
    S3,
    Wait,
    S4,
    DelayedT1,
    DelayedT2,
    DelayedT3,
}

pub struct Bus {
    ram: Ram,
    rom: Rom,
    pub pic: Pic8259,
    pub pit: Pit8253,
    pub ppi: Ppi8255,
    pub dma: Dma8237,
    pub cga: Cga,
    pub fdc: Fdc765,
    pub keyboard: Keyboard,
    nmi_enabled: bool,
    master_tick: u64,
    dma_state: DmaState,
    dma_active_channel: Option<usize>,
    speaker_counter2_output: bool,
}

const DMA_CHANNEL_FOR_PAGE_PORT: [(u16, usize); 4] =
    [(0x87, 0), (0x83, 1), (0x81, 2), (0x82, 3)];

impl Bus {
    pub fn new() -> Self {
        let mut bus = Self {
            ram: Ram::new(),
            rom: Rom::empty(),
            pic: Pic8259::new(),
            pit: Pit8253::new(),
            ppi: Ppi8255::new(),
            dma: Dma8237::new(),
            cga: Cga::new(),
            fdc: Fdc765::new(),
            keyboard: Keyboard::new(),
            nmi_enabled: false,
            master_tick: 0,
            dma_state: DmaState::Idle,
            dma_active_channel: None,
            speaker_counter2_output: false,
        };
        bus.reset();
        bus
    }

    /// A `Bus` with empty RAM and no ROM image, sized for unit/integration
    /// tests that only exercise a handful of addresses.
    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::new()
    }

    pub fn reset(&mut self) {
        self.pic.reset();
        self.pit.reset();
        self.ppi.reset();
        self.dma.reset();
        self.cga.reset();
        self.fdc.reset();
        self.keyboard.reset();
        self.nmi_enabled = false;
        self.master_tick = 0;
        self.dma_state = DmaState::Idle;
        self.dma_active_channel = None;
    }

    pub fn load_rom(&mut self, image: &[u8]) -> Result<()> {
        self.rom = Rom::from_image(image)?;
        Ok(())
    }

    pub fn load_floppy(&mut self, drive: usize, image: Vec<u8>, write_protected: bool) -> Result<()> {
        if drive >= 4 {
            return Err(EmulatorError::InvalidDriveIndex(drive as u8));
        }
        self.fdc.load_image(drive, image, write_protected)
    }

    pub fn ram(&self) -> &[u8] {
        self.ram.as_slice()
    }

    pub fn rom_size(&self) -> usize {
        self.rom.size()
    }

    /// NMI mask register state (port 0xA0, bit 7). Not yet wired to any NMI
    /// source; no PC/XT chipset device in this core raises NMI.
    pub fn nmi_enabled(&self) -> bool {
        self.nmi_enabled
    }

    pub fn front_buffer(&self) -> &[u32] {
        self.cga.front_buffer()
    }

    // --- CPU-facing memory access -----------------------------------------

    pub fn read_u8(&mut self, physical: u32) -> u8 {
        let addr = physical & 0xF_FFFF;
        if let Some(offset) = ram::cga_aperture_offset(addr) {
            self.cga_vram_read(offset)
        } else if let Some(byte) = self.ram.read(addr) {
            byte
        } else if let Some(byte) = self.rom.read(addr) {
            byte
        } else {
            log::trace!("open-bus read at {:#07x}", addr);
            0xFF
        }
    }

    pub fn write_u8(&mut self, physical: u32, value: u8) {
        let addr = physical & 0xF_FFFF;
        if let Some(offset) = ram::cga_aperture_offset(addr) {
            self.cga_vram_write(offset, value);
        } else if !self.ram.write(addr, value) {
            log::trace!("open-bus write at {:#07x}", addr);
        }
    }

    pub fn read_u16(&mut self, physical: u32) -> u16 {
        let low = self.read_u8(physical) as u16;
        let high = self.read_u8(physical.wrapping_add(1) & 0xF_FFFF) as u16;
        low | (high << 8)
    }

    pub fn write_u16(&mut self, physical: u32, value: u16) {
        self.write_u8(physical, value as u8);
        self.write_u8(physical.wrapping_add(1) & 0xF_FFFF, (value >> 8) as u8);
    }

    fn cga_vram_read(&mut self, offset: u32) -> u8 {
        self.cga.read_vram(offset)
    }

    fn cga_vram_write(&mut self, offset: u32, value: u8) {
        self.cga.write_vram(offset, value);
    }

    pub fn peek_physical(&mut self, physical: u32) -> u8 {
        self.read_u8(physical)
    }

    // --- CPU-facing I/O access ----------------------------------------------

    pub fn read_io_u8(&mut self, port: u16) -> u8 {
        match port {
            0x08 => self.dma.read_status(),
            0x00..=0x1F => self.dma.read_channel_port((port & 0x0F) as u8),
            0x20..=0x3F => self.pic.read_port((port & 1) as u8),
            0x40..=0x5F => self.pit.read_port((port & 0x03) as u8),
            0x60..=0x7F => self.ppi.read_port((port & 0x03) as u8),
            0x80..=0x9F => self.read_dma_page(port),
            0xA0..=0xBF => 0xFF,
            0x3C0..=0x3CF => self.cga.read_io(port - 0x3C0),
            0x3E0..=0x3E7 => self.fdc.read_io(port - 0x3E0),
            _ => {
                log::trace!("unmapped I/O read at port {:#06x}", port);
                0xFF
            }
        }
    }

    pub fn write_io_u8(&mut self, port: u16, value: u8) {
        match port {
            0x00..=0x07 => self.dma.write_channel_port((port & 0x0F) as u8, value),
            0x08 => self.dma.write_command(value),
            0x09 => {} // request register: not driven by any PC/XT chipset device
            0x0A => self.dma.write_single_mask(value),
            0x0B => self.dma.write_mode(value),
            0x0C => self.dma.clear_byte_pointer_flip_flop(),
            0x0D => self.dma.reset(),
            0x0E => self.dma.write_mask_register(0), // clear mask register: unmask all
            0x0F => self.dma.write_mask_register(value),
            0x10..=0x1F => {}
            0x20..=0x3F => self.pic.write_port((port & 1) as u8, value),
            0x40..=0x5F => self.pit.write_port((port & 0x03) as u8, value),
            0x60..=0x7F => self.write_ppi(port, value),
            0x80..=0x9F => self.write_dma_page(port, value),
            0xA0..=0xBF => self.nmi_enabled = value & 0x80 != 0,
            0x3C0..=0x3CF => self.cga.write_io(port - 0x3C0, value),
            0x3E0..=0x3E7 => self.fdc.write_io(port - 0x3E0, value),
            _ => log::trace!("unmapped I/O write at port {:#06x} = {:#04x}", port, value),
        }
    }

    fn write_ppi(&mut self, port: u16, value: u8) {
        self.ppi.write_port((port & 0x03) as u8, value);
        self.keyboard.set_clock_line_state(self.ppi.keyboard_clock_line_high());
        if self.ppi.keyboard_clear_pending() {
            self.pic.clear_irq_line(1);
        }
    }

    fn read_dma_page(&self, port: u16) -> u8 {
        for (p, channel) in DMA_CHANNEL_FOR_PAGE_PORT {
            if p == port {
                return self.dma.read_page(channel);
            }
        }
        0xFF
    }

    fn write_dma_page(&mut self, port: u16, value: u8) {
        for (p, channel) in DMA_CHANNEL_FOR_PAGE_PORT {
            if p == port {
                self.dma.write_page(channel, value);
                return;
            }
        }
    }

    pub fn read_io_u16(&mut self, port: u16) -> u16 {
        let low = self.read_io_u8(port) as u16;
        let high = self.read_io_u8(port.wrapping_add(1)) as u16;
        low | (high << 8)
    }

    pub fn write_io_u16(&mut self, port: u16, value: u16) {
        self.write_io_u8(port, value as u8);
        self.write_io_u8(port.wrapping_add(1), (value >> 8) as u8);
    }

    // --- Interrupt interface used by the CPU -------------------------------

    pub fn maskable_interrupt_pending(&self) -> bool {
        self.pic.interrupt_pending()
    }

    pub fn acknowledge_interrupt(&mut self) -> Option<u8> {
        self.pic.acknowledge()
    }

    // --- Host-facing interface ----------------------------------------------

    pub fn send_scancode(&mut self, scancode: u8) {
        self.keyboard.push_scancode(scancode);
    }

    /// Advance every device by one master clock tick (1/3 of a CPU cycle).
    pub fn tick(&mut self) {
        self.master_tick += 1;

        if self.cga.tick() {
            // vsync edge: nothing extra to do at the bus level, the CGA
            // already swapped its double buffer.
        }

        if self.master_tick % PIT_TICK_PERIOD == 0 {
            self.tick_pit();
        }

        if self.master_tick % PPI_SAMPLE_PERIOD == 0 {
            self.sample_ppi();
        }

        if self.master_tick % SLOW_DEVICE_PERIOD == 0 {
            self.keyboard_tick();
            self.fdc.tick();
        }

        self.step_dma();
    }

    fn tick_pit(&mut self) {
        let out = [self.pit.tick(0), self.pit.tick(1), self.pit.tick(2)];
        if out[0] {
            self.pic.raise_irq(0);
        }
        if out[1] {
            // Counter 1's rising edge triggers a DRAM-refresh style DMA
            // request on channel 0 when DACK0 is not already asserted.
            if self.dma_active_channel != Some(0) {
                self.dma.set_request(0, true);
            }
        }
        let counter2_output = out[2];
        if counter2_output != self.speaker_counter2_output {
            self.speaker_counter2_output = counter2_output;
        }
    }

    fn sample_ppi(&mut self) {
        self.keyboard.set_clock_line_state(self.ppi.keyboard_clock_line_high());
        if self.ppi.keyboard_clear_pending() {
            self.pic.clear_irq_line(1);
        }
    }

    fn keyboard_tick(&mut self) {
        if let Some(byte) = self.keyboard.tick() {
            self.ppi.latch_scancode(byte);
            self.pic.raise_irq(1);
        } else if let Some(scancode) = self.keyboard.get_scancode() {
            self.ppi.latch_scancode(scancode);
            self.pic.raise_irq(1);
        }
        if self.fdc.poll_irq() {
            self.pic.raise_irq(6);
        }
    }

    /// Current speaker drive state: (counter 2 output, PPI speaker-gate mask).
    pub fn speaker_state(&self) -> (bool, u8) {
        (self.speaker_counter2_output, self.ppi.speaker_mask())
    }

    /// PIT counter 0's elapsed tick count, used to timestamp speaker callback events.
    pub fn pit_ticks(&self) -> u64 {
        self.pit.elapsed_ticks()
    }

    fn step_dma(&mut self) {
        self.dma_state = match self.dma_state {
            DmaState::Idle => {
                if let Some(channel) = self.highest_priority_request() {
                    self.dma_active_channel = Some(channel);
                    DmaState::Dreq
                } else {
                    DmaState::Idle
                }
            }
            DmaState::Dreq => DmaState::Hrq,
            DmaState::Hrq => DmaState::HoldWait,
            DmaState::HoldWait => DmaState::PreAen,
            DmaState::PreAen => DmaState::Aen,
            DmaState::Aen => DmaState::S0,
            DmaState::S0 => DmaState::S1,
            DmaState::S1 => DmaState::S2,
            DmaState::S2 => {
                self.perform_dma_transfer();
                DmaState::S3
            }
            DmaState::S3 => DmaState::Wait,
            DmaState::Wait => DmaState::S4,
            DmaState::S4 => DmaState::DelayedT1,
            DmaState::DelayedT1 => DmaState::DelayedT2,
            DmaState::DelayedT2 => DmaState::DelayedT3,
            DmaState::DelayedT3 => {
                self.dma_active_channel = None;
                DmaState::Idle
            }
        };
    }

    fn highest_priority_request(&self) -> Option<usize> {
        (0..4).find(|&ch| self.dma.channel(ch).request && !self.dma.channel(ch).masked)
    }

    fn perform_dma_transfer(&mut self) {
        let Some(channel) = self.dma_active_channel else { return };
        let physical = self.dma.channel(channel).physical_address();
        let terminal = if channel == 2 {
            self.step_fdc_dma(physical)
        } else {
            false
        };
        if self.dma.channel_mut(channel).advance() || terminal {
            self.dma.mark_terminal_count(channel);
            self.dma.set_request(channel, false);
            if channel == 2 {
                self.fdc.dma_device_eop();
            }
        }
    }

    fn step_fdc_dma(&mut self, physical: u32) -> bool {
        if !self.fdc.is_drq_asserted() {
            return true;
        }
        let mode_write_to_memory = self.dma.channel(2).mode & 0x0C == 0x08;
        if mode_write_to_memory {
            let byte = self.fdc.dma_device_read();
            self.write_u8(physical, byte);
        } else {
            let byte = self.read_u8(physical);
            self.fdc.dma_device_write(byte);
        }
        false
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_round_trips_through_physical_address() {
        let mut bus = Bus::new_for_test();
        bus.write_u8(0x1234, 0xAB);
        assert_eq!(bus.read_u8(0x1234), 0xAB);
    }

    #[test]
    fn io_port_band_routes_to_pic() {
        let mut bus = Bus::new_for_test();
        bus.write_io_u8(0x20, 0b0001_0011); // ICW1: edge, single, ICW4 needed
        bus.write_io_u8(0x21, 0x08); // ICW2: vector base
        bus.write_io_u8(0x21, 0x01); // ICW4
        bus.pic.raise_irq(0);
        assert!(bus.maskable_interrupt_pending());
    }

    #[test]
    fn dma_page_register_non_linear_mapping_routes_correctly() {
        let mut bus = Bus::new_for_test();
        bus.write_io_u8(0x87, 0x0A); // channel 0 page
        bus.write_io_u8(0x83, 0x0B); // channel 1 page
        assert_eq!(bus.dma.read_page(0), 0x0A);
        assert_eq!(bus.dma.read_page(1), 0x0B);
    }

    #[test]
    fn unmapped_memory_reads_open_bus() {
        let mut bus = Bus::new_for_test();
        assert_eq!(bus.read_u8(0xBD000), 0xFF);
    }
}
