/*!
bus::fdc - 765-family floppy disk controller.

Models the command/result FIFO protocol, drive geometry inference from
image size, and the DMA channel-2 handshake (DREQ/DACK, terminal-count
driven result-phase entry) documented for the PC/XT's single floppy
controller. Command set: Specify, Sense Interrupt Status, Check Drive
Status, Recalibrate, Seek, Read Data, Write Data, Read ID, Format Track.
*/

pub const PORT_DOR: u16 = 2;
pub const PORT_MSR: u16 = 4;
pub const PORT_DATA: u16 = 5;

pub mod msr {
    pub const DRIVE0_BUSY: u8 = 1 << 0;
    pub const FDC_BUSY: u8 = 1 << 4;
    pub const NON_DMA_MODE: u8 = 1 << 5;
    pub const DIO_CONTROLLER_TO_CPU: u8 = 1 << 6;
    pub const REQUEST_FOR_MASTER: u8 = 1 << 7;
}

#[derive(Debug, Clone, Copy)]
struct DiskFormat {
    cylinders: u8,
    heads: u8,
    sectors_per_track: u8,
}

fn infer_geometry(byte_len: usize) -> Option<DiskFormat> {
    match byte_len {
        163_840 => Some(DiskFormat { cylinders: 40, heads: 1, sectors_per_track: 8 }),
        184_320 => Some(DiskFormat { cylinders: 40, heads: 1, sectors_per_track: 9 }),
        327_680 => Some(DiskFormat { cylinders: 40, heads: 2, sectors_per_track: 8 }),
        368_640 => Some(DiskFormat { cylinders: 40, heads: 2, sectors_per_track: 9 }),
        737_280 => Some(DiskFormat { cylinders: 80, heads: 2, sectors_per_track: 9 }),
        1_228_800 => Some(DiskFormat { cylinders: 80, heads: 2, sectors_per_track: 15 }),
        1_474_560 => Some(DiskFormat { cylinders: 80, heads: 2, sectors_per_track: 18 }),
        _ => None,
    }
}

pub struct Drive {
    image: Vec<u8>,
    geometry: DiskFormat,
    pub cylinder: u8,
    pub motor_on: bool,
    pub write_protected: bool,
}

impl Drive {
    fn new(image: Vec<u8>, geometry: DiskFormat, write_protected: bool) -> Self {
        Self { image, geometry, cylinder: 0, motor_on: false, write_protected }
    }

    fn chs_to_offset(&self, cylinder: u8, head: u8, sector: u8) -> Option<usize> {
        if sector == 0 || sector as u32 > self.geometry.sectors_per_track as u32 {
            return None;
        }
        let lba = (cylinder as u32 * self.geometry.heads as u32 + head as u32)
            * self.geometry.sectors_per_track as u32
            + (sector as u32 - 1);
        Some(lba as usize * 512)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Command(u8),  // opcode, collecting parameter bytes
    Executing,
    Result,
}

#[derive(Clone, Copy, Default)]
struct OpState {
    opcode: u8,
    params: [u8; 8],
    param_count: u8,
    result: [u8; 7],
    result_len: u8,
    result_pos: u8,
}

pub struct Fdc765 {
    drives: [Option<Drive>; 4],
    phase: Phase,
    op: OpState,
    dor: u8,
    irq_pending: bool,
    sense_interrupt_needed: bool,
    dma_offset: usize,
    dma_remaining: u32,
    drq: bool,
    reset_pending_ticks: u32,
}

const RESET_TICKS: u32 = 22;

const OPC_SPECIFY: u8 = 0x03;
const OPC_SENSE_INT: u8 = 0x08;
const OPC_CHECK_STATUS: u8 = 0x04;
const OPC_CALIBRATE: u8 = 0x07;
const OPC_SEEK: u8 = 0x0F;
const OPC_READ_DATA: u8 = 0x06;
const OPC_WRITE_DATA: u8 = 0x05;
const OPC_READ_ID: u8 = 0x0A;
const OPC_FORMAT_TRACK: u8 = 0x0D;

fn param_count_for(opcode: u8) -> u8 {
    match opcode & 0x1F {
        OPC_SPECIFY => 2,
        OPC_SENSE_INT => 0,
        OPC_CHECK_STATUS => 1,
        OPC_CALIBRATE => 1,
        OPC_SEEK => 2,
        OPC_READ_DATA | OPC_WRITE_DATA => 8,
        OPC_READ_ID => 1,
        OPC_FORMAT_TRACK => 5,
        _ => 0,
    }
}

impl Fdc765 {
    pub fn new() -> Self {
        Self {
            drives: [None, None, None, None],
            phase: Phase::Idle,
            op: OpState::default(),
            dor: 0,
            irq_pending: false,
            sense_interrupt_needed: false,
            dma_offset: 0,
            dma_remaining: 0,
            drq: false,
            reset_pending_ticks: 0,
        }
    }

    pub fn load_image(
        &mut self,
        drive: usize,
        image: Vec<u8>,
        write_protected: bool,
    ) -> Result<(), crate::error::EmulatorError> {
        let geometry = infer_geometry(image.len()).ok_or(crate::error::EmulatorError::InvalidFloppyImage {
            drive: drive as u8,
            size: image.len(),
        })?;
        self.drives[drive] = Some(Drive::new(image, geometry, write_protected));
        Ok(())
    }

    pub fn is_drq_asserted(&self) -> bool {
        self.drq
    }

    pub fn poll_irq(&self) -> bool {
        self.irq_pending
    }

    pub fn ack_irq(&mut self) {
        self.irq_pending = false;
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.op = OpState::default();
        self.sense_interrupt_needed = true;
        self.irq_pending = true;
        self.drq = false;
        self.reset_pending_ticks = 0;
    }

    pub fn reset_power_on(&mut self) {
        self.reset();
        self.dor = 0;
    }

    pub fn read_io(&mut self, port: u16) -> u8 {
        match port {
            PORT_MSR => self.read_msr(),
            PORT_DATA => self.read_data(),
            _ => 0xFF,
        }
    }

    pub fn write_io(&mut self, port: u16, value: u8) {
        match port {
            PORT_DOR => self.write_dor(value),
            PORT_DATA => self.write_data(value),
            _ => {}
        }
    }

    fn write_dor(&mut self, value: u8) {
        let resetting = self.dor & 0x04 != 0 && value & 0x04 == 0;
        self.dor = value;
        if resetting {
            self.reset_pending_ticks = RESET_TICKS;
        }
        if let Some(drive) = self.drives[0].as_mut() {
            drive.motor_on = value & 0x10 != 0;
        }
    }

    fn read_msr(&self) -> u8 {
        let mut value = msr::REQUEST_FOR_MASTER;
        if matches!(self.phase, Phase::Result) {
            value |= msr::DIO_CONTROLLER_TO_CPU;
        }
        if !matches!(self.phase, Phase::Idle) {
            value |= msr::FDC_BUSY;
        }
        value
    }

    fn read_data(&mut self) -> u8 {
        match self.phase {
            Phase::Result => {
                let pos = self.op.result_pos as usize;
                let byte = self.op.result[pos];
                self.op.result_pos += 1;
                if self.op.result_pos >= self.op.result_len {
                    self.phase = Phase::Idle;
                }
                byte
            }
            _ => 0xFF,
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.phase {
            Phase::Idle => {
                self.op = OpState { opcode: value, ..OpState::default() };
                let needed = param_count_for(value);
                if needed == 0 {
                    self.phase = Phase::Executing;
                    self.dispatch_command();
                } else {
                    self.phase = Phase::Command(needed);
                }
            }
            Phase::Command(needed) => {
                let idx = self.op.param_count as usize;
                self.op.params[idx] = value;
                self.op.param_count += 1;
                if self.op.param_count >= needed {
                    self.phase = Phase::Executing;
                    self.dispatch_command();
                }
            }
            _ => {}
        }
    }

    fn dispatch_command(&mut self) {
        match self.op.opcode & 0x1F {
            OPC_SPECIFY => {
                self.phase = Phase::Idle;
            }
            OPC_SENSE_INT => {
                self.op.result = [0; 7];
                self.op.result[0] = 0x00; // ST0: normal termination, drive 0
                self.op.result[1] = self.current_cylinder(0);
                self.op.result_len = 2;
                self.op.result_pos = 0;
                self.phase = Phase::Result;
                self.sense_interrupt_needed = false;
            }
            OPC_CHECK_STATUS => {
                self.op.result[0] = 0x00;
                self.op.result_len = 1;
                self.op.result_pos = 0;
                self.phase = Phase::Result;
            }
            OPC_CALIBRATE => {
                if let Some(drive) = self.drives[0].as_mut() {
                    drive.cylinder = 0;
                }
                self.phase = Phase::Idle;
                self.irq_pending = true;
            }
            OPC_SEEK => {
                let cylinder = self.op.params[1];
                if let Some(drive) = self.drives[0].as_mut() {
                    drive.cylinder = cylinder;
                }
                self.phase = Phase::Idle;
                self.irq_pending = true;
            }
            OPC_WRITE_DATA if self.drive_write_protected(0) => self.finish_write_protected(),
            OPC_READ_DATA | OPC_WRITE_DATA => self.start_data_transfer(),
            OPC_READ_ID => {
                self.op.result = [0; 7];
                self.op.result[0] = 0;
                self.op.result[2] = self.current_cylinder(0);
                self.op.result[5] = 2; // N=2 -> 512-byte sectors
                self.op.result_len = 7;
                self.op.result_pos = 0;
                self.phase = Phase::Result;
                self.irq_pending = true;
            }
            OPC_FORMAT_TRACK if self.drive_write_protected(0) => self.finish_write_protected(),
            OPC_FORMAT_TRACK => self.start_data_transfer(),
            _ => {
                self.phase = Phase::Idle;
            }
        }
    }

    fn current_cylinder(&self, drive: usize) -> u8 {
        self.drives[drive].as_ref().map(|d| d.cylinder).unwrap_or(0)
    }

    fn drive_write_protected(&self, drive: usize) -> bool {
        self.drives[drive].as_ref().map(|d| d.write_protected).unwrap_or(false)
    }

    /// Abort with ST1 bit 1 (not writable) set, per the 765's write-protect response.
    fn finish_write_protected(&mut self) {
        self.op.result = [0; 7];
        self.op.result[0] = 0x40; // ST0: abnormal termination
        self.op.result[1] = 0x02; // ST1: not writable
        self.op.result_len = 7;
        self.op.result_pos = 0;
        self.phase = Phase::Result;
        self.irq_pending = true;
    }

    fn start_data_transfer(&mut self) {
        let cylinder = self.op.params[1];
        let head = self.op.params[2];
        let sector = self.op.params[3];
        let Some(drive) = self.drives[0].as_ref() else {
            self.finish_with_error();
            return;
        };
        let Some(offset) = drive.chs_to_offset(cylinder, head, sector) else {
            self.finish_with_error();
            return;
        };
        self.dma_offset = offset;
        self.dma_remaining = 512;
        self.drq = true;
    }

    fn finish_with_error(&mut self) {
        self.op.result = [0; 7];
        self.op.result[0] = 0x40; // ST0: abnormal termination
        self.op.result_len = 7;
        self.op.result_pos = 0;
        self.phase = Phase::Result;
        self.irq_pending = true;
    }

    /// DMA channel 2 pulls one byte for a read command.
    pub fn dma_device_read(&mut self) -> u8 {
        let opcode_is_read = self.op.opcode & 0x1F == OPC_READ_DATA;
        let byte = if opcode_is_read {
            self.drives[0].as_ref().map(|d| d.image.get(self.dma_offset).copied().unwrap_or(0xFF)).unwrap_or(0xFF)
        } else {
            0xFF
        };
        self.advance_dma();
        byte
    }

    /// DMA channel 2 pushes one byte for a write command.
    pub fn dma_device_write(&mut self, value: u8) {
        let opcode_is_write = self.op.opcode & 0x1F == OPC_WRITE_DATA;
        if opcode_is_write {
            if let Some(drive) = self.drives[0].as_mut() {
                if let Some(slot) = drive.image.get_mut(self.dma_offset) {
                    *slot = value;
                }
            }
        }
        self.advance_dma();
    }

    fn advance_dma(&mut self) {
        self.dma_offset += 1;
        self.dma_remaining = self.dma_remaining.saturating_sub(1);
        if self.dma_remaining == 0 {
            self.drq = false;
        }
    }

    /// Signalled by the DMA controller's terminal-count line for channel 2.
    pub fn dma_device_eop(&mut self) {
        self.drq = false;
        self.finalize_data_op();
    }

    fn finalize_data_op(&mut self) {
        self.op.result = [0; 7];
        self.op.result[0] = 0x00;
        self.op.result[3] = self.op.params[1];
        self.op.result[4] = self.op.params[2];
        self.op.result[5] = self.op.params[3].wrapping_add(1);
        self.op.result_len = 7;
        self.op.result_pos = 0;
        self.phase = Phase::Result;
        self.irq_pending = true;
    }

    pub fn tick(&mut self) {
        if self.reset_pending_ticks > 0 {
            self.reset_pending_ticks -= 1;
            if self.reset_pending_ticks == 0 {
                self.reset();
            }
        }
    }
}

impl Default for Fdc765 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn geometry_inferred_from_standard_360k_image() {
        let format = infer_geometry(368_640).unwrap();
        assert_eq!(format.cylinders, 40);
        assert_eq!(format.heads, 2);
        assert_eq!(format.sectors_per_track, 9);
    }

    #[test]
    fn unrecognized_image_size_is_rejected() {
        let mut fdc = Fdc765::new();
        let err = fdc.load_image(0, vec![0u8; 12345], false).unwrap_err();
        assert!(matches!(err, crate::error::EmulatorError::InvalidFloppyImage { .. }));
    }

    #[test]
    fn sense_interrupt_after_reset_returns_two_byte_result() {
        let mut fdc = Fdc765::new();
        fdc.load_image(0, disk_image(368_640), false).unwrap();
        fdc.reset();
        fdc.write_io(PORT_DATA, 0x08); // Sense Interrupt Status
        assert_eq!(fdc.read_io(PORT_DATA), 0x00);
        assert_eq!(fdc.read_io(PORT_DATA), 0x00); // cylinder 0
    }

    #[test]
    fn read_data_command_asserts_drq_and_streams_sector() {
        let mut fdc = Fdc765::new();
        let image = disk_image(368_640);
        fdc.load_image(0, image.clone(), false).unwrap();
        fdc.write_io(PORT_DATA, OPC_READ_DATA);
        for param in [0u8, 0, 0, 1, 2, 9, 0x1B, 0xFF] {
            fdc.write_io(PORT_DATA, param);
        }
        assert!(fdc.is_drq_asserted());
        let first_byte = fdc.dma_device_read();
        assert_eq!(first_byte, image[0]);
    }

    #[test]
    fn terminal_count_enters_result_phase() {
        let mut fdc = Fdc765::new();
        fdc.load_image(0, disk_image(368_640), false).unwrap();
        fdc.write_io(PORT_DATA, OPC_READ_DATA);
        for param in [0u8, 0, 0, 1, 2, 9, 0x1B, 0xFF] {
            fdc.write_io(PORT_DATA, param);
        }
        fdc.dma_device_eop();
        assert!(!fdc.is_drq_asserted());
        assert!(fdc.poll_irq());
    }

    #[test]
    fn write_data_on_write_protected_disk_aborts_with_st1_not_writable() {
        let mut fdc = Fdc765::new();
        fdc.load_image(0, disk_image(368_640), true).unwrap();
        fdc.write_io(PORT_DATA, OPC_WRITE_DATA);
        for param in [0u8, 0, 0, 1, 2, 9, 0x1B, 0xFF] {
            fdc.write_io(PORT_DATA, param);
        }
        assert!(!fdc.is_drq_asserted());
        assert_eq!(fdc.read_io(PORT_DATA), 0x40);
        assert_eq!(fdc.read_io(PORT_DATA), 0x02);
    }
}
