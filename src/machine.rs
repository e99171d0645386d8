/*!
machine - the embedding-facing handle tying the CPU and chipset together.

A thin orchestrator: it owns a `Cpu` and a `Bus`, advances them in lockstep
(one CPU clock is three master ticks at the 8088's default clock divider),
and exposes the inspection/control surface a frontend needs without handing
out the CPU or Bus types directly.
*/

use crate::bus::Bus;
use crate::cpu::{Cpu, Reg, RunResult};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Stopped,
    Halt,
    BreakpointHit,
}

type SpeakerCallback = Box<dyn FnMut(u64, bool, u8)>;

pub struct Machine {
    cpu: Cpu,
    bus: Bus,
    state: MachineState,
    speaker_callback: Option<SpeakerCallback>,
    last_speaker_state: (bool, u8),
}

impl Machine {
    pub fn new() -> Self {
        let mut machine = Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            state: MachineState::Stopped,
            speaker_callback: None,
            last_speaker_state: (false, 0),
        };
        machine.reset_machine();
        machine
    }

    /// Install a hook invoked as `(pit_ticks, counter2_output, speaker_mask)`
    /// whenever counter 2's output or the PPI speaker mask changes, so a
    /// frontend can synthesise PC-speaker audio.
    pub fn set_speaker_callback(&mut self, callback: impl FnMut(u64, bool, u8) + 'static) {
        self.speaker_callback = Some(Box::new(callback));
    }

    pub fn clear_speaker_callback(&mut self) {
        self.speaker_callback = None;
    }

    fn poll_speaker_callback(&mut self) {
        let state = self.bus.speaker_state();
        if state != self.last_speaker_state {
            self.last_speaker_state = state;
            if let Some(callback) = self.speaker_callback.as_mut() {
                callback(self.bus.pit_ticks(), state.0, state.1);
            }
        }
    }

    pub fn load_bios(&mut self, image: &[u8]) -> Result<()> {
        self.bus.load_rom(image)
    }

    pub fn load_floppy(&mut self, drive: usize, image: Vec<u8>, write_protected: bool) -> Result<()> {
        self.bus.load_floppy(drive, image, write_protected)
    }

    /// Advance the machine by `master_ticks` 14.318 MHz clock ticks (the
    /// 8088's input clock, divided by 3 for its own cycle rate). Devices are
    /// ticked for every master tick; the CPU executes one cycle every third.
    pub fn run_for(&mut self, master_ticks: u64) -> MachineState {
        self.state = MachineState::Running;
        for tick in 0..master_ticks {
            self.bus.tick();
            self.poll_speaker_callback();
            if (tick + 1) % 3 == 0 {
                match self.cpu.cycle(&mut self.bus) {
                    Some(RunResult::Halt) => {
                        self.state = MachineState::Halt;
                        return self.state;
                    }
                    Some(RunResult::BreakpointHit) => {
                        self.state = MachineState::BreakpointHit;
                        return self.state;
                    }
                    _ => {}
                }
            }
        }
        self.state = MachineState::Stopped;
        self.state
    }

    /// Advance until the CPU reaches its next instruction boundary. Returns
    /// the number of CPU cycles consumed.
    pub fn step_instruction(&mut self) -> u64 {
        let start = self.cpu.cycle_count;
        loop {
            self.bus.tick();
            self.bus.tick();
            self.bus.tick();
            self.poll_speaker_callback();
            match self.cpu.cycle(&mut self.bus) {
                Some(RunResult::Halt) => {
                    self.state = MachineState::Halt;
                    break;
                }
                Some(RunResult::BreakpointHit) => {
                    self.state = MachineState::BreakpointHit;
                    break;
                }
                Some(RunResult::Ok) => {
                    if self.state == MachineState::Running {
                        self.state = MachineState::Stopped;
                    }
                    break;
                }
                None => {}
            }
        }
        self.cpu.cycle_count - start
    }

    pub fn reset_cpu(&mut self) {
        self.cpu.reset();
    }

    pub fn reset_machine(&mut self) {
        self.cpu.reset();
        self.bus.reset();
        self.state = MachineState::Stopped;
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn send_scancode(&mut self, scancode: u8) {
        self.bus.send_scancode(scancode);
    }

    pub fn peek_physical(&mut self, address: u32) -> u8 {
        self.bus.peek_physical(address)
    }

    pub fn ram(&self) -> &[u8] {
        self.bus.ram()
    }

    pub fn rom_size(&self) -> usize {
        self.bus.rom_size()
    }

    pub fn registers(&self) -> &crate::cpu::RegisterFile {
        &self.cpu.regs
    }

    pub fn front_buffer(&self) -> &[u32] {
        self.bus.front_buffer()
    }

    pub fn cycle_count(&self) -> u64 {
        self.cpu.cycle_count
    }

    pub fn set_breakpoint(&mut self, cs: u16, ip: u16) {
        self.cpu.breakpoint.cs = cs;
        self.cpu.breakpoint.ip = ip;
        self.cpu.breakpoint.armed = true;
    }

    pub fn clear_breakpoint(&mut self) {
        self.cpu.breakpoint.armed = false;
    }

    pub fn breakpoint_hit(&self) -> bool {
        self.state == MachineState::BreakpointHit
    }

    pub fn halted(&self) -> bool {
        self.state == MachineState::Halt
    }

    pub fn real_ip(&self) -> u16 {
        self.cpu.regs.get(Reg::Pc)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_machine_resets_cs_ip_to_reset_vector() {
        let machine = Machine::new();
        assert_eq!(machine.registers().get(Reg::Cs), 0xFFFF);
        assert_eq!(machine.registers().get(Reg::Pc), 0x0000);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut machine = Machine::new();
        machine.reset_machine();
        let regs_once = machine.registers().get(Reg::Cs);
        machine.reset_machine();
        let regs_twice = machine.registers().get(Reg::Cs);
        assert_eq!(regs_once, regs_twice);
    }

    #[test]
    fn run_for_advances_cycle_count() {
        let mut machine = Machine::new();
        machine.run_for(30);
        assert!(machine.cycle_count() > 0);
    }

    #[test]
    fn speaker_callback_is_not_invoked_without_a_state_change() {
        use std::cell::Cell;
        use std::rc::Rc;
        let calls = Rc::new(Cell::new(0u32));
        let calls_clone = Rc::clone(&calls);
        let mut machine = Machine::new();
        machine.set_speaker_callback(move |_, _, _| calls_clone.set(calls_clone.get() + 1));
        machine.run_for(0);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn invalid_floppy_image_is_rejected_before_touching_the_drive() {
        let mut machine = Machine::new();
        let err = machine.load_floppy(0, vec![0u8; 1234], false).unwrap_err();
        assert!(matches!(err, crate::error::EmulatorError::InvalidFloppyImage { .. }));
    }

    #[test]
    fn hlt_opcode_sets_halt_state_not_breakpoint_hit() {
        let mut machine = Machine::new();
        let mut rom = vec![0u8; 8 * 1024];
        rom[0x1FF0] = 0xF4; // HLT at the reset vector FFFF:0000 -> physical 0xFFFF0
        machine.load_bios(&rom).unwrap();
        let state = machine.run_for(1000);
        assert_eq!(state, MachineState::Halt);
        assert!(machine.halted());
        assert!(!machine.breakpoint_hit());
    }
}
