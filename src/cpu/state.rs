/*!
cpu::state - pipeline state that is not plain architectural register content.

`MicrocodeState` is the bus-interface-adjacent state machine from the data
model's "CPU states" list. `CarryLatch` models the separate gate that
decides whether an ALU op's CF actually reaches FLAGS (cleared during EA
computation and by the "no carry update" group bit).
*/

/// Bus-interface / instruction-pipeline state. Named after the data model's
/// enumerated CPU states; transitions live in `cpu::execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrocodeState {
    Running,
    WaitingForQueueData,
    WaitingForQueueIdle,
    IoDelay1,
    IoDelay2,
    WaitingUntilFirstByteCanStart,
    WaitingUntilFirstByteDone,
    WaitingUntilSecondByteDone,
    SingleCycleWait,
    Suspending,
    HaltingStart,
    Halting3,
    Halting2,
    Halting1,
    Halted,
}

/// T-state of an in-flight bus cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusTState {
    T1,
    T2,
    T3,
    Tw,
    T4,
    Tidle,
}

/// The four-state instruction loader (opcode fetch / ModR/M fetch / dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    FetchOpcode = 0,
    FetchModrm = 1,
    Dispatch = 2,
    Executing = 3,
}

/// Gates whether an ALU op's CF is allowed to reach FLAGS. Held closed
/// during effective-address computation and by the group decoder's
/// "no carry update" bit; opened by the next ALU-precondition microcode word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CarryLatch(bool);

impl CarryLatch {
    pub fn open(&mut self) {
        self.0 = true;
    }

    pub fn close(&mut self) {
        self.0 = false;
    }

    pub fn is_open(self) -> bool {
        self.0
    }
}

/// Outcome of `Cpu::run_for`/`step_instruction`, surfaced to the embedding
/// layer (`Machine`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Ok,
    Halt,
    BreakpointHit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Breakpoint {
    pub cs: u16,
    pub ip: u16,
    pub armed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_latch_defaults_closed() {
        let latch = CarryLatch::default();
        assert!(!latch.is_open());
    }

    #[test]
    fn carry_latch_opens_and_closes() {
        let mut latch = CarryLatch::default();
        latch.open();
        assert!(latch.is_open());
        latch.close();
        assert!(!latch.is_open());
    }
}
