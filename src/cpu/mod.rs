/*!
cpu - the microcoded-in-spirit 8088 core.

This module is organized the way the pipeline it models is organized:

    regs.rs      - the flat 32-slot register file and the FLAGS bit layout.
    queue.rs     - the prefetch queue (4-entry ring buffer on the 8088).
    state.rs     - pipeline state that is not architectural register content
                   (`MicrocodeState`, the bus T-state, the carry latch).
    alu.rs       - the 26-operation ALU with full 8086 flag semantics.
    microcode.rs - the synthesized opcode group-decode table.
    execute.rs   - the per-cycle interpreter tying the above together.

Only `Cpu` and the handful of types an embedder needs (`RunResult`,
`Breakpoint`, `Reg`, `flags`) are re-exported here.
*/

mod alu;
mod microcode;
mod queue;
mod regs;
mod state;

mod execute;

pub use execute::Cpu;
pub use regs::{flags, Reg, RegisterFile};
pub use state::{Breakpoint, RunResult};
