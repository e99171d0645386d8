#![doc = r#"
Cycle-oriented IBM PC/XT emulator core.

This crate exposes the machine's CPU, chipset, and ROM-loading pieces for
use by an embedding frontend (see `src/main.rs` for a headless CLI driver).

Modules:
- cpu: the 8088-pipeline-shaped CPU core (register file, prefetch queue, ALU,
  per-cycle interpreter)
- bus: the chipset facade (RAM/ROM, PIC, PIT, DMAC, PPI, CRTC, CGA, FDC,
  keyboard) and the master-tick scheduler
- machine: the embedding-facing handle tying the CPU and Bus together
- rom: BIOS and floppy image loading
- error: the crate-level `EmulatorError` used at the embedding boundary

Internal programming violations (a corrupt table index, an out-of-range
register) are asserted, not returned as `Result` — see `error` for the
external-failure boundary this crate actually surfaces.
"#]

pub mod bus;
pub mod cpu;
pub mod error;
pub mod machine;
pub mod rom;

pub use error::{EmulatorError, Result};
pub use machine::Machine;
