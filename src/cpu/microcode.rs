/*!
cpu::microcode - the synthesized decode tables.

The original project builds its `microcode`/`microcode_index`/`translation`/
`groups` arrays by parsing raw ROM bit-matrix text files at startup. Those
ROM images are not part of this distribution (see the architecture decision
in `DESIGN.md`), so this module instead *computes* the equivalent
per-opcode metadata from the documented 8086/8088 instruction encoding.

The externally observable contract is preserved: a 256-entry `GroupTable`
built once, read-only afterwards, describing per-opcode attributes (has
ModR/M, word/byte, is a memory-touching opcode, carries a segment-override
or REP prefix, etc.) — the same shape described in the data model's
`groups[257]` field, minus the literal PLA bit-matrix.
*/

use std::sync::OnceLock;

bitflags_lite::bitflags_lite! {
    /// Per-opcode attribute bitset (the "group decode vector").
    pub struct GroupFlags: u16 {
        const HAS_MODRM        = 1 << 0;
        const WORD_OP          = 1 << 1;
        const MEMORY_ACCESS    = 1 << 2;
        const SEGMENT_OVERRIDE = 1 << 3;
        const REP_PREFIX       = 1 << 4;
        const LOCK_PREFIX      = 1 << 5;
        const IS_HLT           = 1 << 6;
        const IS_PREFIX        = 1 << 7;
        const NO_CARRY_UPDATE  = 1 << 8;
    }
}

/// A tiny inline replacement for the `bitflags` crate macro surface used
/// above: this codebase has no external bitflags dependency, so the macro
/// is hand-rolled here rather than reached for from crates.io, matching the
/// "closed enumeration, no dynamic dispatch in the hot path" design note.
mod bitflags_lite {
    macro_rules! bitflags_lite {
        (
            $(#[$meta:meta])*
            pub struct $name:ident: $repr:ty {
                $(const $flag:ident = $value:expr;)*
            }
        ) => {
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
            pub struct $name($repr);

            impl $name {
                $(pub const $flag: $name = $name($value);)*

                pub const fn empty() -> Self {
                    $name(0)
                }

                pub const fn contains(self, other: Self) -> bool {
                    (self.0 & other.0) == other.0
                }

                pub const fn union(self, other: Self) -> Self {
                    $name(self.0 | other.0)
                }
            }

            impl std::ops::BitOr for $name {
                type Output = Self;
                fn bitor(self, rhs: Self) -> Self {
                    self.union(rhs)
                }
            }
        };
    }
    pub(crate) use bitflags_lite;
}

/// Decode the group-attribute vector for one opcode byte. This mirrors the
/// documented 8086 opcode map rather than a literal PLA bit-matrix.
pub fn decode_group(opcode: u8) -> GroupFlags {
    let mut flags = GroupFlags::empty();
    let word_bit = opcode & 1 != 0;

    match opcode {
        // ALU reg/mem <-> reg/mem forms: 00-3D excluding segment/inc-dec bytes.
        0x00..=0x3D if (opcode & 0xC0) == 0x00 || opcode & 0xC7 <= 0x05 => {
            if opcode & 0x04 == 0 {
                flags = flags.union(GroupFlags::HAS_MODRM).union(GroupFlags::MEMORY_ACCESS);
            }
            if word_bit {
                flags = flags.union(GroupFlags::WORD_OP);
            }
        }
        // MOV reg/mem, reg/mem (0x88-0x8B), LEA (0x8D), POP r/m (0x8F).
        0x88..=0x8B | 0x8D | 0x8F => {
            flags = flags.union(GroupFlags::HAS_MODRM).union(GroupFlags::MEMORY_ACCESS);
            if word_bit || opcode == 0x8D {
                flags = flags.union(GroupFlags::WORD_OP);
            }
        }
        // Immediate group (80/81/83), shift/rotate group (C0/C1/D0-D3), INC/DEC/CALL/JMP/PUSH r/m (FE/FF), TEST r/m (84/85).
        0x80..=0x85 | 0xC0 | 0xC1 | 0xD0..=0xD3 | 0xFE | 0xFF => {
            flags = flags.union(GroupFlags::HAS_MODRM).union(GroupFlags::MEMORY_ACCESS);
            if word_bit {
                flags = flags.union(GroupFlags::WORD_OP);
            }
        }
        0xF6 | 0xF7 => {
            flags = flags.union(GroupFlags::HAS_MODRM).union(GroupFlags::MEMORY_ACCESS);
            if opcode == 0xF7 {
                flags = flags.union(GroupFlags::WORD_OP);
            }
        }
        0xF0 => flags = flags.union(GroupFlags::LOCK_PREFIX).union(GroupFlags::IS_PREFIX),
        0xF2 | 0xF3 => flags = flags.union(GroupFlags::REP_PREFIX).union(GroupFlags::IS_PREFIX),
        0x26 | 0x2E | 0x36 | 0x3E => {
            flags = flags.union(GroupFlags::SEGMENT_OVERRIDE).union(GroupFlags::IS_PREFIX)
        }
        0xF4 => flags = flags.union(GroupFlags::IS_HLT),
        _ => {}
    }

    flags
}

pub struct GroupTable {
    entries: [GroupFlags; 256],
}

impl GroupTable {
    pub fn get(&self, opcode: u8) -> GroupFlags {
        self.entries[opcode as usize]
    }
}

static GROUP_TABLE: OnceLock<GroupTable> = OnceLock::new();

/// Build (once) and return the process-wide group-decode table.
pub fn group_table() -> &'static GroupTable {
    GROUP_TABLE.get_or_init(|| {
        let mut entries = [GroupFlags::empty(); 256];
        for (opcode, slot) in entries.iter_mut().enumerate() {
            *slot = decode_group(opcode as u8);
        }
        GroupTable { entries }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_al_imm8_has_no_modrm() {
        let flags = decode_group(0x04); // ADD AL, imm8
        assert!(!flags.contains(GroupFlags::HAS_MODRM));
    }

    #[test]
    fn add_reg_rm_word_has_modrm_and_word_bit() {
        let flags = decode_group(0x03); // ADD r16, r/m16
        assert!(flags.contains(GroupFlags::HAS_MODRM));
        assert!(flags.contains(GroupFlags::WORD_OP));
    }

    #[test]
    fn hlt_is_flagged() {
        assert!(decode_group(0xF4).contains(GroupFlags::IS_HLT));
    }

    #[test]
    fn segment_override_prefixes_are_flagged() {
        for op in [0x26u8, 0x2E, 0x36, 0x3E] {
            assert!(decode_group(op).contains(GroupFlags::SEGMENT_OVERRIDE));
        }
    }

    #[test]
    fn group_table_is_built_once_and_matches_function() {
        let table = group_table();
        assert_eq!(table.get(0xF4), decode_group(0xF4));
    }
}
