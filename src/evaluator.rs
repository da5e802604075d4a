//! Per-instruction abstract evaluator.
//!
//! One `step` call consumes one lowered operation, updates the symbolic
//! register file, and emits facts about the instruction. The outcome is a
//! tagged variant so the conservative-stop contract is visible at the type
//! level: a window driver keeps stepping on `Updated`/`FactOnly` and stops
//! on `Abort`, keeping every fact emitted before the stop.

use crate::encoding::{ExtendOption, Shift};
use crate::registers::RegisterFile;
use crate::{Address, Fact, MemoryProbe, Reg, ZR_OR_SP};

/// One evaluator operand: a register view or a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg { index: Reg, is64: bool },
    ShiftedReg { index: Reg, is64: bool, shift: Shift, amount: u8 },
    Imm(i64),
}

/// Base-register writeback mode of an indexed load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writeback {
    None,
    Pre,
    Post,
}

/// How a load/store names its effective address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadAddress {
    /// pc-relative literal, already resolved
    Literal { target: Address },
    /// base register plus immediate-or-register offset
    BaseOffset { base: Reg, offset: Operand, writeback: Writeback },
    /// base register plus extended register offset
    BaseRegister { base: Reg, rm: Reg, extend: ExtendOption, amount: u8 },
}

/// An evaluator operation, independent of how it was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// adr or adrp with the target already resolved against the pc
    Adr { rd: Reg, target: Address },
    Add { rd: Reg, is64: bool, lhs: Operand, rhs: Operand },
    Mov { rd: Reg, is64: bool, src: Operand },
    Load { rt: Reg, is64: bool, sign_extend_word: bool, address: LoadAddress },
    Store { address: LoadAddress },
    Branch { link: bool, target: Address },
    Nop,
}

/// Outcome of one evaluator step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The register file was updated; facts may have been emitted.
    Updated(Vec<Fact>),
    /// Nothing was written; the scan continues.
    FactOnly(Vec<Fact>),
    /// Conservative stop. Facts emitted by this step still stand.
    Abort(Vec<Fact>),
}

impl StepOutcome {
    /// Facts emitted by this step, in emission order.
    pub fn facts(&self) -> &[Fact] {
        match self {
            StepOutcome::Updated(f) | StepOutcome::FactOnly(f) | StepOutcome::Abort(f) => f,
        }
    }

    /// Whether the scan window may continue past this step.
    pub fn continues(&self) -> bool {
        !matches!(self, StepOutcome::Abort(_))
    }
}

/// Resolve an operand to its unsigned value, or `None` when it uses an
/// unknown register. Register 31 reads as literal 0.
fn resolve(regs: &RegisterFile, operand: &Operand) -> Option<u64> {
    match *operand {
        Operand::Imm(value) => Some(value as u64),
        Operand::Reg { index, is64 } => read_register(regs, index, is64),
        Operand::ShiftedReg { index, is64, shift, amount } => {
            let value = read_register(regs, index, is64)?;
            Some(apply_shift(value, is64, shift, amount))
        }
    }
}

fn read_register(regs: &RegisterFile, index: Reg, is64: bool) -> Option<u64> {
    if index == ZR_OR_SP {
        return Some(0);
    }
    regs.get_unsigned(index, is64)
}

fn apply_shift(value: u64, is64: bool, shift: Shift, amount: u8) -> u64 {
    let narrowed = if is64 { value } else { value & 0xffff_ffff };
    match shift {
        Shift::Lsl => narrowed << amount,
        Shift::Lsr => narrowed >> amount,
        Shift::Asr => {
            if is64 {
                ((narrowed as i64) >> amount) as u64
            } else {
                ((narrowed as u32 as i32) >> amount) as u32 as u64
            }
        }
    }
}

/// The extended register offset of a register-offset load/store.
fn extend_offset(raw: u64, extend: ExtendOption, amount: u8) -> u64 {
    match extend {
        ExtendOption::Uxtw => (raw & 0xffff_ffff) << amount,
        ExtendOption::Sxtw => ((raw as u32 as i32 as i64) << amount) as u64,
        ExtendOption::Sxtx | ExtendOption::Lsl => raw << amount,
        ExtendOption::Unknown => raw << amount,
    }
}

fn mask_width(value: u64, is64: bool) -> u64 {
    if is64 {
        value
    } else {
        value & 0xffff_ffff
    }
}

/// Evaluate one operation at `load_address` against the register file,
/// probing memory for loads.
pub fn step(
    op: &Op,
    load_address: Address,
    regs: &mut RegisterFile,
    probe: &dyn MemoryProbe,
) -> StepOutcome {
    match *op {
        Op::Adr { rd, target } => {
            regs.set_value(rd, target, true);
            StepOutcome::Updated(vec![Fact::target(load_address, target)])
        }
        Op::Add { rd, is64, ref lhs, ref rhs } => {
            let (lhs, rhs) = match (resolve(regs, lhs), resolve(regs, rhs)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    log::debug!("add at 0x{:x}: unresolved operand, stopping window", load_address);
                    return StepOutcome::Abort(Vec::new());
                }
            };
            let value = mask_width(lhs.wrapping_add(rhs), is64);
            regs.set_value(rd, value, is64);
            StepOutcome::Updated(vec![Fact::target(load_address, value)])
        }
        Op::Mov { rd, is64, ref src } => {
            let value = match *src {
                Operand::Imm(value) => value as u64,
                Operand::Reg { index, .. } => {
                    // Register moves copy the raw bit pattern of the source
                    if index == ZR_OR_SP {
                        0
                    } else {
                        match regs.get_raw_value(index) {
                            Some(raw) => raw,
                            None => return StepOutcome::Abort(Vec::new()),
                        }
                    }
                }
                Operand::ShiftedReg { .. } => return StepOutcome::Abort(Vec::new()),
            };
            let value = mask_width(value, is64);
            regs.set_value(rd, value, is64);
            StepOutcome::Updated(vec![Fact::target(load_address, value)])
        }
        Op::Load { rt, is64, sign_extend_word, ref address } => {
            step_load(rt, is64, sign_extend_word, address, load_address, regs, probe)
        }
        Op::Store { ref address } => step_store(address, load_address, regs),
        Op::Branch { target, .. } => {
            StepOutcome::FactOnly(vec![Fact::target(load_address, target)])
        }
        Op::Nop => StepOutcome::FactOnly(Vec::new()),
    }
}

fn step_load(
    rt: Reg,
    is64: bool,
    sign_extend_word: bool,
    address: &LoadAddress,
    load_address: Address,
    regs: &mut RegisterFile,
    probe: &dyn MemoryProbe,
) -> StepOutcome {
    // (effective address, pending base-register writeback)
    let (effective, writeback) = match *address {
        LoadAddress::Literal { target } => (target, None),
        LoadAddress::BaseOffset { base, ref offset, writeback } => {
            let base_value = match read_register(regs, base, true) {
                Some(value) => value,
                None => return StepOutcome::Abort(Vec::new()),
            };
            let offset_value = match resolve(regs, offset) {
                Some(value) => value,
                None => return StepOutcome::Abort(Vec::new()),
            };
            let indexed = base_value.wrapping_add(offset_value);
            match writeback {
                Writeback::None => (indexed, None),
                Writeback::Pre => (indexed, Some((base, indexed, Writeback::Pre))),
                // Post-index loads from the un-indexed base
                Writeback::Post => (base_value, Some((base, indexed, Writeback::Post))),
            }
        }
        LoadAddress::BaseRegister { base, rm, extend, amount } => {
            // A register-offset load into the zero register is a prefetch
            if rt == ZR_OR_SP {
                return StepOutcome::FactOnly(Vec::new());
            }
            let base_value = match read_register(regs, base, true) {
                Some(value) => value,
                None => return StepOutcome::Abort(Vec::new()),
            };
            let rm_raw = if rm == ZR_OR_SP {
                0
            } else {
                match regs.get_raw_value(rm) {
                    Some(raw) => raw,
                    None => return StepOutcome::Abort(Vec::new()),
                }
            };
            (base_value.wrapping_add(extend_offset(rm_raw, extend, amount)), None)
        }
    };

    // The computed address is a fact whether or not the probe succeeds
    let mut facts = vec![Fact::target(load_address, effective)];

    let loaded = if sign_extend_word {
        probe.read_signed_word(effective).map(|value| value as u64)
    } else {
        probe.read_pointer(effective)
    };

    match loaded {
        Some(value) => {
            facts.push(Fact::loaded(load_address, value));
            if rt != ZR_OR_SP {
                regs.set_value(rt, value, if sign_extend_word { true } else { is64 });
            }
            if let Some((base, new_base, _)) = writeback {
                regs.set_value(base, new_base, true);
            }
            StepOutcome::Updated(facts)
        }
        None => {
            // The destination is now unknown
            if rt != ZR_OR_SP {
                regs.clear(rt);
            }
            // A failed post-index load still performs its base update, and
            // the window continues; every other form stops the window.
            if let Some((base, new_base, Writeback::Post)) = writeback {
                regs.set_value(base, new_base, true);
                return StepOutcome::Updated(facts);
            }
            StepOutcome::Abort(facts)
        }
    }
}

fn step_store(address: &LoadAddress, load_address: Address, regs: &mut RegisterFile) -> StepOutcome {
    // Stores never produce a register value; an unresolvable store leaves
    // the window running.
    let (effective, writeback) = match *address {
        LoadAddress::Literal { target } => (target, None),
        LoadAddress::BaseOffset { base, ref offset, writeback } => {
            let base_value = match read_register(regs, base, true) {
                Some(value) => value,
                None => return StepOutcome::FactOnly(Vec::new()),
            };
            let offset_value = match resolve(regs, offset) {
                Some(value) => value,
                None => return StepOutcome::FactOnly(Vec::new()),
            };
            let indexed = base_value.wrapping_add(offset_value);
            match writeback {
                Writeback::None => (indexed, None),
                Writeback::Pre => (indexed, Some((base, indexed))),
                Writeback::Post => (base_value, Some((base, indexed))),
            }
        }
        LoadAddress::BaseRegister { base, rm, extend, amount } => {
            let base_value = match read_register(regs, base, true) {
                Some(value) => value,
                None => return StepOutcome::FactOnly(Vec::new()),
            };
            let rm_raw = if rm == ZR_OR_SP {
                0
            } else {
                match regs.get_raw_value(rm) {
                    Some(raw) => raw,
                    None => return StepOutcome::FactOnly(Vec::new()),
                }
            };
            (base_value.wrapping_add(extend_offset(rm_raw, extend, amount)), None)
        }
    };

    let facts = vec![Fact::target(load_address, effective)];
    match writeback {
        Some((base, new_base)) => {
            regs.set_value(base, new_base, true);
            StepOutcome::Updated(facts)
        }
        None => StepOutcome::FactOnly(facts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FactKind;
    use std::collections::HashMap;

    /// Probe backed by a map of pointer-sized slots.
    pub(crate) struct MapProbe(pub HashMap<Address, u64>);

    impl MemoryProbe for MapProbe {
        fn read_bytes(&self, addr: Address, len: usize) -> Option<Vec<u8>> {
            let value = *self.0.get(&addr)?;
            Some(value.to_le_bytes()[..len.min(8)].to_vec())
        }
    }

    fn empty_probe() -> MapProbe {
        MapProbe(HashMap::new())
    }

    #[test]
    fn adr_stores_and_emits() {
        let mut regs = RegisterFile::new();
        let outcome = step(
            &Op::Adr { rd: 8, target: 0x1debec000 },
            0x1000,
            &mut regs,
            &empty_probe(),
        );
        assert_eq!(outcome, StepOutcome::Updated(vec![Fact::target(0x1000, 0x1debec000)]));
        assert_eq!(regs.get_unsigned(8, true), Some(0x1debec000));
    }

    #[test]
    fn add_resolves_register_plus_immediate() {
        let mut regs = RegisterFile::new();
        regs.set_value(8, 0x1debec000, true);
        let op = Op::Add {
            rd: 1,
            is64: true,
            lhs: Operand::Reg { index: 8, is64: true },
            rhs: Operand::Imm(0xbbb),
        };
        let outcome = step(&op, 0x1004, &mut regs, &empty_probe());
        assert_eq!(outcome.facts(), &[Fact::target(0x1004, 0x1debecbbb)]);
        assert_eq!(regs.get_unsigned(1, true), Some(0x1debecbbb));
    }

    #[test]
    fn add_with_unknown_operand_aborts() {
        let mut regs = RegisterFile::new();
        let op = Op::Add {
            rd: 1,
            is64: true,
            lhs: Operand::Reg { index: 8, is64: true },
            rhs: Operand::Imm(0xbbb),
        };
        let outcome = step(&op, 0x1004, &mut regs, &empty_probe());
        assert_eq!(outcome, StepOutcome::Abort(Vec::new()));
        assert!(!regs.has_value(1));
    }

    #[test]
    fn add_narrows_32_bit_results() {
        let mut regs = RegisterFile::new();
        regs.set_value(2, 0xffff_ffff, false);
        let op = Op::Add {
            rd: 3,
            is64: false,
            lhs: Operand::Reg { index: 2, is64: false },
            rhs: Operand::Imm(1),
        };
        let outcome = step(&op, 0x1000, &mut regs, &empty_probe());
        assert_eq!(outcome.facts(), &[Fact::target(0x1000, 0)]);
        assert_eq!(regs.get_unsigned(3, false), Some(0));
    }

    #[test]
    fn mov_copies_raw_pattern() {
        let mut regs = RegisterFile::new();
        regs.set_value(20, 0xabcd_ef01_2345_6789, true);
        let op = Op::Mov {
            rd: 3,
            is64: true,
            src: Operand::Reg { index: 20, is64: true },
        };
        assert!(step(&op, 0x1000, &mut regs, &empty_probe()).continues());
        assert_eq!(regs.get_raw_value(3), Some(0xabcd_ef01_2345_6789));
    }

    #[test]
    fn mov_from_sp_reads_zero() {
        let mut regs = RegisterFile::new();
        let op = Op::Mov {
            rd: 29,
            is64: true,
            src: Operand::Reg { index: 31, is64: true },
        };
        let outcome = step(&op, 0x1000, &mut regs, &empty_probe());
        assert_eq!(outcome.facts(), &[Fact::target(0x1000, 0)]);
        assert_eq!(regs.get_unsigned(29, true), Some(0));
    }

    #[test]
    fn load_success_populates_destination() {
        let mut regs = RegisterFile::new();
        regs.set_value(8, 0x2000, true);
        let probe = MapProbe(HashMap::from([(0x29c8u64, 0x1_0000_0000u64)]));
        let op = Op::Load {
            rt: 1,
            is64: true,
            sign_extend_word: false,
            address: LoadAddress::BaseOffset {
                base: 8,
                offset: Operand::Imm(0x9c8),
                writeback: Writeback::None,
            },
        };
        let outcome = step(&op, 0x1000, &mut regs, &probe);
        assert_eq!(
            outcome.facts(),
            &[Fact::target(0x1000, 0x29c8), Fact::loaded(0x1000, 0x1_0000_0000)]
        );
        assert_eq!(regs.get_unsigned(1, true), Some(0x1_0000_0000));
    }

    #[test]
    fn load_unknown_base_aborts_without_fact() {
        let mut regs = RegisterFile::new();
        let op = Op::Load {
            rt: 1,
            is64: true,
            sign_extend_word: false,
            address: LoadAddress::BaseOffset {
                base: 8,
                offset: Operand::Imm(0),
                writeback: Writeback::None,
            },
        };
        let outcome = step(&op, 0x1000, &mut regs, &empty_probe());
        assert_eq!(outcome, StepOutcome::Abort(Vec::new()));
    }

    #[test]
    fn load_probe_failure_keeps_address_fact() {
        let mut regs = RegisterFile::new();
        regs.set_value(8, 0x4000, true);
        let op = Op::Load {
            rt: 1,
            is64: true,
            sign_extend_word: false,
            address: LoadAddress::BaseOffset {
                base: 8,
                offset: Operand::Imm(0x10),
                writeback: Writeback::None,
            },
        };
        let outcome = step(&op, 0x1000, &mut regs, &empty_probe());
        assert_eq!(outcome, StepOutcome::Abort(vec![Fact::target(0x1000, 0x4010)]));
        assert!(!regs.has_value(1));
    }

    #[test]
    fn failed_post_index_load_still_updates_base() {
        let mut regs = RegisterFile::new();
        regs.set_value(2, 0x4000, true);
        let op = Op::Load {
            rt: 1,
            is64: true,
            sign_extend_word: false,
            address: LoadAddress::BaseOffset {
                base: 2,
                offset: Operand::Imm(8),
                writeback: Writeback::Post,
            },
        };
        let outcome = step(&op, 0x1000, &mut regs, &empty_probe());
        // Window continues, base was indexed, destination is unknown
        assert!(outcome.continues());
        assert_eq!(outcome.facts(), &[Fact::target(0x1000, 0x4000)]);
        assert_eq!(regs.get_unsigned(2, true), Some(0x4008));
        assert!(!regs.has_value(1));
    }

    #[test]
    fn ldrsw_sign_extends_loaded_word() {
        let mut regs = RegisterFile::new();
        regs.set_value(8, 0x3000, true);
        let probe = MapProbe(HashMap::from([(0x3aacu64, 0xffff_fff0u64)]));
        let op = Op::Load {
            rt: 8,
            is64: true,
            sign_extend_word: true,
            address: LoadAddress::BaseOffset {
                base: 8,
                offset: Operand::Imm(0xaac),
                writeback: Writeback::None,
            },
        };
        let outcome = step(&op, 0x1000, &mut regs, &probe);
        assert_eq!(
            outcome.facts(),
            &[Fact::target(0x1000, 0x3aac), Fact::loaded(0x1000, 0xffff_ffff_ffff_fff0)]
        );
        assert_eq!(regs.get_signed(8, true), Some(-16));
    }

    #[test]
    fn register_offset_load_to_zero_register_is_prefetch() {
        let mut regs = RegisterFile::new();
        let op = Op::Load {
            rt: 31,
            is64: true,
            sign_extend_word: false,
            address: LoadAddress::BaseRegister {
                base: 8,
                rm: 23,
                extend: ExtendOption::Lsl,
                amount: 3,
            },
        };
        // Even with every register unknown, a prefetch is skipped quietly
        let outcome = step(&op, 0x1000, &mut regs, &empty_probe());
        assert_eq!(outcome, StepOutcome::FactOnly(Vec::new()));
    }

    #[test]
    fn register_offset_load_extends_the_index() {
        let mut regs = RegisterFile::new();
        regs.set_value(0, 0x1000, true);
        // The w-view of the index register is what uxtw extends
        regs.set_raw_value(2, 0xffff_ffff_0000_0002);
        let probe = MapProbe(HashMap::from([(0x1010u64, 0x55u64)]));
        let op = Op::Load {
            rt: 1,
            is64: true,
            sign_extend_word: false,
            address: LoadAddress::BaseRegister {
                base: 0,
                rm: 2,
                extend: ExtendOption::Uxtw,
                amount: 3,
            },
        };
        let outcome = step(&op, 0x1000, &mut regs, &probe);
        assert_eq!(
            outcome.facts(),
            &[Fact::target(0x1000, 0x1010), Fact::loaded(0x1000, 0x55)]
        );
        assert_eq!(regs.get_unsigned(1, true), Some(0x55));
    }

    #[test]
    fn store_never_writes_registers() {
        let mut regs = RegisterFile::new();
        regs.set_value(8, 0x5000, true);
        let before = regs.known_registers();
        let op = Op::Store {
            address: LoadAddress::BaseOffset {
                base: 8,
                offset: Operand::Imm(0x50),
                writeback: Writeback::None,
            },
        };
        let outcome = step(&op, 0x1000, &mut regs, &empty_probe());
        assert_eq!(outcome, StepOutcome::FactOnly(vec![Fact::target(0x1000, 0x5050)]));
        assert_eq!(regs.known_registers(), before);
    }

    #[test]
    fn store_with_unknown_base_continues_silently() {
        let mut regs = RegisterFile::new();
        let op = Op::Store {
            address: LoadAddress::BaseOffset {
                base: 8,
                offset: Operand::Imm(0),
                writeback: Writeback::None,
            },
        };
        let outcome = step(&op, 0x1000, &mut regs, &empty_probe());
        assert_eq!(outcome, StepOutcome::FactOnly(Vec::new()));
    }

    #[test]
    fn branch_emits_without_touching_registers() {
        let mut regs = RegisterFile::new();
        let op = Op::Branch { link: true, target: 0x1_0000 };
        let outcome = step(&op, 0x1000, &mut regs, &empty_probe());
        assert_eq!(outcome, StepOutcome::FactOnly(vec![Fact::target(0x1000, 0x1_0000)]));
        assert!(regs.is_empty());
    }

    #[test]
    fn facts_carry_both_kinds_for_loads() {
        let mut regs = RegisterFile::new();
        regs.set_value(0, 0x100, true);
        let probe = MapProbe(HashMap::from([(0x100u64, 7u64)]));
        let op = Op::Load {
            rt: 1,
            is64: true,
            sign_extend_word: false,
            address: LoadAddress::BaseOffset {
                base: 0,
                offset: Operand::Imm(0),
                writeback: Writeback::None,
            },
        };
        let outcome = step(&op, 0x1000, &mut regs, &probe);
        let kinds: Vec<_> = outcome.facts().iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FactKind::Target(0x100), FactKind::Loaded(7)]);
    }
}
