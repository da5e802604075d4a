//! Forward scan driver.
//!
//! A scan window starts at an adr/adrp root, seeds a fresh register file
//! with the root's computed address, and threads it through the evaluator
//! over the instructions that follow. The window ends at its step bound, at
//! the first instruction the engine cannot model, or at the next adr/adrp
//! root (which will get its own window). Facts emitted before the stop are
//! kept.

use crate::evaluator::{step, Op, StepOutcome};
use crate::registers::RegisterFile;
use crate::{Address, Fact, MemoryProbe};

/// Bounded lookahead from one root. The two call sites use different
/// lengths on purpose; neither is canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub max_steps: usize,
}

impl ScanWindow {
    pub const fn new(max_steps: usize) -> Self {
        ScanWindow { max_steps }
    }
}

/// Result of one window run.
#[derive(Debug, Clone)]
pub struct WindowScan {
    /// The root's computed address
    pub root_value: Address,
    /// Whether the instruction immediately after the root is a nop
    pub first_is_nop: bool,
    /// Facts emitted by the instructions after the root, in order
    pub facts: Vec<Fact>,
}

impl ScanWindow {
    /// Run one window. `root` must be the lowered adr/adrp operation at
    /// `root_addr`; `following` yields the lowered instructions after it
    /// (`None` for an instruction the engine does not recognize).
    pub fn run<I>(
        &self,
        root_addr: Address,
        root: &Op,
        following: I,
        probe: &dyn MemoryProbe,
    ) -> WindowScan
    where
        I: IntoIterator<Item = (Address, Option<Op>)>,
    {
        let mut regs = RegisterFile::new();
        let root_value = match *root {
            Op::Adr { target, .. } => target,
            _ => {
                debug_assert!(false, "scan windows root at adr/adrp only");
                0
            }
        };
        step(root, root_addr, &mut regs, probe);

        let mut facts = Vec::new();
        let mut first_is_nop = false;
        for (index, (addr, op)) in following.into_iter().take(self.max_steps).enumerate() {
            let op = match op {
                Some(op) => op,
                None => break,
            };
            if index == 0 && op == Op::Nop {
                first_is_nop = true;
            }
            // The next adr/adrp starts its own window
            if matches!(op, Op::Adr { .. }) {
                break;
            }
            let outcome = step(&op, addr, &mut regs, probe);
            facts.extend_from_slice(outcome.facts());
            if let StepOutcome::Abort(_) = outcome {
                break;
            }
        }

        WindowScan { root_value, first_is_nop, facts }
    }
}
