//! Capstone-based listing renderer.
//!
//! The annotation mode consumes listing text; this produces it from image
//! bytes when no external disassembler output is at hand. Only AArch64 is
//! built, matching the engine's architecture gate.

use capstone::arch::arm64::ArchMode as Arm64Mode;
use capstone::prelude::BuildsCapstone;
use capstone::Capstone;

use crate::encoding::decode_adr;
use crate::parser::Image;
use crate::{Address, MemoryProbe, ScanError};

/// Renders disassembly listings for address ranges of an image.
pub struct ListingRenderer {
    cs: Capstone,
}

impl ListingRenderer {
    /// Build an AArch64 renderer.
    pub fn new() -> Result<Self, ScanError> {
        let cs = Capstone::new()
            .arm64()
            .mode(Arm64Mode::Arm)
            .detail(false)
            .build()
            .map_err(|e| ScanError::Render(e.to_string()))?;
        Ok(ListingRenderer { cs })
    }

    /// Render `count` instructions starting at `start`, one line per
    /// instruction: `0x<addr>: <mnemonic> <operands>`.
    pub fn render(
        &self,
        probe: &dyn MemoryProbe,
        start: Address,
        count: usize,
    ) -> Result<String, ScanError> {
        // Clamp the range to what the image actually maps
        let mut len = count * 4;
        let bytes = loop {
            match probe.read_bytes(start, len) {
                Some(bytes) => break bytes,
                None if len > 4 => len -= 4,
                None => return Err(ScanError::InvalidAddress(format!("0x{:x}", start))),
            }
        };
        let insns = self
            .cs
            .disasm_all(&bytes, start)
            .map_err(|e| ScanError::Render(e.to_string()))?;

        let mut output = String::new();
        for insn in insns.iter() {
            let mnemonic = insn.mnemonic().unwrap_or("");
            let mut op_str = insn.op_str().unwrap_or("").to_string();
            // Capstone prints adr/adrp targets as absolute addresses; the
            // annotator expects the debugger's operand shapes (byte offset
            // for adr, page count for adrp), so re-derive them from the
            // instruction word.
            if mnemonic == "adr" || mnemonic == "adrp" {
                let offset = (insn.address() - start) as usize;
                if let Some(slice) = bytes.get(offset..offset + 4) {
                    let word = u32::from_le_bytes(slice.try_into().expect("4-byte slice"));
                    let (rd, imm) = decode_adr(word);
                    op_str = if mnemonic == "adr" {
                        if imm < 0 {
                            format!("x{}, #-0x{:x}", rd, -imm)
                        } else {
                            format!("x{}, #0x{:x}", rd, imm)
                        }
                    } else {
                        format!("x{}, {}", rd, imm)
                    };
                }
            }
            output.push_str(&format!("0x{:x}: {:<7} {}\n", insn.address(), mnemonic, op_str));
        }
        Ok(output)
    }

    /// Render a named function: from its symbol to the next symbol, capped
    /// at `max_count` instructions.
    pub fn render_symbol(
        &self,
        image: &Image,
        probe: &dyn MemoryProbe,
        name: &str,
        max_count: usize,
    ) -> Result<String, ScanError> {
        let symbol = image
            .find_symbol(name)
            .ok_or_else(|| ScanError::SymbolNotFound(name.to_string()))?;
        let start = symbol.address;
        let count = match image.symbol_for_address(start) {
            Some((_, Some(next))) => (((next - start) / 4) as usize).min(max_count),
            _ => max_count,
        };
        let mut output = format!("{}`{}:\n", image.basename(), symbol.name);
        output.push_str(&self.render(probe, start, count.max(1))?);
        Ok(output)
    }
}
