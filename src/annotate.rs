//! Disassembly annotation mode.
//!
//! Takes a rendered disassembly listing, reconstructs what the adr/adrp
//! roots and the instructions after them compute, and splices the results
//! back into the listing as right-aligned comments. Branch instructions
//! without a native comment get their targets resolved, including the two
//! common stub shapes (adrp/add/br and adrp/ldr/adrp/ldr/br) whose real
//! destination lives behind the trampoline.

use std::collections::HashMap;

use crate::encoding::{adrp_result, classify, RawInst};
use crate::operands::{int_value_from_string, lower_text, parse_assemble_line, resolve_ldr_operands, ParsedLine};
use crate::scan::ScanWindow;
use crate::{Address, Fact, FactKind, MemoryProbe, SymbolLookup};

/// Lookahead used when annotating a listing.
pub const ANNOTATE_WINDOW: ScanWindow = ScanWindow::new(10);

/// Comments keyed by instruction address. When two scan roots derive a
/// comment for the same address, the longer string wins; an equal or
/// shorter candidate never replaces what is already there.
#[derive(Debug, Default)]
pub struct CommentMap {
    map: HashMap<Address, String>,
}

impl CommentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `comment` unless an at-least-as-long comment already exists.
    /// Returns whether the map changed.
    pub fn insert_if_longer(&mut self, addr: Address, comment: String) -> bool {
        match self.map.get(&addr) {
            Some(existing) if existing.len() >= comment.len() => false,
            _ => {
                self.map.insert(addr, comment);
                true
            }
        }
    }

    pub fn get(&self, addr: Address) -> Option<&str> {
        self.map.get(&addr).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Annotate a rendered listing. Lines the parser does not recognize as
/// instructions (headers, separators) pass through untouched, as do lines
/// that already carry a native comment.
pub fn annotate_listing(
    listing: &str,
    probe: &dyn MemoryProbe,
    lookup: &dyn SymbolLookup,
) -> String {
    let lines: Vec<&str> = listing.lines().collect();
    let parsed: Vec<Option<ParsedLine>> = lines.iter().map(|l| parse_assemble_line(l)).collect();

    // Comments line up with the first native comment's column, or hang off
    // the longest line when the listing has none.
    let mut comment_column = None;
    let mut max_line_length = 0;
    for line in &lines {
        if comment_column.is_none() {
            if let Some(index) = line.rfind(';') {
                comment_column = Some(index);
            }
        }
        max_line_length = max_line_length.max(line.len());
    }
    let comment_column = comment_column.unwrap_or(max_line_length + 4);

    // Scan each continuous run of instruction lines
    let mut comments = CommentMap::new();
    let mut run_start: Option<usize> = None;
    for index in 0..=parsed.len() {
        let is_instruction = index < parsed.len() && parsed[index].is_some();
        if is_instruction && run_start.is_none() {
            run_start = Some(index);
        }
        if !is_instruction {
            if let Some(start) = run_start.take() {
                annotate_run(&parsed[start..index], probe, lookup, &mut comments);
            }
        }
    }
    log::debug!("derived {} comments", comments.len());

    let mut output = String::new();
    for (index, line) in lines.iter().enumerate() {
        match &parsed[index] {
            Some(p) if p.comment.is_none() => {
                if let Some(comment) = comments.get(p.addr) {
                    output.push_str(&format!("{:<1$}; {2}\n", line, comment_column, comment));
                } else {
                    output.push_str(line);
                    output.push('\n');
                }
            }
            _ => {
                output.push_str(line);
                output.push('\n');
            }
        }
    }
    output
}

fn annotate_run(
    run: &[Option<ParsedLine>],
    probe: &dyn MemoryProbe,
    lookup: &dyn SymbolLookup,
    comments: &mut CommentMap,
) {
    let insns: Vec<&ParsedLine> = run.iter().map(|p| p.as_ref().expect("run holds instructions")).collect();
    let by_addr: HashMap<Address, &ParsedLine> =
        insns.iter().map(|line| (line.addr, *line)).collect();

    for (index, line) in insns.iter().enumerate() {
        match line.mnemonic.as_str() {
            "adr" | "adrp" => {
                let root = match lower_text(&line.mnemonic, &line.operands, line.addr) {
                    Some(op) => op,
                    None => continue,
                };
                let following = insns[index + 1..]
                    .iter()
                    .map(|l| (l.addr, lower_text(&l.mnemonic, &l.operands, l.addr)));
                let scan = ANNOTATE_WINDOW.run(line.addr, &root, following, probe);

                if line.comment.is_none() {
                    let rd = line.operands.split(", ").next().unwrap_or_default();
                    let comment = if line.mnemonic == "adr" {
                        format!("{} = 0x{:x}, {}", rd, scan.root_value, scan.root_value)
                    } else {
                        format!("{} = 0x{:x}", rd, scan.root_value)
                    };
                    comments.insert_if_longer(line.addr, comment);
                }

                for fact in &scan.facts {
                    if let Some(target_line) = by_addr.get(&fact.addr) {
                        if target_line.comment.is_some() {
                            continue;
                        }
                        if let Some(comment) = fact_comment(target_line, fact, lookup) {
                            comments.insert_if_longer(fact.addr, comment);
                        }
                    }
                }
            }
            "b" | "bl" | "br" | "blr" if line.comment.is_none() => {
                if let Some(comment) = comment_for_branch(line, probe, lookup) {
                    comments.insert_if_longer(line.addr, comment);
                }
            }
            _ => {}
        }
    }
}

/// Turn one window fact into a comment for the line it belongs to.
fn fact_comment(line: &ParsedLine, fact: &Fact, lookup: &dyn SymbolLookup) -> Option<String> {
    match (line.mnemonic.as_str(), fact.kind) {
        ("add", FactKind::Target(value)) => {
            let rd = line.operands.split(", ").next()?;
            Some(match lookup.summary(value) {
                Some(summary) => format!("{} = 0x{:x} {}", rd, value, summary),
                None => format!("{} = 0x{:x}", rd, value),
            })
        }
        ("mov", FactKind::Target(value)) => {
            let rd = line.operands.split(", ").next()?;
            Some(format!("{} = 0x{:x}", rd, value))
        }
        ("ldr", FactKind::Loaded(value)) => {
            let (supported, rt, _, _) = resolve_ldr_operands(&line.operands);
            if !supported {
                return None;
            }
            Some(match lookup.summary(value) {
                Some(summary) => format!("{} = 0x{:x} {}", rt, value, summary),
                None => format!("{} = 0x{:x}", rt, value),
            })
        }
        ("ldrsw", FactKind::Loaded(value)) => {
            let (supported, rt, _, _) = resolve_ldr_operands(&line.operands);
            if !supported {
                return None;
            }
            Some(format!("{} = 0x{:x}", rt, value))
        }
        _ => None,
    }
}

/// Resolve a branch line's real destination. Static b/bl targets get a
/// symbol summary; when the target is a trampoline, the shape behind it is
/// followed one level.
fn comment_for_branch(
    line: &ParsedLine,
    probe: &dyn MemoryProbe,
    lookup: &dyn SymbolLookup,
) -> Option<String> {
    let target = int_value_from_string(line.operands.trim())?;
    if target < 0 {
        return None;
    }
    let target = target as Address;

    // Read the 5 instructions at the branch destination
    let mut words = [None; 5];
    for (k, slot) in words.iter_mut().enumerate() {
        *slot = probe
            .read_instruction_word(target + 4 * k as Address)
            .and_then(classify);
    }

    if let Some(comment) = stub_comment(target, &words, probe, lookup) {
        return Some(comment);
    }
    lookup.summary(target)
}

fn stub_comment(
    target: Address,
    words: &[Option<RawInst>; 5],
    probe: &dyn MemoryProbe,
    lookup: &dyn SymbolLookup,
) -> Option<String> {
    // adrp x16, N
    // add  x16, x16, #imm
    // br   x16
    if let (
        Some(RawInst::Adrp { rd: adrp_rd, offset }),
        Some(RawInst::AddImmediate { rd: add_rd, rn: add_rn, imm, .. }),
        Some(RawInst::Br { rn: br_rn } | RawInst::Blr { rn: br_rn }),
    ) = (words[0], words[1], words[2])
    {
        if adrp_rd == add_rn && add_rd == br_rn {
            let value = adrp_result(offset, target).wrapping_add(imm);
            let mnemonic = if matches!(words[2], Some(RawInst::Blr { .. })) { "blr" } else { "br" };
            return Some(match lookup.summary(value) {
                Some(summary) => {
                    format!("{} x{}, x{} = 0x{:x} {}", mnemonic, br_rn, br_rn, value, summary)
                }
                None => format!("{} x{}, x{} = 0x{:x}", mnemonic, br_rn, br_rn, value),
            });
        }
    }

    // adrp x1, N
    // ldr  x1, [x1, #imm]
    // adrp x16, M
    // ldr  x16, [x16, #imm]
    // br   x16
    if let (
        Some(RawInst::Adrp { rd: first_rd, offset: first_offset }),
        Some(RawInst::LdrImmediateUnsignedOffset { rt: second_rt, rn: second_rn, pimm: second_pimm, .. }),
        Some(RawInst::Adrp { rd: third_rd, offset: third_offset }),
        Some(RawInst::LdrImmediateUnsignedOffset { rt: fourth_rt, rn: fourth_rn, pimm: fourth_pimm, .. }),
        Some(RawInst::Br { rn: br_rn } | RawInst::Blr { rn: br_rn }),
    ) = (words[0], words[1], words[2], words[3], words[4])
    {
        if third_rd != fourth_rn || fourth_rt != br_rn {
            return None;
        }
        let slot = adrp_result(third_offset, target + 8).wrapping_add(fourth_pimm);
        let value = probe.read_pointer(slot)?;
        let mnemonic = if matches!(words[4], Some(RawInst::Blr { .. })) { "blr" } else { "br" };
        let mut comment = match lookup.summary(value) {
            Some(summary) => {
                format!("{} x{}, x{} = 0x{:x} {}", mnemonic, br_rn, br_rn, value, summary)
            }
            None => format!("{} x{}, x{} = 0x{:x}", mnemonic, br_rn, br_rn, value),
        };

        // When the destination is objc_msgSend the x1 slot holds the
        // selector; show it.
        if comment.contains("objc_msgSend") && second_rt == 1 && first_rd == second_rn {
            let sel_slot = adrp_result(first_offset, target).wrapping_add(second_pimm);
            if let Some(sel_ptr) = probe.read_pointer(sel_slot) {
                if let Some(sel) = probe.read_cstring(sel_ptr) {
                    comment = format!("{}, sel = {}", comment, sel);
                }
            }
        }
        return Some(comment);
    }

    None
}
