//! Textual instruction parsing for disassembly listings.
//!
//! The annotation mode works from rendered listing lines, so its view of an
//! instruction is a mnemonic plus an operand string like
//! `x1, [x2, #0x9c8]`. These resolvers turn that text into the same lowered
//! operations the byte decoder produces. Anything they cannot express (for
//! example a shifted register-offset load) resolves to nothing, which the
//! window driver treats as a conservative stop.

use crate::encoding::adrp_result;
use crate::evaluator::{LoadAddress, Op, Operand, Writeback};
use crate::{Address, Reg};

/// Parse an integer operand: decimal or hex, optionally negative, with an
/// optional leading `#`.
pub fn int_value_from_string(text: &str) -> Option<i64> {
    let text = text.trim().trim_start_matches('#');
    if let Some(hex) = text.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = text.strip_prefix("-0x") {
        return i64::from_str_radix(hex, 16).ok().map(|v| -v);
    }
    text.parse::<i64>().ok()
}

/// Parse a register name into (index, is 64-bit view).
pub fn parse_register(name: &str) -> Option<(Reg, bool)> {
    match name {
        "sp" | "xzr" => return Some((31, true)),
        "wsp" | "wzr" => return Some((31, false)),
        _ => {}
    }
    let (is64, digits) = if let Some(rest) = name.strip_prefix('x') {
        (true, rest)
    } else if let Some(rest) = name.strip_prefix('w') {
        (false, rest)
    } else {
        return None;
    };
    let index: u8 = digits.parse().ok()?;
    if index > 30 {
        return None;
    }
    Some((index, is64))
}

/// Resolve the operand string of an ldr/ldrsw/str into
/// (supported, destination, base, offset). The offset is `"0"` when absent
/// and loses its `#` prefix; an addressing mode the engine cannot model
/// yields `(false, "", "", "0")`.
///
/// ```
/// use xrefscan::operands::resolve_ldr_operands;
/// assert_eq!(
///     resolve_ldr_operands("x1, [x2, #0x9c8]"),
///     (true, "x1".into(), "x2".into(), "0x9c8".into())
/// );
/// ```
pub fn resolve_ldr_operands(operands: &str) -> (bool, String, String, String) {
    let unsupported = || (false, String::new(), String::new(), "0".to_string());

    // Tolerate a leading mnemonic ("ldr x1, [x2]")
    let mut text = operands.trim();
    if let Some((first, rest)) = text.split_once(' ') {
        if !first.ends_with(',') && !first.contains('[') {
            text = rest.trim();
        }
    }

    let parts: Vec<&str> = text.split(", ").collect();
    match parts.len() {
        2 => {
            let base = parts[1].trim_start_matches('[').trim_end_matches(']');
            (true, parts[0].to_string(), base.to_string(), "0".to_string())
        }
        3 => {
            let base = parts[1].trim_start_matches('[');
            let offset = parts[2].trim_end_matches(']').trim_start_matches('#');
            if base.contains('[') || offset.contains('[') {
                return unsupported();
            }
            (true, parts[0].to_string(), base.to_string(), offset.to_string())
        }
        // e.g. "x21, [x8, x23, lsl #3]"
        _ => unsupported(),
    }
}

/// Resolve the operand string of an immediate add into
/// (destination, source register, immediate).
pub fn resolve_add_operands(operands: &str) -> Option<(String, String, i64)> {
    let parts: Vec<&str> = operands.trim().split(", ").collect();
    if parts.len() != 3 {
        return None;
    }
    let imm = int_value_from_string(parts[2])?;
    Some((parts[0].to_string(), parts[1].to_string(), imm))
}

/// Extract the load address from one listing line, honoring the `->`
/// current-pc marker and a trailing `:` on the address token.
pub fn get_address_from_assemble_line(line: &str) -> Option<Address> {
    let keywords: Vec<&str> = line.split_whitespace().collect();
    if keywords.len() < 2 {
        return None;
    }
    let address_str = if keywords[0] == "->" {
        keywords[1]
    } else {
        keywords[0]
    };
    let value = int_value_from_string(address_str.trim_end_matches(':'))?;
    if value < 0 {
        return None;
    }
    Some(value as Address)
}

/// One parsed listing line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub addr: Address,
    pub mnemonic: String,
    pub operands: String,
    /// Text after `;`, if the line already carries a comment
    pub comment: Option<String>,
}

/// Parse one listing line into its instruction parts. Lines without an
/// address (section headers, blank separators) parse to `None`.
pub fn parse_assemble_line(line: &str) -> Option<ParsedLine> {
    let (code, comment) = match line.split_once(';') {
        Some((code, comment)) => (code, Some(comment.trim().to_string())),
        None => (line, None),
    };
    let addr = get_address_from_assemble_line(code)?;

    // The mnemonic follows the last colon-terminated prefix token
    // ("0x1000:", "<+32>:").
    let tokens: Vec<&str> = code.split_whitespace().collect();
    let colon_index = tokens.iter().position(|t| t.ends_with(':'))?;
    let mnemonic = tokens.get(colon_index + 1)?.to_string();
    let operands = tokens[colon_index + 2..].join(" ");
    Some(ParsedLine { addr, mnemonic, operands, comment })
}

fn operand_from_str(text: &str) -> Option<Operand> {
    if let Some((index, is64)) = parse_register(text) {
        return Some(Operand::Reg { index, is64 });
    }
    int_value_from_string(text).map(Operand::Imm)
}

/// Lower a textual instruction into an evaluator operation. Returns `None`
/// for any mnemonic or operand shape the engine cannot model.
pub fn lower_text(mnemonic: &str, operands: &str, load_address: Address) -> Option<Op> {
    match mnemonic {
        "nop" => Some(Op::Nop),
        "adr" => {
            // adr x17, #-0x8000
            let parts: Vec<&str> = operands.split(", ").collect();
            if parts.len() != 2 || !(parts[1].starts_with("#0x") || parts[1].starts_with("#-0x")) {
                return None;
            }
            let (rd, _) = parse_register(parts[0])?;
            let offset = int_value_from_string(parts[1])?;
            Some(Op::Adr { rd, target: load_address.wrapping_add_signed(offset) })
        }
        "adrp" => {
            // adrp x8, -24587
            let parts: Vec<&str> = operands.split(", ").collect();
            if parts.len() != 2 {
                return None;
            }
            let (rd, _) = parse_register(parts[0])?;
            let imm = int_value_from_string(parts[1])?;
            Some(Op::Adr { rd, target: adrp_result(imm, load_address) })
        }
        "add" => {
            let parts: Vec<&str> = operands.split(", ").collect();
            if parts.len() != 3 {
                return None;
            }
            let (rd, is64) = parse_register(parts[0])?;
            let lhs = operand_from_str(parts[1])?;
            let rhs = operand_from_str(parts[2])?;
            Some(Op::Add { rd, is64, lhs, rhs })
        }
        "mov" => {
            let parts: Vec<&str> = operands.split(", ").collect();
            if parts.len() != 2 {
                return None;
            }
            let (rd, is64) = parse_register(parts[0])?;
            let src = operand_from_str(parts[1])?;
            Some(Op::Mov { rd, is64, src })
        }
        "ldr" | "ldrsw" => {
            let (supported, rt, base, offset) = resolve_ldr_operands(operands);
            if !supported {
                return None;
            }
            let (rt, rt_is64) = parse_register(&rt)?;
            let (base, _) = parse_register(&base)?;
            let offset = operand_from_str(&offset)?;
            let sign_extend_word = mnemonic == "ldrsw";
            Some(Op::Load {
                rt,
                is64: sign_extend_word || rt_is64,
                sign_extend_word,
                address: LoadAddress::BaseOffset { base, offset, writeback: Writeback::None },
            })
        }
        "str" => {
            let (supported, _, base, offset) = resolve_ldr_operands(operands);
            if !supported {
                return None;
            }
            let (base, _) = parse_register(&base)?;
            let offset = operand_from_str(&offset)?;
            Some(Op::Store {
                address: LoadAddress::BaseOffset { base, offset, writeback: Writeback::None },
            })
        }
        "b" | "bl" => {
            let target = int_value_from_string(operands.trim())?;
            if target < 0 {
                return None;
            }
            Some(Op::Branch { link: mnemonic == "bl", target: target as Address })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{LoadAddress, Op, Operand, Writeback};

    #[test]
    fn ldr_operand_contracts() {
        assert_eq!(
            resolve_ldr_operands("ldr x1, [x2, #0x9c8]"),
            (true, "x1".to_string(), "x2".to_string(), "0x9c8".to_string())
        );
        assert_eq!(
            resolve_ldr_operands("ldr x1, [x2]"),
            (true, "x1".to_string(), "x2".to_string(), "0".to_string())
        );
        assert_eq!(
            resolve_ldr_operands("ldr x8, [x0, x20]"),
            (true, "x8".to_string(), "x0".to_string(), "x20".to_string())
        );
        assert_eq!(
            resolve_ldr_operands("x21, [x8, x23, lsl #3]"),
            (false, String::new(), String::new(), "0".to_string())
        );
    }

    #[test]
    fn ldr_operands_without_mnemonic() {
        assert_eq!(
            resolve_ldr_operands("x1, [x2, #0x9c8]"),
            (true, "x1".to_string(), "x2".to_string(), "0x9c8".to_string())
        );
    }

    #[test]
    fn add_operands() {
        assert_eq!(
            resolve_add_operands("x1, x8, #0xbbb"),
            Some(("x1".to_string(), "x8".to_string(), 0xbbb))
        );
        assert_eq!(resolve_add_operands("x1, x8"), None);
        // register third operand is not an immediate add
        assert_eq!(resolve_add_operands("x1, x8, x9"), None);
    }

    #[test]
    fn integer_parsing() {
        assert_eq!(int_value_from_string("0x9c8"), Some(0x9c8));
        assert_eq!(int_value_from_string("#-0x10"), Some(-0x10));
        assert_eq!(int_value_from_string("-24587"), Some(-24587));
        assert_eq!(int_value_from_string("348413"), Some(348413));
        assert_eq!(int_value_from_string("x8"), None);
    }

    #[test]
    fn register_names() {
        assert_eq!(parse_register("x8"), Some((8, true)));
        assert_eq!(parse_register("w30"), Some((30, false)));
        assert_eq!(parse_register("sp"), Some((31, true)));
        assert_eq!(parse_register("wzr"), Some((31, false)));
        assert_eq!(parse_register("x31"), None);
        assert_eq!(parse_register("pc"), None);
    }

    #[test]
    fn address_extraction() {
        assert_eq!(
            get_address_from_assemble_line("0x189aef040 <+32>: adrp x8, 348413"),
            Some(0x189aef040)
        );
        assert_eq!(
            get_address_from_assemble_line("-> 0x104a2c000: bl 0x104a2c100"),
            Some(0x104a2c000)
        );
        assert_eq!(get_address_from_assemble_line("libsystem.dylib`malloc:"), None);
        assert_eq!(get_address_from_assemble_line(""), None);
    }

    #[test]
    fn line_parsing() {
        let parsed = parse_assemble_line("0x189aef040 <+32>: adrp x8, 348413").unwrap();
        assert_eq!(parsed.addr, 0x189aef040);
        assert_eq!(parsed.mnemonic, "adrp");
        assert_eq!(parsed.operands, "x8, 348413");
        assert_eq!(parsed.comment, None);

        let parsed = parse_assemble_line("0x1000: bl 0x2000 ; symbol stub for: malloc").unwrap();
        assert_eq!(parsed.mnemonic, "bl");
        assert_eq!(parsed.comment.as_deref(), Some("symbol stub for: malloc"));

        assert!(parse_assemble_line("MyApp`main:").is_none());
    }

    #[test]
    fn text_lowering() {
        let op = lower_text("adrp", "x8, -24587", 0x189aef040).unwrap();
        assert_eq!(
            op,
            Op::Adr { rd: 8, target: adrp_result(-24587, 0x189aef040) }
        );

        let op = lower_text("adr", "x17, #-0x8000", 0x189aef040).unwrap();
        assert_eq!(op, Op::Adr { rd: 17, target: 0x189aef040 - 0x8000 });
        // A non-literal adr operand is unsupported
        assert_eq!(lower_text("adr", "x17, label", 0x1000), None);

        let op = lower_text("add", "x1, x8, #0xbbb", 0x1000).unwrap();
        assert_eq!(
            op,
            Op::Add {
                rd: 1,
                is64: true,
                lhs: Operand::Reg { index: 8, is64: true },
                rhs: Operand::Imm(0xbbb),
            }
        );

        let op = lower_text("ldr", "x1, [x2, #0x9c8]", 0x1000).unwrap();
        assert_eq!(
            op,
            Op::Load {
                rt: 1,
                is64: true,
                sign_extend_word: false,
                address: LoadAddress::BaseOffset {
                    base: 2,
                    offset: Operand::Imm(0x9c8),
                    writeback: Writeback::None,
                },
            }
        );

        // Shifted register-offset loads stop the window
        assert_eq!(lower_text("ldr", "x21, [x8, x23, lsl #3]", 0x1000), None);
        // Unknown mnemonics stop the window
        assert_eq!(lower_text("cbnz", "x3, 0x2000", 0x1000), None);

        let op = lower_text("bl", "0x104a2c100", 0x1000).unwrap();
        assert_eq!(op, Op::Branch { link: true, target: 0x104a2c100 });
    }
}
