//! Core IR, traits, and errors for the xrefscan analysis engine.
//!
//! This library reconstructs effective addresses from AArch64 instruction
//! streams without executing them. It decodes raw instruction words straight
//! from their bit-field encodings, propagates known register values through a
//! small symbolic register file, and cross-references the computed addresses
//! against the sections of the image under analysis. Two consumers sit on
//! top of the same engine: a disassembly annotator that splices reconstructed
//! targets into a listing as comments, and a whole-image reference scanner
//! that answers "who points at this address?".
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use xrefscan::{
//!     parser::Image,
//!     memory::ImageMemory,
//!     reference::{ReferenceCache, REFERENCE_WINDOW},
//! };
//!
//! // Parse the binary image (must be AArch64)
//! let image = Image::open("path/to/binary").unwrap();
//!
//! // Scan once, query many times
//! let mut cache = ReferenceCache::new();
//! let probe = ImageMemory::new(&image);
//! let facts = cache.facts_for(&image, &probe, REFERENCE_WINDOW).unwrap();
//! let report = facts.find_references(0x1debec000);
//! for hit in &report.direct {
//!     println!("0x{:x}", hit);
//! }
//! ```

pub mod annotate;
pub mod encoding;
pub mod evaluator;
pub mod format;
pub mod memory;
pub mod operands;
pub mod parser;
pub mod reference;
pub mod registers;
pub mod render;
pub mod scan;

/// Represents a load address in the analyzed image
pub type Address = u64;

/// A general-purpose register index (0-30, plus 31 for xzr/sp)
pub type Reg = u8;

/// Register index 31: the zero register or the stack pointer depending on
/// context. Never stored in the register file; readers treat it as literal 0.
pub const ZR_OR_SP: Reg = 31;

use std::fmt;

/// One derived fact about an instruction: what address or value the engine
/// reconstructed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fact {
    /// Load address of the instruction the fact belongs to
    pub addr: Address,
    /// What was derived
    pub kind: FactKind,
}

/// The two kinds of facts the evaluator emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactKind {
    /// A computed target address (adr/adrp/add/mov results, branch targets,
    /// effective load/store addresses)
    Target(Address),
    /// A value read out of the image's memory at a computed address
    Loaded(u64),
}

impl Fact {
    /// Shorthand for a computed-target fact.
    pub fn target(addr: Address, value: Address) -> Self {
        Fact { addr, kind: FactKind::Target(value) }
    }

    /// Shorthand for a dereferenced-in-memory fact.
    pub fn loaded(addr: Address, value: u64) -> Self {
        Fact { addr, kind: FactKind::Loaded(value) }
    }
}

/// Memory probe: typed read access to the image under analysis.
///
/// The evaluator dereferences computed addresses through this trait only.
/// Every method returns `None` when the address range is not mapped by any
/// section, which callers treat as the conservative "unreadable" outcome.
pub trait MemoryProbe {
    /// Read `len` bytes starting at `addr`.
    fn read_bytes(&self, addr: Address, len: usize) -> Option<Vec<u8>>;

    /// Read a 64-bit little-endian value at `addr`.
    fn read_pointer(&self, addr: Address) -> Option<u64> {
        let bytes = self.read_bytes(addr, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Read a 32-bit word at `addr` and sign-extend it to 64 bits.
    fn read_signed_word(&self, addr: Address) -> Option<i64> {
        let bytes = self.read_bytes(addr, 4)?;
        let word = u32::from_le_bytes(bytes.try_into().ok()?);
        Some(word as i32 as i64)
    }

    /// Read one 4-byte instruction word at `addr`.
    fn read_instruction_word(&self, addr: Address) -> Option<u32> {
        let bytes = self.read_bytes(addr, 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Read a NUL-terminated string at `addr` (at most 256 bytes).
    fn read_cstring(&self, addr: Address) -> Option<String> {
        let mut out = Vec::new();
        for i in 0..256 {
            let byte = *self.read_bytes(addr + i, 1)?.first()?;
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        String::from_utf8(out).ok()
    }
}

/// Symbol lookup: resolve an address to a human-readable summary
/// ("symbol + offset"), if the image knows one.
pub trait SymbolLookup {
    /// Return a summary for `addr`, or `None` when no symbol covers it.
    fn summary(&self, addr: Address) -> Option<String>;
}

/// Architectures the parser can report. Only AArch64 is analyzable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Architecture {
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// 64-bit x86
    X86_64,
    /// Anything else
    Unknown,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Error type for scan operations
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Failed to parse the image
    #[error("Failed to parse image: {0}")]
    ImageParse(String),

    /// The image is not AArch64
    #[error("Unsupported architecture: {0}. Only AArch64 images can be analyzed")]
    UnsupportedArchitecture(Architecture),

    /// A user-supplied address or immediate did not parse
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A symbol name was not found in the image
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// Instruction rendering failed
    #[error("Disassembler error: {0}")]
    Render(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
