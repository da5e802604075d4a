//! Goblin-based image parser.
//!
//! Loads a Mach-O or ELF binary, gates on AArch64, and flattens its
//! segments into the section table the scanner and the memory probes work
//! from. Mach-O images are keyed by their LC_UUID so a rebuilt binary at
//! the same path gets a fresh cache entry; images without a UUID fall back
//! to their path.

use std::path::{Path, PathBuf};

use goblin::mach::constants::{cputype, SECTION_TYPE, S_ATTR_PURE_INSTRUCTIONS, S_ATTR_SOME_INSTRUCTIONS, S_ZEROFILL};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};
use goblin::{elf, Object};

use crate::{Address, Architecture, ScanError, SymbolLookup};

/// Identity of an image for cache keying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageKey {
    /// Mach-O LC_UUID
    Uuid([u8; 16]),
    /// Canonical path, for images without a build UUID
    Path(PathBuf),
}

/// One section of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// Load address of the section
    pub address: Address,
    pub size: u64,
    /// Offset of the section's bytes within the image file
    pub file_offset: u64,
    /// Whether the section holds instructions (a scan target)
    pub is_code: bool,
}

impl Section {
    pub fn end_address(&self) -> Address {
        self.address + self.size
    }

    /// Whether `[addr, addr + len)` lies inside this section.
    pub fn contains(&self, addr: Address, len: usize) -> bool {
        addr >= self.address && addr + len as Address <= self.end_address()
    }
}

/// One defined symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub address: Address,
    pub name: String,
}

/// A parsed AArch64 image: section table, symbols, and the raw file bytes.
#[derive(Debug)]
pub struct Image {
    pub path: PathBuf,
    pub architecture: Architecture,
    pub key: ImageKey,
    pub sections: Vec<Section>,
    /// Defined symbols, sorted by address
    pub symbols: Vec<Symbol>,
    data: Vec<u8>,
}

impl Image {
    /// Read and parse the binary at `path`. Refuses anything that is not
    /// AArch64.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Image, ScanError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        Image::parse(path.to_path_buf(), data)
    }

    /// Parse already-read bytes.
    pub fn parse(path: PathBuf, data: Vec<u8>) -> Result<Image, ScanError> {
        match Object::parse(&data).map_err(|e| ScanError::ImageParse(e.to_string()))? {
            Object::Mach(Mach::Binary(macho)) => {
                let (architecture, key, sections, symbols) = parse_macho(&macho, &path)?;
                Ok(Image { path, architecture, key, sections, symbols, data })
            }
            Object::Mach(Mach::Fat(_)) => Err(ScanError::ImageParse(
                "fat binary: extract the arm64 slice first".to_string(),
            )),
            Object::Elf(elf) => {
                let (architecture, key, sections, symbols) = parse_elf(&elf, &path)?;
                Ok(Image { path, architecture, key, sections, symbols, data })
            }
            _ => Err(ScanError::ImageParse("unrecognized binary format".to_string())),
        }
    }

    /// Assemble an image from pre-parsed parts. Lets embedders and tests
    /// drive the engine without a file on disk.
    pub fn from_parts(
        path: PathBuf,
        architecture: Architecture,
        key: ImageKey,
        sections: Vec<Section>,
        mut symbols: Vec<Symbol>,
        data: Vec<u8>,
    ) -> Image {
        symbols.sort_by_key(|s| s.address);
        Image { path, architecture, key, sections, symbols, data }
    }

    /// Basename of the image, as shown in lookup summaries.
    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Read bytes at a load address out of whichever section maps it.
    pub fn read_bytes(&self, addr: Address, len: usize) -> Option<Vec<u8>> {
        let section = self.sections.iter().find(|s| s.contains(addr, len))?;
        let start = (section.file_offset + (addr - section.address)) as usize;
        self.data.get(start..start + len).map(|b| b.to_vec())
    }

    /// Find a symbol by exact name.
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// The symbol covering `addr` and the next symbol's address, if any.
    pub fn symbol_for_address(&self, addr: Address) -> Option<(&Symbol, Option<Address>)> {
        let index = self.symbols.partition_point(|s| s.address <= addr);
        if index == 0 {
            return None;
        }
        let next = self.symbols.get(index).map(|s| s.address);
        Some((&self.symbols[index - 1], next))
    }
}

impl SymbolLookup for Image {
    fn summary(&self, addr: Address) -> Option<String> {
        let (symbol, _) = self.symbol_for_address(addr)?;
        let offset = addr - symbol.address;
        if offset == 0 {
            Some(format!("{}`{}", self.basename(), symbol.name))
        } else {
            Some(format!("{}`{} + {}", self.basename(), symbol.name, offset))
        }
    }
}

fn parse_macho(
    macho: &MachO,
    path: &Path,
) -> Result<(Architecture, ImageKey, Vec<Section>, Vec<Symbol>), ScanError> {
    let architecture = match macho.header.cputype {
        cputype::CPU_TYPE_ARM64 => Architecture::AArch64,
        cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
        _ => Architecture::Unknown,
    };
    if architecture != Architecture::AArch64 {
        return Err(ScanError::UnsupportedArchitecture(architecture));
    }

    let key = macho
        .load_commands
        .iter()
        .find_map(|lc| match lc.command {
            CommandVariant::Uuid(uuid) => Some(ImageKey::Uuid(uuid.uuid)),
            _ => None,
        })
        .unwrap_or_else(|| ImageKey::Path(path.to_path_buf()));

    // Segments are the containers; their sections are the leaves the
    // scanner and the probes work from.
    let mut sections = Vec::new();
    for segment in &macho.segments {
        let segment_sections = segment
            .sections()
            .map_err(|e| ScanError::ImageParse(e.to_string()))?;
        for (sect, _data) in segment_sections {
            if sect.flags & SECTION_TYPE == S_ZEROFILL {
                continue;
            }
            let name = sect
                .name()
                .map_err(|e| ScanError::ImageParse(e.to_string()))?
                .to_string();
            let is_code = sect.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0;
            sections.push(Section {
                name,
                address: sect.addr,
                size: sect.size,
                file_offset: sect.offset as u64,
                is_code,
            });
        }
    }

    let mut symbols = Vec::new();
    for sym in macho.symbols() {
        let (name, nlist) = sym.map_err(|e| ScanError::ImageParse(e.to_string()))?;
        if nlist.n_sect == 0 || nlist.is_undefined() || nlist.n_value == 0 || name.is_empty() {
            continue;
        }
        symbols.push(Symbol {
            address: nlist.n_value,
            name: name.trim_start_matches('_').to_string(),
        });
    }
    symbols.sort_by_key(|s| s.address);
    symbols.dedup_by_key(|s| s.address);

    log::debug!(
        "parsed {}: {} sections, {} symbols",
        path.display(),
        sections.len(),
        symbols.len()
    );
    Ok((Architecture::AArch64, key, sections, symbols))
}

fn parse_elf(
    elf: &elf::Elf,
    path: &Path,
) -> Result<(Architecture, ImageKey, Vec<Section>, Vec<Symbol>), ScanError> {
    let architecture = match elf.header.e_machine {
        elf::header::EM_AARCH64 => Architecture::AArch64,
        elf::header::EM_X86_64 => Architecture::X86_64,
        _ => Architecture::Unknown,
    };
    if architecture != Architecture::AArch64 {
        return Err(ScanError::UnsupportedArchitecture(architecture));
    }

    let mut sections = Vec::new();
    for sh in &elf.section_headers {
        if sh.sh_type == elf::section_header::SHT_NOBITS || sh.sh_addr == 0 {
            continue;
        }
        let name = elf
            .shdr_strtab
            .get_at(sh.sh_name)
            .unwrap_or_default()
            .to_string();
        sections.push(Section {
            name,
            address: sh.sh_addr,
            size: sh.sh_size,
            file_offset: sh.sh_offset,
            is_code: sh.is_executable(),
        });
    }

    let mut symbols = Vec::new();
    for sym in elf.syms.iter() {
        if sym.st_value == 0 || !sym.is_function() {
            continue;
        }
        if let Some(name) = elf.strtab.get_at(sym.st_name) {
            if !name.is_empty() {
                symbols.push(Symbol { address: sym.st_value, name: name.to_string() });
            }
        }
    }
    symbols.sort_by_key(|s| s.address);
    symbols.dedup_by_key(|s| s.address);

    Ok((
        Architecture::AArch64,
        ImageKey::Path(path.to_path_buf()),
        sections,
        symbols,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_symbols() -> Image {
        Image::from_parts(
            "MyBin".into(),
            Architecture::AArch64,
            ImageKey::Path("MyBin".into()),
            Vec::new(),
            vec![
                Symbol { address: 0x2000, name: "second".to_string() },
                Symbol { address: 0x1000, name: "first".to_string() },
            ],
            Vec::new(),
        )
    }

    #[test]
    fn symbol_lookup_picks_preceding_symbol() {
        let image = image_with_symbols();
        assert_eq!(image.summary(0x1000).as_deref(), Some("MyBin`first"));
        assert_eq!(image.summary(0x100c).as_deref(), Some("MyBin`first + 12"));
        assert_eq!(image.summary(0x2004).as_deref(), Some("MyBin`second + 4"));
        assert_eq!(image.summary(0xfff), None);
    }

    #[test]
    fn find_symbol_by_name() {
        let image = image_with_symbols();
        assert_eq!(image.find_symbol("second").map(|s| s.address), Some(0x2000));
        assert!(image.find_symbol("missing").is_none());
    }

    #[test]
    fn section_containment() {
        let section = Section {
            name: "__text".to_string(),
            address: 0x1000,
            size: 0x100,
            file_offset: 0,
            is_code: true,
        };
        assert!(section.contains(0x1000, 4));
        assert!(section.contains(0x10fc, 4));
        assert!(!section.contains(0x10fd, 4));
        assert!(!section.contains(0xfff, 4));
    }
}
