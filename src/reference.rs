//! Whole-image reference scan.
//!
//! On the first query against an image, every code section is walked word
//! by word: adr/adrp roots get a short evaluator window, b/bl words record
//! their static targets directly. The two resulting fact maps (computed
//! targets and dereferenced values) are cached under the image's key and
//! answer every later query with a linear scan, never re-reading a byte.
//! Large sections take a while; progress is reported every few percent.

use std::collections::HashMap;

use crate::encoding::{classify, decode_b, is_adr, is_adrp, is_b, is_bl, lower, RawInst};
use crate::memory::ImageMemory;
use crate::parser::{Image, ImageKey, Section};
use crate::scan::ScanWindow;
use crate::{Address, FactKind, MemoryProbe, ScanError};

/// Lookahead used when scanning an image for references. Shorter than the
/// annotation window; the two lengths are deliberately independent.
pub const REFERENCE_WINDOW: ScanWindow = ScanWindow::new(5);

/// Bytes analyzed per chunk.
const SCAN_SPAN: u64 = 4 * 10000;

/// Chunk count above which progress percentages are worth printing.
const PROGRESS_CHUNK_THRESHOLD: u64 = 120;

/// The cached result of scanning one image.
#[derive(Debug, Default)]
pub struct ImageFacts {
    /// instruction address -> computed or branch target
    targets: HashMap<Address, Address>,
    /// instruction address -> value found in memory at the computed address
    loads: HashMap<Address, u64>,
}

/// Addresses in an image that reference a queried target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceReport {
    pub target: Address,
    /// Instructions whose computed or branch target equals the query
    pub direct: Vec<Address>,
    /// Instructions that loaded the query value out of memory
    pub memory: Vec<Address>,
}

impl ImageFacts {
    /// All recorded source addresses whose derived value equals `target`.
    pub fn find_references(&self, target: Address) -> ReferenceReport {
        let mut direct: Vec<Address> = self
            .targets
            .iter()
            .filter(|(_, value)| **value == target)
            .map(|(addr, _)| *addr)
            .collect();
        direct.sort_unstable();
        let mut memory: Vec<Address> = self
            .loads
            .iter()
            .filter(|(_, value)| **value == target)
            .map(|(addr, _)| *addr)
            .collect();
        memory.sort_unstable();
        ReferenceReport { target, direct, memory }
    }

    /// Number of recorded facts (both maps).
    pub fn len(&self) -> usize {
        self.targets.len() + self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.loads.is_empty()
    }

    fn record(&mut self, addr: Address, kind: FactKind) {
        match kind {
            FactKind::Target(value) => {
                self.targets.insert(addr, value);
            }
            FactKind::Loaded(value) => {
                self.loads.insert(addr, value);
            }
        }
    }
}

/// Per-image fact cache. Populated once per image key and kept for the
/// lifetime of the cache; nothing invalidates implicitly, so a reloaded
/// binary needs an explicit `invalidate` (or a fresh UUID).
#[derive(Debug, Default)]
pub struct ReferenceCache {
    images: HashMap<ImageKey, ImageFacts>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &ImageKey) -> bool {
        self.images.contains_key(key)
    }

    /// Drop the cached facts for one image.
    pub fn invalidate(&mut self, key: &ImageKey) {
        self.images.remove(key);
    }

    /// The facts for `image`, scanning it on the first call.
    pub fn facts_for(
        &mut self,
        image: &Image,
        probe: &dyn MemoryProbe,
        window: ScanWindow,
    ) -> Result<&ImageFacts, ScanError> {
        if !self.images.contains_key(&image.key) {
            let facts = scan_image(image, probe, window)?;
            self.images.insert(image.key.clone(), facts);
        }
        Ok(&self.images[&image.key])
    }
}

/// Convenience entry point: scan (or reuse) and query in one call.
pub fn find_references(
    cache: &mut ReferenceCache,
    image: &Image,
    target: Address,
) -> Result<ReferenceReport, ScanError> {
    let probe = ImageMemory::new(image);
    let facts = cache.facts_for(image, &probe, REFERENCE_WINDOW)?;
    Ok(facts.find_references(target))
}

/// Walk every code section of the image.
fn scan_image(
    image: &Image,
    probe: &dyn MemoryProbe,
    window: ScanWindow,
) -> Result<ImageFacts, ScanError> {
    let mut facts = ImageFacts::default();
    for section in image.sections.iter().filter(|s| s.is_code) {
        scan_section(section, probe, window, &mut facts)?;
    }
    log::info!(
        "scanned {}: {} target facts, {} memory facts",
        image.basename(),
        facts.targets.len(),
        facts.loads.len()
    );
    Ok(facts)
}

fn scan_section(
    section: &Section,
    probe: &dyn MemoryProbe,
    window: ScanWindow,
    facts: &mut ImageFacts,
) -> Result<(), ScanError> {
    log::info!(
        "analyzing section {} [0x{:x}, 0x{:x})",
        section.name,
        section.address,
        section.end_address()
    );

    let start = section.address;
    let end = section.end_address();
    let chunk_count = (end - start) / SCAN_SPAN;
    let mut analyzed_chunks = 0u64;
    let mut last_percentage = 0.0f64;

    let mut current = start;
    while current + SCAN_SPAN < end {
        analyze_chunk(probe, current, current + SCAN_SPAN, window, facts);
        current += SCAN_SPAN;
        if chunk_count > PROGRESS_CHUNK_THRESHOLD {
            analyzed_chunks += 1;
            let percentage = (analyzed_chunks as f64 / chunk_count as f64) * 100.0;
            if percentage - last_percentage > 5.0 {
                last_percentage = percentage;
                println!("{:.2}%", percentage);
            }
        }
    }
    // Tail chunk
    if end - current >= 4 {
        analyze_chunk(probe, current, end, window, facts);
    }
    Ok(())
}

/// Classify every 4-byte-aligned word in `[start, end)` and record what the
/// roots compute.
fn analyze_chunk(
    probe: &dyn MemoryProbe,
    start: Address,
    end: Address,
    window: ScanWindow,
    facts: &mut ImageFacts,
) {
    let data = match probe.read_bytes(start, (end - start) as usize) {
        Some(data) => data,
        None => {
            log::debug!("chunk [0x{:x}, 0x{:x}) is unreadable, skipped", start, end);
            return;
        }
    };

    for (offset, chunk) in data.chunks_exact(4).enumerate() {
        let word = u32::from_le_bytes(chunk.try_into().expect("chunks_exact yields 4 bytes"));
        let addr = start + offset as Address * 4;
        if is_adr(word) || is_adrp(word) {
            record_root_window(probe, word, addr, window, facts);
        } else if is_b(word) || is_bl(word) {
            facts
                .targets
                .insert(addr, addr.wrapping_add_signed(decode_b(word)));
        }
    }
}

/// Run the evaluator window for one adr/adrp root.
fn record_root_window(
    probe: &dyn MemoryProbe,
    word: u32,
    addr: Address,
    window: ScanWindow,
    facts: &mut ImageFacts,
) {
    let raw = match classify(word) {
        Some(raw @ (RawInst::Adr { .. } | RawInst::Adrp { .. })) => raw,
        _ => return,
    };
    let root = match lower(&raw, addr) {
        Some(op) => op,
        None => return,
    };
    let following = (1..=window.max_steps as Address).map(|step| {
        let step_addr = addr + step * 4;
        let op = probe
            .read_instruction_word(step_addr)
            .and_then(classify)
            .and_then(|raw| lower(&raw, step_addr));
        (step_addr, op)
    });
    let scan = window.run(addr, &root, following, probe);

    for fact in &scan.facts {
        facts.record(fact.addr, fact.kind);
    }
    // A root followed by a nop keeps its own computed address on record
    if scan.first_is_nop {
        facts.targets.insert(addr, scan.root_value);
    }
}
