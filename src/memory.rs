//! Memory probes over a parsed image.
//!
//! `ImageMemory` serves reads out of the image's file-backed sections, which
//! is exactly the read-only literal-pool view the evaluator needs: an
//! address that no section maps reads as `None`, and the evaluator records
//! the computed address without a value.

use std::cell::Cell;

use crate::parser::Image;
use crate::{Address, MemoryProbe};

/// A probe over the mapped sections of a parsed image.
pub struct ImageMemory<'a> {
    image: &'a Image,
}

impl<'a> ImageMemory<'a> {
    pub fn new(image: &'a Image) -> Self {
        ImageMemory { image }
    }
}

impl MemoryProbe for ImageMemory<'_> {
    fn read_bytes(&self, addr: Address, len: usize) -> Option<Vec<u8>> {
        self.image.read_bytes(addr, len)
    }
}

/// A probe wrapper that counts reads. Used to observe that a cached scan
/// never touches the image again.
pub struct CountingProbe<'a> {
    inner: &'a dyn MemoryProbe,
    reads: Cell<usize>,
}

impl<'a> CountingProbe<'a> {
    pub fn new(inner: &'a dyn MemoryProbe) -> Self {
        CountingProbe { inner, reads: Cell::new(0) }
    }

    /// Number of `read_bytes` calls that reached the underlying probe.
    pub fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl MemoryProbe for CountingProbe<'_> {
    fn read_bytes(&self, addr: Address, len: usize) -> Option<Vec<u8>> {
        self.reads.set(self.reads.get() + 1);
        self.inner.read_bytes(addr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Image, Section};
    use crate::Architecture;

    fn test_image() -> Image {
        Image::from_parts(
            "test".into(),
            Architecture::AArch64,
            crate::parser::ImageKey::Path("test".into()),
            vec![Section {
                name: "__text".to_string(),
                address: 0x1000,
                size: 8,
                file_offset: 0,
                is_code: true,
            }],
            Vec::new(),
            vec![1, 2, 3, 4, 5, 6, 7, 8],
        )
    }

    #[test]
    fn reads_within_section() {
        let image = test_image();
        let probe = ImageMemory::new(&image);
        assert_eq!(probe.read_bytes(0x1000, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(probe.read_bytes(0x1004, 4), Some(vec![5, 6, 7, 8]));
    }

    #[test]
    fn reads_outside_any_section_fail() {
        let image = test_image();
        let probe = ImageMemory::new(&image);
        assert_eq!(probe.read_bytes(0x2000, 4), None);
        // Crossing the end of the section also fails
        assert_eq!(probe.read_bytes(0x1006, 4), None);
    }

    #[test]
    fn counting_probe_counts() {
        let image = test_image();
        let inner = ImageMemory::new(&image);
        let probe = CountingProbe::new(&inner);
        let _ = probe.read_bytes(0x1000, 4);
        let _ = probe.read_bytes(0x2000, 4);
        assert_eq!(probe.reads(), 2);
    }
}
