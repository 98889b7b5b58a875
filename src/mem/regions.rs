use std::ops::Index;

use anyhow::{anyhow, ensure, Result};
use serde::Serialize;

pub type RegionIndex = usize;

/// A named address range from the map's "Memory Configuration" table.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct MemoryRegion {
    pub name: String,
    pub origin: u64,
    pub size: u64,
    pub attribs: String,
}

impl MemoryRegion {
    pub fn new(name: String, origin: u64, size: u64, attribs: String) -> Self {
        Self { name, origin, size, attribs }
    }

    /// Half-open containment, `origin <= address < origin + size`.
    /// Regions such as `*default*` span the whole address space, so the end
    /// is never computed directly.
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.origin && address - self.origin < self.size
    }

    #[inline]
    pub fn end(&self) -> u64 { self.origin.saturating_add(self.size) }
}

/// Append-only region table. Regions can only be looked up once the table
/// has been frozen, which happens when the linker map begins.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegions {
    regions: Vec<MemoryRegion>,
    frozen: bool,
}

impl MemoryRegions {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, region: MemoryRegion) -> Result<RegionIndex> {
        ensure!(
            !self.frozen,
            "Memory region {} defined after the region table was finalized",
            region.name
        );
        let index = self.regions.len();
        self.regions.push(region);
        Ok(index)
    }

    pub fn freeze(&mut self) { self.frozen = true; }

    #[inline]
    pub fn is_frozen(&self) -> bool { self.frozen }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (RegionIndex, &MemoryRegion)> {
        self.regions.iter().enumerate()
    }

    pub fn count(&self) -> usize { self.regions.len() }

    pub fn is_empty(&self) -> bool { self.regions.is_empty() }

    pub fn get(&self, index: RegionIndex) -> Option<&MemoryRegion> { self.regions.get(index) }

    /// Locates the region containing `address`. When regions overlap, the
    /// first one in document order wins.
    pub fn at_address(&self, address: u64) -> Result<(RegionIndex, &MemoryRegion)> {
        ensure!(
            self.frozen,
            "Region lookup @ {:#010x} before the region table was finalized",
            address
        );
        self.iter()
            .find(|(_, r)| r.contains(address))
            .ok_or_else(|| anyhow!("Failed to locate memory region @ {:#010x}", address))
    }
}

impl Index<RegionIndex> for MemoryRegions {
    type Output = MemoryRegion;

    fn index(&self, index: RegionIndex) -> &Self::Output { &self.regions[index] }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str, origin: u64, size: u64) -> MemoryRegion {
        MemoryRegion::new(name.to_string(), origin, size, String::new())
    }

    #[test]
    fn test_contains() {
        let ram = region("RAM", 0x20000000, 0x100);
        assert!(!ram.contains(0x1fffffff));
        assert!(ram.contains(0x20000000));
        assert!(ram.contains(0x200000ff));
        assert!(!ram.contains(0x20000100));

        let empty = region("EMPTY", 0x1000, 0);
        assert!(!empty.contains(0x1000));

        let all = region("*default*", 0, u64::MAX);
        assert!(all.contains(0));
        assert!(all.contains(u64::MAX - 1));
        assert!(!all.contains(u64::MAX));

        let top = region("TOP", u64::MAX - 0xf, 0x10);
        assert!(top.contains(u64::MAX));
        assert_eq!(top.end(), u64::MAX);
    }

    #[test]
    fn test_at_address() -> Result<()> {
        let mut regions = MemoryRegions::new();
        regions.push(region("FLASH", 0x0, 0x8000))?;
        regions.push(region("RAM", 0x800000, 0x1000))?;
        assert!(regions.at_address(0x100).is_err());
        regions.freeze();
        assert!(regions.push(region("EXTRA", 0x9000, 0x10)).is_err());

        assert_eq!(regions.at_address(0x100)?.1.name, "FLASH");
        assert_eq!(regions.at_address(0x800000)?.1.name, "RAM");
        assert_eq!(regions.at_address(0x800fff)?.0, 1);
        assert!(regions.at_address(0x8000).is_err());
        assert!(regions.at_address(0x801000).is_err());
        Ok(())
    }

    #[test]
    fn test_disjoint_regions_claim_at_most_once() -> Result<()> {
        let mut regions = MemoryRegions::new();
        regions.push(region("A", 0x0, 0x100))?;
        regions.push(region("B", 0x100, 0x100))?;
        regions.push(region("C", 0x400, 0x80))?;
        for address in (0..0x600).step_by(0x10) {
            let hits = regions.iter().filter(|(_, r)| r.contains(address)).count();
            assert!(hits <= 1, "{:#x} claimed {} times", address, hits);
        }
        Ok(())
    }
}
