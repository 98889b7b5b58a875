//! Aggregation queries over a finished memory map.
use anyhow::Result;
use indexmap::IndexSet;
use serde::Serialize;

use crate::mem::{MapWarning, MemoryMap, NodeIndex, NodeRegion, RegionIndex};

/// Which attribution a footprint is keyed by.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FileKind {
    Object,
    Archive,
}

impl FileKind {
    fn of(self, map: &MemoryMap, index: NodeIndex) -> Option<&str> {
        let node = &map[index];
        match self {
            FileKind::Object => node.object_file.as_deref(),
            FileKind::Archive => node.archive_file.as_deref(),
        }
    }
}

/// Object and archive files that contribute placed bytes.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct UsedFiles {
    /// Object files linked directly rather than from an archive.
    pub objects: Vec<String>,
    pub archives: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct RegionUsage {
    pub name: String,
    pub origin: u64,
    pub end: u64,
    pub size: u64,
    pub used: u64,
}

/// Read-only view answering footprint queries. Every node's region is
/// classified once up front.
pub struct Footprint<'a> {
    map: &'a MemoryMap,
    regions: Vec<NodeRegion>,
    used_regions: Vec<RegionIndex>,
    used_sections: Vec<NodeIndex>,
}

impl<'a> Footprint<'a> {
    pub fn new(map: &'a MemoryMap) -> Result<Self> {
        let regions = map.classify_regions()?;
        let mut used_regions = IndexSet::new();
        for index in map.all_nodes() {
            if let NodeRegion::Region(region) = regions[index] {
                used_regions.insert(region);
            }
        }
        let mut footprint = Self {
            map,
            regions,
            used_regions: used_regions.into_iter().collect(),
            used_sections: vec![],
        };
        footprint.used_sections = footprint.find_used_sections();
        Ok(footprint)
    }

    #[inline]
    pub fn map(&self) -> &'a MemoryMap { self.map }

    #[inline]
    pub fn region(&self, index: NodeIndex) -> NodeRegion { self.regions[index] }

    /// Regions in order of first appearance.
    pub fn used_regions(&self) -> &[RegionIndex] { &self.used_regions }

    pub fn used_region_names(&self) -> Vec<&'a str> {
        self.used_regions.iter().map(|&region| self.map.regions[region].name.as_str()).collect()
    }

    /// Placed top-level sections, then the placed children of top-level
    /// groupings that have no address of their own.
    pub fn used_sections(&self) -> &[NodeIndex] { &self.used_sections }

    pub fn used_section_paths(&self) -> Vec<String> {
        self.used_sections.iter().map(|&index| self.map.path(index)).collect()
    }

    fn find_used_sections(&self) -> Vec<NodeIndex> {
        let map = self.map;
        let mut sections = map
            .top_level_nodes()
            .filter(|&index| self.regions[index].is_placed() && map.total_size(index) > 0)
            .collect::<Vec<_>>();
        for index in map.top_level_nodes() {
            if self.regions[index] != NodeRegion::Undefined {
                continue;
            }
            sections.extend(map[index].children().filter(|&child| {
                self.regions[child] != NodeRegion::Discarded && map.total_size(child) > 0
            }));
        }
        sections
    }

    /// Nodes that contribute bytes to a real region.
    fn counted(&self, index: NodeIndex) -> bool {
        self.map[index].leaf_size().is_some() && self.regions[index].is_placed()
    }

    fn unaccounted(&self, index: NodeIndex) -> MapWarning {
        let warning = MapWarning::Unaccounted {
            path: self.map.path(index),
            region: self.map.region_name(self.regions[index]).to_string(),
            size: self.map[index].leaf_size().unwrap_or(0),
        };
        warning.emit();
        warning
    }

    fn used(&self, kind: FileKind, warnings: &mut Vec<MapWarning>) -> Vec<String> {
        let mut out = IndexSet::new();
        for index in self.map.all_nodes().filter(|&index| self.counted(index)) {
            match kind.of(self.map, index) {
                Some(file) => {
                    out.insert(file);
                }
                None => warnings.push(self.unaccounted(index)),
            }
        }
        out.into_iter().map(str::to_string).collect()
    }

    /// Distinct node names in pre-order.
    pub fn all_symbols(&self) -> Vec<&'a str> {
        let map = self.map;
        let names = map.all_nodes().map(|index| map[index].name.as_str()).collect::<IndexSet<_>>();
        names.into_iter().collect()
    }

    pub fn used_object_files(&self, warnings: &mut Vec<MapWarning>) -> Vec<String> {
        self.used(FileKind::Object, warnings)
    }

    pub fn used_archive_files(&self, warnings: &mut Vec<MapWarning>) -> Vec<String> {
        self.used(FileKind::Archive, warnings)
    }

    /// Standalone object files and archives. A counted node with neither an
    /// archive nor an object file is unaccounted.
    pub fn used_files(&self, warnings: &mut Vec<MapWarning>) -> UsedFiles {
        let mut objects = IndexSet::new();
        let mut archives = IndexSet::new();
        for index in self.map.all_nodes().filter(|&index| self.counted(index)) {
            let node = &self.map[index];
            match (node.archive_file.as_deref(), node.object_file.as_deref()) {
                (Some(archive), _) => {
                    archives.insert(archive);
                }
                (None, Some(object)) => {
                    objects.insert(object);
                }
                (None, None) => warnings.push(self.unaccounted(index)),
            }
        }
        UsedFiles {
            objects: objects.into_iter().map(str::to_string).collect(),
            archives: archives.into_iter().map(str::to_string).collect(),
        }
    }

    fn region_footprint(&self, kind: FileKind, file: &str) -> Vec<u64> {
        let mut out = vec![0u64; self.used_regions.len()];
        for index in self.map.all_nodes() {
            let NodeRegion::Region(region) = self.regions[index] else {
                continue;
            };
            if kind.of(self.map, index) != Some(file) {
                continue;
            }
            let Some(size) = self.map[index].leaf_size() else {
                continue;
            };
            if let Some(slot) = self.used_regions.iter().position(|&r| r == region) {
                out[slot] = out[slot].saturating_add(size);
            }
        }
        out
    }

    fn section_footprint(&self, kind: FileKind, file: &str) -> Vec<u64> {
        self.used_sections
            .iter()
            .map(|&section| {
                self.map
                    .subtree(section)
                    .filter(|&index| kind.of(self.map, index) == Some(file))
                    .filter_map(|index| self.map[index].leaf_size())
                    .fold(0, u64::saturating_add)
            })
            .collect()
    }

    /// Bytes contributed by `file` to each used region.
    pub fn object_footprint(&self, file: &str) -> Vec<u64> {
        self.region_footprint(FileKind::Object, file)
    }

    pub fn archive_footprint(&self, file: &str) -> Vec<u64> {
        self.region_footprint(FileKind::Archive, file)
    }

    /// Bytes contributed by `file` to each used section's subtree.
    pub fn object_footprint_by_section(&self, file: &str) -> Vec<u64> {
        self.section_footprint(FileKind::Object, file)
    }

    pub fn archive_footprint_by_section(&self, file: &str) -> Vec<u64> {
        self.section_footprint(FileKind::Archive, file)
    }

    /// Total placed leaf size per used region, next to the configured size.
    pub fn region_usage(&self) -> Vec<RegionUsage> {
        let mut used = vec![0u64; self.used_regions.len()];
        for index in self.map.all_nodes() {
            let NodeRegion::Region(region) = self.regions[index] else {
                continue;
            };
            if let (Some(size), Some(slot)) = (
                self.map[index].leaf_size(),
                self.used_regions.iter().position(|&r| r == region),
            ) {
                used[slot] = used[slot].saturating_add(size);
            }
        }
        self.used_regions
            .iter()
            .zip(used)
            .map(|(&region, used)| {
                let region = &self.map.regions[region];
                RegionUsage {
                    name: region.name.clone(),
                    origin: region.origin,
                    end: region.end(),
                    size: region.size,
                    used,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::util::map::{process_map, MapInfo, MapOptions};

    const MAP: &str = r"Memory Configuration

Name             Origin             Length             Attributes
FLASH            0x08000000         0x00010000         xr
RAM              0x20000000         0x00001000         xrw

Linker script and memory map

.text           0x08000000       0x40
 .text.main     0x08000000       0x10 main.o
 .text.memcpy   0x08000010       0x20 /usr/lib/libc.a(lib_a-memcpy.o)
 *fill*         0x08000030        0x4
 .text.helper   0x08000034        0xc util.o

.data           0x20000000        0x8 load address 0x08000040
 .data          0x20000000        0x4 main.o
 .data          0x20000004        0x4 util.o

.bss            0x20000008        0x8
 .bss           0x20000008        0x4 main.o
 .bss.pool      0x2000000c        0x4

.comment        0x00000000       0x20
 .comment       0x00000000       0x20 main.o

.stack
 .stack         0x20000f00      0x100 startup.o
";

    fn parse() -> MapInfo { process_map(Cursor::new(MAP), &MapOptions::default()).unwrap() }

    #[test]
    fn test_used_regions_and_sections() -> Result<()> {
        let info = parse();
        let footprint = Footprint::new(&info.memory)?;
        assert_eq!(footprint.used_region_names(), ["FLASH", "RAM"]);
        assert_eq!(footprint.used_section_paths(), [".text", ".data", ".bss", ".stack.startup_o"]);
        Ok(())
    }

    #[test]
    fn test_used_files() -> Result<()> {
        let info = parse();
        let footprint = Footprint::new(&info.memory)?;

        let mut warnings = vec![];
        assert_eq!(footprint.used_object_files(&mut warnings), [
            "main.o",
            "lib_a-memcpy.o",
            "util.o",
            "startup.o"
        ]);
        assert_eq!(warnings, [MapWarning::Unaccounted {
            path: ".bss.pool".to_string(),
            region: "RAM".to_string(),
            size: 4
        }]);

        warnings.clear();
        assert_eq!(footprint.used_archive_files(&mut warnings), ["libc.a"]);
        // Every counted node outside an archive is reported.
        assert_eq!(warnings.len(), 7);

        warnings.clear();
        let files = footprint.used_files(&mut warnings);
        assert_eq!(files.objects, ["main.o", "util.o", "startup.o"]);
        assert_eq!(files.archives, ["libc.a"]);
        assert_eq!(warnings.len(), 1);
        Ok(())
    }

    #[test]
    fn test_all_symbols() -> Result<()> {
        let info = parse();
        let footprint = Footprint::new(&info.memory)?;
        assert_eq!(footprint.all_symbols(), [
            "text", "main", "memcpy", "helper", "data", "main_o", "util_o", "bss", "pool",
            "comment", "stack", "startup_o"
        ]);
        Ok(())
    }

    #[test]
    fn test_saturating_totals() -> Result<()> {
        let info = process_map(
            Cursor::new(
                r"Memory Configuration
RAM 0x20000000 0xffffffffffffffff xrw
Linker script and memory map
.data 0x20000000 0x0
 .data.a 0x20000000 0xffffffffffffffff a.o
 .data.b 0x20000001 0x10 a.o
",
            ),
            &MapOptions::default(),
        )?;
        let footprint = Footprint::new(&info.memory)?;
        assert_eq!(footprint.object_footprint("a.o"), [u64::MAX]);
        assert_eq!(footprint.object_footprint_by_section("a.o"), [u64::MAX]);
        assert_eq!(footprint.region_usage()[0].used, u64::MAX);
        let data = info.memory.get_node(".data").unwrap();
        assert_eq!(info.memory.total_size(data), u64::MAX);
        Ok(())
    }

    #[test]
    fn test_object_footprint() -> Result<()> {
        let info = parse();
        let footprint = Footprint::new(&info.memory)?;
        assert_eq!(footprint.object_footprint("main.o"), [0x10, 0x8]);
        assert_eq!(footprint.object_footprint("util.o"), [0xc, 0x4]);
        assert_eq!(footprint.object_footprint("lib_a-memcpy.o"), [0x24, 0]);
        assert_eq!(footprint.object_footprint("startup.o"), [0, 0x100]);
        assert_eq!(footprint.object_footprint("missing.o"), [0, 0]);
        assert_eq!(footprint.archive_footprint("libc.a"), [0x24, 0]);

        // One entry per used region, matching a manual sum.
        let memory = &info.memory;
        for (slot, &region) in footprint.used_regions().iter().enumerate() {
            let expected: u64 = memory
                .all_nodes()
                .filter(|&i| memory[i].object_file.as_deref() == Some("main.o"))
                .filter(|&i| footprint.region(i) == NodeRegion::Region(region))
                .filter_map(|i| memory[i].leaf_size())
                .sum();
            assert_eq!(footprint.object_footprint("main.o")[slot], expected);
        }
        Ok(())
    }

    #[test]
    fn test_footprint_by_section() -> Result<()> {
        let info = parse();
        let footprint = Footprint::new(&info.memory)?;
        assert_eq!(footprint.object_footprint_by_section("main.o"), [0x10, 0x4, 0x4, 0]);
        assert_eq!(footprint.object_footprint_by_section("startup.o"), [0, 0, 0, 0x100]);
        assert_eq!(footprint.archive_footprint_by_section("libc.a"), [0x24, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_region_usage() -> Result<()> {
        let info = parse();
        let footprint = Footprint::new(&info.memory)?;
        assert_eq!(footprint.region_usage(), [
            RegionUsage {
                name: "FLASH".to_string(),
                origin: 0x08000000,
                end: 0x08010000,
                size: 0x10000,
                used: 0x40
            },
            RegionUsage {
                name: "RAM".to_string(),
                origin: 0x20000000,
                end: 0x20001000,
                size: 0x1000,
                used: 0x110
            },
        ]);
        Ok(())
    }
}
