pub mod aliases;
pub mod regions;
mod warning;

use std::ops::{Index, IndexMut};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::Serialize;

pub use self::{
    aliases::LinkAliases,
    regions::{MemoryRegion, MemoryRegions, RegionIndex},
    warning::MapWarning,
};

pub type NodeIndex = usize;

pub const ROOT_INDEX: NodeIndex = 0;

/// Region classification of a node, derived from its address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NodeRegion {
    /// No address has been assigned.
    Undefined,
    /// Placed at address 0, or below a discarded parent.
    Discarded,
    Region(RegionIndex),
}

impl NodeRegion {
    #[inline]
    pub fn is_placed(self) -> bool { matches!(self, NodeRegion::Region(_)) }
}

/// One segment of the section/symbol namespace.
#[derive(Debug, Clone, Default)]
pub struct MemoryMapNode {
    pub name: String,
    pub parent: Option<NodeIndex>,
    children: IndexMap<String, NodeIndex>,
    pub address: Option<u64>,
    /// Size stated on a section heading.
    pub declared_size: Option<u64>,
    pub load_address: Option<u64>,
    own_size: Option<u64>,
    /// Linker padding following the symbol.
    pub fill_size: Option<u64>,
    pub archive_file: Option<String>,
    pub object_file: Option<String>,
    pub archive_folder: Option<String>,
    /// Map file line that last placed this node.
    pub line: Option<usize>,
}

impl MemoryMapNode {
    fn new(name: String, parent: Option<NodeIndex>) -> Self {
        Self { name, parent, ..Default::default() }
    }

    #[inline]
    pub fn own_size(&self) -> Option<u64> { self.own_size }

    /// Own size plus fill, or whichever of the two is known. Saturates;
    /// the parser rejects sizes whose sum does not fit.
    #[inline]
    pub fn leaf_size(&self) -> Option<u64> {
        match (self.own_size, self.fill_size) {
            (Some(size), Some(fill)) => Some(size.saturating_add(fill)),
            (size, fill) => size.or(fill),
        }
    }

    /// Adds trailing padding, keeping the leaf size representable.
    pub fn add_fill(&mut self, size: u64) -> Result<()> {
        let fill = self.fill_size.unwrap_or(0).checked_add(size);
        match fill.filter(|&fill| self.own_size.unwrap_or(0).checked_add(fill).is_some()) {
            Some(fill) => {
                self.fill_size = Some(fill);
                Ok(())
            }
            None => bail!("Fill of {:#x} bytes overflows the size of '{}'", size, self.name),
        }
    }

    #[inline]
    pub fn has_children(&self) -> bool { !self.children.is_empty() }

    pub fn children(&self) -> impl DoubleEndedIterator<Item = NodeIndex> + '_ {
        self.children.values().copied()
    }

    pub fn child(&self, name: &str) -> Option<NodeIndex> { self.children.get(name).copied() }
}

/// Tree of sections and symbols keyed by dot-separated path. Nodes live in
/// an arena; a parent is always allocated before its children.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    pub regions: MemoryRegions,
    nodes: Vec<MemoryMapNode>,
    paths: FxHashMap<String, NodeIndex>,
}

impl Default for MemoryMap {
    fn default() -> Self { Self::new() }
}

impl MemoryMap {
    pub fn new() -> Self {
        Self {
            regions: MemoryRegions::new(),
            nodes: vec![MemoryMapNode::new(String::new(), None)],
            paths: FxHashMap::default(),
        }
    }

    /// Number of nodes, excluding the root.
    pub fn count(&self) -> usize { self.nodes.len() - 1 }

    pub fn root(&self) -> &MemoryMapNode { &self.nodes[ROOT_INDEX] }

    pub fn get(&self, index: NodeIndex) -> Option<&MemoryMapNode> { self.nodes.get(index) }

    pub fn get_mut(&mut self, index: NodeIndex) -> Option<&mut MemoryMapNode> {
        self.nodes.get_mut(index)
    }

    pub fn get_node(&self, path: &str) -> Option<NodeIndex> { self.paths.get(path).copied() }

    pub fn node(&self, path: &str) -> Option<&MemoryMapNode> {
        self.get_node(path).map(|index| &self.nodes[index])
    }

    /// Returns the node at `path`, creating it and any missing ancestors.
    pub fn get_or_create_node(&mut self, path: &str) -> Result<NodeIndex> {
        if let Some(index) = self.get_node(path) {
            return Ok(index);
        }
        let Some(rest) = path.strip_prefix('.') else {
            bail!("Node path '{}' does not start with '.'", path);
        };
        let mut current = ROOT_INDEX;
        let mut prefix = String::with_capacity(path.len());
        for segment in rest.split('.') {
            prefix.push('.');
            prefix.push_str(segment);
            current = match self.nodes[current].child(segment) {
                Some(index) => index,
                None => {
                    let index = self.nodes.len();
                    self.nodes.push(MemoryMapNode::new(segment.to_string(), Some(current)));
                    self.nodes[current].children.insert(segment.to_string(), index);
                    self.paths.insert(prefix.clone(), index);
                    index
                }
            };
        }
        Ok(current)
    }

    pub fn path(&self, index: NodeIndex) -> String {
        let mut names = vec![];
        let mut current = index;
        while let Some(parent) = self.nodes[current].parent {
            names.push(self.nodes[current].name.as_str());
            current = parent;
        }
        let mut path = String::new();
        for name in names.iter().rev() {
            path.push('.');
            path.push_str(name);
        }
        path
    }

    pub fn top_level_nodes(&self) -> impl DoubleEndedIterator<Item = NodeIndex> + '_ {
        self.root().children()
    }

    /// Pre-order traversal of every node below the root.
    pub fn all_nodes(&self) -> NodeIter<'_> { self.subtree(ROOT_INDEX) }

    /// Pre-order traversal of the subtree at `index`, including `index`
    /// itself unless it is the root.
    pub fn subtree(&self, index: NodeIndex) -> NodeIter<'_> {
        let stack = if index == ROOT_INDEX {
            self.nodes[ROOT_INDEX].children().rev().collect()
        } else {
            vec![index]
        };
        NodeIter { map: self, stack }
    }

    /// Sets the symbol size of a node, reporting suspicious rewrites.
    pub fn set_own_size(&mut self, index: NodeIndex, size: u64, warnings: &mut Vec<MapWarning>) {
        let node = &self.nodes[index];
        let mut found = vec![];
        if node.has_children() {
            found.push(MapWarning::SizeOnInternalNode { path: self.path(index) });
        }
        match node.own_size {
            Some(old) if old != size => {
                found.push(MapWarning::SizeOverwritten { path: self.path(index), old, new: size })
            }
            Some(_) => found.push(MapWarning::PossibleDuplicate { path: self.path(index), size }),
            None => {}
        }
        for warning in found {
            warning.emit();
            warnings.push(warning);
        }
        self.nodes[index].own_size = Some(size);
    }

    /// Leaf size for childless nodes, otherwise the sum over the children.
    pub fn total_size(&self, index: NodeIndex) -> u64 {
        let node = &self.nodes[index];
        if node.has_children() {
            node.children().fold(0, |acc, child| acc.saturating_add(self.total_size(child)))
        } else {
            node.leaf_size().unwrap_or(0)
        }
    }

    pub fn region(&self, index: NodeIndex) -> Result<NodeRegion> {
        let node = &self.nodes[index];
        if let Some(parent) = node.parent {
            if self.region(parent)? == NodeRegion::Discarded {
                return Ok(NodeRegion::Discarded);
            }
        }
        self.own_region(index)
    }

    fn own_region(&self, index: NodeIndex) -> Result<NodeRegion> {
        let node = &self.nodes[index];
        match node.address {
            None => Ok(NodeRegion::Undefined),
            Some(0) => Ok(NodeRegion::Discarded),
            Some(address) => {
                let (region, _) = self.regions.at_address(address).with_context(|| {
                    let line = node.line.map(|l| format!(" (line {l})")).unwrap_or_default();
                    format!("Node {}{} is not placed in any memory region", self.path(index), line)
                })?;
                Ok(NodeRegion::Region(region))
            }
        }
    }

    /// Classifies every node at once, indexed by `NodeIndex`.
    pub fn classify_regions(&self) -> Result<Vec<NodeRegion>> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for index in 0..self.nodes.len() {
            let inherited = self.nodes[index].parent.map(|parent| out[parent]);
            let region = if inherited == Some(NodeRegion::Discarded) {
                NodeRegion::Discarded
            } else {
                self.own_region(index)?
            };
            out.push(region);
        }
        Ok(out)
    }

    pub fn region_name(&self, region: NodeRegion) -> &str {
        match region {
            NodeRegion::Undefined => "UNDEF",
            NodeRegion::Discarded => "DISCARDED",
            NodeRegion::Region(index) => &self.regions[index].name,
        }
    }

    /// Fixed-width report row: path, address, declared size, own size,
    /// leaf size, object file and region.
    pub fn format_row(&self, index: NodeIndex) -> Result<String> {
        let node = &self.nodes[index];
        let region = self.region(index)?;
        let address = node.address.map(|a| format!("{:#010x}", a)).unwrap_or_default();
        Ok(format!(
            "{:.<60}{:<15}{:>10}{:>10}{:>10}    {:<30}{}",
            self.path(index),
            address,
            display_opt(node.declared_size),
            display_opt(node.own_size),
            display_opt(node.leaf_size()),
            node.object_file.as_deref().unwrap_or(""),
            self.region_name(region),
        ))
    }

    pub fn records(&self) -> Result<Vec<NodeRecord>> {
        let regions = self.classify_regions()?;
        Ok(self
            .all_nodes()
            .map(|index| {
                let node = &self.nodes[index];
                NodeRecord {
                    path: self.path(index),
                    address: node.address,
                    load_address: node.load_address,
                    declared_size: node.declared_size,
                    own_size: node.own_size,
                    fill_size: node.fill_size,
                    leaf_size: node.leaf_size(),
                    archive_folder: node.archive_folder.clone(),
                    archive_file: node.archive_file.clone(),
                    object_file: node.object_file.clone(),
                    region: self.region_name(regions[index]).to_string(),
                }
            })
            .collect())
    }
}

impl Index<NodeIndex> for MemoryMap {
    type Output = MemoryMapNode;

    fn index(&self, index: NodeIndex) -> &Self::Output { &self.nodes[index] }
}

impl IndexMut<NodeIndex> for MemoryMap {
    fn index_mut(&mut self, index: NodeIndex) -> &mut Self::Output { &mut self.nodes[index] }
}

fn display_opt(value: Option<u64>) -> String { value.map(|v| v.to_string()).unwrap_or_default() }

/// Serializable snapshot of a node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub path: String,
    pub address: Option<u64>,
    pub load_address: Option<u64>,
    pub declared_size: Option<u64>,
    pub own_size: Option<u64>,
    pub fill_size: Option<u64>,
    pub leaf_size: Option<u64>,
    pub archive_folder: Option<String>,
    pub archive_file: Option<String>,
    pub object_file: Option<String>,
    pub region: String,
}

pub struct NodeIter<'a> {
    map: &'a MemoryMap,
    stack: Vec<NodeIndex>,
}

impl Iterator for NodeIter<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.stack.pop()?;
        self.stack.extend(self.map.nodes[index].children().rev());
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frozen_map(regions: &[(&str, u64, u64)]) -> Result<MemoryMap> {
        let mut map = MemoryMap::new();
        for &(name, origin, size) in regions {
            map.regions.push(MemoryRegion::new(name.to_string(), origin, size, String::new()))?;
        }
        map.regions.freeze();
        Ok(map)
    }

    #[test]
    fn test_get_or_create_node() -> Result<()> {
        let mut map = MemoryMap::new();
        let c = map.get_or_create_node(".a.b.c")?;
        assert_eq!(map.count(), 3);
        assert_eq!(map.get_or_create_node(".a.b.c")?, c);
        assert_eq!(map.count(), 3);

        let a = map.get_node(".a").unwrap();
        let b = map.get_node(".a.b").unwrap();
        for index in [a, b] {
            let node = map.get(index).unwrap();
            assert!(node.address.is_none());
            assert!(node.declared_size.is_none());
            assert!(node.own_size().is_none());
        }
        assert_eq!(map.get(c).unwrap().parent, Some(b));
        assert_eq!(map.path(c), ".a.b.c");

        map.get_or_create_node(".a.d")?;
        assert_eq!(map.count(), 4);
        assert!(map.get_or_create_node("a.e").is_err());
        Ok(())
    }

    #[test]
    fn test_all_nodes_pre_order() -> Result<()> {
        let mut map = MemoryMap::new();
        for path in [".text.main", ".data.x", ".text.isr", ".data"] {
            map.get_or_create_node(path)?;
        }
        let paths = map.all_nodes().map(|i| map.path(i)).collect::<Vec<_>>();
        assert_eq!(paths, [".text", ".text.main", ".text.isr", ".data", ".data.x"]);
        // Restartable
        assert_eq!(map.all_nodes().count(), 5);
        let text = map.get_node(".text").unwrap();
        assert_eq!(map.subtree(text).count(), 3);
        Ok(())
    }

    #[test]
    fn test_leaf_size() {
        let mut node = MemoryMapNode::default();
        assert_eq!(node.leaf_size(), None);
        node.fill_size = Some(2);
        assert_eq!(node.leaf_size(), Some(2));
        node.own_size = Some(0x10);
        assert_eq!(node.leaf_size(), Some(0x12));
        node.fill_size = None;
        assert_eq!(node.leaf_size(), Some(0x10));
    }

    #[test]
    fn test_add_fill() -> Result<()> {
        let mut node = MemoryMapNode::new("a".to_string(), None);
        node.add_fill(4)?;
        node.add_fill(4)?;
        assert_eq!(node.fill_size, Some(8));
        node.own_size = Some(0x10);
        assert!(node.add_fill(u64::MAX - 0x17).is_err());
        assert_eq!(node.fill_size, Some(8));
        node.add_fill(u64::MAX - 0x19)?;
        assert_eq!(node.leaf_size(), Some(u64::MAX - 1));

        let mut node = MemoryMapNode { own_size: Some(u64::MAX), ..Default::default() };
        node.fill_size = Some(1);
        assert_eq!(node.leaf_size(), Some(u64::MAX));
        Ok(())
    }

    #[test]
    fn test_set_own_size_warnings() -> Result<()> {
        let mut map = MemoryMap::new();
        let mut warnings = vec![];
        let leaf = map.get_or_create_node(".text.main")?;
        map.set_own_size(leaf, 4, &mut warnings);
        assert!(warnings.is_empty());
        map.set_own_size(leaf, 4, &mut warnings);
        assert_eq!(warnings, [MapWarning::PossibleDuplicate {
            path: ".text.main".to_string(),
            size: 4
        }]);
        warnings.clear();
        map.set_own_size(leaf, 8, &mut warnings);
        assert_eq!(warnings, [MapWarning::SizeOverwritten {
            path: ".text.main".to_string(),
            old: 4,
            new: 8
        }]);
        assert_eq!(map.get(leaf).unwrap().own_size(), Some(8));

        warnings.clear();
        let text = map.get_node(".text").unwrap();
        map.set_own_size(text, 1, &mut warnings);
        assert_eq!(warnings, [MapWarning::SizeOnInternalNode { path: ".text".to_string() }]);
        assert_eq!(map.get(text).unwrap().own_size(), Some(1));
        Ok(())
    }

    #[test]
    fn test_region() -> Result<()> {
        let mut map = frozen_map(&[("FLASH", 0x0, 0x8000), ("RAM", 0x20000000, 0x1000)])?;
        let text = map.get_or_create_node(".text")?;
        let main = map.get_or_create_node(".text.main")?;
        let undef = map.get_or_create_node(".comment")?;
        map.get_mut(text).unwrap().address = Some(0x100);
        map.get_mut(main).unwrap().address = Some(0x20000010);
        assert_eq!(map.region(text)?, NodeRegion::Region(0));
        assert_eq!(map.region(main)?, NodeRegion::Region(1));
        assert_eq!(map.region(undef)?, NodeRegion::Undefined);
        assert_eq!(map.region_name(map.region(main)?), "RAM");

        // Address 0 discards the node and everything below it.
        map.get_mut(text).unwrap().address = Some(0);
        assert_eq!(map.region(text)?, NodeRegion::Discarded);
        assert_eq!(map.region(main)?, NodeRegion::Discarded);
        let regions = map.classify_regions()?;
        assert_eq!(regions[main], NodeRegion::Discarded);
        assert_eq!(regions[undef], NodeRegion::Undefined);
        Ok(())
    }

    #[test]
    fn test_region_outside_table_is_fatal() -> Result<()> {
        let mut map = frozen_map(&[("RAM", 0x0, 0x100)])?;
        let node = map.get_or_create_node(".data.x")?;
        map.get_mut(node).unwrap().address = Some(0x1000);
        map.get_mut(node).unwrap().line = Some(42);
        let err = map.region(node).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains(".data.x"), "{message}");
        assert!(message.contains("line 42"), "{message}");
        assert!(map.classify_regions().is_err());
        Ok(())
    }

    #[test]
    fn test_region_requires_frozen_table() -> Result<()> {
        let mut map = MemoryMap::new();
        map.regions.push(MemoryRegion::new("RAM".into(), 0, 0x100, String::new()))?;
        let node = map.get_or_create_node(".data")?;
        map.get_mut(node).unwrap().address = Some(0x10);
        assert!(map.region(node).is_err());
        map.regions.freeze();
        assert_eq!(map.region(node)?, NodeRegion::Region(0));
        Ok(())
    }

    #[test]
    fn test_total_size_and_row() -> Result<()> {
        let mut map = frozen_map(&[("RAM", 0x0, 0x100)])?;
        let mut warnings = vec![];
        let a = map.get_or_create_node(".data.a")?;
        let b = map.get_or_create_node(".data.b")?;
        map.set_own_size(a, 4, &mut warnings);
        map.set_own_size(b, 8, &mut warnings);
        map.get_mut(b).unwrap().fill_size = Some(2);
        map.get_mut(a).unwrap().address = Some(0x10);
        map.get_mut(a).unwrap().object_file = Some("a.o".to_string());
        let data = map.get_node(".data").unwrap();
        assert_eq!(map.total_size(data), 14);

        let row = map.format_row(a)?;
        assert!(row.starts_with(".data.a....."));
        assert!(row.contains("0x00000010"));
        assert!(row.contains("a.o"));
        assert!(row.ends_with("RAM"));
        Ok(())
    }
}
