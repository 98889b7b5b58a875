//! "Linker script and memory map" section parser.
//!
//! Section headings open a section node, symbol lines below them create
//! leaf nodes, and `*fill*` lines pad the most recent symbol. Long names make
//! ld split an entry over two lines; the name is kept pending until the
//! line carrying its address and size arrives.
use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::{capture, parse_hex, DefinedAddress, FileAttribution, MapSession};
use crate::mem::{MapWarning, NodeIndex};

static LOAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^LOAD\s+(?P<folder>.*/)?(?P<file>[^/]+?\.[^./]*)$").unwrap());
static DEFINED_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s+(?P<address>0[xX][0-9a-fA-F]+)\s+(?P<name>\S.*?)\s+=\s+(?P<value>0[xX][0-9a-fA-F]+)$",
    )
    .unwrap()
});
static SECTION_HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<name>[._]\S*)(?:\s+(?P<address>0[xX][0-9a-fA-F]+))?(?:\s+(?P<size>0[xX][0-9a-fA-F]+))?(?:\s+load address\s+(?P<load_address>0[xX][0-9a-fA-F]+))?$",
    )
    .unwrap()
});
static SECTION_DETAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s+(?P<address>0[xX][0-9a-fA-F]+)(?:\s+(?P<size>0[xX][0-9a-fA-F]+))?(?:\s+load address\s+(?P<load_address>0[xX][0-9a-fA-F]+))?$",
    )
    .unwrap()
});
static SYMBOL_DETAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s+(?P<address>0[xX][0-9a-fA-F]+)\s+(?P<size>0[xX][0-9a-fA-F]+)(?:\s+(?P<folder>.*/)?(?P<file>[^/()\s][^/()]*\.[^./()]*)(?:\((?P<member>[^()]*)\))?)?$",
    )
    .unwrap()
});
static FILL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s\*fill\*\s+(?P<address>0[xX][0-9a-fA-F]+)\s+(?P<size>0[xX][0-9a-fA-F]+)(?:\s+\S+)?$",
    )
    .unwrap()
});
static SYMBOL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s(?P<name>\S+)\s+(?P<address>0[xX][0-9a-fA-F]+)\s+(?P<size>0[xX][0-9a-fA-F]+)(?:\s+(?P<folder>.*/)?(?P<file>[^/()\s][^/()]*\.[^./()]*)(?:\((?P<member>[^()]*)\))?)?$",
    )
    .unwrap()
});
static SYMBOL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s(?P<name>(?:[._]|COMMON)\S*)$").unwrap());

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum LineKind {
    Load,
    DefinedAddress,
    SectionHeading,
    SymbolDetail,
    Fill,
    Symbol,
    SymbolName,
}

impl LineKind {
    fn pattern(self) -> &'static Regex {
        match self {
            LineKind::Load => &*LOAD,
            LineKind::DefinedAddress => &*DEFINED_ADDRESS,
            LineKind::SectionHeading => &*SECTION_HEADING,
            LineKind::SymbolDetail => &*SYMBOL_DETAIL,
            LineKind::Fill => &*FILL,
            LineKind::Symbol => &*SYMBOL,
            LineKind::SymbolName => &*SYMBOL_NAME,
        }
    }
}

/// Rules tried, in order, between sections.
const NORMAL_RULES: &[LineKind] =
    &[LineKind::Load, LineKind::DefinedAddress, LineKind::SectionHeading];

/// Rules tried, in order, inside a section body. A symbol detail line is
/// only considered while a symbol name is pending.
const IN_SECTION_RULES: &[LineKind] = &[
    LineKind::SymbolDetail,
    LineKind::SectionHeading,
    LineKind::Fill,
    LineKind::Symbol,
    LineKind::SymbolName,
];

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub(super) enum LinkerMapMode {
    #[default]
    Normal,
    /// A section heading without an address; the next line has it.
    GotSectionName,
    InSection,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(super) struct PendingSymbol {
    pub name: String,
    pub line: usize,
}

#[derive(Debug, Default)]
pub(super) struct LinkerMapState {
    mode: LinkerMapMode,
    section: Option<NodeIndex>,
    section_path: String,
    pending: Option<PendingSymbol>,
    /// Target for `*fill*` lines.
    last_symbol: Option<NodeIndex>,
}

impl LinkerMapState {
    pub fn take_pending(&mut self) -> Option<PendingSymbol> { self.pending.take() }

    pub fn describe(&self) -> String {
        let mut out = format!("linker map {:?}", self.mode);
        if self.section.is_some() {
            out.push_str(&format!(", section {}", self.section_path));
        }
        if let Some(pending) = &self.pending {
            out.push_str(&format!(", pending {}", pending.name));
        }
        out
    }
}

impl MapSession<'_> {
    pub(super) fn process_linker_map_line(&mut self, line: &str) -> Result<()> {
        match self.linker.mode {
            LinkerMapMode::GotSectionName => self.process_section_detail_line(line),
            LinkerMapMode::Normal => self.process_rules(NORMAL_RULES, line),
            LinkerMapMode::InSection => self.process_rules(IN_SECTION_RULES, line),
        }
    }

    fn process_rules(&mut self, rules: &[LineKind], line: &str) -> Result<()> {
        for &kind in rules {
            if kind == LineKind::SymbolDetail && self.linker.pending.is_none() {
                continue;
            }
            if let Some(captures) = kind.pattern().captures(line) {
                return self.apply_rule(kind, &captures);
            }
        }
        self.unhandled(line);
        Ok(())
    }

    fn apply_rule(&mut self, kind: LineKind, captures: &Captures) -> Result<()> {
        match kind {
            LineKind::Load => {
                let folder = captures.name("folder").map(|m| m.as_str()).unwrap_or_default();
                let path = format!("{}{}", folder, &captures["file"]);
                self.loaded_files.push(path.trim().to_string());
                Ok(())
            }
            LineKind::DefinedAddress => {
                self.defined_addresses.push(DefinedAddress {
                    symbol: captures["name"].trim().to_string(),
                    address: parse_hex(&captures["address"])?,
                    value: parse_hex(&captures["value"])?,
                });
                Ok(())
            }
            LineKind::SectionHeading => self.process_section_heading(captures),
            LineKind::SymbolDetail => self.process_symbol_detail(captures),
            LineKind::Fill => self.process_fill(captures),
            LineKind::Symbol => self.process_symbol(captures),
            LineKind::SymbolName => {
                self.process_symbol_name(captures);
                Ok(())
            }
        }
    }

    fn unhandled(&mut self, line: &str) {
        if !line.trim().is_empty() {
            self.warn(MapWarning::UnhandledLine { line: self.line, text: line.to_string() });
        }
    }

    fn discard_pending(&mut self) {
        if let Some(pending) = self.linker.pending.take() {
            self.warn(MapWarning::MissedSymbolDetail { line: pending.line, name: pending.name });
        }
    }

    fn process_section_heading(&mut self, captures: &Captures) -> Result<()> {
        self.discard_pending();
        let Some(name) = self.normalize_name(&captures["name"]) else {
            return Ok(());
        };
        let index = self.memory.get_or_create_node(&name)?;
        self.linker.section = Some(index);
        self.linker.section_path = name;
        if captures.name("address").is_some() {
            self.apply_section_detail(captures)
        } else {
            self.linker.mode = LinkerMapMode::GotSectionName;
            Ok(())
        }
    }

    /// A section body may start right away when the heading has no address.
    fn process_section_detail_line(&mut self, line: &str) -> Result<()> {
        match SECTION_DETAIL.captures(line) {
            Some(captures) => self.apply_section_detail(&captures),
            None => {
                self.linker.mode = LinkerMapMode::InSection;
                self.process_rules(IN_SECTION_RULES, line)
            }
        }
    }

    /// Applies address, size and load address to the open section.
    fn apply_section_detail(&mut self, captures: &Captures) -> Result<()> {
        let Some(index) = self.linker.section else {
            bail!("Section detail without an open section");
        };
        let address = parse_capture(captures, "address")?;
        let size = parse_capture(captures, "size")?;
        let load_address = parse_capture(captures, "load_address")?;
        let node = &mut self.memory[index];
        if address.is_some() {
            node.address = address;
            node.line = Some(self.line);
        }
        if size.is_some() {
            node.declared_size = size;
        }
        if load_address.is_some() {
            node.load_address = load_address;
        }
        self.linker.mode = LinkerMapMode::InSection;
        Ok(())
    }

    fn process_symbol(&mut self, captures: &Captures) -> Result<()> {
        self.discard_pending();
        let Some(name) = self.normalize_name(&captures["name"]) else {
            return Ok(());
        };
        let name = self.prefix_section(name);
        let attribution = FileAttribution::from_captures(captures);
        let path = self.disambiguate(name, &attribution)?;
        self.place_symbol(&path, attribution, captures)
    }

    fn process_symbol_name(&mut self, captures: &Captures) {
        self.discard_pending();
        let Some(name) = self.normalize_name(&captures["name"]) else {
            return;
        };
        let name = self.prefix_section(name);
        self.linker.pending = Some(PendingSymbol { name, line: self.line });
    }

    fn process_symbol_detail(&mut self, captures: &Captures) -> Result<()> {
        let Some(pending) = self.linker.pending.take() else {
            bail!("Symbol detail without a pending symbol name");
        };
        let attribution = FileAttribution::from_captures(captures);
        let path = self.disambiguate(pending.name, &attribution)?;
        self.place_symbol(&path, attribution, captures)
    }

    fn process_fill(&mut self, captures: &Captures) -> Result<()> {
        self.discard_pending();
        let size = parse_hex(&captures["size"])?;
        match self.linker.last_symbol {
            Some(index) => self.memory[index].add_fill(size)?,
            None => self.warn(MapWarning::FillWithoutTarget { line: self.line }),
        }
        Ok(())
    }

    fn place_symbol(
        &mut self,
        path: &str,
        attribution: FileAttribution,
        captures: &Captures,
    ) -> Result<()> {
        let address = parse_capture(captures, "address")?;
        let size = parse_capture(captures, "size")?;
        let index = self.memory.get_or_create_node(path)?;
        let node = &mut self.memory[index];
        if attribution.archive.is_some() {
            node.archive_file = attribution.archive;
        }
        if attribution.object.is_some() {
            node.object_file = attribution.object;
        }
        if attribution.folder.is_some() {
            node.archive_folder = attribution.folder;
        }
        if address.is_some() {
            node.address = address;
        }
        node.line = Some(self.line);
        if let Some(size) = size {
            let fill = self.memory[index].fill_size.unwrap_or(0);
            if size.checked_add(fill).is_none() {
                bail!("Size {:#x} overflows with {:#x} bytes of fill", size, fill);
            }
            self.memory.set_own_size(index, size, &mut self.warnings);
        }
        self.linker.last_symbol = Some(index);
        Ok(())
    }

    /// Brings a raw name into the dotted namespace: `COMMON` and `_` names
    /// gain a leading `.`, then aliases apply. Names still outside the
    /// namespace are skipped.
    fn normalize_name(&mut self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        let name = if raw.starts_with("COMMON") || raw.starts_with('_') {
            format!(".{}", raw)
        } else {
            raw.to_string()
        };
        let name = self.options.aliases.encode(&name);
        if name.starts_with('.') {
            Some(name)
        } else {
            self.warn(MapWarning::SkippedName { line: self.line, name });
            None
        }
    }

    /// Symbol names are sometimes printed relative to their section.
    fn prefix_section(&mut self, name: String) -> String {
        if name.starts_with(self.linker.section_path.as_str()) {
            return name;
        }
        let section = self.linker.section_path.clone();
        self.warn(MapWarning::MismatchedSection {
            line: self.line,
            name: name.clone(),
            section: section.clone(),
        });
        section + &name
    }

    /// Appends an object file segment to paths that would otherwise merge
    /// same-named symbols from unrelated objects.
    fn disambiguate(&self, name: String, attribution: &FileAttribution) -> Result<String> {
        let needed = name.split('.').count() == 2
            || self.options.disambiguate_prefixes.iter().any(|p| name.starts_with(p.as_str()));
        if !needed {
            return Ok(name);
        }
        match &attribution.object {
            Some(object) => Ok(format!("{}.{}", name, object.replace('.', "_"))),
            None => bail!("Symbol {} has no object file to disambiguate it with", name),
        }
    }
}

fn parse_capture(captures: &Captures, name: &str) -> Result<Option<u64>> {
    Ok(match capture(captures, name) {
        Some(value) => Some(parse_hex(value)?),
        None => None,
    })
}
