mod linker;

use std::{fmt, io::BufRead, num::ParseIntError, path::Path};

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing_attributes::instrument;

use self::linker::LinkerMapState;
use crate::{
    mem::{LinkAliases, MapWarning, MemoryMap, MemoryRegion},
    util::file::map_file,
};

/// Section of the map file currently being read.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DocumentState {
    Start,
    Dependencies,
    CommonSymbols,
    DiscardedInputSections,
    MemoryConfiguration,
    LinkerMap,
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentState::Start => "start",
            DocumentState::Dependencies => "archive dependencies",
            DocumentState::CommonSymbols => "common symbols",
            DocumentState::DiscardedInputSections => "discarded input sections",
            DocumentState::MemoryConfiguration => "memory configuration",
            DocumentState::LinkerMap => "linker script and memory map",
        };
        f.write_str(name)
    }
}

static HEADINGS: Lazy<[(DocumentState, Regex); 5]> = Lazy::new(|| {
    [
        (
            DocumentState::Dependencies,
            Regex::new(
                r"^Archive member included (?:because of|to satisfy reference by) file \(symbol\)$",
            )
            .unwrap(),
        ),
        (DocumentState::CommonSymbols, Regex::new(r"^Allocating common symbols$").unwrap()),
        (
            DocumentState::DiscardedInputSections,
            Regex::new(r"^Discarded input sections$").unwrap(),
        ),
        (DocumentState::MemoryConfiguration, Regex::new(r"^Memory Configuration$").unwrap()),
        (DocumentState::LinkerMap, Regex::new(r"^Linker script and memory map$").unwrap()),
    ]
});

static MEMORY_REGION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<name>\S+)\s+(?P<origin>0[xX][0-9a-fA-F]+)\s+(?P<size>0[xX][0-9a-fA-F]+)\s*(?P<attribs>\S*)$",
    )
    .unwrap()
});

static DEPENDENCY_ARCHIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<folder>\S.*/)?(?P<archive>[^/()\s]+)\((?P<member>[^()]*)\)(?:\s+(?P<rest>\S.*))?$",
    )
    .unwrap()
});
static DEPENDENCY_CAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?P<file>\S(?:.*\S)?)\s+\((?P<symbol>[^()]*)\)$").unwrap());

static COMMON_SYMBOL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<symbol>\S+)\s+(?P<size>0[xX][0-9a-fA-F]+)\s+(?P<folder>.*/)?(?P<file>[^/()]+?)(?:\((?P<member>[^()]*)\))?$",
    )
    .unwrap()
});
static COMMON_SYMBOL_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?P<symbol>\S+)$").unwrap());
static COMMON_SYMBOL_DETAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s+(?P<size>0[xX][0-9a-fA-F]+)\s+(?P<folder>.*/)?(?P<file>[^/()]+?)(?:\((?P<member>[^()]*)\))?$",
    )
    .unwrap()
});

/// Classifies a line as one of the five document headings.
pub fn check_line_for_heading(line: &str) -> Option<DocumentState> {
    HEADINGS.iter().find(|(_, regex)| regex.is_match(line)).map(|&(state, _)| state)
}

pub(crate) fn parse_hex(s: &str) -> Result<u64, ParseIntError> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(digits, 16)
}

/// Trimmed, non-empty capture group.
pub(crate) fn capture<'h>(captures: &Captures<'h>, name: &str) -> Option<&'h str> {
    captures.name(name).map(|m| m.as_str().trim()).filter(|s| !s.is_empty())
}

/// Provenance captured from an `archive(member)` or plain file column.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub(crate) struct FileAttribution {
    pub folder: Option<String>,
    pub archive: Option<String>,
    pub object: Option<String>,
}

impl FileAttribution {
    /// Reads the `folder`, `file` and `member` capture groups. With a
    /// member, `file` names the archive; otherwise it is the object file.
    pub fn from_captures(captures: &Captures) -> Self {
        let folder = capture(captures, "folder").map(str::to_string);
        match (capture(captures, "file"), capture(captures, "member")) {
            (Some(file), Some(member)) => Self {
                folder,
                archive: Some(file.to_string()),
                object: Some(member.to_string()),
            },
            (file, _) => Self { folder, archive: None, object: file.map(str::to_string) },
        }
    }
}

/// Symbol assigned by the linker script, e.g. `0x00000100 __stack = 0x100`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DefinedAddress {
    pub symbol: String,
    pub address: u64,
    pub value: u64,
}

/// Archive member pulled into the link, and the reference that caused it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ArchiveDependency {
    pub archive_folder: Option<String>,
    pub archive: String,
    pub member: String,
    pub referenced_by: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CommonSymbol {
    pub symbol: String,
    pub size: u64,
    pub folder: Option<String>,
    pub archive: Option<String>,
    pub object: Option<String>,
}

/// Name handling knobs for the linker map parser.
#[derive(Debug, Clone)]
pub struct MapOptions {
    pub aliases: LinkAliases,
    /// Paths starting with one of these always get an object file segment.
    pub disambiguate_prefixes: Vec<String>,
}

pub const DEFAULT_DISAMBIGUATE_PREFIXES: [&str; 2] = [".bss.COMMON", ".MSP430.attributes"];

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            aliases: LinkAliases::new(),
            disambiguate_prefixes: DEFAULT_DISAMBIGUATE_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Everything recovered from one map file.
#[derive(Debug, Clone)]
pub struct MapInfo {
    pub memory: MemoryMap,
    pub loaded_files: Vec<String>,
    pub defined_addresses: Vec<DefinedAddress>,
    pub dependencies: Vec<ArchiveDependency>,
    pub common_symbols: Vec<CommonSymbol>,
    pub warnings: Vec<MapWarning>,
}

#[derive(Debug, Default)]
enum DependencyState {
    #[default]
    Start,
    ArchiveDefined { folder: Option<String>, archive: String, member: String },
}

#[derive(Debug, Default)]
enum CommonSymbolState {
    #[default]
    Normal,
    GotName(String),
}

/// Mutable state for a single parse. Consumed by [`MapSession::finish`].
pub struct MapSession<'a> {
    options: &'a MapOptions,
    state: DocumentState,
    line: usize,
    memory: MemoryMap,
    linker: LinkerMapState,
    dependency_state: DependencyState,
    common_state: CommonSymbolState,
    loaded_files: Vec<String>,
    defined_addresses: Vec<DefinedAddress>,
    dependencies: Vec<ArchiveDependency>,
    common_symbols: Vec<CommonSymbol>,
    warnings: Vec<MapWarning>,
}

impl<'a> MapSession<'a> {
    pub fn new(options: &'a MapOptions) -> Self {
        Self {
            options,
            state: DocumentState::Start,
            line: 0,
            memory: MemoryMap::new(),
            linker: LinkerMapState::default(),
            dependency_state: DependencyState::default(),
            common_state: CommonSymbolState::default(),
            loaded_files: vec![],
            defined_addresses: vec![],
            dependencies: vec![],
            common_symbols: vec![],
            warnings: vec![],
        }
    }

    #[inline]
    pub fn state(&self) -> DocumentState { self.state }

    #[inline]
    pub fn memory(&self) -> &MemoryMap { &self.memory }

    pub fn process_line(&mut self, line: &str) -> Result<()> {
        self.line += 1;
        let line = line.trim_end();
        let result = match check_line_for_heading(line) {
            Some(state) => self.enter(state),
            None => self.dispatch(line),
        };
        result.with_context(|| {
            format!(
                "Failed to process line {}: '{}' (in {}, {})",
                self.line,
                line,
                self.state,
                self.linker.describe()
            )
        })
    }

    fn enter(&mut self, state: DocumentState) -> Result<()> {
        if state == DocumentState::MemoryConfiguration && self.memory.regions.is_frozen() {
            bail!("Memory Configuration found after the linker memory map");
        }
        if state == DocumentState::LinkerMap {
            self.memory.regions.freeze();
        }
        tracing::debug!("Entering map file region: {}", state);
        self.state = state;
        Ok(())
    }

    fn dispatch(&mut self, line: &str) -> Result<()> {
        match self.state {
            DocumentState::Start | DocumentState::DiscardedInputSections => Ok(()),
            DocumentState::Dependencies => {
                self.process_dependencies_line(line);
                Ok(())
            }
            DocumentState::CommonSymbols => self.process_common_symbols_line(line),
            DocumentState::MemoryConfiguration => self.process_memory_configuration_line(line),
            DocumentState::LinkerMap => self.process_linker_map_line(line),
        }
    }

    fn warn(&mut self, warning: MapWarning) {
        warning.emit();
        self.warnings.push(warning);
    }

    fn process_memory_configuration_line(&mut self, line: &str) -> Result<()> {
        let Some(captures) = MEMORY_REGION.captures(line) else {
            return Ok(());
        };
        let region = MemoryRegion::new(
            captures["name"].to_string(),
            parse_hex(&captures["origin"])?,
            parse_hex(&captures["size"])?,
            captures["attribs"].to_string(),
        );
        tracing::debug!(
            "Memory region {} @ {:#010x} size {:#x}",
            region.name,
            region.origin,
            region.size
        );
        self.memory.regions.push(region)?;
        Ok(())
    }

    fn process_dependencies_line(&mut self, line: &str) {
        if matches!(self.dependency_state, DependencyState::ArchiveDefined { .. })
            && line.starts_with(char::is_whitespace)
        {
            if let Some(captures) = DEPENDENCY_CAUSE.captures(line) {
                if let DependencyState::ArchiveDefined { folder, archive, member } =
                    std::mem::take(&mut self.dependency_state)
                {
                    self.dependencies.push(ArchiveDependency {
                        archive_folder: folder,
                        archive,
                        member,
                        referenced_by: captures["file"].to_string(),
                        symbol: captures["symbol"].to_string(),
                    });
                }
                return;
            }
        }
        let Some(captures) = DEPENDENCY_ARCHIVE.captures(line) else {
            return;
        };
        let folder = captures.name("folder").map(|m| m.as_str().to_string());
        let archive = captures["archive"].to_string();
        let member = captures["member"].to_string();
        let cause = captures.name("rest").and_then(|m| DEPENDENCY_CAUSE.captures(m.as_str()));
        if let Some(cause) = cause {
            self.dependencies.push(ArchiveDependency {
                archive_folder: folder,
                archive,
                member,
                referenced_by: cause["file"].to_string(),
                symbol: cause["symbol"].to_string(),
            });
            self.dependency_state = DependencyState::Start;
        } else {
            self.dependency_state = DependencyState::ArchiveDefined { folder, archive, member };
        }
    }

    fn process_common_symbols_line(&mut self, line: &str) -> Result<()> {
        match std::mem::take(&mut self.common_state) {
            CommonSymbolState::Normal => {
                if let Some(captures) = COMMON_SYMBOL.captures(line) {
                    let symbol = captures["symbol"].to_string();
                    self.push_common_symbol(symbol, &captures)?;
                } else if let Some(captures) = COMMON_SYMBOL_NAME.captures(line) {
                    self.common_state = CommonSymbolState::GotName(captures["symbol"].to_string());
                }
            }
            CommonSymbolState::GotName(symbol) => {
                if let Some(captures) = COMMON_SYMBOL_DETAIL.captures(line) {
                    self.push_common_symbol(symbol, &captures)?;
                } else {
                    self.common_state = CommonSymbolState::GotName(symbol);
                }
            }
        }
        Ok(())
    }

    fn push_common_symbol(&mut self, symbol: String, captures: &Captures) -> Result<()> {
        let attribution = FileAttribution::from_captures(captures);
        self.common_symbols.push(CommonSymbol {
            symbol,
            size: parse_hex(&captures["size"])?,
            folder: attribution.folder,
            archive: attribution.archive,
            object: attribution.object,
        });
        Ok(())
    }

    /// Ends the parse: freezes the region table and checks that every
    /// placed node falls inside a memory region.
    pub fn finish(mut self) -> Result<MapInfo> {
        if let Some(pending) = self.linker.take_pending() {
            self.warn(MapWarning::MissedSymbolDetail { line: pending.line, name: pending.name });
        }
        self.memory.regions.freeze();
        self.memory.classify_regions().context("Inconsistent memory map")?;
        tracing::debug!(
            "Parsed {} lines: {} regions, {} nodes, {} warnings",
            self.line,
            self.memory.regions.count(),
            self.memory.count(),
            self.warnings.len()
        );
        Ok(MapInfo {
            memory: self.memory,
            loaded_files: self.loaded_files,
            defined_addresses: self.defined_addresses,
            dependencies: self.dependencies,
            common_symbols: self.common_symbols,
            warnings: self.warnings,
        })
    }
}

#[instrument(level = "debug", name = "map", skip_all)]
pub fn process_map<R: BufRead>(reader: R, options: &MapOptions) -> Result<MapInfo> {
    let mut session = MapSession::new(options);
    for result in reader.lines() {
        let line = result.context("Failed to read map file")?;
        session.process_line(&line)?;
    }
    session.finish()
}

pub fn process_map_file<P: AsRef<Path>>(path: P, options: &MapOptions) -> Result<MapInfo> {
    let file = map_file(&path)?;
    process_map(file.as_reader(), options)
        .with_context(|| format!("Failed to process map '{}'", path.as_ref().display()))
}
