use std::fmt;

use serde::Serialize;

/// Recoverable conditions noticed while building or querying a memory map.
/// They are logged when they arise and kept so callers can inspect them.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MapWarning {
    UnhandledLine { line: usize, text: String },
    SkippedName { line: usize, name: String },
    MismatchedSection { line: usize, name: String, section: String },
    SizeOverwritten { path: String, old: u64, new: u64 },
    PossibleDuplicate { path: String, size: u64 },
    SizeOnInternalNode { path: String },
    FillWithoutTarget { line: usize },
    MissedSymbolDetail { line: usize, name: String },
    Unaccounted { path: String, region: String, size: u64 },
    AliasCollision { alias: String, existing: String, target: String },
}

impl MapWarning {
    /// Line-level noise is only interesting when debugging the grammar.
    pub fn is_noise(&self) -> bool { matches!(self, MapWarning::UnhandledLine { .. }) }

    pub(crate) fn emit(&self) {
        if self.is_noise() {
            tracing::debug!("{}", self);
        } else {
            tracing::warn!("{}", self);
        }
    }
}

impl fmt::Display for MapWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapWarning::UnhandledLine { line, text } => {
                write!(f, "Unhandled line {}: {}", line, text.trim())
            }
            MapWarning::SkippedName { line, name } => {
                write!(f, "Skipping name outside of the section namespace on line {}: {}", line, name)
            }
            MapWarning::MismatchedSection { line, name, section } => {
                write!(f, "Possibly mismatched section on line {}: {} ; {}", line, name, section)
            }
            MapWarning::SizeOverwritten { path, old, new } => {
                write!(f, "Overwriting leaf size at node {}: {:#x} -> {:#x}", path, old, new)
            }
            MapWarning::PossibleDuplicate { path, size } => {
                write!(f, "Possibly missing leaf node with same name: {} ({:#x})", path, size)
            }
            MapWarning::SizeOnInternalNode { path } => {
                write!(f, "Setting leaf size at a node which has children: {}", path)
            }
            MapWarning::FillWithoutTarget { line } => {
                write!(f, "Fill container unknown on line {}", line)
            }
            MapWarning::MissedSymbolDetail { line, name } => {
                write!(f, "Probably missed symbol detail for {} (line {})", name, line)
            }
            MapWarning::Unaccounted { path, region, size } => {
                write!(f, "Object unaccounted for: {:<40} {:<15} {:>5}", path, region, size)
            }
            MapWarning::AliasCollision { alias, existing, target } => {
                write!(f, "Alias collision: {} :: {}; {}", alias, target, existing)
            }
        }
    }
}
