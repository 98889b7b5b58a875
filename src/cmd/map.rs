use std::{
    io::{stdout, Write},
    path::{Path, PathBuf},
};

use anyhow::{ensure, Result};
use argp::FromArgs;
use itertools::Itertools;
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    analysis::footprint::Footprint,
    mem::{MapWarning, MemoryRegion, NodeRecord},
    util::{
        config::load_options,
        file::{buf_writer, process_rsp},
        map::{
            process_map_file, ArchiveDependency, CommonSymbol, DefinedAddress, MapInfo, MapOptions,
        },
    },
};

#[derive(FromArgs, PartialEq, Debug)]
/// Commands for processing GNU ld map files.
#[argp(subcommand, name = "map")]
pub struct Args {
    #[argp(option, short = 'c')]
    /// YAML file with name aliases and disambiguation prefixes
    config: Option<PathBuf>,
    #[argp(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
enum SubCommand {
    Regions(RegionsArgs),
    Sections(SectionsArgs),
    Files(FilesArgs),
    Footprint(FootprintArgs),
    Nodes(NodesArgs),
    Warnings(WarningsArgs),
    Json(JsonArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Displays the memory regions in use and how full they are.
#[argp(subcommand, name = "regions")]
pub struct RegionsArgs {
    #[argp(positional)]
    /// path to input map
    map_file: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Displays the sections that occupy memory.
#[argp(subcommand, name = "sections")]
pub struct SectionsArgs {
    #[argp(positional)]
    /// path to input map
    map_file: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Lists the object and archive files that occupy memory.
#[argp(subcommand, name = "files")]
pub struct FilesArgs {
    #[argp(positional)]
    /// path to input map
    map_file: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Prints per-file footprints by region or by section.
#[argp(subcommand, name = "footprint")]
pub struct FootprintArgs {
    #[argp(positional)]
    /// input maps (or @response files)
    map_files: Vec<PathBuf>,
    #[argp(switch)]
    /// break footprints down by section instead of region
    by_section: bool,
    #[argp(switch)]
    /// report archive files instead of object files
    archives: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Prints every node of the memory map.
#[argp(subcommand, name = "nodes")]
pub struct NodesArgs {
    #[argp(positional)]
    /// path to input map
    map_file: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Prints the warnings raised while reading a map.
#[argp(subcommand, name = "warnings")]
pub struct WarningsArgs {
    #[argp(positional)]
    /// path to input map
    map_file: PathBuf,
    #[argp(switch)]
    /// include unhandled lines
    all: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Exports the parsed map as JSON.
#[argp(subcommand, name = "json")]
pub struct JsonArgs {
    #[argp(positional)]
    /// path to input map
    map_file: PathBuf,
    #[argp(option, short = 'o')]
    /// output file (defaults to stdout)
    out: Option<PathBuf>,
}

pub fn run(args: Args) -> Result<()> {
    let options = load_options(args.config.as_deref())?;
    match args.command {
        SubCommand::Regions(c_args) => regions(c_args, &options),
        SubCommand::Sections(c_args) => sections(c_args, &options),
        SubCommand::Files(c_args) => files(c_args, &options),
        SubCommand::Footprint(c_args) => footprint(c_args, &options),
        SubCommand::Nodes(c_args) => nodes(c_args, &options),
        SubCommand::Warnings(c_args) => warnings(c_args, &options),
        SubCommand::Json(c_args) => json(c_args, &options),
    }
}

fn read_map(path: &Path, options: &MapOptions) -> Result<MapInfo> {
    let info = process_map_file(path, options)?;
    tracing::info!(
        "Read '{}': {} nodes in {} regions ({} warnings)",
        path.display(),
        info.memory.count(),
        info.memory.regions.count(),
        info.warnings.len()
    );
    Ok(info)
}

fn regions(args: RegionsArgs, options: &MapOptions) -> Result<()> {
    let info = read_map(&args.map_file, options)?;
    let footprint = Footprint::new(&info.memory)?;
    println!(
        "{:<20}{:>12}{:>12}{:>12}{:>12}{:>8}",
        "Region", "Origin", "End", "Size", "Used", "%"
    );
    for usage in footprint.region_usage() {
        let percent =
            if usage.size == 0 { 0.0 } else { usage.used as f64 * 100.0 / usage.size as f64 };
        println!(
            "{:<20}{:>#12x}{:>#12x}{:>12}{:>12}{:>7.1}%",
            usage.name,
            usage.origin,
            usage.end,
            usage.size,
            usage.used,
            percent
        );
    }
    Ok(())
}

fn sections(args: SectionsArgs, options: &MapOptions) -> Result<()> {
    let info = read_map(&args.map_file, options)?;
    let footprint = Footprint::new(&info.memory)?;
    let memory = footprint.map();
    for &index in footprint.used_sections() {
        println!(
            "{:<40}{:>12}    {}",
            memory.path(index),
            memory.total_size(index),
            memory.region_name(footprint.region(index))
        );
    }
    Ok(())
}

fn files(args: FilesArgs, options: &MapOptions) -> Result<()> {
    let info = read_map(&args.map_file, options)?;
    let footprint = Footprint::new(&info.memory)?;
    let mut warnings = vec![];
    let used = footprint.used_files(&mut warnings);
    println!("Object files:");
    for object in &used.objects {
        println!("  {}", object);
    }
    println!("Archive files:");
    for archive in &used.archives {
        println!("  {}", archive);
    }
    if !warnings.is_empty() {
        tracing::warn!("{} nodes could not be attributed to a file", warnings.len());
    }
    Ok(())
}

fn footprint(args: FootprintArgs, options: &MapOptions) -> Result<()> {
    let paths = process_rsp(&args.map_files)?;
    ensure!(!paths.is_empty(), "No map files given");
    let maps = paths
        .par_iter()
        .map(|path| read_map(path, options))
        .collect::<Result<Vec<_>>>()?;
    for (path, info) in paths.iter().zip(&maps) {
        let footprint = Footprint::new(&info.memory)?;
        let mut warnings = vec![];
        let files = if args.archives {
            footprint.used_archive_files(&mut warnings)
        } else {
            footprint.used_object_files(&mut warnings)
        };
        let header = columns(&footprint, args.by_section);
        println!("{}", path.display());
        println!("{:<40}{}", "File", header.iter().map(|c| format!("{:>14}", c)).join(""));
        for file in &files {
            let sizes = match (args.archives, args.by_section) {
                (false, false) => footprint.object_footprint(file),
                (false, true) => footprint.object_footprint_by_section(file),
                (true, false) => footprint.archive_footprint(file),
                (true, true) => footprint.archive_footprint_by_section(file),
            };
            println!("{:<40}{}", file, sizes.iter().map(|s| format!("{:>14}", s)).join(""));
        }
        println!();
    }
    Ok(())
}

fn columns(footprint: &Footprint, by_section: bool) -> Vec<String> {
    if by_section {
        footprint.used_section_paths()
    } else {
        footprint.used_region_names().into_iter().map(str::to_string).collect()
    }
}

fn nodes(args: NodesArgs, options: &MapOptions) -> Result<()> {
    let info = read_map(&args.map_file, options)?;
    let out = stdout();
    let mut out = out.lock();
    for index in info.memory.all_nodes() {
        writeln!(out, "{}", info.memory.format_row(index)?)?;
    }
    Ok(())
}

fn warnings(args: WarningsArgs, options: &MapOptions) -> Result<()> {
    let info = read_map(&args.map_file, options)?;
    let footprint = Footprint::new(&info.memory)?;
    let mut warnings = info.warnings.clone();
    footprint.used_files(&mut warnings);
    for warning in warnings.iter().filter(|w| args.all || !w.is_noise()) {
        println!("{}", warning);
    }
    Ok(())
}

#[derive(Serialize)]
struct MapExport<'a> {
    regions: Vec<&'a MemoryRegion>,
    nodes: Vec<NodeRecord>,
    loaded_files: &'a [String],
    defined_addresses: &'a [DefinedAddress],
    dependencies: &'a [ArchiveDependency],
    common_symbols: &'a [CommonSymbol],
    warnings: &'a [MapWarning],
}

impl<'a> MapExport<'a> {
    fn new(info: &'a MapInfo) -> Result<Self> {
        Ok(Self {
            regions: info.memory.regions.iter().map(|(_, region)| region).collect(),
            nodes: info.memory.records()?,
            loaded_files: &info.loaded_files,
            defined_addresses: &info.defined_addresses,
            dependencies: &info.dependencies,
            common_symbols: &info.common_symbols,
            warnings: &info.warnings,
        })
    }
}

fn json(args: JsonArgs, options: &MapOptions) -> Result<()> {
    let info = read_map(&args.map_file, options)?;
    let export = MapExport::new(&info)?;
    match &args.out {
        Some(out_path) => {
            let mut w = buf_writer(out_path)?;
            serde_json::to_writer_pretty(&mut w, &export)?;
            w.flush()?;
        }
        None => {
            let out = stdout();
            let mut out = out.lock();
            serde_json::to_writer_pretty(&mut out, &export)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::util::map::process_map;

    #[test]
    fn test_export_json() -> Result<()> {
        let info = process_map(
            Cursor::new(
                "Memory Configuration\nRAM 0x20000000 0x100 xrw\nLinker script and memory map\n\
                 LOAD main.o\n.data 0x20000000 0x4\n .data 0x20000000 0x4 main.o\n",
            ),
            &MapOptions::default(),
        )?;
        let value = serde_json::to_value(MapExport::new(&info)?)?;
        assert_eq!(value["regions"][0]["name"], "RAM");
        assert_eq!(value["loaded_files"][0], "main.o");
        assert_eq!(value["nodes"].as_array().map(Vec::len), Some(2));
        assert_eq!(value["nodes"][1]["path"], ".data.main_o");
        assert_eq!(value["nodes"][1]["leaf_size"], 4);
        assert_eq!(value["nodes"][1]["region"], "RAM");
        assert!(value["warnings"].as_array().is_some_and(|w| w.is_empty()));
        Ok(())
    }
}
