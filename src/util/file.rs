use std::{
    fs::{DirBuilder, File},
    io::{BufRead, BufWriter, Cursor},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use memmap2::{Mmap, MmapOptions};

/// A read-only memory mapped file.
pub struct MappedFile {
    mmap: Mmap,
}

impl MappedFile {
    #[inline]
    pub fn as_slice(&self) -> &[u8] { &self.mmap }

    #[inline]
    pub fn as_reader(&self) -> Cursor<&[u8]> { Cursor::new(self.as_slice()) }
}

/// Opens and memory maps a file.
pub fn map_file<P>(path: P) -> Result<MappedFile>
where P: AsRef<Path> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open file '{}'", path.display()))?;
    let mmap = unsafe { MmapOptions::new().map(&file) }
        .with_context(|| format!("Failed to mmap file: '{}'", path.display()))?;
    Ok(MappedFile { mmap })
}

/// Creates a buffered writer around a file (not memory mapped).
pub fn buf_writer<P>(path: P) -> Result<BufWriter<File>>
where P: AsRef<Path> {
    if let Some(parent) = path.as_ref().parent() {
        DirBuilder::new().recursive(true).create(parent)?;
    }
    let file = File::create(&path)
        .with_context(|| format!("Failed to create file '{}'", path.as_ref().display()))?;
    Ok(BufWriter::new(file))
}

/// Expands response files (starting with '@') into the paths they list,
/// one per line.
pub fn process_rsp(files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::with_capacity(files.len());
    for path in files {
        let path_str =
            path.to_str().ok_or_else(|| anyhow!("'{}' is not valid UTF-8", path.display()))?;
        if let Some(rsp_file) = path_str.strip_prefix('@') {
            let file = map_file(rsp_file)?;
            for result in file.as_reader().lines() {
                let line = result?;
                let line = line.trim();
                if !line.is_empty() {
                    out.push(PathBuf::from(line));
                }
            }
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}
