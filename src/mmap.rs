//! Read-only memory mapping of archive files.

use std::fs::File;
use std::io;
use std::path::Path;

/// A whole file mapped read-only.
///
/// The descriptor stays open for as long as the view exists; fields drop
/// in declaration order, so the view is torn down before the file closes.
#[derive(Debug)]
pub(crate) struct MappedFile {
    map: memmap2::Mmap,
    _file: File,
}

impl MappedFile {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and private to this struct.
        // Truncation of the file by another process while mapped is
        // undefined behavior the caller accepts by choosing map mode.
        let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
        Ok(Self { map, _file: file })
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.map
    }
}
