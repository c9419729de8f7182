//! RomFS: an IVFC hash tree whose level 3 holds the file system
//!
//! Only level 3 is read. Hash levels are not verified.

use std::collections::HashSet;

use byteorder::{ByteOrder, LittleEndian};
use timepatch_core::entities::ContainerEntry;
use timepatch_core::source::ByteSource;
use timepatch_core::Error;

use super::{align, parse_error, read_region, region};

const IVFC_HEADER_SIZE: u64 = 0x60;
const MASTER_HASH_SIZE_OFFSET: usize = 0x08;
const LEVEL3_BLOCK_SIZE_OFFSET: usize = 0x4C;
const LEVEL3_HEADER_SIZE: u64 = 0x28;

const DIR_ENTRY_SIZE: usize = 0x18;
const FILE_ENTRY_SIZE: usize = 0x20;
const EMPTY: u32 = 0xFFFF_FFFF;

struct DirEntry {
    next_sibling: u32,
    first_child: u32,
    first_file: u32,
    name: String,
}

struct FileEntry {
    next_sibling: u32,
    data_offset: u64,
    data_size: u64,
    name: String,
}

/// Directory and file metadata tables of level 3
struct MetaTables {
    dirs: Vec<u8>,
    files: Vec<u8>,
}

impl MetaTables {
    fn dir(&self, offset: u32) -> Result<DirEntry, Error> {
        let entry = entry_at(&self.dirs, offset, DIR_ENTRY_SIZE, "directory")?;
        Ok(DirEntry {
            next_sibling: LittleEndian::read_u32(&entry[0x04..]),
            first_child: LittleEndian::read_u32(&entry[0x08..]),
            first_file: LittleEndian::read_u32(&entry[0x0C..]),
            name: read_name(&self.dirs, offset as usize + DIR_ENTRY_SIZE, &entry[0x14..])?,
        })
    }

    fn file(&self, offset: u32) -> Result<FileEntry, Error> {
        let entry = entry_at(&self.files, offset, FILE_ENTRY_SIZE, "file")?;
        Ok(FileEntry {
            next_sibling: LittleEndian::read_u32(&entry[0x04..]),
            data_offset: LittleEndian::read_u64(&entry[0x08..]),
            data_size: LittleEndian::read_u64(&entry[0x10..]),
            name: read_name(&self.files, offset as usize + FILE_ENTRY_SIZE, &entry[0x1C..])?,
        })
    }
}

fn entry_at<'a>(table: &'a [u8], offset: u32, size: usize, what: &str) -> Result<&'a [u8], Error> {
    let start = offset as usize;
    table
        .get(start..start + size)
        .ok_or_else(|| parse_error(format!("RomFS {} entry {:#x} out of range", what, offset)))
}

/// UTF-16LE name stored right after the fixed part of an entry.
fn read_name(table: &[u8], start: usize, len_field: &[u8]) -> Result<String, Error> {
    let len = LittleEndian::read_u32(len_field) as usize;
    let raw = start
        .checked_add(len)
        .and_then(|end| table.get(start..end))
        .ok_or_else(|| parse_error("RomFS name out of range"))?;
    let units: Vec<u16> = raw.chunks_exact(2).map(LittleEndian::read_u16).collect();
    String::from_utf16(&units).map_err(|_| parse_error("RomFS name is not valid UTF-16"))
}

/// Every file of the RomFS, with paths below `prefix`.
pub fn files(romfs: &ByteSource, prefix: &str) -> Result<Vec<ContainerEntry>, Error> {
    let ivfc = read_region(romfs, 0, IVFC_HEADER_SIZE, "IVFC header")?;
    if &ivfc[..4] != b"IVFC" {
        return Err(parse_error("missing IVFC magic"));
    }

    let master_hash_size = u64::from(LittleEndian::read_u32(&ivfc[MASTER_HASH_SIZE_OFFSET..]));
    let block_log2 = LittleEndian::read_u32(&ivfc[LEVEL3_BLOCK_SIZE_OFFSET..]);
    if block_log2 > 31 {
        return Err(parse_error(format!("invalid level 3 block size 2^{}", block_log2)));
    }
    let level3_offset = align(IVFC_HEADER_SIZE + master_hash_size, 1 << block_log2);
    let level3 = region(romfs, level3_offset, romfs.len().saturating_sub(level3_offset), "RomFS level 3")?;

    let header = read_region(&level3, 0, LEVEL3_HEADER_SIZE, "RomFS level 3 header")?;
    let field = |index: usize| u64::from(LittleEndian::read_u32(&header[index * 4..]));
    let tables = MetaTables {
        dirs: read_region(&level3, field(3), field(4), "RomFS directory table")?,
        files: read_region(&level3, field(7), field(8), "RomFS file table")?,
    };
    let data_offset = field(9);

    let mut walk = Walk {
        tables: &tables,
        level3: &level3,
        data_offset,
        visited_dirs: HashSet::new(),
        visited_files: HashSet::new(),
        entries: Vec::new(),
    };
    walk.dir(0, prefix)?;
    Ok(walk.entries)
}

struct Walk<'a> {
    tables: &'a MetaTables,
    level3: &'a ByteSource,
    data_offset: u64,
    visited_dirs: HashSet<u32>,
    visited_files: HashSet<u32>,
    entries: Vec<ContainerEntry>,
}

impl Walk<'_> {
    fn dir(&mut self, offset: u32, path: &str) -> Result<(), Error> {
        if !self.visited_dirs.insert(offset) {
            return Err(parse_error("RomFS directory tree has a cycle"));
        }
        let dir = self.tables.dir(offset)?;

        let mut next_file = dir.first_file;
        while next_file != EMPTY {
            if !self.visited_files.insert(next_file) {
                return Err(parse_error("RomFS file list has a cycle"));
            }
            let file = self.tables.file(next_file)?;
            let file_path = format!("{}/{}", path, file.name);
            let start = self
                .data_offset
                .checked_add(file.data_offset)
                .ok_or_else(|| parse_error(format!("{} has an invalid offset", file_path)))?;
            let data = region(self.level3, start, file.data_size, &file_path)?;
            self.entries.push(ContainerEntry::new(file_path, data));
            next_file = file.next_sibling;
        }

        let mut next_dir = dir.first_child;
        while next_dir != EMPTY {
            let child = self.tables.dir(next_dir)?;
            self.dir(next_dir, &format!("{}/{}", path, child.name))?;
            next_dir = child.next_sibling;
        }

        Ok(())
    }
}
