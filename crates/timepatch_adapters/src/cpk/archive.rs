use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use timepatch_core::entities::ArchiveEntry;
use timepatch_core::ports::ArchiveState;
use timepatch_core::source::ByteSource;
use timepatch_core::Error;

use super::crilayla;
use super::utf::{obfuscate, UtfTable};

const PACKET_HEADER_SIZE: u64 = 0x10;
const PACKET_FLAG: u32 = 0xFF;
const CPK_MAGIC: &[u8; 4] = b"CPK ";
const TOC_MAGIC: &[u8; 4] = b"TOC ";
const ETOC_MAGIC: &[u8; 4] = b"ETOC";

const HEADER_RESERVED: u64 = 0x800;
const MAX_ALIGN: u64 = 0x1_0000;
const COPYRIGHT: &[u8; 6] = b"(c)CRI";

/// Index tables that a subset archive no longer carries
const DROPPED_TABLES: [&str; 3] = ["Itoc", "Gtoc", "Htoc"];

#[derive(Debug, Clone)]
struct CpkFile {
    path: String,
    offset: u64,
    stored_size: u64,
    extract_size: u64,
}

/// A loaded CPK: its tables, the file list they describe and pending edits.
#[derive(Debug)]
pub struct CpkArchive {
    image: ByteSource,
    header: UtfTable,
    toc: UtfTable,
    etoc: Option<UtfTable>,
    obfuscated: bool,
    align: u64,
    files: Vec<CpkFile>,
    deleted: Vec<bool>,
    replaced: Vec<Option<Vec<u8>>>,
}

impl CpkArchive {
    pub fn load(image: ByteSource) -> Result<Self, Error> {
        let (header, obfuscated) = read_packet(&image, 0, CPK_MAGIC)?;

        let toc_offset = header.get_u64(0, "TocOffset").unwrap_or(0);
        if toc_offset == 0 {
            return Err(Error::ArchiveParse(
                "CPK has no TOC; ID-only archives are not supported".into(),
            ));
        }
        let content_offset = header.get_u64(0, "ContentOffset").unwrap_or(0);
        // File offsets count from whichever of TOC and content comes first
        let base = match content_offset {
            0 => toc_offset,
            content => content.min(toc_offset),
        };

        let (toc, _) = read_packet(&image, toc_offset, TOC_MAGIC)?;
        let etoc = match header.get_u64(0, "EtocOffset") {
            Some(offset) if offset > 0 => Some(read_packet(&image, offset, ETOC_MAGIC)?.0),
            _ => None,
        };
        let align = header
            .get_u64(0, "Align")
            .filter(|&a| a > 0)
            .unwrap_or(1);
        if align > MAX_ALIGN {
            return Err(Error::ArchiveParse(format!("CPK alignment {:#x} too large", align)));
        }

        let mut files = Vec::with_capacity(toc.row_count());
        for row in 0..toc.row_count() {
            let name = toc
                .get_str(row, "FileName")
                .ok_or_else(|| Error::ArchiveParse(format!("TOC row {} has no FileName", row)))?;
            let path = match toc.get_str(row, "DirName").unwrap_or("") {
                "" => format!("/{}", name),
                dir => format!("/{}/{}", dir.trim_matches('/'), name),
            };
            let relative = toc.get_u64(row, "FileOffset").unwrap_or(0);
            let stored_size = toc.get_u64(row, "FileSize").unwrap_or(0);
            let extract_size = toc.get_u64(row, "ExtractSize").unwrap_or(stored_size);

            let offset = base
                .checked_add(relative)
                .filter(|o| o.checked_add(stored_size).is_some_and(|end| end <= image.len()))
                .ok_or_else(|| {
                    Error::ArchiveParse(format!("{} lies outside the archive", path))
                })?;
            files.push(CpkFile {
                path,
                offset,
                stored_size,
                extract_size,
            });
        }

        tracing::debug!(
            files = files.len(),
            align,
            obfuscated,
            etoc = etoc.is_some(),
            "Loaded CPK"
        );

        let count = files.len();
        Ok(Self {
            image,
            header,
            toc,
            etoc,
            obfuscated,
            align,
            files,
            deleted: vec![false; count],
            replaced: vec![None; count],
        })
    }

    fn check_index(&self, index: usize) -> Result<(), Error> {
        if index >= self.files.len() {
            return Err(Error::ArchiveEntryMissing(index));
        }
        Ok(())
    }

    fn stored_bytes(&self, file: &CpkFile) -> Result<Vec<u8>, Error> {
        let len = usize::try_from(file.stored_size)
            .map_err(|_| Error::ArchiveParse(format!("{} is too large", file.path)))?;
        Ok(self.image.read_vec(file.offset, len)?)
    }

    /// Sizes as written to the TOC: (stored, extracted)
    fn sizes(&self, index: usize) -> (u64, u64) {
        match &self.replaced[index] {
            Some(content) => (content.len() as u64, content.len() as u64),
            None => (self.files[index].stored_size, self.files[index].extract_size),
        }
    }

    fn write_packet(&self, out: &mut dyn Write, magic: &[u8; 4], table: &[u8]) -> Result<(), Error> {
        let mut table = table.to_vec();
        if self.obfuscated {
            obfuscate(&mut table);
        }
        out.write_all(magic)?;
        out.write_u32::<LittleEndian>(PACKET_FLAG)?;
        out.write_u64::<LittleEndian>(table.len() as u64)?;
        out.write_all(&table)?;
        Ok(())
    }
}

impl ArchiveState for CpkArchive {
    fn entries(&self) -> Vec<ArchiveEntry> {
        self.files
            .iter()
            .enumerate()
            .map(|(index, file)| ArchiveEntry {
                index,
                path: file.path.clone(),
                size: self.sizes(index).1,
            })
            .collect()
    }

    fn read_entry(&self, index: usize) -> Result<Vec<u8>, Error> {
        self.check_index(index)?;
        if let Some(content) = &self.replaced[index] {
            return Ok(content.clone());
        }

        let file = &self.files[index];
        let stored = self.stored_bytes(file)?;
        if file.extract_size != file.stored_size && crilayla::is_compressed(&stored) {
            let content = crilayla::decompress(&stored)?;
            if content.len() as u64 != file.extract_size {
                return Err(Error::ArchiveParse(format!(
                    "{} decompressed to {} bytes, expected {}",
                    file.path,
                    content.len(),
                    file.extract_size
                )));
            }
            return Ok(content);
        }
        Ok(stored)
    }

    fn delete_entry(&mut self, index: usize) -> Result<(), Error> {
        self.check_index(index)?;
        self.deleted[index] = true;
        self.replaced[index] = None;
        Ok(())
    }

    fn set_content(&mut self, index: usize, content: Vec<u8>) -> Result<(), Error> {
        self.check_index(index)?;
        if self.deleted[index] {
            return Err(Error::ArchiveWrite(format!(
                "{} was deleted",
                self.files[index].path
            )));
        }
        self.replaced[index] = Some(content);
        Ok(())
    }

    fn save(&self, output: &mut dyn Write, keep: &[usize]) -> Result<(), Error> {
        let mut kept = keep.to_vec();
        kept.sort_unstable();
        kept.dedup();
        for &index in &kept {
            self.check_index(index)?;
            if self.deleted[index] {
                return Err(Error::ArchiveWrite(format!(
                    "cannot keep deleted entry {}",
                    self.files[index].path
                )));
            }
        }

        let sizes: Vec<(u64, u64)> = kept.iter().map(|&i| self.sizes(i)).collect();
        let mut toc = self.toc.select_rows(&kept);
        for (row, (stored, extracted)) in sizes.iter().enumerate() {
            toc.set_u64(row, "FileSize", *stored)?;
            toc.set_u64(row, "ExtractSize", *extracted)?;
        }
        let etoc = self.etoc.as_ref().map(|etoc| {
            if etoc.row_count() == self.toc.row_count() {
                etoc.select_rows(&kept)
            } else {
                etoc.clone()
            }
        });
        let etoc_bytes = etoc.as_ref().map(UtfTable::to_bytes);

        let mut header = self.header.clone();
        let mut toc_offset = HEADER_RESERVED;
        let (layout, header_bytes) = loop {
            let layout = Layout::plan(&mut toc, &sizes, toc_offset, self.align)?;
            let (etoc_offset, etoc_size) = match &etoc_bytes {
                Some(bytes) => (layout.content_end, PACKET_HEADER_SIZE + bytes.len() as u64),
                None => (0, 0),
            };

            let fields = [
                ("TocOffset", toc_offset),
                ("TocSize", PACKET_HEADER_SIZE + layout.toc.len() as u64),
                ("TocCrc", 0),
                ("ContentOffset", layout.content_offset),
                ("ContentSize", layout.content_end - layout.content_offset),
                ("EtocOffset", etoc_offset),
                ("EtocSize", etoc_size),
                ("Files", kept.len() as u64),
                ("TotalFiles", kept.len() as u64),
                ("EnabledPackedSize", sizes.iter().map(|s| s.0).sum::<u64>()),
                ("EnabledDataSize", sizes.iter().map(|s| s.1).sum::<u64>()),
            ];
            for (name, value) in fields {
                header.set_u64(0, name, value)?;
            }
            for table in DROPPED_TABLES {
                for suffix in ["Offset", "Size", "Crc"] {
                    header.set_u64(0, &format!("{}{}", table, suffix), 0)?;
                }
            }

            let header_bytes = header.to_bytes();
            let needed = PACKET_HEADER_SIZE + header_bytes.len() as u64 + COPYRIGHT.len() as u64;
            if needed <= toc_offset {
                break (layout, header_bytes);
            }
            toc_offset = align_to(needed, HEADER_RESERVED);
        };

        let mut out = CountingWriter::new(output);
        self.write_packet(&mut out, CPK_MAGIC, &header_bytes)?;
        out.pad_to(toc_offset - COPYRIGHT.len() as u64)?;
        out.write_all(COPYRIGHT)?;

        self.write_packet(&mut out, TOC_MAGIC, &layout.toc)?;
        for ((&index, &offset), (stored, _)) in kept.iter().zip(&layout.offsets).zip(&sizes) {
            out.pad_to(offset)?;
            match &self.replaced[index] {
                Some(content) => out.write_all(content)?,
                None => out.write_all(&self.stored_bytes(&self.files[index])?)?,
            }
            debug_assert_eq!(out.position, offset + stored);
        }
        out.pad_to(layout.content_end)?;

        if let Some(bytes) = &etoc_bytes {
            self.write_packet(&mut out, ETOC_MAGIC, bytes)?;
        }
        out.flush()?;

        tracing::debug!(
            files = kept.len(),
            size = out.position,
            "Wrote CPK"
        );
        Ok(())
    }
}

/// Positions of the TOC and of every kept file.
struct Layout {
    toc: Vec<u8>,
    content_offset: u64,
    content_end: u64,
    offsets: Vec<u64>,
}

impl Layout {
    /// Settle file offsets and TOC size, which depend on each other through
    /// the TOC's encoded length.
    fn plan(toc: &mut UtfTable, sizes: &[(u64, u64)], toc_offset: u64, align: u64) -> Result<Layout, Error> {
        let mut content_offset = align_to(toc_offset + PACKET_HEADER_SIZE, align);
        for _ in 0..4 {
            let mut offsets = Vec::with_capacity(sizes.len());
            let mut position = content_offset;
            for (row, (stored, _)) in sizes.iter().enumerate() {
                offsets.push(position);
                toc.set_u64(row, "FileOffset", position - toc_offset)?;
                position = align_to(position + stored, align);
            }

            let bytes = toc.to_bytes();
            let needed = align_to(toc_offset + PACKET_HEADER_SIZE + bytes.len() as u64, align);
            if needed <= content_offset {
                return Ok(Layout {
                    toc: bytes,
                    content_offset,
                    content_end: position,
                    offsets,
                });
            }
            content_offset = needed;
        }
        Err(Error::ArchiveWrite("TOC layout does not settle".into()))
    }
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn read_packet(image: &ByteSource, offset: u64, magic: &[u8; 4]) -> Result<(UtfTable, bool), Error> {
    let name = String::from_utf8_lossy(magic).trim().to_string();
    let truncated = |_: std::io::Error| Error::ArchiveParse(format!("{} packet at {:#x} is truncated", name, offset));

    let head = image
        .slice(offset, PACKET_HEADER_SIZE)
        .and_then(|s| s.read_all())
        .map_err(truncated)?;
    if &head[..4] != magic {
        return Err(Error::ArchiveParse(format!("missing {} magic at {:#x}", name, offset)));
    }
    let size = LittleEndian::read_u64(&head[0x08..]);
    let table = image
        .slice(offset + PACKET_HEADER_SIZE, size)
        .and_then(|s| s.read_all())
        .map_err(truncated)?;
    UtfTable::parse(&table)
}

/// Tracks the output position for alignment padding.
struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    position: u64,
}

impl<'a> CountingWriter<'a> {
    fn new(inner: &'a mut dyn Write) -> Self {
        Self { inner, position: 0 }
    }

    fn pad_to(&mut self, offset: u64) -> std::io::Result<()> {
        if offset > self.position {
            let gap = offset - self.position;
            std::io::copy(&mut std::io::repeat(0).take(gap), self)?;
        }
        Ok(())
    }
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::cpk::utf::Value;

    /// A CPK holding `files`; each is (dir, name, stored bytes, extract size).
    pub(crate) fn cpk(files: &[(&str, &str, &[u8], u64)], with_etoc: bool, obfuscated: bool) -> Vec<u8> {
        const ALIGN: u64 = 0x20;
        const TOC_OFFSET: u64 = 0x800;

        let mut toc = UtfTable::new("CpkTocInfo")
            .with_column("DirName", Value::Str(String::new()), true)
            .with_column("FileName", Value::Str(String::new()), true)
            .with_column("FileSize", Value::U32(0), true)
            .with_column("ExtractSize", Value::U32(0), true)
            .with_column("FileOffset", Value::U64(0), true)
            .with_column("ID", Value::U32(0), true)
            .with_column("UserString", Value::Str("<NULL>".into()), false);
        for (id, (dir, name, data, extract)) in files.iter().enumerate() {
            toc.push_row(vec![
                Value::Str(dir.to_string()),
                Value::Str(name.to_string()),
                Value::U32(data.len() as u32),
                Value::U32(*extract as u32),
                Value::U64(0),
                Value::U32(id as u32),
                Value::Str("<NULL>".into()),
            ]);
        }
        let toc_len = toc.to_bytes().len() as u64;
        let content_offset = align_to(TOC_OFFSET + PACKET_HEADER_SIZE + toc_len, ALIGN);

        let mut offsets = Vec::new();
        let mut position = content_offset;
        for (row, (_, _, data, _)) in files.iter().enumerate() {
            offsets.push(position);
            toc.set_u64(row, "FileOffset", position - TOC_OFFSET).unwrap();
            position = align_to(position + data.len() as u64, ALIGN);
        }
        let toc_bytes = toc.to_bytes();
        assert_eq!(toc_bytes.len() as u64, toc_len);

        let mut etoc = UtfTable::new("CpkEtocInfo")
            .with_column("UpdateDateTime", Value::U64(0), true)
            .with_column("LocalDir", Value::Str(String::new()), true);
        for (i, (dir, ..)) in files.iter().enumerate() {
            etoc.push_row(vec![Value::U64(0x07E3_0101 + i as u64), Value::Str(dir.to_string())]);
        }
        let etoc_bytes = etoc.to_bytes();

        let mut header = UtfTable::new("CpkHeader")
            .with_column("UpdateDateTime", Value::U64(1), true)
            .with_column("ContentOffset", Value::U64(0), true)
            .with_column("ContentSize", Value::U64(0), true)
            .with_column("TocOffset", Value::U64(0), true)
            .with_column("TocSize", Value::U64(0), true)
            .with_column("EtocOffset", Value::U64(0), true)
            .with_column("EtocSize", Value::U64(0), true)
            .with_column("ItocOffset", Value::U64(0), true)
            .with_column("ItocSize", Value::U64(0), true)
            .with_column("Files", Value::U32(0), true)
            .with_column("Version", Value::U16(7), false)
            .with_column("Align", Value::U16(0), true)
            .with_zero_column("GtocOffset", 0x6);
        header.push_row(vec![
            Value::U64(1),
            Value::U64(content_offset),
            Value::U64(position - content_offset),
            Value::U64(TOC_OFFSET),
            Value::U64(PACKET_HEADER_SIZE + toc_bytes.len() as u64),
            Value::U64(if with_etoc { position } else { 0 }),
            Value::U64(if with_etoc { PACKET_HEADER_SIZE + etoc_bytes.len() as u64 } else { 0 }),
            // Stale index tables a repack must drop
            Value::U64(0x1234),
            Value::U64(0x40),
            Value::U32(files.len() as u32),
            Value::U16(7),
            Value::U16(ALIGN as u16),
            Value::U64(0),
        ]);

        let packet = |magic: &[u8; 4], table: &[u8]| {
            let mut table = table.to_vec();
            if obfuscated {
                obfuscate(&mut table);
            }
            let mut out = magic.to_vec();
            out.extend_from_slice(&PACKET_FLAG.to_le_bytes());
            out.extend_from_slice(&(table.len() as u64).to_le_bytes());
            out.extend_from_slice(&table);
            out
        };

        let mut image = packet(CPK_MAGIC, &header.to_bytes());
        image.resize(TOC_OFFSET as usize, 0);
        image.extend_from_slice(&packet(TOC_MAGIC, &toc_bytes));
        for ((_, _, data, _), offset) in files.iter().zip(&offsets) {
            image.resize(*offset as usize, 0);
            image.extend_from_slice(data);
        }
        image.resize(position as usize, 0);
        if with_etoc {
            image.extend_from_slice(&packet(ETOC_MAGIC, &etoc_bytes));
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::cpk;
    use super::*;
    use crate::cpk::crilayla::tests::{pack, Token};

    fn load(image: Vec<u8>) -> CpkArchive {
        CpkArchive::load(ByteSource::from_vec(image)).unwrap()
    }

    fn save(archive: &CpkArchive, keep: &[usize]) -> Vec<u8> {
        let mut out = Vec::new();
        archive.save(&mut out, keep).unwrap();
        out
    }

    fn sample(with_etoc: bool, obfuscated: bool) -> Vec<u8> {
        cpk(
            &[
                ("data", "a.bin", b"alpha", 5),
                ("", "b.bin", b"bravo!", 6),
                ("data/sub", "c.bin", b"charlie", 7),
            ],
            with_etoc,
            obfuscated,
        )
    }

    fn paths(archive: &CpkArchive) -> Vec<String> {
        archive.entries().into_iter().map(|e| e.path).collect()
    }

    #[test]
    fn test_lists_entries() {
        let archive = load(sample(true, false));

        assert_eq!(paths(&archive), vec!["/data/a.bin", "/b.bin", "/data/sub/c.bin"]);
        let entries = archive.entries();
        assert_eq!(entries[1].index, 1);
        assert_eq!(entries[1].size, 6);
        assert_eq!(archive.read_entry(2).unwrap(), b"charlie");
    }

    #[test]
    fn test_reads_compressed_entry() {
        let prefix = [0x50; 0x100];
        let packed = pack(&prefix, &[Token::Literal(b'b'), Token::Literal(b'a')]);
        let image = cpk(&[("", "packed.bin", &packed, 0x102)], false, false);

        let archive = load(image);
        let content = archive.read_entry(0).unwrap();
        assert_eq!(content.len(), 0x102);
        assert_eq!(&content[0x100..], b"ab");
    }

    #[test]
    fn test_staged_content_is_read_back() {
        let mut archive = load(sample(false, false));
        archive.set_content(0, b"patched".to_vec()).unwrap();

        assert_eq!(archive.read_entry(0).unwrap(), b"patched");
        assert_eq!(archive.entries()[0].size, 7);
    }

    #[test]
    fn test_save_subset_in_table_order() {
        let mut archive = load(sample(true, false));
        archive.set_content(2, b"CHARLIE, patched".to_vec()).unwrap();
        archive.delete_entry(1).unwrap();

        let saved = load(save(&archive, &[2, 0]));

        assert_eq!(paths(&saved), vec!["/data/a.bin", "/data/sub/c.bin"]);
        assert_eq!(saved.read_entry(0).unwrap(), b"alpha");
        assert_eq!(saved.read_entry(1).unwrap(), b"CHARLIE, patched");
        assert!(saved.files.iter().all(|f| f.offset % 0x20 == 0));
        assert_eq!(saved.header.get_u64(0, "Files"), Some(2));
        assert_eq!(saved.etoc.as_ref().map(UtfTable::row_count), Some(2));
        assert_eq!(saved.etoc.as_ref().and_then(|e| e.get_str(1, "LocalDir")), Some("data/sub"));
    }

    #[test]
    fn test_save_drops_stale_index_tables() {
        let archive = load(sample(false, false));
        let saved = load(save(&archive, &[0]));

        assert_eq!(saved.header.get_u64(0, "ItocOffset"), Some(0));
        assert_eq!(saved.header.get_u64(0, "ItocSize"), Some(0));
        assert_eq!(saved.header.get_u64(0, "EtocOffset"), Some(0));
        assert!(saved.etoc.is_none());
    }

    #[test]
    fn test_replaced_compressed_entry_is_stored_plain() {
        let packed = pack(&[0; 0x100], &[Token::Literal(1)]);
        let mut archive = load(cpk(&[("", "packed.bin", &packed, 0x101)], false, false));
        archive.set_content(0, b"plain".to_vec()).unwrap();

        let saved = load(save(&archive, &[0]));
        assert_eq!(saved.files[0].stored_size, 5);
        assert_eq!(saved.files[0].extract_size, 5);
        assert_eq!(saved.read_entry(0).unwrap(), b"plain");
    }

    #[test]
    fn test_save_is_deterministic() {
        let mut archive = load(sample(true, false));
        archive.set_content(1, b"new".to_vec()).unwrap();

        assert_eq!(save(&archive, &[1]), save(&archive, &[1]));
    }

    #[test]
    fn test_keeps_obfuscation() {
        let archive = load(sample(true, true));
        assert!(archive.obfuscated);
        assert_eq!(archive.read_entry(0).unwrap(), b"alpha");

        let bytes = save(&archive, &[0, 1]);
        assert_ne!(&bytes[0x10..0x14], b"@UTF");
        let saved = load(bytes);
        assert!(saved.obfuscated);
        assert_eq!(paths(&saved), vec!["/data/a.bin", "/b.bin"]);
    }

    #[test]
    fn test_empty_subset() {
        let archive = load(sample(true, false));
        let saved = load(save(&archive, &[]));

        assert!(saved.entries().is_empty());
        assert_eq!(saved.header.get_u64(0, "Files"), Some(0));
    }

    #[test]
    fn test_save_rejects_deleted_or_unknown_entries() {
        let mut archive = load(sample(false, false));
        archive.delete_entry(0).unwrap();

        let mut out = Vec::new();
        assert!(matches!(archive.save(&mut out, &[0]), Err(Error::ArchiveWrite(_))));
        assert!(matches!(
            archive.save(&mut out, &[9]),
            Err(Error::ArchiveEntryMissing(9))
        ));
        assert!(matches!(
            archive.set_content(0, vec![]),
            Err(Error::ArchiveWrite(_))
        ));
    }

    #[test]
    fn test_index_checks() {
        let mut archive = load(sample(false, false));

        assert!(matches!(archive.read_entry(3), Err(Error::ArchiveEntryMissing(3))));
        assert!(matches!(archive.delete_entry(3), Err(Error::ArchiveEntryMissing(3))));
    }

    #[test]
    fn test_rejects_non_cpk() {
        let result = CpkArchive::load(ByteSource::from_vec(b"this is not a CPK archive".to_vec()));
        assert!(matches!(result, Err(Error::ArchiveParse(_))));
    }

    #[test]
    fn test_rejects_entry_past_end() {
        let mut image = sample(false, false);
        image.truncate(image.len() - 0x20);

        let result = CpkArchive::load(ByteSource::from_vec(image));
        assert!(matches!(result, Err(Error::ArchiveParse(_))));
    }
}
