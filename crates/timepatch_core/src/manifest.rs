//! Patch bundle (`.pat`) reader
//!
//! A bundle maps logical file paths to delta payloads. All integers are
//! big-endian:
//!
//! - Header: magic (8 bytes), version: u16, flags: u16, entry count: u32
//! - Index: per entry [path_len: u16][path: UTF-8][offset: u64][length: u64][crc32: u32]
//! - Index CRC32 over every byte from the start of the file to the end of the index
//! - Payloads, anywhere after the index

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use crc32fast::Hasher;
use tracing::instrument;

use crate::error::Error;

/// Bundle magic: "TTPATCH" followed by 0x1A
pub const BUNDLE_MAGIC: [u8; 8] = [0x54, 0x54, 0x50, 0x41, 0x54, 0x43, 0x48, 0x1A];

pub const BUNDLE_VERSION: u16 = 1;

/// Size of the fixed header preceding the index
pub const HEADER_SIZE: u64 = 16;

/// Index record of one delta payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub crc32: u32,
}

/// An opened, validated patch bundle.
///
/// Read-only after [`PatchManifest::open`]; every payload read goes through a
/// fresh file handle so payload streams are independent of each other.
#[derive(Debug)]
pub struct PatchManifest {
    path: PathBuf,
    entries: Vec<ManifestEntry>,
    lookup: HashMap<String, usize>,
}

impl PatchManifest {
    /// Open and validate a bundle, including every payload checksum.
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::open_with(path, true)
    }

    /// Open and validate a bundle.
    ///
    /// The header and index are always validated. `verify_payloads` controls
    /// whether payload CRCs are checked up front as well.
    #[instrument]
    pub fn open_with(path: &Path, verify_payloads: bool) -> Result<Self, Error> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ManifestNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(corrupt(format!("{}: {}", path.display(), e))),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let entries = read_index(&mut reader, file_len)?;

        let mut lookup = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            if lookup.insert(entry.path.clone(), index).is_some() {
                return Err(corrupt(format!("duplicate patch path {:?}", entry.path)));
            }
        }

        if verify_payloads {
            for entry in &entries {
                verify_payload(&mut reader, entry)?;
            }
        }

        tracing::info!(
            "Loaded patch file {:?} with {} patches",
            path,
            entries.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            lookup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index records in bundle order
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Exact-match membership test. No separator or case normalization.
    pub fn has_patch(&self, logical_path: &str) -> bool {
        self.lookup.contains_key(logical_path)
    }

    /// Open a fresh stream over the delta payload for `logical_path`.
    ///
    /// The stream owns its own file handle, which is closed when the stream
    /// is dropped.
    pub fn get_patch(&self, logical_path: &str) -> Result<PatchStream, Error> {
        let index = self
            .lookup
            .get(logical_path)
            .ok_or_else(|| Error::PatchNotFound(logical_path.to_string()))?;
        let entry = &self.entries[*index];

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;

        Ok(PatchStream {
            inner: BufReader::new(file).take(entry.length),
        })
    }
}

/// Single-use reader over one delta payload.
#[derive(Debug)]
pub struct PatchStream {
    inner: Take<BufReader<File>>,
}

impl PatchStream {
    /// Bytes left to read
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }
}

impl Read for PatchStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::ManifestCorrupt(msg.into())
}

/// Reads through to the inner reader while hashing everything read.
struct HashingReader<'a, R> {
    inner: &'a mut R,
    hasher: Hasher,
}

impl<R: Read> Read for HashingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn truncated(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        corrupt("index is truncated")
    } else {
        Error::Io(e)
    }
}

fn read_index<R: Read>(reader: &mut R, file_len: u64) -> Result<Vec<ManifestEntry>, Error> {
    let mut hashing = HashingReader {
        inner: reader,
        hasher: Hasher::new(),
    };

    let mut magic = [0u8; 8];
    hashing.read_exact(&mut magic).map_err(truncated)?;
    if magic != BUNDLE_MAGIC {
        return Err(corrupt("invalid magic header"));
    }

    let version = hashing.read_u16::<BigEndian>().map_err(truncated)?;
    if version != BUNDLE_VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }

    let flags = hashing.read_u16::<BigEndian>().map_err(truncated)?;
    if flags != 0 {
        return Err(corrupt(format!("unknown flags {:#06x}", flags)));
    }

    let count = hashing.read_u32::<BigEndian>().map_err(truncated)?;

    // Smallest possible record is 22 bytes; reject counts the file can't hold
    if u64::from(count) * 22 > file_len.saturating_sub(HEADER_SIZE) {
        return Err(corrupt(format!("entry count {} exceeds file size", count)));
    }

    let mut entries = Vec::with_capacity(count as usize);
    let mut index_end = HEADER_SIZE;
    for _ in 0..count {
        let path_len = hashing.read_u16::<BigEndian>().map_err(truncated)?;
        let mut path = vec![0u8; path_len as usize];
        hashing.read_exact(&mut path).map_err(truncated)?;
        let path = String::from_utf8(path).map_err(|_| corrupt("patch path is not UTF-8"))?;

        let offset = hashing.read_u64::<BigEndian>().map_err(truncated)?;
        let length = hashing.read_u64::<BigEndian>().map_err(truncated)?;
        let crc32 = hashing.read_u32::<BigEndian>().map_err(truncated)?;

        index_end += 2 + u64::from(path_len) + 8 + 8 + 4;
        entries.push(ManifestEntry {
            path,
            offset,
            length,
            crc32,
        });
    }

    let computed = hashing.hasher.finalize();
    let stored = reader.read_u32::<BigEndian>().map_err(truncated)?;
    if computed != stored {
        return Err(corrupt(format!(
            "index checksum mismatch (expected {:#010x}, got {:#010x})",
            stored, computed
        )));
    }

    let payload_start = index_end + 4;
    for entry in &entries {
        let end = entry.offset.checked_add(entry.length);
        if entry.offset < payload_start || end.map_or(true, |end| end > file_len) {
            return Err(corrupt(format!(
                "payload for {:?} lies outside the payload region",
                entry.path
            )));
        }
    }

    Ok(entries)
}

fn verify_payload<R: Read + Seek>(reader: &mut R, entry: &ManifestEntry) -> Result<(), Error> {
    reader.seek(SeekFrom::Start(entry.offset))?;

    let mut hasher = Hasher::new();
    let mut remaining = entry.length;
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..chunk]).map_err(truncated)?;
        hasher.update(&buf[..chunk]);
        remaining -= chunk as u64;
    }

    let computed = hasher.finalize();
    if computed != entry.crc32 {
        return Err(corrupt(format!(
            "payload checksum mismatch for {:?} (expected {:#010x}, got {:#010x})",
            entry.path, entry.crc32, computed
        )));
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // ==========================================================================
    // Test Fixture Helpers
    // ==========================================================================

    fn crc(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Build a bundle with payloads laid out in order after the index
    pub(crate) fn build_bundle(patches: &[(&str, &[u8])]) -> Vec<u8> {
        let index_len: usize = patches.iter().map(|(p, _)| 2 + p.len() + 20).sum();
        let mut offset = HEADER_SIZE + index_len as u64 + 4;

        let mut out = Vec::new();
        out.extend_from_slice(&BUNDLE_MAGIC);
        out.extend_from_slice(&BUNDLE_VERSION.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(patches.len() as u32).to_be_bytes());
        for (path, payload) in patches {
            out.extend_from_slice(&(path.len() as u16).to_be_bytes());
            out.extend_from_slice(path.as_bytes());
            out.extend_from_slice(&offset.to_be_bytes());
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            out.extend_from_slice(&crc(payload).to_be_bytes());
            offset += payload.len() as u64;
        }
        let index_crc = crc(&out);
        out.extend_from_slice(&index_crc.to_be_bytes());
        for (_, payload) in patches {
            out.extend_from_slice(payload);
        }
        out
    }

    pub(crate) fn write_bundle(patches: &[(&str, &[u8])]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&build_bundle(patches)).unwrap();
        file.flush().unwrap();
        file
    }

    fn write_raw(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn read_patch(manifest: &PatchManifest, path: &str) -> Vec<u8> {
        let mut out = Vec::new();
        manifest.get_patch(path).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    // ==========================================================================
    // Lookup Tests
    // ==========================================================================

    #[test]
    fn test_open_and_lookup() {
        let file = write_bundle(&[("/a", b"delta-a"), ("/b", b"delta-bb"), (".code", b"")]);
        let manifest = PatchManifest::open(file.path()).unwrap();

        assert_eq!(manifest.len(), 3);
        assert!(manifest.has_patch("/a"));
        assert!(manifest.has_patch(".code"));
        assert!(!manifest.has_patch("/c"));
        assert_eq!(read_patch(&manifest, "/a"), b"delta-a");
        assert_eq!(read_patch(&manifest, "/b"), b"delta-bb");
        assert_eq!(read_patch(&manifest, ".code"), b"");
    }

    #[test]
    fn test_lookup_is_exact_match() {
        let file = write_bundle(&[("/dir/file.bin", b"x")]);
        let manifest = PatchManifest::open(file.path()).unwrap();

        assert!(manifest.has_patch("/dir/file.bin"));
        assert!(!manifest.has_patch("dir/file.bin"));
        assert!(!manifest.has_patch("\\dir\\file.bin"));
        assert!(!manifest.has_patch("/DIR/file.bin"));
    }

    #[test]
    fn test_patch_streams_are_independent() {
        let file = write_bundle(&[("/a", b"0123456789")]);
        let manifest = PatchManifest::open(file.path()).unwrap();

        let mut first = manifest.get_patch("/a").unwrap();
        let mut head = [0u8; 4];
        first.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"0123");
        assert_eq!(first.remaining(), 6);

        // A second stream starts at offset 0 regardless of the first
        assert_eq!(read_patch(&manifest, "/a"), b"0123456789");
    }

    #[test]
    fn test_get_patch_unknown_path() {
        let file = write_bundle(&[("/a", b"x")]);
        let manifest = PatchManifest::open(file.path()).unwrap();

        assert!(matches!(
            manifest.get_patch("/missing"),
            Err(Error::PatchNotFound(path)) if path == "/missing"
        ));
    }

    #[test]
    fn test_empty_bundle() {
        let file = write_bundle(&[]);
        let manifest = PatchManifest::open(file.path()).unwrap();
        assert!(manifest.is_empty());
    }

    // ==========================================================================
    // Validation Tests
    // ==========================================================================

    #[test]
    fn test_open_missing_file() {
        let result = PatchManifest::open(Path::new("/nonexistent/patch.pat"));
        assert!(matches!(result, Err(Error::ManifestNotFound(_))));
    }

    #[test]
    fn test_invalid_magic() {
        let mut data = build_bundle(&[("/a", b"x")]);
        data[0] = b'X';
        let file = write_raw(&data);
        assert!(matches!(
            PatchManifest::open(file.path()),
            Err(Error::ManifestCorrupt(msg)) if msg.contains("magic")
        ));
    }

    #[test]
    fn test_truncated_index() {
        let data = build_bundle(&[("/a", b"payload")]);
        let file = write_raw(&data[..20]);
        assert!(matches!(
            PatchManifest::open(file.path()),
            Err(Error::ManifestCorrupt(_))
        ));
    }

    #[test]
    fn test_index_checksum_mismatch() {
        let mut data = build_bundle(&[("/a", b"payload")]);
        // Flip the low byte of the first payload offset
        data[HEADER_SIZE as usize + 2 + 2 + 7] ^= 0x01;
        let file = write_raw(&data);
        assert!(matches!(
            PatchManifest::open(file.path()),
            Err(Error::ManifestCorrupt(msg)) if msg.contains("index checksum")
        ));
    }

    #[test]
    fn test_payload_checksum_mismatch() {
        let mut data = build_bundle(&[("/a", b"payload")]);
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let file = write_raw(&data);

        assert!(matches!(
            PatchManifest::open(file.path()),
            Err(Error::ManifestCorrupt(msg)) if msg.contains("payload checksum")
        ));
        // Payload verification can be skipped
        assert!(PatchManifest::open_with(file.path(), false).is_ok());
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let file = write_bundle(&[("/a", b"1"), ("/a", b"2")]);
        assert!(matches!(
            PatchManifest::open(file.path()),
            Err(Error::ManifestCorrupt(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn test_payload_out_of_range() {
        let data = build_bundle(&[("/a", b"payload")]);
        // Drop the tail of the payload region
        let file = write_raw(&data[..data.len() - 3]);
        assert!(matches!(
            PatchManifest::open_with(file.path(), false),
            Err(Error::ManifestCorrupt(msg)) if msg.contains("outside")
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = build_bundle(&[]);
        data[9] = 2;
        let file = write_raw(&data);
        assert!(matches!(
            PatchManifest::open(file.path()),
            Err(Error::ManifestCorrupt(msg)) if msg.contains("version")
        ));
    }
}
