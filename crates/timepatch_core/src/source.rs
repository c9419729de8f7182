//! Random-access byte sources for nested containers
//!
//! A game image is a container of partitions, a partition is a container of
//! files and one of those files is itself an archive. Every level is a window
//! into the same backing file, so a [`ByteSource`] is a cheap, cloneable
//! `(backing, offset, length)` view that can be narrowed with [`ByteSource::slice`].

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Positional read access to some backing storage.
pub trait RandomAccess: Send + Sync {
    /// Total number of bytes available.
    fn len(&self) -> u64;

    /// Fill `buf` with the bytes starting at `offset`.
    ///
    /// Must fail with `UnexpectedEof` when the range runs past the end.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl RandomAccess for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| eof())?;
        let end = start.checked_add(buf.len()).ok_or_else(eof)?;
        let data = self.get(start..end).ok_or_else(eof)?;
        buf.copy_from_slice(data);
        Ok(())
    }
}

/// A file opened read-only, shared between all sources cut from it.
pub struct FileAccess {
    file: Mutex<File>,
    len: u64,
}

impl FileAccess {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl RandomAccess for FileAccess {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset.checked_add(buf.len() as u64).ok_or_else(eof)?;
        if end > self.len {
            return Err(eof());
        }
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "file handle lock poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of source")
}

/// A window into a [`RandomAccess`] backing.
#[derive(Clone)]
pub struct ByteSource {
    backing: Arc<dyn RandomAccess>,
    offset: u64,
    len: u64,
}

impl ByteSource {
    pub fn new(backing: Arc<dyn RandomAccess>) -> Self {
        let len = backing.len();
        Self {
            backing,
            offset: 0,
            len,
        }
    }

    /// Source over an owned buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::new(Arc::new(data))
    }

    /// Source over a file opened read-only.
    ///
    /// The handle is closed when the last source cut from it is dropped.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(Arc::new(FileAccess::open(path)?)))
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrow this source to `len` bytes starting at `offset`.
    pub fn slice(&self, offset: u64, len: u64) -> io::Result<ByteSource> {
        let end = offset.checked_add(len).ok_or_else(|| out_of_bounds(offset, len, self.len))?;
        if end > self.len {
            return Err(out_of_bounds(offset, len, self.len));
        }
        Ok(Self {
            backing: Arc::clone(&self.backing),
            offset: self.offset + offset,
            len,
        })
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset.checked_add(buf.len() as u64).ok_or_else(eof)?;
        if end > self.len {
            return Err(eof());
        }
        self.backing.read_at(self.offset + offset, buf)
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let len = usize::try_from(self.len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "source too large"))?;
        self.read_vec(0, len)
    }

    /// Sequential reader over this source, for header parsing with `byteorder`.
    pub fn reader(&self) -> SourceReader {
        SourceReader {
            source: self.clone(),
            position: 0,
        }
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSource")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

fn out_of_bounds(offset: u64, len: u64, available: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "range {:#x}+{:#x} exceeds source length {:#x}",
            offset, len, available
        ),
    )
}

/// `Read + Seek` cursor over a [`ByteSource`].
pub struct SourceReader {
    source: ByteSource,
    position: u64,
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.source.len().saturating_sub(self.position);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.source.read_at(self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for SourceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.source.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            )),
        }
    }
}
