//! CRI CPK archives
//!
//! A CPK is a `CPK ` header packet followed by a `TOC ` packet listing
//! every file by directory and name, the file contents, and optionally an
//! `ETOC` packet with per-file timestamps. Every packet wraps an @UTF
//! table. Contents may be CRILAYLA-compressed.
//!
//! Saving writes a fresh archive: the header packet padded to 0x800, the
//! TOC, then the kept contents aligned to the archive's `Align`, then the
//! ETOC. ID-based indexes (ITOC, GTOC, HTOC) are not carried over.

mod archive;
mod crilayla;
mod utf;

use timepatch_core::ports::ArchiveRepacker;
use timepatch_core::source::ByteSource;
use timepatch_core::Error;
use tracing::instrument;

pub use archive::CpkArchive;

#[cfg(test)]
pub(crate) use archive::fixtures;

#[derive(Debug, Default, Clone)]
pub struct CpkRepacker;

impl ArchiveRepacker for CpkRepacker {
    type State = CpkArchive;

    #[instrument(skip_all, fields(size = archive.len()))]
    fn load(&self, archive: ByteSource) -> Result<CpkArchive, Error> {
        CpkArchive::load(archive)
    }
}
