//! Nintendo 3DS containers
//!
//! Only decrypted images are supported. Listings are views into the image:
//! no file content is read until an entry's data is used.

mod cia;
mod ncch;
mod ncsd;
mod romfs;

use timepatch_core::entities::{ContainerEntry, ContainerKind};
use timepatch_core::ports::ContainerReader;
use timepatch_core::source::ByteSource;
use timepatch_core::Error;
use tracing::instrument;

/// Default 3DS media unit
const MEDIA_UNIT: u64 = 0x200;

/// Reads NCSD and CIA images and the NCCH partitions inside them.
#[derive(Debug, Default, Clone)]
pub struct CtrContainerReader;

impl ContainerReader for CtrContainerReader {
    #[instrument(skip_all, fields(kind = %kind, size = image.len()))]
    fn load_partitions(
        &self,
        image: ByteSource,
        kind: ContainerKind,
    ) -> Result<Vec<ContainerEntry>, Error> {
        let entries = match kind {
            ContainerKind::Ncsd => ncsd::partitions(&image)?,
            ContainerKind::Cia => cia::contents(&image)?,
        };
        tracing::debug!("Found {} partitions", entries.len());
        Ok(entries)
    }

    #[instrument(skip_all, fields(size = partition.len()))]
    fn load_filesystem(&self, partition: ByteSource) -> Result<Vec<ContainerEntry>, Error> {
        let entries = ncch::files(&partition)?;
        tracing::debug!("Found {} files", entries.len());
        Ok(entries)
    }
}

fn parse_error(msg: impl Into<String>) -> Error {
    Error::ContainerParse(msg.into())
}

/// Bounds-checked view of `len` bytes at `offset`.
fn region(source: &ByteSource, offset: u64, len: u64, what: &str) -> Result<ByteSource, Error> {
    source.slice(offset, len).map_err(|_| {
        parse_error(format!(
            "{} at {:#x}+{:#x} lies outside the {:#x} byte container",
            what,
            offset,
            len,
            source.len()
        ))
    })
}

fn read_region(source: &ByteSource, offset: u64, len: u64, what: &str) -> Result<Vec<u8>, Error> {
    Ok(region(source, offset, len, what)?.read_all()?)
}

fn media_unit(exponent: u8) -> Result<u64, Error> {
    if exponent > 16 {
        return Err(parse_error(format!("invalid media unit exponent {}", exponent)));
    }
    Ok(MEDIA_UNIT << exponent)
}

fn align(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
