//! NCSD game card images (`.3ds`)

use byteorder::{ByteOrder, LittleEndian};
use timepatch_core::entities::ContainerEntry;
use timepatch_core::source::ByteSource;
use timepatch_core::Error;

use super::{media_unit, parse_error, read_region, region};

const HEADER_SIZE: u64 = 0x200;
const MAGIC_OFFSET: usize = 0x100;
const PARTITION_TABLE_OFFSET: usize = 0x120;
const PARTITION_COUNT: usize = 8;
/// flags[6] of the header flags at 0x188
const MEDIA_UNIT_EXPONENT_OFFSET: usize = 0x18E;

fn partition_name(slot: usize) -> String {
    match slot {
        0 => "GameData.cxi".to_string(),
        1 => "EManual.cfa".to_string(),
        2 => "DownloadPlay.cfa".to_string(),
        6 => "UpdateNew3DS.cfa".to_string(),
        7 => "UpdateOld3DS.cfa".to_string(),
        n => format!("Partition{}.cfa", n),
    }
}

pub fn partitions(image: &ByteSource) -> Result<Vec<ContainerEntry>, Error> {
    let header = read_region(image, 0, HEADER_SIZE, "NCSD header")?;
    if &header[MAGIC_OFFSET..MAGIC_OFFSET + 4] != b"NCSD" {
        return Err(parse_error("missing NCSD magic"));
    }

    let unit = media_unit(header[MEDIA_UNIT_EXPONENT_OFFSET])?;
    let mut entries = Vec::new();

    for slot in 0..PARTITION_COUNT {
        let entry = &header[PARTITION_TABLE_OFFSET + slot * 8..];
        let offset = u64::from(LittleEndian::read_u32(entry)) * unit;
        let length = u64::from(LittleEndian::read_u32(&entry[4..])) * unit;
        if length == 0 {
            continue;
        }

        let name = partition_name(slot);
        let data = region(image, offset, length, &name)?;
        entries.push(ContainerEntry::new(format!("/{}", name), data));
    }

    Ok(entries)
}
