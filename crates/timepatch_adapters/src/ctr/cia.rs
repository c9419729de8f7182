//! CIA installable archives (`.cia`)
//!
//! Layout: header, certificate chain, ticket, TMD, contents, meta. Every
//! section starts on a 64-byte boundary. Contents follow each other in
//! TMD chunk order, skipping those missing from the content index.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use timepatch_core::entities::ContainerEntry;
use timepatch_core::source::ByteSource;
use timepatch_core::Error;

use super::{align, parse_error, read_region, region};

const SECTION_ALIGNMENT: u64 = 0x40;
const HEADER_FIELDS_SIZE: u64 = 0x20;
const CONTENT_INDEX_OFFSET: usize = 0x20;
const CONTENT_INDEX_SIZE: u64 = 0x2000;

const TMD_HEADER_SIZE: u64 = 0xC4;
const TMD_CONTENT_COUNT_OFFSET: usize = 0x9E;
const TMD_CONTENT_INFO_SIZE: u64 = 0x24 * 64;
const CHUNK_RECORD_SIZE: u64 = 0x30;
const CONTENT_TYPE_ENCRYPTED: u16 = 0x0001;

fn content_name(index: u16, content_id: u32) -> String {
    match index {
        0 => "GameData.cxi".to_string(),
        1 => "Manual.cfa".to_string(),
        2 => "DownloadPlay.cfa".to_string(),
        _ => format!("{:08x}.app", content_id),
    }
}

/// Size of the signature block including type and padding.
fn signature_block_size(signature_type: u32) -> Result<u64, Error> {
    let (signature, padding) = match signature_type {
        0x0001_0000 | 0x0001_0003 => (0x200, 0x3C),
        0x0001_0001 | 0x0001_0004 => (0x100, 0x3C),
        0x0001_0002 | 0x0001_0005 => (0x3C, 0x40),
        other => {
            return Err(parse_error(format!(
                "unknown TMD signature type {:#010x}",
                other
            )))
        }
    };
    Ok(4 + signature + padding)
}

#[derive(Debug)]
struct ChunkRecord {
    content_id: u32,
    index: u16,
    content_type: u16,
    size: u64,
}

pub fn contents(image: &ByteSource) -> Result<Vec<ContainerEntry>, Error> {
    let fields = read_region(image, 0, HEADER_FIELDS_SIZE, "CIA header")?;
    let header_size = u64::from(LittleEndian::read_u32(&fields[0x00..]));
    let cert_size = u64::from(LittleEndian::read_u32(&fields[0x08..]));
    let ticket_size = u64::from(LittleEndian::read_u32(&fields[0x0C..]));
    let tmd_size = u64::from(LittleEndian::read_u32(&fields[0x10..]));

    if header_size < HEADER_FIELDS_SIZE + CONTENT_INDEX_SIZE {
        return Err(parse_error(format!("CIA header size {:#x} too small", header_size)));
    }
    let content_index = read_region(
        image,
        CONTENT_INDEX_OFFSET as u64,
        CONTENT_INDEX_SIZE,
        "CIA content index",
    )?;

    let cert_offset = align(header_size, SECTION_ALIGNMENT);
    let ticket_offset = align(cert_offset + cert_size, SECTION_ALIGNMENT);
    let tmd_offset = align(ticket_offset + ticket_size, SECTION_ALIGNMENT);
    let content_offset = align(tmd_offset + tmd_size, SECTION_ALIGNMENT);

    let tmd = region(image, tmd_offset, tmd_size, "TMD")?;
    let records = chunk_records(&tmd)?;

    let mut entries = Vec::new();
    let mut offset = content_offset;
    for record in records {
        let present = content_index
            .get(record.index as usize / 8)
            .is_some_and(|bits| bits & (0x80u8 >> (record.index % 8)) != 0);
        if !present {
            tracing::debug!("Content {:08x} not included in CIA", record.content_id);
            continue;
        }

        let name = content_name(record.index, record.content_id);
        if record.content_type & CONTENT_TYPE_ENCRYPTED != 0 {
            return Err(Error::ContainerEncrypted(format!("CIA content {}", name)));
        }

        let data = region(image, offset, record.size, &name)?;
        entries.push(ContainerEntry::new(format!("/{}", name), data));
        offset += record.size;
    }

    Ok(entries)
}

fn chunk_records(tmd: &ByteSource) -> Result<Vec<ChunkRecord>, Error> {
    let signature_type = BigEndian::read_u32(&read_region(tmd, 0, 4, "TMD signature type")?);
    let header_offset = signature_block_size(signature_type)?;
    let header = read_region(tmd, header_offset, TMD_HEADER_SIZE, "TMD header")?;
    let count = u64::from(BigEndian::read_u16(&header[TMD_CONTENT_COUNT_OFFSET..]));

    let records_offset = header_offset + TMD_HEADER_SIZE + TMD_CONTENT_INFO_SIZE;
    let raw = read_region(tmd, records_offset, count * CHUNK_RECORD_SIZE, "TMD chunk records")?;

    Ok(raw
        .chunks_exact(CHUNK_RECORD_SIZE as usize)
        .map(|chunk| ChunkRecord {
            content_id: BigEndian::read_u32(&chunk[0..]),
            index: BigEndian::read_u16(&chunk[4..]),
            content_type: BigEndian::read_u16(&chunk[6..]),
            size: BigEndian::read_u64(&chunk[8..]),
        })
        .collect())
}
