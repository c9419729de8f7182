//! NCCH partitions (`.cxi`, `.cfa`)

use byteorder::{ByteOrder, LittleEndian};
use timepatch_core::entities::ContainerEntry;
use timepatch_core::source::ByteSource;
use timepatch_core::Error;

use super::{media_unit, parse_error, read_region, region, romfs};

const HEADER_SIZE: u64 = 0x200;
const MAGIC_OFFSET: usize = 0x100;
const EXHEADER_SIZE_OFFSET: usize = 0x180;
const FLAGS_OFFSET: usize = 0x188;
const EXEFS_OFFSET: usize = 0x1A0;
const ROMFS_OFFSET: usize = 0x1B0;

const FLAG_MEDIA_UNIT: usize = 6;
const FLAG_CRYPTO: usize = 7;
const NO_CRYPTO: u8 = 0x04;

const EXEFS_HEADER_SIZE: u64 = 0x200;
const EXEFS_FILE_COUNT: usize = 10;

/// ExHeader, ExeFS and RomFS files of a decrypted NCCH partition.
pub fn files(partition: &ByteSource) -> Result<Vec<ContainerEntry>, Error> {
    let header = read_region(partition, 0, HEADER_SIZE, "NCCH header")?;
    if &header[MAGIC_OFFSET..MAGIC_OFFSET + 4] != b"NCCH" {
        return Err(parse_error("missing NCCH magic"));
    }

    let flags = &header[FLAGS_OFFSET..FLAGS_OFFSET + 8];
    if flags[FLAG_CRYPTO] & NO_CRYPTO == 0 {
        return Err(Error::ContainerEncrypted(
            "NCCH partition is encrypted, decrypt the image first".into(),
        ));
    }
    let unit = media_unit(flags[FLAG_MEDIA_UNIT])?;

    let mut entries = Vec::new();

    // The declared size covers the ExHeader only, the access descriptor
    // follows it and is kept with it.
    let exheader_size = u64::from(LittleEndian::read_u32(&header[EXHEADER_SIZE_OFFSET..]));
    if exheader_size > 0 {
        let data = region(partition, HEADER_SIZE, exheader_size * 2, "ExHeader")?;
        entries.push(ContainerEntry::new("/ExHeader.bin", data));
    }

    let (exefs_offset, exefs_size) = section(&header, EXEFS_OFFSET, unit);
    if exefs_size > 0 {
        let exefs = region(partition, exefs_offset, exefs_size, "ExeFS")?;
        entries.extend(exefs_files(&exefs)?);
    }

    let (romfs_offset, romfs_size) = section(&header, ROMFS_OFFSET, unit);
    if romfs_size > 0 {
        let romfs = region(partition, romfs_offset, romfs_size, "RomFS")?;
        entries.extend(romfs::files(&romfs, "/RomFs")?);
    }

    Ok(entries)
}

/// (offset, size) in bytes of a section declared in media units.
fn section(header: &[u8], field: usize, unit: u64) -> (u64, u64) {
    let offset = u64::from(LittleEndian::read_u32(&header[field..])) * unit;
    let size = u64::from(LittleEndian::read_u32(&header[field + 4..])) * unit;
    (offset, size)
}

fn exefs_files(exefs: &ByteSource) -> Result<Vec<ContainerEntry>, Error> {
    let header = read_region(exefs, 0, EXEFS_HEADER_SIZE, "ExeFS header")?;
    let mut entries = Vec::new();

    for slot in header.chunks_exact(16).take(EXEFS_FILE_COUNT) {
        let name_bytes = &slot[..8];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(8);
        if name_len == 0 {
            continue;
        }
        let name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| parse_error("ExeFS file name is not ASCII"))?;

        let offset = u64::from(LittleEndian::read_u32(&slot[8..]));
        let size = u64::from(LittleEndian::read_u32(&slot[12..]));
        let data = region(exefs, EXEFS_HEADER_SIZE + offset, size, name)?;
        entries.push(ContainerEntry::new(format!("/ExeFs/{}", name), data));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::*;
    use timepatch_core::entities::find_entry;

    fn sample(decrypted: bool) -> Vec<u8> {
        fixtures::ncch(
            &[0xE0; 0x800],
            &[(".code", b"code bytes"), ("icon", &[0x1C; 0x36C0])],
            &[("/tt1_ctr.cpk", b"CPK archive"), ("/sound/bgm.bcstm", b"music")],
            decrypted,
        )
    }

    #[test]
    fn test_lists_all_sections() {
        let entries = files(&ByteSource::from_vec(sample(true))).unwrap();

        let exheader = find_entry(&entries, "/ExHeader.bin").unwrap();
        assert_eq!(exheader.data.len(), 0x800);

        let code = find_entry(&entries, "/ExeFs/.code").unwrap();
        assert_eq!(code.data.read_all().unwrap(), b"code bytes");
        assert_eq!(find_entry(&entries, "/ExeFs/icon").unwrap().data.len(), 0x36C0);

        let cpk = find_entry(&entries, "/RomFs/tt1_ctr.cpk").unwrap();
        assert_eq!(cpk.data.read_all().unwrap(), b"CPK archive");
        let bgm = find_entry(&entries, "/RomFs/sound/bgm.bcstm").unwrap();
        assert_eq!(bgm.data.read_all().unwrap(), b"music");
    }

    #[test]
    fn test_rejects_encrypted_partition() {
        let result = files(&ByteSource::from_vec(sample(false)));
        assert!(matches!(result, Err(Error::ContainerEncrypted(_))));
    }

    #[test]
    fn test_rejects_missing_magic() {
        let mut image = sample(true);
        image[0x100..0x104].copy_from_slice(b"NCSD");

        let result = files(&ByteSource::from_vec(image));
        assert!(matches!(result, Err(Error::ContainerParse(_))));
    }

    #[test]
    fn test_exefs_entry_past_end() {
        let mut image = sample(true);
        let exefs = LittleEndian::read_u32(&image[0x1A0..]) as usize * fixtures::UNIT;
        // Size of the first ExeFS file
        LittleEndian::write_u32(&mut image[exefs + 12..], 0x0100_0000);

        let result = files(&ByteSource::from_vec(image));
        assert!(matches!(result, Err(Error::ContainerParse(_))));
    }
}
