//! CRILAYLA decompression
//!
//! ```text
//! "CRILAYLA" size:u32le compressed_len:u32le
//! compressed stream (compressed_len bytes), read backwards
//! first 0x100 bytes of the output, stored raw
//! ```
//!
//! The stream is consumed bit by bit, MSB first, from its last byte towards
//! its first, and the output is produced from its last byte towards offset
//! 0x100. A set flag bit starts a back-reference to already written bytes
//! at a higher position; a clear one is followed by a literal byte.

use byteorder::{ByteOrder, LittleEndian};
use timepatch_core::Error;

const MAGIC: &[u8; 8] = b"CRILAYLA";
const HEADER_SIZE: usize = 0x10;
const RAW_PREFIX_SIZE: usize = 0x100;
const DISTANCE_BITS: u32 = 13;
const MIN_DISTANCE: usize = 3;
const MIN_LENGTH: usize = 3;
const LENGTH_BITS: [u32; 4] = [2, 3, 5, 8];

pub fn is_compressed(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

pub fn decompress(input: &[u8]) -> Result<Vec<u8>, Error> {
    if input.len() < HEADER_SIZE || !is_compressed(input) {
        return Err(corrupt("missing CRILAYLA header"));
    }
    let size = LittleEndian::read_u32(&input[0x08..]) as usize;
    let stream_len = LittleEndian::read_u32(&input[0x0C..]) as usize;

    let stream_end = HEADER_SIZE
        .checked_add(stream_len)
        .ok_or_else(|| corrupt("stream length overflows"))?;
    let prefix = stream_end
        .checked_add(RAW_PREFIX_SIZE)
        .and_then(|end| input.get(stream_end..end))
        .ok_or_else(|| corrupt("truncated"))?;
    // A byte of stream expands to at most 255 bytes of output
    if size > stream_len.saturating_mul(256) {
        return Err(corrupt(format!(
            "{} bytes cannot come from a {} byte stream",
            size, stream_len
        )));
    }

    let mut out = vec![0u8; RAW_PREFIX_SIZE + size];
    out[..RAW_PREFIX_SIZE].copy_from_slice(prefix);

    let mut bits = BitReader::new(&input[HEADER_SIZE..stream_end]);
    let last = out.len() - 1;
    let mut written = 0;
    while written < size {
        if bits.read(1)? == 0 {
            out[last - written] = bits.read(8)? as u8;
            written += 1;
            continue;
        }

        let distance = bits.read(DISTANCE_BITS)? as usize + MIN_DISTANCE;
        let length = read_length(&mut bits)?;
        if length > size - written {
            return Err(corrupt("back-reference runs past the output start"));
        }
        for _ in 0..length {
            let at = last - written;
            let from = at + distance;
            if from > last {
                return Err(corrupt("back-reference points past the output end"));
            }
            out[at] = out[from];
            written += 1;
        }
    }

    Ok(out)
}

/// Length of a back-reference: a chain of fields that continues while each
/// one is saturated, then 8-bit fields until one is not 255.
fn read_length(bits: &mut BitReader<'_>) -> Result<usize, Error> {
    let mut length = MIN_LENGTH;
    for width in LENGTH_BITS {
        let part = bits.read(width)?;
        length += part as usize;
        if part != (1 << width) - 1 {
            return Ok(length);
        }
    }
    loop {
        let part = bits.read(8)?;
        length += part as usize;
        if part != 0xFF {
            return Ok(length);
        }
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    /// Bytes not yet loaded; the next one is `data[unread - 1]`
    unread: usize,
    pool: u8,
    available: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            unread: data.len(),
            pool: 0,
            available: 0,
        }
    }

    fn read(&mut self, count: u32) -> Result<u32, Error> {
        let mut value = 0u32;
        let mut produced = 0;
        while produced < count {
            if self.available == 0 {
                if self.unread == 0 {
                    return Err(corrupt("stream ended early"));
                }
                self.unread -= 1;
                self.pool = self.data[self.unread];
                self.available = 8;
            }
            let take = self.available.min(count - produced);
            let bits = (u32::from(self.pool) >> (self.available - take)) & ((1 << take) - 1);
            value = (value << take) | bits;
            self.available -= take;
            produced += take;
        }
        Ok(value)
    }
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::ArchiveParse(format!("CRILAYLA: {}", msg.into()))
}
