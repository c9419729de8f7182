//! VCDIFF (RFC 3284) delta decoding
//!
//! Decoding is done by `oxidelta` with the default code table. Secondary
//! compression, application code tables and `VCD_TARGET` windows are
//! rejected as unsupported. Adler-32 window checksums are checked when
//! present and enabled.
//!
//! Every window header is walked once before the delta reaches the
//! decoder: section lengths must add up to the window's encoded size and
//! fit in the payload, and a source window must lie inside the base.

use std::io::{self, Read};

use oxidelta::vcdiff::decoder::{DecodeError, StreamDecoder};
use oxidelta::vcdiff::header::{
    HARD_MAX_WINSIZE, VCDIFF_MAGIC, VCD_ADLER32, VCD_APPHEADER, VCD_CODETABLE, VCD_SECONDARY,
    VCD_SOURCE, VCD_TARGET,
};
use oxidelta::vcdiff::varint;
use timepatch_core::ports::DeltaApplier;
use timepatch_core::DeltaError;

#[derive(Debug, Clone)]
pub struct VcdiffApplier {
    verify_checksums: bool,
}

impl VcdiffApplier {
    pub fn new(verify_checksums: bool) -> Self {
        Self { verify_checksums }
    }
}

impl Default for VcdiffApplier {
    fn default() -> Self {
        Self::new(true)
    }
}

impl DeltaApplier for VcdiffApplier {
    fn apply(&self, base: &[u8], delta: &mut dyn Read) -> Result<Vec<u8>, DeltaError> {
        let mut bytes = Vec::new();
        delta.read_to_end(&mut bytes)?;
        check_windows(&bytes, base.len() as u64)?;

        let mut decoder = StreamDecoder::new(bytes.as_slice(), self.verify_checksums);
        let mut source = base;
        let mut output = Vec::new();
        decoder
            .decode_all(&mut source, &mut output)
            .map_err(delta_error)?;
        Ok(output)
    }
}

fn delta_error(err: DecodeError) -> DeltaError {
    match err {
        DecodeError::Io(e) if e.kind() == io::ErrorKind::Unsupported => {
            DeltaError::Unsupported(e.to_string())
        }
        // The delta is read from memory, so any I/O failure is a malformed stream
        DecodeError::Io(e) => DeltaError::InvalidDelta(e.to_string()),
        DecodeError::InvalidInput(msg) => DeltaError::InvalidDelta(msg),
        DecodeError::ChecksumMismatch { expected, actual } => {
            DeltaError::ChecksumMismatch { expected, actual }
        }
        DecodeError::Unsupported(msg) => DeltaError::Unsupported(msg),
    }
}

fn invalid(msg: impl Into<String>) -> DeltaError {
    DeltaError::InvalidDelta(msg.into())
}

/// Walk the file header and every window header of `delta` without
/// decoding instructions.
fn check_windows(delta: &[u8], base_len: u64) -> Result<(), DeltaError> {
    let mut scan = Scan::new(delta);

    if scan.take(4)? != VCDIFF_MAGIC {
        return Err(invalid("not a VCDIFF stream"));
    }
    let header = scan.byte()?;
    if header & VCD_SECONDARY != 0 {
        return Err(DeltaError::Unsupported("secondary compression".into()));
    }
    if header & VCD_CODETABLE != 0 {
        return Err(DeltaError::Unsupported("application code table".into()));
    }
    if header & VCD_APPHEADER != 0 {
        let len = scan.varint()?;
        scan.take(len)?;
    }

    let mut index = 0u64;
    while !scan.is_empty() {
        let indicator = scan.byte()?;
        if indicator & VCD_TARGET != 0 {
            return Err(DeltaError::Unsupported(format!(
                "window {} copies from the target",
                index
            )));
        }
        if indicator & VCD_SOURCE != 0 {
            let len = scan.varint()?;
            let offset = scan.varint()?;
            if offset.checked_add(len).map_or(true, |end| end > base_len) {
                return Err(invalid(format!(
                    "window {} source {}+{} exceeds the {} byte base",
                    index, offset, len, base_len
                )));
            }
        }

        let encoded_len = scan.varint()?;
        let mut window = Scan::new(scan.take(encoded_len)?);
        let target_len = window.varint()?;
        if target_len > HARD_MAX_WINSIZE {
            return Err(invalid(format!(
                "window {} target of {} bytes is too large",
                index, target_len
            )));
        }
        window.byte()?;

        let mut sections = 0u64;
        for _ in 0..3 {
            sections = sections
                .checked_add(window.varint()?)
                .ok_or_else(|| invalid(format!("window {} section lengths overflow", index)))?;
        }
        if indicator & VCD_ADLER32 != 0 {
            window.take(4)?;
        }
        if sections != window.remaining() {
            return Err(invalid(format!(
                "window {} sections hold {} bytes, header declares {}",
                index,
                window.remaining(),
                sections
            )));
        }
        index += 1;
    }

    Ok(())
}

struct Scan<'a> {
    data: &'a [u8],
}

impl<'a> Scan<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn remaining(&self) -> u64 {
        self.data.len() as u64
    }

    fn take(&mut self, len: u64) -> Result<&'a [u8], DeltaError> {
        if len > self.remaining() {
            return Err(invalid("unexpected end of delta"));
        }
        let (head, rest) = self.data.split_at(len as usize);
        self.data = rest;
        Ok(head)
    }

    fn byte(&mut self) -> Result<u8, DeltaError> {
        Ok(self.take(1)?[0])
    }

    fn varint(&mut self) -> Result<u64, DeltaError> {
        let (value, used) = varint::read_u64(self.data).map_err(|e| invalid(e.to_string()))?;
        self.data = &self.data[used..];
        Ok(value)
    }
}
