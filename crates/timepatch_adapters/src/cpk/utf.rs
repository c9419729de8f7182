//! @UTF tables
//!
//! CRI's typed table format, used for the CPK header and every index
//! inside it. All integers are big-endian. Offsets in the table header are
//! relative to the byte after the size field.
//!
//! ```text
//! "@UTF" size:u32 version:u16 rows:u16 strings:u32 data:u32 name:u32
//! columns:u16 row_length:u16 row_count:u32
//! schema: (flags:u8 name:u32 [constant value])*
//! rows, string pool, data pool
//! ```

use std::collections::HashMap;
use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use timepatch_core::Error;

pub const UTF_MAGIC: &[u8; 4] = b"@UTF";

/// Size of the fields after magic and size
const HEADER_TAIL: usize = 0x18;

const STORAGE_MASK: u8 = 0xF0;
const STORAGE_ZERO: u8 = 0x10;
const STORAGE_CONSTANT: u8 = 0x30;
const STORAGE_PER_ROW: u8 = 0x50;
const STORAGE_CONSTANT2: u8 = 0x70;
const TYPE_MASK: u8 = 0x0F;

const NULL_STRING: &[u8] = b"<NULL>\0";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Data(Vec<u8>),
}

impl Value {
    fn type_code(&self) -> u8 {
        match self {
            Value::U8(_) => 0x0,
            Value::I8(_) => 0x1,
            Value::U16(_) => 0x2,
            Value::I16(_) => 0x3,
            Value::U32(_) => 0x4,
            Value::I32(_) => 0x5,
            Value::U64(_) => 0x6,
            Value::I64(_) => 0x7,
            Value::F32(_) => 0x8,
            Value::F64(_) => 0x9,
            Value::Str(_) => 0xA,
            Value::Data(_) => 0xB,
        }
    }

    fn zero(type_code: u8) -> Result<Value, Error> {
        Ok(match type_code {
            0x0 => Value::U8(0),
            0x1 => Value::I8(0),
            0x2 => Value::U16(0),
            0x3 => Value::I16(0),
            0x4 => Value::U32(0),
            0x5 => Value::I32(0),
            0x6 => Value::U64(0),
            0x7 => Value::I64(0),
            0x8 => Value::F32(0.0),
            0x9 => Value::F64(0.0),
            0xA => Value::Str(String::new()),
            0xB => Value::Data(Vec::new()),
            other => return Err(corrupt(format!("unknown column type {:#x}", other))),
        })
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U8(v) => Some(v.into()),
            Value::U16(v) => Some(v.into()),
            Value::U32(v) => Some(v.into()),
            Value::U64(v) => Some(v),
            Value::I8(v) => u64::try_from(v).ok(),
            Value::I16(v) => u64::try_from(v).ok(),
            Value::I32(v) => u64::try_from(v).ok(),
            Value::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    /// `value` in this value's integer type, if it fits.
    fn with_integer(&self, value: u64) -> Option<Value> {
        match self {
            Value::U8(_) => u8::try_from(value).ok().map(Value::U8),
            Value::I8(_) => i8::try_from(value).ok().map(Value::I8),
            Value::U16(_) => u16::try_from(value).ok().map(Value::U16),
            Value::I16(_) => i16::try_from(value).ok().map(Value::I16),
            Value::U32(_) => u32::try_from(value).ok().map(Value::U32),
            Value::I32(_) => i32::try_from(value).ok().map(Value::I32),
            Value::U64(_) => Some(Value::U64(value)),
            Value::I64(_) => i64::try_from(value).ok().map(Value::I64),
            _ => None,
        }
    }

    fn read(type_code: u8, cursor: &mut Cursor<&[u8]>, pools: &Pools<'_>) -> Result<Value, Error> {
        let value = match type_code {
            0x0 => Value::U8(cursor.read_u8().map_err(truncated)?),
            0x1 => Value::I8(cursor.read_i8().map_err(truncated)?),
            0x2 => Value::U16(cursor.read_u16::<BigEndian>().map_err(truncated)?),
            0x3 => Value::I16(cursor.read_i16::<BigEndian>().map_err(truncated)?),
            0x4 => Value::U32(cursor.read_u32::<BigEndian>().map_err(truncated)?),
            0x5 => Value::I32(cursor.read_i32::<BigEndian>().map_err(truncated)?),
            0x6 => Value::U64(cursor.read_u64::<BigEndian>().map_err(truncated)?),
            0x7 => Value::I64(cursor.read_i64::<BigEndian>().map_err(truncated)?),
            0x8 => Value::F32(cursor.read_f32::<BigEndian>().map_err(truncated)?),
            0x9 => Value::F64(cursor.read_f64::<BigEndian>().map_err(truncated)?),
            0xA => {
                let offset = cursor.read_u32::<BigEndian>().map_err(truncated)?;
                Value::Str(pools.string(offset)?)
            }
            0xB => {
                let offset = cursor.read_u32::<BigEndian>().map_err(truncated)?;
                let size = cursor.read_u32::<BigEndian>().map_err(truncated)?;
                Value::Data(pools.data(offset, size)?)
            }
            other => return Err(corrupt(format!("unknown column type {:#x}", other))),
        };
        Ok(value)
    }

    fn write(&self, out: &mut Vec<u8>, pools: &mut PoolWriter) {
        // Writes into a Vec cannot fail
        let _ = match self {
            Value::U8(v) => out.write_u8(*v),
            Value::I8(v) => out.write_i8(*v),
            Value::U16(v) => out.write_u16::<BigEndian>(*v),
            Value::I16(v) => out.write_i16::<BigEndian>(*v),
            Value::U32(v) => out.write_u32::<BigEndian>(*v),
            Value::I32(v) => out.write_i32::<BigEndian>(*v),
            Value::U64(v) => out.write_u64::<BigEndian>(*v),
            Value::I64(v) => out.write_i64::<BigEndian>(*v),
            Value::F32(v) => out.write_f32::<BigEndian>(*v),
            Value::F64(v) => out.write_f64::<BigEndian>(*v),
            Value::Str(s) => out.write_u32::<BigEndian>(pools.intern(s)),
            Value::Data(d) => {
                let (offset, size) = pools.push_data(d);
                out.write_u32::<BigEndian>(offset)
                    .and_then(|()| out.write_u32::<BigEndian>(size))
            }
        };
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Storage {
    Zero,
    Constant,
    PerRow,
}

#[derive(Debug, Clone, PartialEq)]
struct Column {
    name: String,
    type_code: u8,
    storage: Storage,
}

/// A decoded @UTF table. Every row holds one value per column; constant
/// and zero columns repeat their single value.
#[derive(Debug, Clone, PartialEq)]
pub struct UtfTable {
    name: String,
    version: u16,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

struct Pools<'a> {
    strings: &'a [u8],
    data: &'a [u8],
}

impl Pools<'_> {
    fn string(&self, offset: u32) -> Result<String, Error> {
        let rest = self
            .strings
            .get(offset as usize..)
            .ok_or_else(|| corrupt("string offset out of range"))?;
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| corrupt("unterminated string"))?;
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }

    fn data(&self, offset: u32, size: u32) -> Result<Vec<u8>, Error> {
        let start = offset as usize;
        start
            .checked_add(size as usize)
            .and_then(|end| self.data.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| corrupt("data field out of range"))
    }
}

struct PoolWriter {
    strings: Vec<u8>,
    offsets: HashMap<String, u32>,
    data: Vec<u8>,
}

impl PoolWriter {
    fn new() -> Self {
        let mut offsets = HashMap::new();
        offsets.insert("<NULL>".to_string(), 0);
        Self {
            strings: NULL_STRING.to_vec(),
            offsets,
            data: Vec::new(),
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(s) {
            return offset;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        self.offsets.insert(s.to_string(), offset);
        offset
    }

    fn push_data(&mut self, data: &[u8]) -> (u32, u32) {
        if data.is_empty() {
            return (0, 0);
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(data);
        (offset, data.len() as u32)
    }
}

impl UtfTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn get(&self, row: usize, name: &str) -> Option<&Value> {
        let column = self.column_index(name)?;
        self.rows.get(row)?.get(column)
    }

    pub fn get_u64(&self, row: usize, name: &str) -> Option<u64> {
        self.get(row, name)?.as_u64()
    }

    pub fn get_str(&self, row: usize, name: &str) -> Option<&str> {
        match self.get(row, name)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Store an integer in an existing integer column. Returns `false` when
    /// the table has no such column.
    pub fn set_u64(&mut self, row: usize, name: &str, value: u64) -> Result<bool, Error> {
        let Some(column) = self.column_index(name) else {
            return Ok(false);
        };
        let current = self
            .rows
            .get(row)
            .and_then(|r| r.get(column))
            .ok_or_else(|| Error::ArchiveWrite(format!("{} has no row {}", self.name, row)))?;
        let new = current.with_integer(value).ok_or_else(|| {
            Error::ArchiveWrite(format!(
                "{} of {} does not fit in column {}",
                value, self.name, name
            ))
        })?;

        if new != *current {
            // A value that differs from the shared one moves into the rows
            self.columns[column].storage = Storage::PerRow;
            self.rows[row][column] = new;
        }
        Ok(true)
    }

    /// A copy of this table holding only `rows`, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> UtfTable {
        UtfTable {
            name: self.name.clone(),
            version: self.version,
            columns: self.columns.clone(),
            rows: rows
                .iter()
                .filter_map(|&r| self.rows.get(r).cloned())
                .collect(),
        }
    }

    /// Parse a table, undoing the XOR obfuscation if present.
    ///
    /// Returns the table and whether it was obfuscated.
    pub fn parse(bytes: &[u8]) -> Result<(UtfTable, bool), Error> {
        if bytes.starts_with(UTF_MAGIC) {
            return Ok((Self::parse_plain(bytes)?, false));
        }
        let mut plain = bytes.to_vec();
        obfuscate(&mut plain);
        if !plain.starts_with(UTF_MAGIC) {
            return Err(corrupt("missing @UTF magic"));
        }
        Ok((Self::parse_plain(&plain)?, true))
    }

    fn parse_plain(bytes: &[u8]) -> Result<UtfTable, Error> {
        let mut cursor = Cursor::new(bytes);
        cursor.set_position(4);
        let table_size = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
        let body = bytes
            .get(8..8 + table_size)
            .ok_or_else(|| corrupt("table size exceeds packet"))?;

        let mut header = Cursor::new(body);
        let version = header.read_u16::<BigEndian>().map_err(truncated)?;
        let rows_offset = header.read_u16::<BigEndian>().map_err(truncated)? as usize;
        let strings_offset = header.read_u32::<BigEndian>().map_err(truncated)? as usize;
        let data_offset = header.read_u32::<BigEndian>().map_err(truncated)? as usize;
        let name_offset = header.read_u32::<BigEndian>().map_err(truncated)?;
        let column_count = header.read_u16::<BigEndian>().map_err(truncated)?;
        let row_length = header.read_u16::<BigEndian>().map_err(truncated)? as usize;
        let row_count = header.read_u32::<BigEndian>().map_err(truncated)? as usize;

        if strings_offset > body.len() || data_offset > body.len() || data_offset < strings_offset {
            return Err(corrupt("pool offsets out of range"));
        }
        let pools = Pools {
            strings: &body[strings_offset..data_offset],
            data: &body[data_offset..],
        };

        let mut schema = Cursor::new(body);
        schema.set_position(HEADER_TAIL as u64);
        let mut columns = Vec::with_capacity(column_count as usize);
        let mut constants = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let flags = schema.read_u8().map_err(truncated)?;
            let name = pools.string(schema.read_u32::<BigEndian>().map_err(truncated)?)?;
            let type_code = flags & TYPE_MASK;
            let (storage, constant) = match flags & STORAGE_MASK {
                STORAGE_ZERO => (Storage::Zero, Some(Value::zero(type_code)?)),
                STORAGE_CONSTANT | STORAGE_CONSTANT2 => (
                    Storage::Constant,
                    Some(Value::read(type_code, &mut schema, &pools)?),
                ),
                STORAGE_PER_ROW => (Storage::PerRow, None),
                other => return Err(corrupt(format!("unknown column storage {:#x}", other))),
            };
            columns.push(Column {
                name,
                type_code,
                storage,
            });
            constants.push(constant);
        }

        let rows_end = row_length
            .checked_mul(row_count)
            .and_then(|len| len.checked_add(rows_offset))
            .filter(|&end| end <= body.len())
            .ok_or_else(|| corrupt("rows exceed table"))?;
        if row_length == 0 && row_count > body.len() {
            return Err(corrupt("implausible row count"));
        }

        let mut rows = Vec::with_capacity(row_count);
        for row in 0..row_count {
            let start = rows_offset + row * row_length;
            let mut cursor = Cursor::new(&body[..rows_end]);
            cursor.set_position(start as u64);
            let mut values = Vec::with_capacity(columns.len());
            for (column, constant) in columns.iter().zip(&constants) {
                values.push(match constant {
                    Some(value) => value.clone(),
                    None => Value::read(column.type_code, &mut cursor, &pools)?,
                });
            }
            rows.push(values);
        }

        Ok(UtfTable {
            name: pools.string(name_offset)?,
            version,
            columns,
            rows,
        })
    }

    /// Serialize without obfuscation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut pools = PoolWriter::new();
        let name_offset = pools.intern(&self.name);

        let mut schema = Vec::new();
        for (index, column) in self.columns.iter().enumerate() {
            let storage = match column.storage {
                Storage::Zero => STORAGE_ZERO,
                Storage::Constant => STORAGE_CONSTANT,
                Storage::PerRow => STORAGE_PER_ROW,
            };
            schema.push(storage | column.type_code);
            schema.extend_from_slice(&pools.intern(&column.name).to_be_bytes());
            if column.storage == Storage::Constant {
                match self.rows.first() {
                    Some(row) => row[index].write(&mut schema, &mut pools),
                    // No rows to carry the constant; keep its type
                    None => {
                        if let Ok(zero) = Value::zero(column.type_code) {
                            zero.write(&mut schema, &mut pools);
                        }
                    }
                }
            }
        }

        let mut rows = Vec::new();
        for row in &self.rows {
            for (value, column) in row.iter().zip(&self.columns) {
                if column.storage == Storage::PerRow {
                    value.write(&mut rows, &mut pools);
                }
            }
        }
        let row_length = self
            .columns
            .iter()
            .filter(|c| c.storage == Storage::PerRow)
            .map(|c| value_size(c.type_code))
            .sum::<usize>();

        let rows_offset = HEADER_TAIL + schema.len();
        let strings_offset = rows_offset + rows.len();
        let mut strings = pools.strings;
        pad(&mut strings, strings_offset, 8);
        let data_offset = strings_offset + strings.len();
        let mut data = pools.data;
        pad(&mut data, data_offset, 8);
        let table_size = data_offset + data.len();

        let mut out = Vec::with_capacity(8 + table_size);
        out.extend_from_slice(UTF_MAGIC);
        out.extend_from_slice(&(table_size as u32).to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(rows_offset as u16).to_be_bytes());
        out.extend_from_slice(&(strings_offset as u32).to_be_bytes());
        out.extend_from_slice(&(data_offset as u32).to_be_bytes());
        out.extend_from_slice(&name_offset.to_be_bytes());
        out.extend_from_slice(&(self.columns.len() as u16).to_be_bytes());
        out.extend_from_slice(&(row_length as u16).to_be_bytes());
        out.extend_from_slice(&(self.rows.len() as u32).to_be_bytes());
        out.extend_from_slice(&schema);
        out.extend_from_slice(&rows);
        out.extend_from_slice(&strings);
        out.extend_from_slice(&data);
        out
    }
}

#[cfg(test)]
impl UtfTable {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: 1,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Add a column whose type is taken from `template`.
    pub(crate) fn with_column(mut self, name: &str, template: Value, per_row: bool) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            type_code: template.type_code(),
            storage: if per_row {
                Storage::PerRow
            } else {
                Storage::Constant
            },
        });
        for row in &mut self.rows {
            row.push(template.clone());
        }
        self
    }

    pub(crate) fn with_zero_column(mut self, name: &str, type_code: u8) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            type_code,
            storage: Storage::Zero,
        });
        for row in &mut self.rows {
            row.push(Value::zero(type_code).unwrap());
        }
        self
    }

    pub(crate) fn push_row(&mut self, values: Vec<Value>) {
        assert_eq!(values.len(), self.columns.len());
        self.rows.push(values);
    }
}

fn value_size(type_code: u8) -> usize {
    match type_code {
        0x0 | 0x1 => 1,
        0x2 | 0x3 => 2,
        0x4 | 0x5 | 0x8 | 0xA => 4,
        _ => 8,
    }
}

/// Zero-pad `buf`, which starts at `start`, so it ends on `alignment`.
fn pad(buf: &mut Vec<u8>, start: usize, alignment: usize) {
    let end = (start + buf.len()).div_ceil(alignment) * alignment;
    buf.resize(end - start, 0);
}

/// CRI's table XOR mask; applying it twice restores the input.
pub fn obfuscate(bytes: &mut [u8]) {
    let mut mask: u32 = 0x0000_655F;
    for byte in bytes {
        *byte ^= mask as u8;
        mask = mask.wrapping_mul(0x0000_4115);
    }
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::ArchiveParse(format!("@UTF table: {}", msg.into()))
}

fn truncated(_: io::Error) -> Error {
    corrupt("truncated")
}
