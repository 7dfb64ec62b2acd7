/*! Typed output columns and the per-flow record builder.

Each decoder declares its columns once at startup; the declarations are
assembled into a global [`Schema`]. At flow termination the decoder appends
values through a [`RecordBuilder`], which checks every write against the
declared types — appending out of order is a contract violation surfaced
as [`Error::SchemaMismatch`](crate::error::Error::SchemaMismatch).

On the wire all integers are little-endian, strings are length-prefixed
UTF-8 and repeated groups start with a `numrep` count followed by that many
tuples of the declared sub-types.
*/

use crate::error::{Error, Result};
use crate::packet::Timestamp;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ColumnType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Mac,
    Ip4,
    Ip6,
    Str,
    Timestamp,
    /// Rendering hints for status bitfields; stored as the same-width
    /// unsigned integer.
    Hex8,
    Hex16,
    Hex32,
    Hex64,
}

impl ColumnType {
    fn storage(self) -> ColumnType {
        match self {
            ColumnType::Hex8 => ColumnType::U8,
            ColumnType::Hex16 => ColumnType::U16,
            ColumnType::Hex32 => ColumnType::U32,
            ColumnType::Hex64 => ColumnType::U64,
            other => other,
        }
    }
}

/// One declared output column: a tuple of primitive types, optionally
/// repeated. Names follow the `<prefix><CamelCase>` convention; tuple
/// members of repeated groups are separated by `_` in the name.
#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
    pub description: String,
    pub types: Vec<ColumnType>,
    pub repeated: bool,
}

impl Column {
    pub fn new(name: &str, description: &str, ty: ColumnType) -> Column {
        Column {
            name: name.to_owned(),
            description: description.to_owned(),
            types: vec![ty],
            repeated: false,
        }
    }

    pub fn repeated(name: &str, description: &str, ty: ColumnType) -> Column {
        Column {
            name: name.to_owned(),
            description: description.to_owned(),
            types: vec![ty],
            repeated: true,
        }
    }

    pub fn group(name: &str, description: &str, types: &[ColumnType]) -> Column {
        Column {
            name: name.to_owned(),
            description: description.to_owned(),
            types: types.to_vec(),
            repeated: true,
        }
    }
}

/// The assembled output schema: every decoder's columns in registration
/// order. Written once at startup; values are referenced positionally
/// thereafter.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn push(&mut self, columns: Vec<Column>) {
        self.columns.extend(columns);
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

enum Slot {
    Value(ColumnType),
    BeginRepeat,
}

/// Appends one flow record, checking writes against the declared columns.
pub struct RecordBuilder<'a> {
    columns: &'a [Column],
    buf: BytesMut,
    col: usize,
    ty: usize,
    /// Remaining tuples of the current repeated group, once `numrep` has
    /// been written.
    reps: Option<u32>,
}

impl<'a> RecordBuilder<'a> {
    pub fn new(columns: &'a [Column]) -> RecordBuilder<'a> {
        RecordBuilder {
            columns,
            buf: BytesMut::new(),
            col: 0,
            ty: 0,
            reps: None,
        }
    }

    fn expected(&self) -> Option<Slot> {
        let col = self.columns.get(self.col)?;
        if col.repeated && self.reps.is_none() {
            return Some(Slot::BeginRepeat);
        }
        Some(Slot::Value(col.types[self.ty]))
    }

    fn mismatch(&self, got: ColumnType) -> Error {
        let declared = match self.expected() {
            Some(Slot::Value(ty)) => ty,
            // Bare value written where a numrep was due, or trailing write.
            _ => ColumnType::U32,
        };
        Error::SchemaMismatch {
            index: self.col,
            declared,
            got,
        }
    }

    fn advance(&mut self) {
        let col = &self.columns[self.col];
        self.ty += 1;
        if self.ty < col.types.len() {
            return;
        }
        self.ty = 0;
        if col.repeated {
            let left = self.reps.unwrap() - 1;
            if left > 0 {
                self.reps = Some(left);
                return;
            }
        }
        self.reps = None;
        self.col += 1;
        // A repeated column with zero tuples is consumed by begin_repeat.
    }

    fn check(&mut self, got: ColumnType) -> Result<()> {
        match self.expected() {
            Some(Slot::Value(declared)) if declared.storage() == got.storage() => Ok(()),
            _ => Err(self.mismatch(got)),
        }
    }

    /// Start a repeated group by writing its `numrep`.
    pub fn begin_repeat(&mut self, count: u32) -> Result<()> {
        match self.expected() {
            Some(Slot::BeginRepeat) => {}
            _ => return Err(self.mismatch(ColumnType::U32)),
        }
        self.buf.put_u32_le(count);
        if count == 0 {
            self.reps = None;
            self.col += 1;
            self.ty = 0;
        } else {
            self.reps = Some(count);
        }
        Ok(())
    }

    pub fn append_u8(&mut self, v: u8) -> Result<()> {
        self.check(ColumnType::U8)?;
        self.buf.put_u8(v);
        self.advance();
        Ok(())
    }

    pub fn append_u16(&mut self, v: u16) -> Result<()> {
        self.check(ColumnType::U16)?;
        self.buf.put_u16_le(v);
        self.advance();
        Ok(())
    }

    pub fn append_u32(&mut self, v: u32) -> Result<()> {
        self.check(ColumnType::U32)?;
        self.buf.put_u32_le(v);
        self.advance();
        Ok(())
    }

    pub fn append_u64(&mut self, v: u64) -> Result<()> {
        self.check(ColumnType::U64)?;
        self.buf.put_u64_le(v);
        self.advance();
        Ok(())
    }

    pub fn append_i8(&mut self, v: i8) -> Result<()> {
        self.check(ColumnType::I8)?;
        self.buf.put_i8(v);
        self.advance();
        Ok(())
    }

    pub fn append_i16(&mut self, v: i16) -> Result<()> {
        self.check(ColumnType::I16)?;
        self.buf.put_i16_le(v);
        self.advance();
        Ok(())
    }

    pub fn append_i32(&mut self, v: i32) -> Result<()> {
        self.check(ColumnType::I32)?;
        self.buf.put_i32_le(v);
        self.advance();
        Ok(())
    }

    pub fn append_i64(&mut self, v: i64) -> Result<()> {
        self.check(ColumnType::I64)?;
        self.buf.put_i64_le(v);
        self.advance();
        Ok(())
    }

    pub fn append_f32(&mut self, v: f32) -> Result<()> {
        self.check(ColumnType::F32)?;
        self.buf.put_f32_le(v);
        self.advance();
        Ok(())
    }

    pub fn append_f64(&mut self, v: f64) -> Result<()> {
        self.check(ColumnType::F64)?;
        self.buf.put_f64_le(v);
        self.advance();
        Ok(())
    }

    pub fn append_mac(&mut self, v: [u8; 6]) -> Result<()> {
        self.check(ColumnType::Mac)?;
        self.buf.put_slice(&v);
        self.advance();
        Ok(())
    }

    pub fn append_ip4(&mut self, v: Ipv4Addr) -> Result<()> {
        self.check(ColumnType::Ip4)?;
        self.buf.put_slice(&v.octets());
        self.advance();
        Ok(())
    }

    pub fn append_ip6(&mut self, v: Ipv6Addr) -> Result<()> {
        self.check(ColumnType::Ip6)?;
        self.buf.put_slice(&v.octets());
        self.advance();
        Ok(())
    }

    pub fn append_str(&mut self, v: &str) -> Result<()> {
        self.check(ColumnType::Str)?;
        self.buf.put_u16_le(v.len() as u16);
        self.buf.put_slice(v.as_bytes());
        self.advance();
        Ok(())
    }

    pub fn append_ts(&mut self, v: Timestamp) -> Result<()> {
        self.check(ColumnType::Timestamp)?;
        self.buf.put_u64_le(v.sec);
        self.buf.put_u32_le(v.usec);
        self.advance();
        Ok(())
    }

    /// Finish the record. Fails if any declared column is missing.
    pub fn finish(self) -> Result<Bytes> {
        if self.col != self.columns.len() {
            return Err(Error::SchemaMismatch {
                index: self.col,
                declared: self.columns[self.col].types[self.ty],
                got: self.columns[self.col].types[self.ty],
            });
        }
        Ok(self.buf.freeze())
    }
}

/// Decodes a record produced by [`RecordBuilder`], for consumers and the
/// round-trip tests.
pub struct RecordReader<'a> {
    buf: &'a [u8],
}

#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Mac([u8; 6]),
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Str(String),
    Timestamp(Timestamp),
    /// A repeated group: one `Vec<Value>` per tuple.
    Rep(Vec<Vec<Value>>),
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> RecordReader<'a> {
        RecordReader { buf }
    }

    fn value(&mut self, ty: ColumnType) -> Value {
        match ty.storage() {
            ColumnType::U8 => Value::U8(self.buf.get_u8()),
            ColumnType::U16 => Value::U16(self.buf.get_u16_le()),
            ColumnType::U32 => Value::U32(self.buf.get_u32_le()),
            ColumnType::U64 => Value::U64(self.buf.get_u64_le()),
            ColumnType::I8 => Value::I8(self.buf.get_i8()),
            ColumnType::I16 => Value::I16(self.buf.get_i16_le()),
            ColumnType::I32 => Value::I32(self.buf.get_i32_le()),
            ColumnType::I64 => Value::I64(self.buf.get_i64_le()),
            ColumnType::F32 => Value::F32(self.buf.get_f32_le()),
            ColumnType::F64 => Value::F64(self.buf.get_f64_le()),
            ColumnType::Mac => {
                let mut mac = [0; 6];
                self.buf.copy_to_slice(&mut mac);
                Value::Mac(mac)
            }
            ColumnType::Ip4 => {
                let mut oct = [0; 4];
                self.buf.copy_to_slice(&mut oct);
                Value::Ip4(Ipv4Addr::from(oct))
            }
            ColumnType::Ip6 => {
                let mut oct = [0; 16];
                self.buf.copy_to_slice(&mut oct);
                Value::Ip6(Ipv6Addr::from(oct))
            }
            ColumnType::Str => {
                let len = self.buf.get_u16_le() as usize;
                let bytes = self.buf.copy_to_bytes(len);
                Value::Str(String::from_utf8_lossy(&bytes).into_owned())
            }
            ColumnType::Timestamp => {
                let sec = self.buf.get_u64_le();
                let usec = self.buf.get_u32_le();
                Value::Timestamp(Timestamp { sec, usec })
            }
            // storage() never returns the hex variants
            _ => unreachable!(),
        }
    }

    /// Decode one record against its schema segment.
    pub fn read(mut self, columns: &[Column]) -> Vec<Value> {
        let mut out = Vec::with_capacity(columns.len());
        for col in columns {
            if col.repeated {
                let numrep = self.buf.get_u32_le();
                let mut tuples = Vec::with_capacity(numrep as usize);
                for _ in 0..numrep {
                    tuples.push(col.types.iter().map(|&ty| self.value(ty)).collect());
                }
                out.push(Value::Rep(tuples));
            } else {
                debug_assert_eq!(col.types.len(), 1);
                out.push(self.value(col.types[0]));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("cdpStat", "CDP status", ColumnType::Hex8),
            Column::new("cdpDevice", "CDP device ID", ColumnType::Str),
            Column::group(
                "cdpIPPref_cdr",
                "CDP IP prefix, CIDR",
                &[ColumnType::Ip4, ColumnType::U8],
            ),
        ]
    }

    #[test]
    fn roundtrip() {
        let cols = columns();
        let mut rec = RecordBuilder::new(&cols);
        rec.append_u8(0x01).unwrap();
        rec.append_str("Switch-A").unwrap();
        rec.begin_repeat(2).unwrap();
        rec.append_ip4(Ipv4Addr::new(10, 0, 0, 0)).unwrap();
        rec.append_u8(24).unwrap();
        rec.append_ip4(Ipv4Addr::new(192, 168, 0, 0)).unwrap();
        rec.append_u8(16).unwrap();
        let bytes = rec.finish().unwrap();

        let values = RecordReader::new(&bytes).read(&cols);
        assert_eq!(values[0], Value::U8(0x01));
        assert_eq!(values[1], Value::Str("Switch-A".into()));
        assert_eq!(
            values[2],
            Value::Rep(vec![
                vec![Value::Ip4(Ipv4Addr::new(10, 0, 0, 0)), Value::U8(24)],
                vec![Value::Ip4(Ipv4Addr::new(192, 168, 0, 0)), Value::U8(16)],
            ])
        );
    }

    #[test]
    fn out_of_order_write_is_rejected() {
        let cols = columns();
        let mut rec = RecordBuilder::new(&cols);
        assert!(rec.append_str("nope").is_err());
    }

    #[test]
    fn empty_repeat_consumes_column() {
        let cols = columns();
        let mut rec = RecordBuilder::new(&cols);
        rec.append_u8(0).unwrap();
        rec.append_str("").unwrap();
        rec.begin_repeat(0).unwrap();
        let bytes = rec.finish().unwrap();
        let values = RecordReader::new(&bytes).read(&cols);
        assert_eq!(values[2], Value::Rep(vec![]));
    }

    #[test]
    fn unfinished_record_is_rejected() {
        let cols = columns();
        let rec = RecordBuilder::new(&cols);
        assert!(rec.finish().is_err());
    }
}
