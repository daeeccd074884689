//! AMQP 1.0 type system encoding.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{AmqpError, AmqpResult, Value};

mod code {
    pub const DESCRIBED: u8 = 0x00;
    pub const NULL: u8 = 0x40;
    pub const TRUE: u8 = 0x41;
    pub const FALSE: u8 = 0x42;
    pub const UINT0: u8 = 0x43;
    pub const ULONG0: u8 = 0x44;
    pub const LIST0: u8 = 0x45;
    pub const UBYTE: u8 = 0x50;
    pub const BYTE: u8 = 0x51;
    pub const SMALLUINT: u8 = 0x52;
    pub const SMALLULONG: u8 = 0x53;
    pub const SMALLINT: u8 = 0x54;
    pub const SMALLLONG: u8 = 0x55;
    pub const BOOLEAN: u8 = 0x56;
    pub const USHORT: u8 = 0x60;
    pub const SHORT: u8 = 0x61;
    pub const UINT: u8 = 0x70;
    pub const INT: u8 = 0x71;
    pub const FLOAT: u8 = 0x72;
    pub const CHAR: u8 = 0x73;
    pub const DECIMAL32: u8 = 0x74;
    pub const ULONG: u8 = 0x80;
    pub const LONG: u8 = 0x81;
    pub const DOUBLE: u8 = 0x82;
    pub const TIMESTAMP: u8 = 0x83;
    pub const DECIMAL64: u8 = 0x84;
    pub const DECIMAL128: u8 = 0x94;
    pub const UUID: u8 = 0x98;
    pub const VBIN8: u8 = 0xa0;
    pub const STR8: u8 = 0xa1;
    pub const SYM8: u8 = 0xa3;
    pub const VBIN32: u8 = 0xb0;
    pub const STR32: u8 = 0xb1;
    pub const SYM32: u8 = 0xb3;
    pub const LIST8: u8 = 0xc0;
    pub const MAP8: u8 = 0xc1;
    pub const LIST32: u8 = 0xd0;
    pub const MAP32: u8 = 0xd1;
    pub const ARRAY8: u8 = 0xe0;
    pub const ARRAY32: u8 = 0xf0;
}

/// Encodes a value, choosing the most compact constructor.
pub fn encode(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::Null => dst.put_u8(code::NULL),
        Value::Bool(true) => dst.put_u8(code::TRUE),
        Value::Bool(false) => dst.put_u8(code::FALSE),
        Value::Ubyte(v) => {
            dst.put_u8(code::UBYTE);
            dst.put_u8(*v);
        }
        Value::Ushort(v) => {
            dst.put_u8(code::USHORT);
            dst.put_u16(*v);
        }
        Value::Uint(0) => dst.put_u8(code::UINT0),
        Value::Uint(v) if *v < 256 => {
            dst.put_u8(code::SMALLUINT);
            dst.put_u8(*v as u8);
        }
        Value::Uint(v) => {
            dst.put_u8(code::UINT);
            dst.put_u32(*v);
        }
        Value::Ulong(0) => dst.put_u8(code::ULONG0),
        Value::Ulong(v) if *v < 256 => {
            dst.put_u8(code::SMALLULONG);
            dst.put_u8(*v as u8);
        }
        Value::Ulong(v) => {
            dst.put_u8(code::ULONG);
            dst.put_u64(*v);
        }
        Value::Byte(v) => {
            dst.put_u8(code::BYTE);
            dst.put_i8(*v);
        }
        Value::Short(v) => {
            dst.put_u8(code::SHORT);
            dst.put_i16(*v);
        }
        Value::Int(v) => match i8::try_from(*v) {
            Ok(small) => {
                dst.put_u8(code::SMALLINT);
                dst.put_i8(small);
            }
            Err(_) => {
                dst.put_u8(code::INT);
                dst.put_i32(*v);
            }
        },
        Value::Long(v) => match i8::try_from(*v) {
            Ok(small) => {
                dst.put_u8(code::SMALLLONG);
                dst.put_i8(small);
            }
            Err(_) => {
                dst.put_u8(code::LONG);
                dst.put_i64(*v);
            }
        },
        Value::Float(v) => {
            dst.put_u8(code::FLOAT);
            dst.put_f32(*v);
        }
        Value::Double(v) => {
            dst.put_u8(code::DOUBLE);
            dst.put_f64(*v);
        }
        Value::Char(v) => {
            dst.put_u8(code::CHAR);
            dst.put_u32(*v as u32);
        }
        Value::Timestamp(v) => {
            dst.put_u8(code::TIMESTAMP);
            dst.put_i64(*v);
        }
        Value::Uuid(v) => {
            dst.put_u8(code::UUID);
            dst.put_slice(v);
        }
        Value::Binary(v) => encode_variable(dst, code::VBIN8, code::VBIN32, v),
        Value::String(v) => encode_variable(dst, code::STR8, code::STR32, v.as_bytes()),
        Value::Symbol(v) => encode_variable(dst, code::SYM8, code::SYM32, v.as_bytes()),
        Value::List(items) if items.is_empty() => dst.put_u8(code::LIST0),
        Value::List(items) => {
            let mut body = BytesMut::new();
            for item in items {
                encode(item, &mut body);
            }
            encode_compound(dst, code::LIST8, code::LIST32, items.len(), &body);
        }
        Value::Map(entries) => {
            let mut body = BytesMut::new();
            for (k, v) in entries {
                encode(k, &mut body);
                encode(v, &mut body);
            }
            encode_compound(dst, code::MAP8, code::MAP32, entries.len() * 2, &body);
        }
        Value::Array(items) => encode_array(dst, items),
        Value::Described(descriptor, value) => {
            dst.put_u8(code::DESCRIBED);
            encode(descriptor, dst);
            encode(value, dst);
        }
    }
}

/// Encodes a value into a fresh buffer.
pub fn to_bytes(value: &Value) -> Bytes {
    let mut dst = BytesMut::new();
    encode(value, &mut dst);
    dst.freeze()
}

fn encode_variable(dst: &mut BytesMut, short: u8, long: u8, data: &[u8]) {
    if data.len() < 256 {
        dst.put_u8(short);
        dst.put_u8(data.len() as u8);
    } else {
        dst.put_u8(long);
        dst.put_u32(data.len() as u32);
    }
    dst.put_slice(data);
}

fn encode_compound(dst: &mut BytesMut, short: u8, long: u8, count: usize, body: &[u8]) {
    if body.len() + 1 < 256 && count < 256 {
        dst.put_u8(short);
        dst.put_u8((body.len() + 1) as u8);
        dst.put_u8(count as u8);
    } else {
        dst.put_u8(long);
        dst.put_u32((body.len() + 4) as u32);
        dst.put_u32(count as u32);
    }
    dst.put_slice(body);
}

/// Arrays share one constructor, so every element uses the wide form of its type.
fn encode_array(dst: &mut BytesMut, items: &[Value]) {
    let constructor = items.first().map(array_constructor).unwrap_or(code::NULL);
    let mut body = BytesMut::new();
    body.put_u8(constructor);
    for item in items {
        encode_array_element(item, &mut body);
    }
    if body.len() + 1 < 256 && items.len() < 256 {
        dst.put_u8(code::ARRAY8);
        dst.put_u8((body.len() + 1) as u8);
        dst.put_u8(items.len() as u8);
    } else {
        dst.put_u8(code::ARRAY32);
        dst.put_u32((body.len() + 4) as u32);
        dst.put_u32(items.len() as u32);
    }
    dst.put_slice(&body);
}

fn array_constructor(value: &Value) -> u8 {
    match value {
        Value::Null => code::NULL,
        Value::Bool(_) => code::BOOLEAN,
        Value::Ubyte(_) => code::UBYTE,
        Value::Ushort(_) => code::USHORT,
        Value::Uint(_) => code::UINT,
        Value::Ulong(_) => code::ULONG,
        Value::Byte(_) => code::BYTE,
        Value::Short(_) => code::SHORT,
        Value::Int(_) => code::INT,
        Value::Long(_) => code::LONG,
        Value::Float(_) => code::FLOAT,
        Value::Double(_) => code::DOUBLE,
        Value::Char(_) => code::CHAR,
        Value::Timestamp(_) => code::TIMESTAMP,
        Value::Uuid(_) => code::UUID,
        Value::Binary(_) => code::VBIN32,
        Value::String(_) => code::STR32,
        Value::Symbol(_) => code::SYM32,
        Value::List(_) => code::LIST32,
        Value::Map(_) => code::MAP32,
        Value::Array(_) => code::ARRAY32,
        Value::Described(_, inner) => array_constructor(inner),
    }
}

fn encode_array_element(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::Null => {}
        Value::Bool(v) => dst.put_u8(u8::from(*v)),
        Value::Ubyte(v) => dst.put_u8(*v),
        Value::Ushort(v) => dst.put_u16(*v),
        Value::Uint(v) => dst.put_u32(*v),
        Value::Ulong(v) => dst.put_u64(*v),
        Value::Byte(v) => dst.put_i8(*v),
        Value::Short(v) => dst.put_i16(*v),
        Value::Int(v) => dst.put_i32(*v),
        Value::Long(v) | Value::Timestamp(v) => dst.put_i64(*v),
        Value::Float(v) => dst.put_f32(*v),
        Value::Double(v) => dst.put_f64(*v),
        Value::Char(v) => dst.put_u32(*v as u32),
        Value::Uuid(v) => dst.put_slice(v),
        Value::Binary(v) => {
            dst.put_u32(v.len() as u32);
            dst.put_slice(v);
        }
        Value::String(v) | Value::Symbol(v) => {
            dst.put_u32(v.len() as u32);
            dst.put_slice(v.as_bytes());
        }
        Value::List(_) | Value::Map(_) | Value::Array(_) | Value::Described(..) => {
            // Wide form: skip the constructor byte the full encoder wrote.
            let mut full = BytesMut::new();
            encode_wide(value, &mut full);
            dst.put_slice(&full[1..]);
        }
    }
}

fn encode_wide(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::List(items) => {
            let mut body = BytesMut::new();
            for item in items {
                encode(item, &mut body);
            }
            dst.put_u8(code::LIST32);
            dst.put_u32((body.len() + 4) as u32);
            dst.put_u32(items.len() as u32);
            dst.put_slice(&body);
        }
        Value::Map(entries) => {
            let mut body = BytesMut::new();
            for (k, v) in entries {
                encode(k, &mut body);
                encode(v, &mut body);
            }
            dst.put_u8(code::MAP32);
            dst.put_u32((body.len() + 4) as u32);
            dst.put_u32((entries.len() * 2) as u32);
            dst.put_slice(&body);
        }
        Value::Described(_, inner) => encode_wide(inner, dst),
        other => encode(other, dst),
    }
}

/// Deepest nesting of described and compound values accepted on decode.
pub const MAX_NESTING: usize = 64;

/// Cursor over an encoded buffer. Every read is bounds checked.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, depth: 0 }
    }

    /// Reader over the body of a compound one level below this one.
    fn child(&self, body: &'a [u8]) -> AmqpResult<Reader<'a>> {
        if self.depth >= MAX_NESTING {
            return Err(AmqpError::decode("nesting too deep"));
        }
        Ok(Reader {
            data: body,
            pos: 0,
            depth: self.depth + 1,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    fn take(&mut self, n: usize) -> AmqpResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                AmqpError::decode(format!(
                    "need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.data.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> AmqpResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> AmqpResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> AmqpResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn read_u32(&mut self) -> AmqpResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn read_u64(&mut self) -> AmqpResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Decodes the next complete value.
    pub fn read_value(&mut self) -> AmqpResult<Value> {
        let constructor = self.read_u8()?;
        if constructor == code::DESCRIBED {
            if self.depth >= MAX_NESTING {
                return Err(AmqpError::decode("nesting too deep"));
            }
            self.depth += 1;
            let described = self.read_value().and_then(|descriptor| {
                let value = self.read_value()?;
                Ok(Value::Described(Box::new(descriptor), Box::new(value)))
            });
            self.depth -= 1;
            return described;
        }
        self.read_payload(constructor)
    }

    fn read_payload(&mut self, constructor: u8) -> AmqpResult<Value> {
        let value = match constructor {
            code::NULL => Value::Null,
            code::TRUE => Value::Bool(true),
            code::FALSE => Value::Bool(false),
            code::BOOLEAN => Value::Bool(self.read_u8()? != 0),
            code::UINT0 => Value::Uint(0),
            code::ULONG0 => Value::Ulong(0),
            code::LIST0 => Value::List(Vec::new()),
            code::UBYTE => Value::Ubyte(self.read_u8()?),
            code::BYTE => Value::Byte(self.read_u8()? as i8),
            code::SMALLUINT => Value::Uint(self.read_u8()? as u32),
            code::SMALLULONG => Value::Ulong(self.read_u8()? as u64),
            code::SMALLINT => Value::Int(self.read_u8()? as i8 as i32),
            code::SMALLLONG => Value::Long(self.read_u8()? as i8 as i64),
            code::USHORT => Value::Ushort(self.read_u16()?),
            code::SHORT => Value::Short(self.read_u16()? as i16),
            code::UINT => Value::Uint(self.read_u32()?),
            code::INT => Value::Int(self.read_u32()? as i32),
            code::FLOAT => Value::Float(f32::from_bits(self.read_u32()?)),
            code::CHAR => {
                let raw = self.read_u32()?;
                Value::Char(
                    char::from_u32(raw)
                        .ok_or_else(|| AmqpError::decode(format!("invalid char {raw:#x}")))?,
                )
            }
            code::ULONG => Value::Ulong(self.read_u64()?),
            code::LONG => Value::Long(self.read_u64()? as i64),
            code::DOUBLE => Value::Double(f64::from_bits(self.read_u64()?)),
            code::TIMESTAMP => Value::Timestamp(self.read_u64()? as i64),
            code::DECIMAL32 | code::DECIMAL64 | code::DECIMAL128 => {
                return Err(AmqpError::decode("decimal types are not supported"))
            }
            code::UUID => Value::Uuid(self.array()?),
            code::VBIN8 => {
                let len = self.read_u8()? as usize;
                Value::Binary(Bytes::copy_from_slice(self.take(len)?))
            }
            code::VBIN32 => {
                let len = self.read_u32()? as usize;
                Value::Binary(Bytes::copy_from_slice(self.take(len)?))
            }
            code::STR8 | code::SYM8 => {
                let len = self.read_u8()? as usize;
                self.read_text(constructor == code::SYM8, len)?
            }
            code::STR32 | code::SYM32 => {
                let len = self.read_u32()? as usize;
                self.read_text(constructor == code::SYM32, len)?
            }
            code::LIST8 | code::LIST32 | code::MAP8 | code::MAP32 => {
                let wide = matches!(constructor, code::LIST32 | code::MAP32);
                let (size, count) = self.read_size_count(wide)?;
                let body = self.take(size)?;
                let mut inner = self.child(body)?;
                let mut items = Vec::with_capacity(count.min(body.len()));
                for _ in 0..count {
                    items.push(inner.read_value()?);
                }
                if matches!(constructor, code::MAP8 | code::MAP32) {
                    if items.len() % 2 != 0 {
                        return Err(AmqpError::decode("map with odd element count"));
                    }
                    let mut entries = Vec::with_capacity(items.len() / 2);
                    let mut it = items.into_iter();
                    while let (Some(k), Some(v)) = (it.next(), it.next()) {
                        entries.push((k, v));
                    }
                    Value::Map(entries)
                } else {
                    Value::List(items)
                }
            }
            code::ARRAY8 | code::ARRAY32 => {
                let (size, count) = self.read_size_count(constructor == code::ARRAY32)?;
                let body = self.take(size)?;
                let mut inner = self.child(body)?;
                let mut element = inner.read_u8()?;
                let mut descriptor = None;
                if element == code::DESCRIBED {
                    descriptor = Some(inner.read_value()?);
                    element = inner.read_u8()?;
                }
                let mut items = Vec::with_capacity(count.min(body.len()));
                for _ in 0..count {
                    let item = inner.read_payload(element)?;
                    items.push(match &descriptor {
                        Some(d) => Value::Described(Box::new(d.clone()), Box::new(item)),
                        None => item,
                    });
                }
                Value::Array(items)
            }
            other => {
                return Err(AmqpError::decode(format!(
                    "unknown constructor {other:#04x}"
                )))
            }
        };
        Ok(value)
    }

    /// Size and count of a compound; `size` excludes the count field.
    fn read_size_count(&mut self, wide: bool) -> AmqpResult<(usize, usize)> {
        if wide {
            let size = self.read_u32()? as usize;
            let count = self.read_u32()? as usize;
            let size = size
                .checked_sub(4)
                .ok_or_else(|| AmqpError::decode("compound size smaller than count field"))?;
            Ok((size, count))
        } else {
            let size = self.read_u8()? as usize;
            let count = self.read_u8()? as usize;
            let size = size
                .checked_sub(1)
                .ok_or_else(|| AmqpError::decode("compound size smaller than count field"))?;
            Ok((size, count))
        }
    }

    fn read_text(&mut self, symbol: bool, len: usize) -> AmqpResult<Value> {
        let raw = self.take(len)?;
        let text = std::str::from_utf8(raw)
            .map_err(|e| AmqpError::decode(format!("invalid utf-8: {e}")))?
            .to_string();
        Ok(if symbol {
            Value::Symbol(text)
        } else {
            Value::String(text)
        })
    }
}

/// Decodes exactly one value from `data`.
pub fn decode(data: &[u8]) -> AmqpResult<Value> {
    Reader::new(data).read_value()
}
