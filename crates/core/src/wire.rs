//! Chunk wire format (optional on-disk cache)
//!
//! The format is explicitly versioned. Layout, all integers little-endian:
//!
//! ```text
//! magic        8  b"ALDERBC\0"
//! major        u16    incompatible changes
//! minor        u16    compatible additions
//! chunk        (recursive)
//! ```
//!
//! One chunk:
//!
//! ```text
//! arity u16, optional_count u16, has_rest u8, is_async u8,
//! name (len u16 + UTF-8),
//! code (len u32 + bytes),
//! constants (count u16, each: kind u8 + payload),
//! line table (pair count u32, each: count u32 + line u32),
//! upvalues (count u8, each: is_local u8 + index u8),
//! param types (count u16, each: tag u8; 0xFF = none),
//! return type u8 (0xFF = none),
//! local_count u16, max_stack u16
//! ```
//!
//! Constant kinds: 0 = i32 (4), 1 = i64 (8), 2 = f64 (8 bits of IEEE 754),
//! 3 = string (len u32 + UTF-8), 4 = function (recursive chunk),
//! 5 = identifier (len u32 + UTF-8). String hashes are not persisted; they
//! are recomputed on load.

use crate::chunk::{Chunk, Constant, LineRun, UpvalueDesc};
use crate::value::TypeTag;
use std::sync::Arc;

pub const MAGIC: [u8; 8] = *b"ALDERBC\0";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Nested function constants beyond this depth fail decoding; guards the
/// reader against crafted input recursing the host stack away.
const MAX_DEPTH: usize = 64;

const NO_TYPE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq)]
pub enum WireError {
    BadMagic,
    UnsupportedVersion { major: u16, minor: u16 },
    Truncated { at: usize },
    BadConstantKind(u8),
    BadTypeTag(u8),
    BadUtf8,
    TooDeep,
    TrailingBytes { remaining: usize },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::BadMagic => write!(f, "not an Alder bytecode file"),
            WireError::UnsupportedVersion { major, minor } => {
                write!(
                    f,
                    "unsupported bytecode version {}.{} (runtime speaks {}.{})",
                    major, minor, VERSION_MAJOR, VERSION_MINOR
                )
            }
            WireError::Truncated { at } => write!(f, "truncated bytecode at byte {}", at),
            WireError::BadConstantKind(kind) => write!(f, "unknown constant kind {}", kind),
            WireError::BadTypeTag(tag) => write!(f, "unknown type tag {}", tag),
            WireError::BadUtf8 => write!(f, "invalid UTF-8 in string constant"),
            WireError::TooDeep => write!(f, "function nesting exceeds decoder limit"),
            WireError::TrailingBytes { remaining } => {
                write!(f, "{} trailing bytes after top-level chunk", remaining)
            }
        }
    }
}

impl std::error::Error for WireError {}

// -- writing ------------------------------------------------------------

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str16(out: &mut Vec<u8>, s: &str) {
    put_u16(out, s.len().min(u16::MAX as usize) as u16);
    out.extend_from_slice(&s.as_bytes()[..s.len().min(u16::MAX as usize)]);
}

fn put_str32(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn write_chunk(out: &mut Vec<u8>, chunk: &Chunk) {
    put_u16(out, chunk.arity);
    put_u16(out, chunk.optional_count);
    out.push(chunk.has_rest as u8);
    out.push(chunk.is_async as u8);
    put_str16(out, &chunk.name);

    put_u32(out, chunk.code.len() as u32);
    out.extend_from_slice(&chunk.code);

    put_u16(out, chunk.constants.len() as u16);
    for constant in &chunk.constants {
        match constant {
            Constant::I32(v) => {
                out.push(0);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Constant::I64(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Constant::F64(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Constant::Str { text, .. } => {
                out.push(3);
                put_str32(out, text);
            }
            Constant::Func(inner) => {
                out.push(4);
                write_chunk(out, inner);
            }
            Constant::Ident(name) => {
                out.push(5);
                put_str32(out, name);
            }
        }
    }

    let runs = chunk.line_runs();
    put_u32(out, runs.len() as u32);
    for run in runs {
        put_u32(out, run.count);
        put_u32(out, run.line);
    }

    out.push(chunk.upvalues.len().min(u8::MAX as usize) as u8);
    for upvalue in &chunk.upvalues {
        out.push(upvalue.is_local as u8);
        out.push(upvalue.index);
    }

    put_u16(out, chunk.param_types.len() as u16);
    for ty in &chunk.param_types {
        out.push(ty.map(|t| t as u8).unwrap_or(NO_TYPE));
    }
    out.push(chunk.return_type.map(|t| t as u8).unwrap_or(NO_TYPE));

    put_u16(out, chunk.local_count);
    put_u16(out, chunk.max_stack);
}

/// Serialize a top-level chunk with the file header.
pub fn serialize(chunk: &Chunk) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + chunk.code.len());
    out.extend_from_slice(&MAGIC);
    put_u16(&mut out, VERSION_MAJOR);
    put_u16(&mut out, VERSION_MINOR);
    write_chunk(&mut out, chunk);
    out
}

// -- reading ------------------------------------------------------------

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Truncated { at: self.pos });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("take returned 8 bytes")))
    }

    fn str16(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadUtf8)
    }

    fn str32(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadUtf8)
    }
}

fn type_tag(byte: u8) -> Result<Option<TypeTag>, WireError> {
    if byte == NO_TYPE {
        return Ok(None);
    }
    TypeTag::from_u8(byte)
        .map(Some)
        .ok_or(WireError::BadTypeTag(byte))
}

fn read_chunk(cursor: &mut Cursor<'_>, depth: usize) -> Result<Chunk, WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep);
    }
    let arity = cursor.u16()?;
    let optional_count = cursor.u16()?;
    let has_rest = cursor.u8()? != 0;
    let is_async = cursor.u8()? != 0;
    let name = cursor.str16()?;

    let code_len = cursor.u32()? as usize;
    let code = cursor.take(code_len)?.to_vec();

    let const_count = cursor.u16()?;
    let mut constants = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        let kind = cursor.u8()?;
        constants.push(match kind {
            0 => {
                let b = cursor.take(4)?;
                Constant::I32(i32::from_le_bytes(b.try_into().expect("4 bytes")))
            }
            1 => {
                let b = cursor.take(8)?;
                Constant::I64(i64::from_le_bytes(b.try_into().expect("8 bytes")))
            }
            2 => Constant::F64(f64::from_bits(cursor.u64()?)),
            // Hash recomputed on load.
            3 => Constant::string(cursor.str32()?),
            4 => Constant::Func(Arc::new(read_chunk(cursor, depth + 1)?)),
            5 => Constant::Ident(cursor.str32()?),
            other => return Err(WireError::BadConstantKind(other)),
        });
    }

    let run_count = cursor.u32()? as usize;
    let mut runs = Vec::with_capacity(run_count.min(4096));
    for _ in 0..run_count {
        let count = cursor.u32()?;
        let line = cursor.u32()?;
        runs.push(LineRun { count, line });
    }

    let upvalue_count = cursor.u8()? as usize;
    let mut upvalues = Vec::with_capacity(upvalue_count);
    for _ in 0..upvalue_count {
        let is_local = cursor.u8()? != 0;
        let index = cursor.u8()?;
        upvalues.push(UpvalueDesc { is_local, index });
    }

    let param_count = cursor.u16()? as usize;
    let mut param_types = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        param_types.push(type_tag(cursor.u8()?)?);
    }
    let return_type = type_tag(cursor.u8()?)?;

    let local_count = cursor.u16()?;
    let max_stack = cursor.u16()?;

    let mut chunk = Chunk::new(name);
    chunk.arity = arity;
    chunk.optional_count = optional_count;
    chunk.has_rest = has_rest;
    chunk.is_async = is_async;
    chunk.code = code;
    chunk.constants = constants;
    chunk.set_line_runs(runs);
    chunk.upvalues = upvalues;
    chunk.param_types = param_types;
    chunk.return_type = return_type;
    chunk.local_count = local_count;
    chunk.max_stack = max_stack;
    Ok(chunk)
}

/// Deserialize a top-level chunk, validating header and consuming all input.
pub fn deserialize(data: &[u8]) -> Result<Chunk, WireError> {
    let mut cursor = Cursor { data, pos: 0 };
    if cursor.take(8)? != MAGIC {
        return Err(WireError::BadMagic);
    }
    let major = cursor.u16()?;
    let minor = cursor.u16()?;
    if major != VERSION_MAJOR {
        return Err(WireError::UnsupportedVersion { major, minor });
    }
    let chunk = read_chunk(&mut cursor, 0)?;
    if cursor.pos != data.len() {
        return Err(WireError::TrailingBytes {
            remaining: data.len() - cursor.pos,
        });
    }
    Ok(chunk)
}
