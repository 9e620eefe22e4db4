//! Little-endian binary encoding of tag trees.
//!
//! Layout: `[type:u8][name_len:u16_le][name][payload]`, compounds terminated
//! by TAG_End (0), arrays and lists prefixed with an `i32_le` length.

use bytes::{Buf, BufMut};

use crate::error::NbtError;
use crate::tag::{NbtCompound, NbtRoot, NbtTag};

/// Maximum nesting depth accepted when reading.
pub const MAX_DEPTH: usize = 512;

const TAG_END: u8 = 0;
const TAG_COMPOUND: u8 = 10;

// ─── Reading ────────────────────────────────────────────────────────────────

pub(crate) fn read_root(buf: &mut impl Buf) -> Result<NbtRoot, NbtError> {
    let tag_type = take_u8(buf)?;
    if tag_type != TAG_COMPOUND {
        return Err(NbtError::ExpectedCompound { got: tag_type });
    }
    let name = read_string(buf)?;
    let compound = read_compound(buf, 0)?;
    Ok(NbtRoot { name, compound })
}

fn read_payload(buf: &mut impl Buf, tag_type: u8, depth: usize) -> Result<NbtTag, NbtError> {
    if depth > MAX_DEPTH {
        return Err(NbtError::NestingTooDeep { limit: MAX_DEPTH });
    }

    let tag = match tag_type {
        1 => NbtTag::Byte(take_u8(buf)? as i8),
        2 => {
            need(buf, 2)?;
            NbtTag::Short(buf.get_i16_le())
        }
        3 => NbtTag::Int(take_i32(buf)?),
        4 => {
            need(buf, 8)?;
            NbtTag::Long(buf.get_i64_le())
        }
        5 => {
            need(buf, 4)?;
            NbtTag::Float(buf.get_f32_le())
        }
        6 => {
            need(buf, 8)?;
            NbtTag::Double(buf.get_f64_le())
        }
        7 => {
            let len = take_len(buf)?;
            need(buf, len)?;
            let bytes = buf.copy_to_bytes(len);
            NbtTag::ByteArray(bytes.iter().map(|&b| b as i8).collect())
        }
        8 => NbtTag::String(read_string(buf)?),
        9 => {
            let element_type = take_u8(buf)?;
            let len = take_len(buf)?;
            // Every element takes at least one byte unless the list is typed TAG_End.
            if element_type != TAG_END {
                need(buf, len)?;
            }
            let mut list = Vec::with_capacity(len);
            for _ in 0..len {
                list.push(read_payload(buf, element_type, depth + 1)?);
            }
            NbtTag::List(list)
        }
        10 => NbtTag::Compound(read_compound(buf, depth + 1)?),
        11 => {
            let len = take_len(buf)?;
            need(buf, len.saturating_mul(4))?;
            NbtTag::IntArray((0..len).map(|_| buf.get_i32_le()).collect())
        }
        12 => {
            let len = take_len(buf)?;
            need(buf, len.saturating_mul(8))?;
            NbtTag::LongArray((0..len).map(|_| buf.get_i64_le()).collect())
        }
        other => return Err(NbtError::UnknownTagType(other)),
    };
    Ok(tag)
}

fn read_compound(buf: &mut impl Buf, depth: usize) -> Result<NbtCompound, NbtError> {
    if depth > MAX_DEPTH {
        return Err(NbtError::NestingTooDeep { limit: MAX_DEPTH });
    }
    let mut map = NbtCompound::new();
    loop {
        let tag_type = take_u8(buf)?;
        if tag_type == TAG_END {
            return Ok(map);
        }
        let name = read_string(buf)?;
        let tag = read_payload(buf, tag_type, depth)?;
        map.insert(name, tag);
    }
}

fn read_string(buf: &mut impl Buf) -> Result<String, NbtError> {
    need(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    need(buf, len)?;
    let data = buf.copy_to_bytes(len);
    String::from_utf8(data.to_vec()).map_err(|_| NbtError::InvalidUtf8)
}

fn take_u8(buf: &mut impl Buf) -> Result<u8, NbtError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_i32(buf: &mut impl Buf) -> Result<i32, NbtError> {
    need(buf, 4)?;
    Ok(buf.get_i32_le())
}

fn take_len(buf: &mut impl Buf) -> Result<usize, NbtError> {
    let len = take_i32(buf)?;
    usize::try_from(len).map_err(|_| NbtError::NegativeLength(len))
}

fn need(buf: &impl Buf, needed: usize) -> Result<(), NbtError> {
    if buf.remaining() < needed {
        Err(NbtError::UnexpectedEof)
    } else {
        Ok(())
    }
}

// ─── Writing ────────────────────────────────────────────────────────────────

pub(crate) fn write_root(buf: &mut impl BufMut, root: &NbtRoot) -> Result<(), NbtError> {
    buf.put_u8(TAG_COMPOUND);
    write_string(buf, &root.name)?;
    write_compound(buf, &root.compound)
}

fn write_payload(buf: &mut impl BufMut, tag: &NbtTag) -> Result<(), NbtError> {
    match tag {
        NbtTag::Byte(v) => buf.put_i8(*v),
        NbtTag::Short(v) => buf.put_i16_le(*v),
        NbtTag::Int(v) => buf.put_i32_le(*v),
        NbtTag::Long(v) => buf.put_i64_le(*v),
        NbtTag::Float(v) => buf.put_f32_le(*v),
        NbtTag::Double(v) => buf.put_f64_le(*v),
        NbtTag::ByteArray(arr) => {
            put_len(buf, arr.len())?;
            for &b in arr {
                buf.put_i8(b);
            }
        }
        NbtTag::String(s) => write_string(buf, s)?,
        NbtTag::List(list) => {
            let element_type = list.first().map_or(TAG_END, NbtTag::tag_type_id);
            if let Some(odd) = list.iter().find(|t| t.tag_type_id() != element_type) {
                return Err(NbtError::MixedList {
                    expected: element_type,
                    found: odd.tag_type_id(),
                });
            }
            buf.put_u8(element_type);
            put_len(buf, list.len())?;
            for item in list {
                write_payload(buf, item)?;
            }
        }
        NbtTag::Compound(map) => write_compound(buf, map)?,
        NbtTag::IntArray(arr) => {
            put_len(buf, arr.len())?;
            for &v in arr {
                buf.put_i32_le(v);
            }
        }
        NbtTag::LongArray(arr) => {
            put_len(buf, arr.len())?;
            for &v in arr {
                buf.put_i64_le(v);
            }
        }
    }
    Ok(())
}

fn write_compound(buf: &mut impl BufMut, map: &NbtCompound) -> Result<(), NbtError> {
    for (name, tag) in map {
        buf.put_u8(tag.tag_type_id());
        write_string(buf, name)?;
        write_payload(buf, tag)?;
    }
    buf.put_u8(TAG_END);
    Ok(())
}

fn write_string(buf: &mut impl BufMut, s: &str) -> Result<(), NbtError> {
    let len = u16::try_from(s.len()).map_err(|_| NbtError::StringTooLong { len: s.len() })?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_len(buf: &mut impl BufMut, len: usize) -> Result<(), NbtError> {
    let len32 = i32::try_from(len).map_err(|_| NbtError::ArrayTooLong { len })?;
    buf.put_i32_le(len32);
    Ok(())
}
