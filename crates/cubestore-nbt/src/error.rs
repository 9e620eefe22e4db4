//! Payload codec error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NbtError {
    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("expected TAG_Compound (10) at root, got {got}")]
    ExpectedCompound { got: u8 },

    #[error("unknown tag type: {0}")]
    UnknownTagType(u8),

    #[error("invalid UTF-8 in NBT string")]
    InvalidUtf8,

    #[error("nesting too deep (limit: {limit})")]
    NestingTooDeep { limit: usize },

    #[error("negative array length: {0}")]
    NegativeLength(i32),

    #[error("string of {len} bytes exceeds the u16 length prefix")]
    StringTooLong { len: usize },

    #[error("array of {len} elements exceeds the i32 length prefix")]
    ArrayTooLong { len: usize },

    #[error("list mixes tag types: expected {expected}, found {found}")]
    MixedList { expected: u8, found: u8 },
}
