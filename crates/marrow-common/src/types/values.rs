//! Column types, runtime values, and the on-disk comparison rules.
//!
//! Tuples are fixed-width byte buffers: every column occupies exactly
//! `len` bytes at a fixed offset. Integers and floats are little-endian;
//! strings are blank-padded to the column width. Comparison therefore
//! works on raw byte ranges, decoding per column type.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MarrowError, MarrowResult};

/// The type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColType {
    /// 32-bit signed integer, 4 bytes.
    Int,
    /// 64-bit float, 8 bytes.
    Float,
    /// Fixed-width string, blank-padded to the declared length.
    String,
}

impl ColType {
    /// The fixed byte width of numeric types; `None` for strings, whose
    /// width is declared per column.
    #[must_use]
    pub const fn fixed_len(self) -> Option<usize> {
        match self {
            ColType::Int => Some(4),
            ColType::Float => Some(8),
            ColType::String => None,
        }
    }
}

impl fmt::Display for ColType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColType::Int => write!(f, "INT"),
            ColType::Float => write!(f, "FLOAT"),
            ColType::String => write!(f, "CHAR"),
        }
    }
}

/// A runtime column value, as supplied by callers of the DML executors.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An integer value.
    Int(i32),
    /// A float value.
    Float(f64),
    /// A string value.
    Str(String),
}

impl Value {
    /// The column type this value belongs to.
    #[must_use]
    pub fn col_type(&self) -> ColType {
        match self {
            Value::Int(_) => ColType::Int,
            Value::Float(_) => ColType::Float,
            Value::Str(_) => ColType::String,
        }
    }

    /// Encodes the value into its fixed-width on-disk form.
    ///
    /// Strings shorter than `len` are blank-padded; longer strings are
    /// rejected. Numeric values ignore `len` beyond the sanity check.
    pub fn to_bytes(&self, len: usize) -> MarrowResult<Vec<u8>> {
        match self {
            Value::Int(v) => {
                if len != 4 {
                    return Err(MarrowError::internal(format!(
                        "INT column declared with length {len}"
                    )));
                }
                Ok(v.to_le_bytes().to_vec())
            }
            Value::Float(v) => {
                if len != 8 {
                    return Err(MarrowError::internal(format!(
                        "FLOAT column declared with length {len}"
                    )));
                }
                Ok(v.to_le_bytes().to_vec())
            }
            Value::Str(s) => {
                if s.len() > len {
                    return Err(MarrowError::StringOverflow {
                        len: s.len(),
                        max: len,
                    });
                }
                let mut buf = vec![b' '; len];
                buf[..s.len()].copy_from_slice(s.as_bytes());
                Ok(buf)
            }
        }
    }

    /// Decodes a value from its fixed-width on-disk form.
    ///
    /// String padding (blanks and NULs) is stripped.
    pub fn from_bytes(col_type: ColType, buf: &[u8]) -> MarrowResult<Value> {
        match col_type {
            ColType::Int => {
                let raw: [u8; 4] = buf
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| MarrowError::internal("short INT column"))?;
                Ok(Value::Int(i32::from_le_bytes(raw)))
            }
            ColType::Float => {
                let raw: [u8; 8] = buf
                    .get(..8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| MarrowError::internal("short FLOAT column"))?;
                Ok(Value::Float(f64::from_le_bytes(raw)))
            }
            ColType::String => {
                let s = String::from_utf8_lossy(buf);
                Ok(Value::Str(
                    s.trim_end_matches(|c| c == ' ' || c == '\0').to_string(),
                ))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Compares two single-column byte ranges under a column type.
///
/// Returns the ordering of `a` relative to `b`. `len` is the declared
/// column width and only matters for strings.
#[must_use]
pub fn ix_compare(a: &[u8], b: &[u8], col_type: ColType, len: usize) -> Ordering {
    match col_type {
        ColType::Int => {
            let lhs = i32::from_le_bytes([a[0], a[1], a[2], a[3]]);
            let rhs = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            lhs.cmp(&rhs)
        }
        ColType::Float => {
            let lhs = f64::from_le_bytes([a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]]);
            let rhs = f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            lhs.total_cmp(&rhs)
        }
        ColType::String => a[..len].cmp(&b[..len]),
    }
}

/// Compares two composite keys column by column.
///
/// `col_types` and `col_lens` describe the key layout; comparison stops
/// at the first column that differs.
#[must_use]
pub fn compare_keys(a: &[u8], b: &[u8], col_types: &[ColType], col_lens: &[usize]) -> Ordering {
    let mut offset = 0;
    for (&ty, &len) in col_types.iter().zip(col_lens.iter()) {
        let ord = ix_compare(&a[offset..], &b[offset..], ty, len);
        if ord != Ordering::Equal {
            return ord;
        }
        offset += len;
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip_and_compare() {
        let a = Value::Int(-5).to_bytes(4).unwrap();
        let b = Value::Int(3).to_bytes(4).unwrap();
        assert_eq!(ix_compare(&a, &b, ColType::Int, 4), Ordering::Less);
        assert_eq!(Value::from_bytes(ColType::Int, &a).unwrap(), Value::Int(-5));
    }

    #[test]
    fn float_compare() {
        let a = Value::Float(1.5).to_bytes(8).unwrap();
        let b = Value::Float(1.5).to_bytes(8).unwrap();
        assert_eq!(ix_compare(&a, &b, ColType::Float, 8), Ordering::Equal);
    }

    #[test]
    fn string_blank_padding() {
        let raw = Value::Str("ab".into()).to_bytes(8).unwrap();
        assert_eq!(raw.len(), 8);
        assert_eq!(&raw[..2], b"ab");
        assert!(raw[2..].iter().all(|&c| c == b' '));
        assert_eq!(
            Value::from_bytes(ColType::String, &raw).unwrap(),
            Value::Str("ab".into())
        );
    }

    #[test]
    fn string_overflow_rejected() {
        let err = Value::Str("toolong".into()).to_bytes(4).unwrap_err();
        assert!(matches!(err, MarrowError::StringOverflow { .. }));
    }

    #[test]
    fn composite_key_compare() {
        // (INT, CHAR(4)) composite keys.
        let types = [ColType::Int, ColType::String];
        let lens = [4usize, 4usize];

        let mut a = Value::Int(1).to_bytes(4).unwrap();
        a.extend(Value::Str("bb".into()).to_bytes(4).unwrap());
        let mut b = Value::Int(1).to_bytes(4).unwrap();
        b.extend(Value::Str("bc".into()).to_bytes(4).unwrap());

        assert_eq!(compare_keys(&a, &b, &types, &lens), Ordering::Less);
        assert_eq!(compare_keys(&a, &a, &types, &lens), Ordering::Equal);
    }
}
