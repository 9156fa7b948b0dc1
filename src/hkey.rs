//! hKeys: ordered byte keys identifying a row's position in its group.
//!
//! An hKey is the concatenation of one segment per table on the row's
//! ancestor chain, root first. Each segment is the table's group ordinal
//! followed by the order-preserving encodings of that table's primary-key
//! values. Two properties the engine leans on:
//!
//! - byte-lexicographic order over hKeys equals group scan order, and
//! - a parent row's hKey is a strict byte prefix of its children's.
//!
//! Numeric values encode by magnitude regardless of INT vs BIGINT width,
//! so a PK widening cast does not move a row within its group.

use std::fmt;

use chrono::NaiveDate;

use crate::types::Value;

const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_NUMBER: u8 = 0x03;
const TAG_DOUBLE: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;

/// An ordered byte key within a group.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HKey(Vec<u8>);

impl HKey {
    pub fn empty() -> Self {
        HKey(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        HKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append one segment: the table's group ordinal plus its PK values.
    pub fn push_segment(&mut self, ordinal: u8, pk_values: &[Value]) {
        self.0.push(ordinal);
        for v in pk_values {
            encode_value(&mut self.0, v);
        }
    }

    /// Build a single-segment key for a root-table row.
    pub fn for_root(ordinal: u8, pk_values: &[Value]) -> Self {
        let mut key = HKey::empty();
        key.push_segment(ordinal, pk_values);
        key
    }

    /// Whether `self` is an ancestor prefix of `other`.
    pub fn is_prefix_of(&self, other: &HKey) -> bool {
        other.0.len() > self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Debug for HKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HKey({self})")
    }
}

impl fmt::Display for HKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ── Value encoding ─────────────────────────────────────────────────────────

/// Append the order-preserving encoding of one value.
///
/// Every encoding is self-delimiting, so concatenated values parse (and
/// compare) unambiguously and a shorter key is a prefix of any key it
/// leads.
pub fn encode_value(out: &mut Vec<u8>, v: &Value) {
    match v {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Int(i) => encode_number(out, i64::from(*i)),
        Value::BigInt(i) => encode_number(out, *i),
        Value::Double(d) => {
            out.push(TAG_DOUBLE);
            let bits = d.to_bits();
            // Flip to total order: negatives invert fully, positives set
            // the sign bit.
            let ordered = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        Value::Text(s) => {
            out.push(TAG_TEXT);
            for &b in s.as_bytes() {
                if b == 0x00 {
                    // Escape embedded NUL so the terminator stays unique.
                    out.push(0x00);
                    out.push(0xFF);
                } else {
                    out.push(b);
                }
            }
            out.push(0x00);
        }
        Value::Date(d) => encode_number(out, days_since_epoch(*d)),
        Value::Timestamp(ts) => encode_number(out, ts.timestamp_micros()),
    }
}

fn encode_number(out: &mut Vec<u8>, i: i64) {
    out.push(TAG_NUMBER);
    let offset = (i as u64) ^ (1 << 63);
    out.extend_from_slice(&offset.to_be_bytes());
}

fn days_since_epoch(d: NaiveDate) -> i64 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch is valid");
    (d - epoch).num_days()
}
