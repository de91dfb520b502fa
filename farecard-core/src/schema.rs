//! Declarative bit-layout schemas and the decoded field map.
//!
//! A schema is a `&'static [Field]` built from const constructors, consumed in
//! declaration order against one bit cursor. Leaves read a fixed number of bits;
//! compound nodes group, repeat, or pick a layout from an already-decoded sibling.

use std::collections::HashMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::types::{FareError, Result};

// ---------------------------------------------------------------------------
// Charsets
// ---------------------------------------------------------------------------

/// Character encodings used by string fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// One byte per character, ISO 8859-1.
    Latin1,
    /// Five bits per character over `ALPHA5`.
    Alpha5,
}

const ALPHA5: &[u8; 32] = b" ABCDEFGHIJKLMNOPQRSTUVWXYZ-./'?";

impl Charset {
    pub fn width(self) -> u32 {
        match self {
            Charset::Latin1 => 8,
            Charset::Alpha5 => 5,
        }
    }

    pub fn decode(self, code: u8) -> char {
        match self {
            Charset::Latin1 => code as char,
            Charset::Alpha5 => ALPHA5[(code & 0x1F) as usize] as char,
        }
    }

    pub fn encode(self, c: char) -> Option<u8> {
        match self {
            Charset::Latin1 => u8::try_from(c as u32).ok(),
            Charset::Alpha5 => ALPHA5.iter().position(|&a| a as char == c).map(|p| p as u8),
        }
    }
}

// ---------------------------------------------------------------------------
// Field descriptors
// ---------------------------------------------------------------------------

/// One node of a record schema.
#[derive(Debug, Clone, Copy)]
pub enum Field {
    /// Unsigned big-endian integer.
    Int { name: &'static str, bits: u32 },
    /// Packed decimal, four bits per digit.
    Bcd { name: &'static str, digits: u32 },
    /// Bitmask or enumerated code; decoded as raw bits.
    Flags { name: &'static str, bits: u32 },
    /// Fixed number of characters in the given charset.
    Text {
        name: &'static str,
        chars: u32,
        charset: Charset,
    },
    /// Day count from the family epoch.
    Date { name: &'static str, bits: u32 },
    /// Minute of day.
    Time { name: &'static str, bits: u32 },
    /// Day count followed by minute of day, stored under one key.
    DateTime {
        name: &'static str,
        date_bits: u32,
        time_bits: u32,
    },
    /// Bits whose meaning is not known. Kept so they survive re-encoding.
    Unknown { name: &'static str, bits: u32 },
    Group { fields: &'static [Field] },
    /// `count` copies of `fields`, keyed `Name.<i>.Child`.
    Repeat {
        name: &'static str,
        count: u32,
        fields: &'static [Field],
    },
    /// Layout chosen by the raw value of the sibling `on`.
    Variant {
        on: &'static str,
        arms: &'static [(u64, &'static [Field])],
        default: Option<&'static [Field]>,
    },
    /// Presence mask of `fields.len()` bits stored as `<name>Bitmap`; bit i
    /// (least significant first) gates child i.
    Bitmap {
        name: &'static str,
        fields: &'static [Field],
    },
}

impl Field {
    pub const fn int(name: &'static str, bits: u32) -> Field {
        Field::Int { name, bits }
    }

    pub const fn bcd(name: &'static str, digits: u32) -> Field {
        Field::Bcd { name, digits }
    }

    pub const fn flags(name: &'static str, bits: u32) -> Field {
        Field::Flags { name, bits }
    }

    pub const fn text(name: &'static str, chars: u32, charset: Charset) -> Field {
        Field::Text {
            name,
            chars,
            charset,
        }
    }

    pub const fn date(name: &'static str, bits: u32) -> Field {
        Field::Date { name, bits }
    }

    pub const fn time(name: &'static str, bits: u32) -> Field {
        Field::Time { name, bits }
    }

    pub const fn date_time(name: &'static str, date_bits: u32, time_bits: u32) -> Field {
        Field::DateTime {
            name,
            date_bits,
            time_bits,
        }
    }

    pub const fn unknown(name: &'static str, bits: u32) -> Field {
        Field::Unknown { name, bits }
    }

    pub const fn group(fields: &'static [Field]) -> Field {
        Field::Group { fields }
    }

    pub const fn repeat(name: &'static str, count: u32, fields: &'static [Field]) -> Field {
        Field::Repeat {
            name,
            count,
            fields,
        }
    }

    pub const fn variant(
        on: &'static str,
        arms: &'static [(u64, &'static [Field])],
        default: Option<&'static [Field]>,
    ) -> Field {
        Field::Variant { on, arms, default }
    }

    pub const fn bitmap(name: &'static str, fields: &'static [Field]) -> Field {
        Field::Bitmap { name, fields }
    }

    /// Fixed width in bits, or `None` when it depends on decoded data.
    pub fn width(&self) -> Option<u32> {
        match *self {
            Field::Int { bits, .. }
            | Field::Flags { bits, .. }
            | Field::Date { bits, .. }
            | Field::Time { bits, .. }
            | Field::Unknown { bits, .. } => Some(bits),
            Field::Bcd { digits, .. } => Some(digits * 4),
            Field::Text { chars, charset, .. } => Some(chars * charset.width()),
            Field::DateTime {
                date_bits,
                time_bits,
                ..
            } => Some(date_bits + time_bits),
            Field::Group { fields } => schema_width(fields),
            Field::Repeat { count, fields, .. } => schema_width(fields).map(|w| w * count),
            Field::Variant { arms, default, .. } => {
                let mut widths = arms
                    .iter()
                    .map(|(_, arm)| schema_width(arm))
                    .chain(default.map(schema_width));
                let first = widths.next()??;
                widths.all(|w| w == Some(first)).then_some(first)
            }
            Field::Bitmap { .. } => None,
        }
    }
}

/// Total fixed width of a schema in bits, when no part of it is data-dependent.
pub fn schema_width(fields: &[Field]) -> Option<u32> {
    fields.iter().try_fold(0u32, |acc, f| Some(acc + f.width()?))
}

// ---------------------------------------------------------------------------
// Decoded values
// ---------------------------------------------------------------------------

/// One decoded leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Int(u64),
    /// Raw nibbles; see `bcd_decimal`.
    Bcd(u64),
    Flags(u64),
    Text(String),
    Date(u64),
    Time(u64),
    DateTime { days: u64, minutes: u64 },
    /// Value of a field with unknown semantics.
    Unknown(u64),
}

impl FieldValue {
    /// The stored bits as an integer. `None` for text and date-time values.
    pub fn raw(&self) -> Option<u64> {
        match *self {
            FieldValue::Int(v)
            | FieldValue::Bcd(v)
            | FieldValue::Flags(v)
            | FieldValue::Date(v)
            | FieldValue::Time(v)
            | FieldValue::Unknown(v) => Some(v),
            FieldValue::Text(_) | FieldValue::DateTime { .. } => None,
        }
    }

    /// Decimal reading of a BCD value. `None` if any nibble is above 9.
    pub fn bcd_decimal(&self) -> Option<u64> {
        let FieldValue::Bcd(raw) = *self else {
            return None;
        };
        let mut out = 0u64;
        let mut scale = 1u64;
        let mut rest = raw;
        while rest > 0 {
            let digit = rest & 0xF;
            if digit > 9 {
                return None;
            }
            out += digit * scale;
            scale = scale.saturating_mul(10);
            rest >>= 4;
        }
        Some(out)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, FieldValue::Unknown(_))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Bcd(v) => write!(f, "{v:x}"),
            FieldValue::Flags(v) => write!(f, "{v:#x}"),
            FieldValue::Text(s) => write!(f, "{:?}", s.trim_end_matches(['\0', ' '])),
            FieldValue::Date(d) => write!(f, "day {d}"),
            FieldValue::Time(m) => write!(f, "{:02}:{:02}", m / 60, m % 60),
            FieldValue::DateTime { days, minutes } => {
                write!(f, "day {days} {:02}:{:02}", minutes / 60, minutes % 60)
            }
            FieldValue::Unknown(v) => write!(f, "?{v:#x}"),
        }
    }
}

/// Ordered name → value result of decoding one record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedFieldMap {
    entries: Vec<(String, FieldValue)>,
    /// Position of each name in `entries`.
    index: HashMap<String, usize>,
}

impl DecodedFieldMap {
    pub fn new() -> Self {
        DecodedFieldMap::default()
    }

    pub(crate) fn insert(&mut self, name: String, value: FieldValue) {
        match self.index.get(&name) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Raw integer value of a numeric field.
    pub fn int(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(FieldValue::raw)
    }

    pub fn int_or_zero(&self, name: &str) -> u64 {
        self.int(name).unwrap_or(0)
    }

    /// Like `int`, but a missing field is an error.
    pub fn require(&self, name: &str) -> Result<u64> {
        self.int(name)
            .ok_or_else(|| FareError::MissingField(name.to_string()))
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// `(days, minutes)` of a date-time field.
    pub fn date_time(&self, name: &str) -> Option<(u64, u64)> {
        match *self.get(name)? {
            FieldValue::DateTime { days, minutes } => Some((days, minutes)),
            _ => None,
        }
    }

    /// Copy with `name` set to `value` (replaced in place, or appended).
    pub fn with(&self, name: &str, value: FieldValue) -> DecodedFieldMap {
        let mut out = self.clone();
        out.insert(name.to_string(), value);
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Names of fields decoded from `Unknown` leaves.
    pub fn unknown_fields(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, v)| v.is_unknown())
            .map(|(n, _)| n)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for DecodedFieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
