//! Schema-driven decode and encode.
//!
//! `decode` walks a schema against one MSB-first bit cursor; `encode` is its
//! exact inverse. Trailing bits past the schema are never read, and
//! `encode_onto` leaves them untouched.

use tracing::debug;

use crate::buffer::{BitWriter, ByteBuffer};
use crate::schema::{DecodedFieldMap, Field, FieldValue};
use crate::types::{FareError, Result};

fn key(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}")
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a ByteBuffer,
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, bits: u32, field: &str) -> Result<u64> {
        let needed = self.pos + bits as usize;
        if needed > self.buf.bit_len() {
            return Err(FareError::SchemaOverrun {
                field: field.to_string(),
                needed,
                available: self.buf.bit_len(),
            });
        }
        let value = self.buf.bits_at(self.pos, bits as usize)?;
        self.pos = needed;
        Ok(value)
    }
}

/// Apply `schema` to `buf`.
///
/// Fails with `SchemaOverrun` as soon as a field would read past the end of
/// the buffer.
pub fn decode(schema: &[Field], buf: &ByteBuffer) -> Result<DecodedFieldMap> {
    let mut cursor = Cursor { buf, pos: 0 };
    let mut out = DecodedFieldMap::new();
    decode_fields(schema, "", &mut cursor, &mut out)?;
    Ok(out)
}

fn decode_fields(
    fields: &[Field],
    prefix: &str,
    cursor: &mut Cursor<'_>,
    out: &mut DecodedFieldMap,
) -> Result<()> {
    for field in fields {
        decode_field(field, prefix, cursor, out)?;
    }
    Ok(())
}

fn decode_field(
    field: &Field,
    prefix: &str,
    cursor: &mut Cursor<'_>,
    out: &mut DecodedFieldMap,
) -> Result<()> {
    match *field {
        Field::Int { name, bits } => {
            let k = key(prefix, name);
            let v = cursor.take(bits, &k)?;
            out.insert(k, FieldValue::Int(v));
        }
        Field::Bcd { name, digits } => {
            let k = key(prefix, name);
            let v = cursor.take(digits * 4, &k)?;
            out.insert(k, FieldValue::Bcd(v));
        }
        Field::Flags { name, bits } => {
            let k = key(prefix, name);
            let v = cursor.take(bits, &k)?;
            out.insert(k, FieldValue::Flags(v));
        }
        Field::Text {
            name,
            chars,
            charset,
        } => {
            let k = key(prefix, name);
            let mut s = String::with_capacity(chars as usize);
            for _ in 0..chars {
                let code = cursor.take(charset.width(), &k)?;
                s.push(charset.decode(code as u8));
            }
            out.insert(k, FieldValue::Text(s));
        }
        Field::Date { name, bits } => {
            let k = key(prefix, name);
            let v = cursor.take(bits, &k)?;
            out.insert(k, FieldValue::Date(v));
        }
        Field::Time { name, bits } => {
            let k = key(prefix, name);
            let v = cursor.take(bits, &k)?;
            out.insert(k, FieldValue::Time(v));
        }
        Field::DateTime {
            name,
            date_bits,
            time_bits,
        } => {
            let k = key(prefix, name);
            let days = cursor.take(date_bits, &k)?;
            let minutes = cursor.take(time_bits, &k)?;
            out.insert(k, FieldValue::DateTime { days, minutes });
        }
        Field::Unknown { name, bits } => {
            let k = key(prefix, name);
            let v = cursor.take(bits, &k)?;
            out.insert(k, FieldValue::Unknown(v));
        }
        Field::Group { fields } => decode_fields(fields, prefix, cursor, out)?,
        Field::Repeat {
            name,
            count,
            fields,
        } => {
            for i in 0..count {
                let nested = format!("{prefix}{name}.{i}.");
                decode_fields(fields, &nested, cursor, out)?;
            }
        }
        Field::Variant { on, arms, default } => {
            let k = key(prefix, on);
            let value = out
                .int(&k)
                .ok_or_else(|| FareError::MissingField(k.clone()))?;
            let arm = select_arm(arms, default, &k, value)?;
            decode_fields(arm, prefix, cursor, out)?;
        }
        Field::Bitmap { name, fields } => {
            let k = format!("{prefix}{name}Bitmap");
            let mask = cursor.take(fields.len() as u32, &k)?;
            out.insert(k, FieldValue::Flags(mask));
            for (i, child) in fields.iter().enumerate() {
                if (mask >> i) & 1 == 1 {
                    decode_field(child, prefix, cursor, out)?;
                }
            }
        }
    }
    Ok(())
}

fn select_arm(
    arms: &'static [(u64, &'static [Field])],
    default: Option<&'static [Field]>,
    field: &str,
    value: u64,
) -> Result<&'static [Field]> {
    if let Some((_, arm)) = arms.iter().find(|(v, _)| *v == value) {
        return Ok(arm);
    }
    match default {
        Some(arm) => {
            debug!(field, value, "no dedicated layout, using default arm");
            Ok(arm)
        }
        None => Err(FareError::UnknownVariant {
            field: field.to_string(),
            value,
        }),
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode `map` with `schema` into a fresh, zero-padded buffer.
pub fn encode(schema: &[Field], map: &DecodedFieldMap) -> Result<ByteBuffer> {
    let mut w = BitWriter::new();
    encode_fields(schema, "", map, &mut w)?;
    Ok(w.finish())
}

/// Encode `map` over a copy of `original`. Bits the schema does not cover keep
/// their original values.
pub fn encode_onto(
    schema: &[Field],
    map: &DecodedFieldMap,
    original: &ByteBuffer,
) -> Result<ByteBuffer> {
    let mut w = BitWriter::over(original);
    encode_fields(schema, "", map, &mut w)?;
    Ok(w.finish())
}

fn encode_fields(
    fields: &[Field],
    prefix: &str,
    map: &DecodedFieldMap,
    w: &mut BitWriter,
) -> Result<()> {
    for field in fields {
        encode_field(field, prefix, map, w)?;
    }
    Ok(())
}

fn put(w: &mut BitWriter, field: &str, value: u64, bits: u32) -> Result<()> {
    if bits < 64 && value >> bits != 0 {
        return Err(FareError::ValueTooWide {
            field: field.to_string(),
            value,
            bits,
        });
    }
    w.write(value, bits);
    Ok(())
}

fn encode_field(
    field: &Field,
    prefix: &str,
    map: &DecodedFieldMap,
    w: &mut BitWriter,
) -> Result<()> {
    match *field {
        Field::Int { name, bits }
        | Field::Flags { name, bits }
        | Field::Date { name, bits }
        | Field::Time { name, bits }
        | Field::Unknown { name, bits } => {
            let k = key(prefix, name);
            put(w, &k, map.require(&k)?, bits)?;
        }
        Field::Bcd { name, digits } => {
            let k = key(prefix, name);
            put(w, &k, map.require(&k)?, digits * 4)?;
        }
        Field::Text {
            name,
            chars,
            charset,
        } => {
            let k = key(prefix, name);
            let text = map
                .text(&k)
                .ok_or_else(|| FareError::MissingField(k.clone()))?;
            let mut written = 0;
            for c in text.chars() {
                let code = charset.encode(c).ok_or_else(|| FareError::ValueTooWide {
                    field: k.clone(),
                    value: c as u64,
                    bits: charset.width(),
                })?;
                if written == chars {
                    return Err(FareError::ValueTooWide {
                        field: k.clone(),
                        value: text.chars().count() as u64,
                        bits: chars * charset.width(),
                    });
                }
                w.write(code as u64, charset.width());
                written += 1;
            }
            for _ in written..chars {
                w.write(0, charset.width());
            }
        }
        Field::DateTime {
            name,
            date_bits,
            time_bits,
        } => {
            let k = key(prefix, name);
            let (days, minutes) = map
                .date_time(&k)
                .ok_or_else(|| FareError::MissingField(k.clone()))?;
            put(w, &k, days, date_bits)?;
            put(w, &k, minutes, time_bits)?;
        }
        Field::Group { fields } => encode_fields(fields, prefix, map, w)?,
        Field::Repeat {
            name,
            count,
            fields,
        } => {
            for i in 0..count {
                let nested = format!("{prefix}{name}.{i}.");
                encode_fields(fields, &nested, map, w)?;
            }
        }
        Field::Variant { on, arms, default } => {
            let k = key(prefix, on);
            let arm = select_arm(arms, default, &k, map.require(&k)?)?;
            encode_fields(arm, prefix, map, w)?;
        }
        Field::Bitmap { name, fields } => {
            let k = format!("{prefix}{name}Bitmap");
            let mask = match map.int(&k) {
                Some(mask) => mask,
                None => fields
                    .iter()
                    .enumerate()
                    .filter(|(_, child)| is_present(child, prefix, map))
                    .fold(0u64, |acc, (i, _)| acc | (1 << i)),
            };
            put(w, &k, mask, fields.len() as u32)?;
            for (i, child) in fields.iter().enumerate() {
                if (mask >> i) & 1 == 1 {
                    encode_field(child, prefix, map, w)?;
                }
            }
        }
    }
    Ok(())
}

/// Whether a bitmap child has any value in `map`.
fn is_present(field: &Field, prefix: &str, map: &DecodedFieldMap) -> bool {
    match *field {
        Field::Int { name, .. }
        | Field::Bcd { name, .. }
        | Field::Flags { name, .. }
        | Field::Text { name, .. }
        | Field::Date { name, .. }
        | Field::Time { name, .. }
        | Field::DateTime { name, .. }
        | Field::Unknown { name, .. } => map.contains(&key(prefix, name)),
        Field::Group { fields } => fields.iter().any(|f| is_present(f, prefix, map)),
        Field::Repeat { name, .. } => {
            let nested = format!("{prefix}{name}.0.");
            map.iter().any(|(n, _)| n.starts_with(&nested))
        }
        Field::Variant { .. } => false,
        Field::Bitmap { name, .. } => map.contains(&format!("{prefix}{name}Bitmap")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{schema_width, Charset};

    const EVERY_LEAF: &[Field] = &[
        Field::int("Version", 3),
        Field::bcd("Network", 5),
        Field::flags("Code", 8),
        Field::text("Name", 4, Charset::Alpha5),
        Field::text("Label", 2, Charset::Latin1),
        Field::date("Day", 14),
        Field::time("Minute", 11),
        Field::date_time("Event", 14, 11),
        Field::unknown("Mystery", 7),
        Field::repeat("Counter", 2, &[Field::int("Value", 24)]),
    ];

    const ARM_ONE: &[Field] = &[Field::int("Route", 8), Field::int("Stop", 8)];
    const ARM_TWO: &[Field] = &[Field::text("Tag", 2, Charset::Latin1)];
    const VARIANT: &[Field] = &[
        Field::int("Type", 8),
        Field::variant("Type", &[(1, ARM_ONE), (2, ARM_TWO)], Some(&[])),
    ];

    const WITH_BITMAP: &[Field] = &[
        Field::int("Head", 4),
        Field::bitmap(
            "Extra",
            &[
                Field::int("A", 8),
                Field::date("B", 14),
                Field::int("C", 4),
            ],
        ),
    ];

    fn buf(hex: &str) -> ByteBuffer {
        ByteBuffer::from_hex(hex).unwrap()
    }

    /// Deterministic pseudo-random bytes.
    fn noise(len: usize, seed: u32) -> ByteBuffer {
        let mut x = seed.wrapping_mul(2654435761).wrapping_add(1);
        let bytes = (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x >> 8) as u8
            })
            .collect::<Vec<u8>>();
        ByteBuffer::new(bytes)
    }

    #[test]
    fn test_every_leaf_roundtrips() {
        let width = schema_width(EVERY_LEAF).unwrap() as usize;
        assert_eq!(width, 3 + 20 + 8 + 20 + 16 + 14 + 11 + 25 + 7 + 48);
        // Pad to whole bytes; the pad bits are outside the schema.
        let len = width.div_ceil(8);
        for seed in 0..32 {
            let original = noise(len, seed);
            let map = decode(EVERY_LEAF, &original).unwrap();
            let out = encode_onto(EVERY_LEAF, &map, &original).unwrap();
            assert_eq!(out, original, "seed {seed}");
        }
    }

    #[test]
    fn test_exact_width_roundtrip_with_fresh_buffer() {
        const BYTE_WIDE: &[Field] = &[
            Field::int("A", 12),
            Field::unknown("B", 4),
            Field::date_time("C", 14, 10),
        ];
        let original = buf("abcdef0123");
        let map = decode(BYTE_WIDE, &original).unwrap();
        assert_eq!(encode(BYTE_WIDE, &map).unwrap(), original);
    }

    #[test]
    fn test_decode_values() {
        const LAYOUT: &[Field] = &[
            Field::int("High", 4),
            Field::bcd("Digits", 3),
            Field::time("Minute", 12),
        ];
        let map = decode(LAYOUT, &buf("a1230465")).unwrap();
        assert_eq!(map.get("High"), Some(&FieldValue::Int(0xA)));
        assert_eq!(map.get("Digits").and_then(FieldValue::bcd_decimal), Some(123));
        assert_eq!(map.get("Minute"), Some(&FieldValue::Time(0x046)));
        let names: Vec<&str> = map.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["High", "Digits", "Minute"]);
    }

    #[test]
    fn test_zero_buffer_decodes_to_zero() {
        let width = schema_width(EVERY_LEAF).unwrap() as usize;
        let map = decode(EVERY_LEAF, &ByteBuffer::zeroed(width.div_ceil(8))).unwrap();
        assert_eq!(map.int("Version"), Some(0));
        assert_eq!(map.get("Day"), Some(&FieldValue::Date(0)));
        assert_eq!(map.date_time("Event"), Some((0, 0)));
        assert_eq!(map.int("Counter.1.Value"), Some(0));
        assert_eq!(map.text("Name"), Some("    "));

        // A zero day count is the epoch itself, with either precision.
        use crate::timestamp::{ymd, Clock, SubDayUnit, Timestamp};
        let clock = Clock::new(ymd(1997, 1, 1), chrono_tz::Europe::Lisbon, SubDayUnit::Minute);
        let day = map.int("Day").unwrap();
        assert_eq!(clock.day(day).unwrap(), Timestamp::Day(clock.epoch()));
        let (days, minutes) = map.date_time("Event").unwrap();
        let event = clock.date_time(days, minutes).unwrap();
        assert_eq!(event.date(), clock.epoch());
        assert_eq!(event.to_string(), "1997-01-01 00:00 +00:00");
    }

    #[test]
    fn test_overrun_names_field() {
        let err = decode(EVERY_LEAF, &buf("ffff")).unwrap_err();
        match err {
            FareError::SchemaOverrun {
                field,
                needed,
                available,
            } => {
                assert_eq!(field, "Network");
                assert_eq!(needed, 23);
                assert_eq!(available, 16);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_trailing_bits_ignored() {
        const SHORT: &[Field] = &[Field::int("A", 8)];
        let map = decode(SHORT, &buf("01ffffff")).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(encode(SHORT, &map).unwrap().hex(), "01");
        assert_eq!(
            encode_onto(SHORT, &map.with("A", FieldValue::Int(2)), &buf("01ffffff"))
                .unwrap()
                .hex(),
            "02ffffff"
        );
    }

    #[test]
    fn test_variant_selects_arm() {
        let one = decode(VARIANT, &buf("011234")).unwrap();
        assert_eq!(one.int("Route"), Some(0x12));
        assert_eq!(one.int("Stop"), Some(0x34));

        let two = decode(VARIANT, &buf("024142")).unwrap();
        assert_eq!(two.text("Tag"), Some("AB"));
        assert!(!two.contains("Route"));

        let other = decode(VARIANT, &buf("07")).unwrap();
        assert_eq!(other.len(), 1);

        for hex in ["011234", "024142"] {
            let original = buf(hex);
            let map = decode(VARIANT, &original).unwrap();
            assert_eq!(encode(VARIANT, &map).unwrap(), original);
        }
    }

    #[test]
    fn test_variant_without_default_rejects() {
        const STRICT: &[Field] = &[
            Field::int("Type", 8),
            Field::variant("Type", &[(1, ARM_ONE)], None),
        ];
        assert!(matches!(
            decode(STRICT, &buf("090000")),
            Err(FareError::UnknownVariant { value: 9, .. })
        ));
    }

    #[test]
    fn test_bitmap_gates_children() {
        // Head=0x1, mask=0b101 (A and C present): 0001 101 | A=0xAB | C=0x7
        let mut w = BitWriter::new();
        w.write(0x1, 4);
        w.write(0b101, 3);
        w.write(0xAB, 8);
        w.write(0x7, 4);
        let original = w.finish();

        let map = decode(WITH_BITMAP, &original).unwrap();
        assert_eq!(map.int("ExtraBitmap"), Some(0b101));
        assert_eq!(map.int("A"), Some(0xAB));
        assert!(!map.contains("B"));
        assert_eq!(map.int("C"), Some(0x7));
        assert_eq!(encode_onto(WITH_BITMAP, &map, &original).unwrap(), original);
    }

    #[test]
    fn test_bitmap_mask_derived_when_missing() {
        let map = DecodedFieldMap::new()
            .with("Head", FieldValue::Int(0))
            .with("B", FieldValue::Date(5));
        let out = encode(WITH_BITMAP, &map).unwrap();
        let back = decode(WITH_BITMAP, &out).unwrap();
        assert_eq!(back.int("ExtraBitmap"), Some(0b010));
        assert_eq!(back.get("B"), Some(&FieldValue::Date(5)));
    }

    #[test]
    fn test_encode_errors() {
        const LAYOUT: &[Field] = &[Field::int("A", 4), Field::text("T", 2, Charset::Alpha5)];
        let map = DecodedFieldMap::new();
        assert!(matches!(encode(LAYOUT, &map), Err(FareError::MissingField(_))));

        let wide = map
            .with("A", FieldValue::Int(16))
            .with("T", FieldValue::Text("AB".into()));
        assert!(matches!(
            encode(LAYOUT, &wide),
            Err(FareError::ValueTooWide { bits: 4, .. })
        ));

        let long = map
            .with("A", FieldValue::Int(1))
            .with("T", FieldValue::Text("ABC".into()));
        assert!(matches!(encode(LAYOUT, &long), Err(FareError::ValueTooWide { .. })));

        let short = map
            .with("A", FieldValue::Int(1))
            .with("T", FieldValue::Text("A".into()));
        let back = decode(LAYOUT, &encode(LAYOUT, &short).unwrap()).unwrap();
        assert_eq!(back.text("T"), Some("A "));
    }
}
