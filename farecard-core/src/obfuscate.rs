//! Date shifting for sharing card dumps and decoded output.
//!
//! Records are decoded, every date and date-time day count is moved by the
//! same number of days, and the result is encoded back over the original so
//! every other bit stays as it was.

use crate::buffer::ByteBuffer;
use crate::codec::{decode, encode_onto};
use crate::schema::{Field, FieldValue};
use crate::timestamp::Timestamp;
use crate::types::{FareError, InfoValue, Result, TransitData};

fn shift(field: &str, days: u64, by: i64) -> Result<u64> {
    days.checked_add_signed(by)
        .ok_or_else(|| FareError::Timestamp(format!("{field}: day {days} shifted by {by}")))
}

/// Copy of `record` with every date field in `schema` moved by `days`.
pub fn shift_record_dates(schema: &[Field], record: &ByteBuffer, days: i64) -> Result<ByteBuffer> {
    let fields = decode(schema, record)?;
    let mut shifted = fields.clone();
    for (name, value) in fields.iter() {
        let moved = match *value {
            FieldValue::Date(d) => FieldValue::Date(shift(name, d, days)?),
            FieldValue::DateTime { days: d, minutes } => FieldValue::DateTime {
                days: shift(name, d, days)?,
                minutes,
            },
            _ => continue,
        };
        shifted = shifted.with(name, moved);
    }
    encode_onto(schema, &shifted, record)
}

fn shift_opt(ts: Option<Timestamp>, days: i64) -> Result<Option<Timestamp>> {
    ts.map(|t| t.shift_days(days)).transpose()
}

/// `data` with every trip, subscription and info-line date moved by `days`.
/// Precision tags are kept.
pub fn shift_transit_data(mut data: TransitData, days: i64) -> Result<TransitData> {
    for (_, value) in &mut data.info {
        if let InfoValue::Date(ts) = value {
            *ts = ts.shift_days(days)?;
        }
    }
    for trip in &mut data.trips {
        trip.start = shift_opt(trip.start, days)?;
        trip.end = shift_opt(trip.end, days)?;
    }
    for sub in &mut data.subscriptions {
        sub.valid_from = shift_opt(sub.valid_from, days)?;
        sub.valid_to = shift_opt(sub.valid_to, days)?;
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
