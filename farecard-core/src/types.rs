//! Shared types, error enum, and decoded domain objects for farecard-core.

use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::selector::Selector;
use crate::timestamp::Timestamp;
use crate::trips::RecordFault;

/// All errors produced by farecard-core.
#[derive(Debug, Error)]
pub enum FareError {
    #[error("read of {len} {unit} at offset {offset} exceeds buffer of {limit} {unit}")]
    Bounds {
        offset: usize,
        len: usize,
        limit: usize,
        unit: &'static str,
    },
    #[error("schema overrun at {field}: needs {needed} bits, record has {available}")]
    SchemaOverrun {
        field: String,
        needed: usize,
        available: usize,
    },
    #[error("{0} is not readable with the available keys")]
    Unauthorized(Selector),
    #[error("{0} is not present on the card")]
    Absent(Selector),
    #[error("unsupported card (inconclusive: {inconclusive:?})")]
    UnknownFormat { inconclusive: Vec<&'static str> },
    #[error("field {0} is missing")]
    MissingField(String),
    #[error("no layout for {field} = {value:#x}")]
    UnknownVariant { field: String, value: u64 },
    #[error("value {value:#x} does not fit {field} ({bits} bits)")]
    ValueTooWide { field: String, value: u64, bits: u32 },
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("timestamp out of range: {0}")]
    Timestamp(String),
    #[error("mandatory file {selector} failed: {source}")]
    Mandatory {
        selector: Selector,
        #[source]
        source: Box<FareError>,
    },
}

impl FareError {
    /// Wrap an error raised while reading a file the identified family cannot do without.
    pub fn mandatory(selector: &Selector, source: FareError) -> Self {
        FareError::Mandatory {
            selector: selector.clone(),
            source: Box::new(source),
        }
    }

    /// True for the "buffer shorter than the schema" signal.
    pub fn is_overrun(&self) -> bool {
        match self {
            FareError::SchemaOverrun { .. } => true,
            FareError::Mandatory { source, .. } => source.is_overrun(),
            _ => false,
        }
    }

    /// True when the file exists but could not be read, or was never read.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, FareError::Unauthorized(_) | FareError::Absent(_))
    }
}

impl Serialize for FareError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub type Result<T> = std::result::Result<T, FareError>;

// ---------------------------------------------------------------------------
// Hex utilities
// ---------------------------------------------------------------------------

/// Decode a hex string into bytes. Case-insensitive; spaces, `-` and `:` separators are skipped.
pub fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = hex
        .bytes()
        .filter(|c| !matches!(c, b' ' | b'\t' | b'-' | b':'))
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks(2) {
        let high = hex_digit(pair[0])?;
        let low = hex_digit(pair[1])?;
        bytes.push((high << 4) | low);
    }
    Some(bytes)
}

/// Encode bytes as lowercase hex.
pub fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for &b in data {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0x0F) as usize] as char);
    }
    s
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// An amount in minor currency units, e.g. cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitCurrency {
    pub minor_units: i64,
    pub code: &'static str,
    #[serde(skip)]
    pub minor_digits: u8,
}

impl TransitCurrency {
    pub fn negate(self) -> Self {
        TransitCurrency {
            minor_units: -self.minor_units,
            ..self
        }
    }
}

impl fmt::Display for TransitCurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.minor_units < 0 { "-" } else { "" };
        let abs = self.minor_units.unsigned_abs();
        if self.minor_digits == 0 {
            return write!(f, "{sign}{abs} {}", self.code);
        }
        let scale = 10u64.pow(self.minor_digits as u32);
        write!(
            f,
            "{sign}{}.{:0width$} {}",
            abs / scale,
            abs % scale,
            self.code,
            width = self.minor_digits as usize
        )
    }
}

// ---------------------------------------------------------------------------
// Trips and subscriptions
// ---------------------------------------------------------------------------

/// A stop, station or route-level location identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Station {
    pub id: u32,
    pub name: Option<String>,
}

impl Station {
    pub fn unknown(id: u32) -> Self {
        Station { id, name: None }
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "#{:x}", self.id),
        }
    }
}

/// Transport mode of a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    Bus,
    Train,
    Tram,
    Metro,
    Ferry,
    TicketMachine,
    Other,
    Unknown,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Bus => "bus",
            Mode::Train => "train",
            Mode::Tram => "tram",
            Mode::Metro => "metro",
            Mode::Ferry => "ferry",
            Mode::TicketMachine => "ticket machine",
            Mode::Other => "other",
            Mode::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// What a reconstructed log entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TripKind {
    Tap,
    TopUp,
    Capping,
}

/// One trip, top-up or capping event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trip {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub origin: Option<Station>,
    pub destination: Option<Station>,
    pub fare: Option<TransitCurrency>,
    pub mode: Mode,
    pub kind: TripKind,
    pub route: Option<String>,
    pub agency: Option<u32>,
}

/// A contract, pass or stored-value purse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: u32,
    pub agency: Option<u32>,
    pub tariff: Option<u32>,
    pub valid_from: Option<Timestamp>,
    pub valid_to: Option<Timestamp>,
    pub remaining_trips: Option<u32>,
    pub balance: Option<TransitCurrency>,
}

/// Card name plus serial, as produced by the cheap identification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitIdentity {
    pub name: &'static str,
    pub serial: Option<String>,
}

/// Value of a card-level info line. Dates stay typed so date shifting reaches them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InfoValue {
    Text(String),
    Date(Timestamp),
}

impl From<String> for InfoValue {
    fn from(text: String) -> Self {
        InfoValue::Text(text)
    }
}

impl From<&str> for InfoValue {
    fn from(text: &str) -> Self {
        InfoValue::Text(text.to_string())
    }
}

impl From<Timestamp> for InfoValue {
    fn from(ts: Timestamp) -> Self {
        InfoValue::Date(ts)
    }
}

impl fmt::Display for InfoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoValue::Text(text) => write!(f, "{text}"),
            InfoValue::Date(ts) => write!(f, "{ts}"),
        }
    }
}

/// Everything decoded from one card.
///
/// `balance: None` means the purse file was unreadable, not that the balance is zero.
#[derive(Debug, Serialize)]
pub struct TransitData {
    pub name: &'static str,
    pub serial: Option<String>,
    pub balance: Option<TransitCurrency>,
    pub trips: Vec<Trip>,
    pub subscriptions: Vec<Subscription>,
    pub info: Vec<(&'static str, InfoValue)>,
    pub faults: Vec<RecordFault>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
