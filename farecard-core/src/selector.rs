//! Structural record addressing and the card boundary.
//!
//! A `Selector` says *where* a record lives (folder/file ids, sector/block,
//! page, or an application name) without saying how it is fetched. The card
//! transport is external; this crate only sees the `Card` trait, which hands
//! back a `Record` that is either present, unauthorized, or absent.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::buffer::ByteBuffer;
use crate::types::{hex_decode, hex_encode, FareError, Result};

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// One step of a selector path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// ISO 7816 / DESFire folder or file identifier.
    File(u16),
    /// Record number inside a record-oriented file (1-based on ISO 7816).
    Record(u8),
    Sector(u8),
    Block(u8),
    Page(u16),
    /// Application selected by name (AID).
    Name(Vec<u8>),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::File(id) => write!(f, "{id:04x}"),
            Segment::Record(n) => write!(f, "#{n}"),
            Segment::Sector(n) => write!(f, "S{n}"),
            Segment::Block(n) => write!(f, "B{n}"),
            Segment::Page(n) => write!(f, "P{n}"),
            Segment::Name(name) => write!(f, "name:{}", hex_encode(name)),
        }
    }
}

/// Ordered path to a record. Two selectors are equal iff their segments are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Selector {
    segments: Vec<Segment>,
}

impl Selector {
    pub fn new(segments: Vec<Segment>) -> Self {
        Selector { segments }
    }

    /// Folder/file path, e.g. `[0x2000, 0x2010]`.
    pub fn path(ids: &[u16]) -> Self {
        Selector::new(ids.iter().map(|&id| Segment::File(id)).collect())
    }

    pub fn sector_block(sector: u8, block: u8) -> Self {
        Selector::new(vec![Segment::Sector(sector), Segment::Block(block)])
    }

    pub fn page(page: u16) -> Self {
        Selector::new(vec![Segment::Page(page)])
    }

    pub fn named(name: &[u8]) -> Self {
        Selector::new(vec![Segment::Name(name.to_vec())])
    }

    /// Same path with a record number appended.
    pub fn record(&self, number: u8) -> Self {
        self.child(Segment::Record(number))
    }

    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Selector { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Parse the display form produced by `Display`, e.g. `S0B2`, `2000/2010/#3`, `P4`.
    /// File ids are hex and must be written lowercase so they never collide with the
    /// `S`/`B`/`P` tags.
    pub fn parse(text: &str) -> Option<Selector> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let mut segments = Vec::new();
        for part in text.split('/') {
            let part = part.trim();
            if let Some(hex) = part.strip_prefix("name:") {
                segments.push(Segment::Name(hex_decode(hex)?));
            } else if let Some(n) = part.strip_prefix('#') {
                segments.push(Segment::Record(n.parse().ok()?));
            } else if let Some(rest) = part.strip_prefix('S') {
                match rest.split_once('B') {
                    Some((sector, block)) => {
                        segments.push(Segment::Sector(sector.parse().ok()?));
                        segments.push(Segment::Block(block.parse().ok()?));
                    }
                    None => segments.push(Segment::Sector(rest.parse().ok()?)),
                }
            } else if let Some(n) = part.strip_prefix('B') {
                segments.push(Segment::Block(n.parse().ok()?));
            } else if let Some(n) = part.strip_prefix('P') {
                segments.push(Segment::Page(n.parse().ok()?));
            } else {
                segments.push(Segment::File(u16::from_str_radix(part, 16).ok()?));
            }
        }
        Some(Selector { segments })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            let glued = matches!(
                (i.checked_sub(1).map(|p| &self.segments[p]), segment),
                (Some(Segment::Sector(_)), Segment::Block(_))
            );
            if i > 0 && !glued {
                write!(f, "/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What the card transport produced for one selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "data", rename_all = "lowercase")]
pub enum RecordContent {
    Data(ByteBuffer),
    Unauthorized,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub selector: Selector,
    pub content: RecordContent,
}

impl Record {
    pub fn present(selector: Selector, data: ByteBuffer) -> Self {
        Record {
            selector,
            content: RecordContent::Data(data),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self.content, RecordContent::Data(_))
    }

    /// Payload, or the matching placeholder error.
    pub fn data(&self) -> Result<&ByteBuffer> {
        match &self.content {
            RecordContent::Data(data) => Ok(data),
            RecordContent::Unauthorized => Err(FareError::Unauthorized(self.selector.clone())),
            RecordContent::Absent => Err(FareError::Absent(self.selector.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Card boundary
// ---------------------------------------------------------------------------

/// Physical card technology, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CardKind {
    MifareClassic,
    Iso7816,
    Ultralight,
}

/// An already-fetched card. Implementations must be side-effect free.
pub trait Card {
    fn tag_id(&self) -> &ByteBuffer;
    fn kind(&self) -> CardKind;
    fn read(&self, selector: &Selector) -> Record;
}

/// In-memory card image: everything the transport managed to fetch.
/// Selectors that were never stored read back as absent.
#[derive(Debug, Clone)]
pub struct CardDump {
    tag_id: ByteBuffer,
    kind: CardKind,
    records: BTreeMap<Selector, RecordContent>,
}

impl CardDump {
    pub fn new(kind: CardKind, tag_id: ByteBuffer) -> Self {
        CardDump {
            tag_id,
            kind,
            records: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, selector: Selector, data: ByteBuffer) {
        self.records.insert(selector, RecordContent::Data(data));
    }

    pub fn insert_unauthorized(&mut self, selector: Selector) {
        self.records.insert(selector, RecordContent::Unauthorized);
    }

    pub fn with(mut self, selector: Selector, data: ByteBuffer) -> Self {
        self.insert(selector, data);
        self
    }

    pub fn with_unauthorized(mut self, selector: Selector) -> Self {
        self.insert_unauthorized(selector);
        self
    }

    pub fn set_tag_id(&mut self, tag_id: ByteBuffer) {
        self.tag_id = tag_id;
    }

    /// All stored records in selector order.
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        self.records.iter().map(|(selector, content)| Record {
            selector: selector.clone(),
            content: content.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Card for CardDump {
    fn tag_id(&self) -> &ByteBuffer {
        &self.tag_id
    }

    fn kind(&self) -> CardKind {
        self.kind
    }

    fn read(&self, selector: &Selector) -> Record {
        let content = self
            .records
            .get(selector)
            .cloned()
            .unwrap_or(RecordContent::Absent);
        Record {
            selector: selector.clone(),
            content,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        let a = Selector::path(&[0x2000]).child(Segment::File(0x2010)).record(3);
        let b = Selector::new(vec![
            Segment::File(0x2000),
            Segment::File(0x2010),
            Segment::Record(3),
        ]);
        assert_eq!(a, b);
        assert_ne!(a, Selector::path(&[0x2000, 0x2010]).record(2));
    }

    #[test]
    fn test_display() {
        assert_eq!(Selector::sector_block(0, 2).to_string(), "S0B2");
        assert_eq!(Selector::path(&[0x2000, 0x2010]).record(1).to_string(), "2000/2010/#1");
        assert_eq!(Selector::page(4).to_string(), "P4");
        assert_eq!(Selector::named(&[0xA0, 0x00]).to_string(), "name:a000");
    }

    #[test]
    fn test_parse_roundtrip() {
        for sel in [
            Selector::sector_block(15, 3),
            Selector::path(&[0x3f00, 0x2000, 0x2001]).record(1),
            Selector::page(12),
            Selector::named(&[0x31, 0x54, 0x49, 0x43]),
            Selector::new(vec![Segment::Sector(2)]),
        ] {
            assert_eq!(Selector::parse(&sel.to_string()), Some(sel));
        }
        assert_eq!(Selector::parse(""), None);
        assert_eq!(Selector::parse("S1Bx"), None);
        assert_eq!(Selector::parse("zz"), None);
    }

    #[test]
    fn test_dump_states() {
        let dump = CardDump::new(CardKind::MifareClassic, ByteBuffer::from_hex("01020304").unwrap())
            .with(Selector::sector_block(0, 1), ByteBuffer::zeroed(16))
            .with_unauthorized(Selector::sector_block(1, 0));

        assert!(dump.read(&Selector::sector_block(0, 1)).is_present());
        assert!(matches!(
            dump.read(&Selector::sector_block(1, 0)).data(),
            Err(FareError::Unauthorized(_))
        ));
        assert!(matches!(
            dump.read(&Selector::sector_block(9, 0)).data(),
            Err(FareError::Absent(_))
        ));
        assert_eq!(dump.len(), 2);
        assert_eq!(dump.tag_id().hex(), "01020304");
    }
}
