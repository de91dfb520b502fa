//! Closed registry of supported card families.
//!
//! Each family provides a cheap `identify` check, the file layouts it reads,
//! and a pure mapping from decoded records to `TransitData`. Operator and network
//! differences are data (`FamilyContext` plus a per-variant profile), not subclasses.

pub mod calypso;
pub mod erg;

use serde::Serialize;
use tracing::debug;

use crate::capability::{FamilyContext, StationResolver};
use crate::schema::Field;
use crate::selector::{Card, Selector};
use crate::types::{FareError, Result, TransitData, TransitIdentity};

pub use calypso::CalypsoNetwork;
pub use erg::ErgOperator;

/// Result of a family's identification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Identification {
    Match,
    NoMatch,
    /// A file needed to decide could not be read.
    Inconclusive,
}

/// One file a family reads, and the layout it expects there.
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub selector: Selector,
    pub schema: &'static [Field],
    pub mandatory: bool,
    pub label: &'static str,
}

/// Every known card family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Family {
    Erg(ErgOperator),
    Calypso(CalypsoNetwork),
}

impl Family {
    /// Identification order: specific operators before fallbacks.
    pub const ALL: &'static [Family] = &[
        Family::Calypso(CalypsoNetwork::RavKav),
        Family::Calypso(CalypsoNetwork::LisboaViva),
        Family::Erg(ErgOperator::ManlyFastFerry),
        Family::Erg(ErgOperator::ChristchurchMetrocard),
        Family::Erg(ErgOperator::Generic),
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Family::Erg(op) => op.name(),
            Family::Calypso(net) => net.name(),
        }
    }

    /// Capability set with the caller's station resolver.
    pub fn context<'a>(&self, stations: &'a dyn StationResolver) -> FamilyContext<'a> {
        match self {
            Family::Erg(op) => op.context(stations),
            Family::Calypso(net) => net.context(stations),
        }
    }

    /// Side-effect free; never fails on missing or unreadable files.
    pub fn identify(&self, card: &dyn Card) -> Identification {
        match self {
            Family::Erg(op) => op.identify(card),
            Family::Calypso(net) => net.identify(card),
        }
    }

    pub fn files(&self) -> Vec<FileSpec> {
        match self {
            Family::Erg(_) => erg::files(),
            Family::Calypso(net) => net.files(),
        }
    }

    pub fn parse_identity(&self, card: &dyn Card) -> Result<TransitIdentity> {
        match self {
            Family::Erg(op) => op.parse_identity(card),
            Family::Calypso(net) => net.parse_identity(card),
        }
    }

    pub fn parse(&self, card: &dyn Card, ctx: &FamilyContext<'_>) -> Result<TransitData> {
        match self {
            Family::Erg(op) => op.parse(card, ctx),
            Family::Calypso(net) => net.parse(card, ctx),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// First family whose identification matches.
pub fn identify(card: &dyn Card) -> Result<Family> {
    let mut inconclusive = Vec::new();
    for family in Family::ALL {
        match family.identify(card) {
            Identification::Match => {
                debug!(family = family.name(), "card identified");
                return Ok(*family);
            }
            Identification::Inconclusive => inconclusive.push(family.name()),
            Identification::NoMatch => {}
        }
    }
    Err(FareError::UnknownFormat { inconclusive })
}

pub fn parse_identity(card: &dyn Card) -> Result<TransitIdentity> {
    identify(card)?.parse_identity(card)
}

/// Identify and fully decode a card.
pub fn parse(card: &dyn Card, stations: &dyn StationResolver) -> Result<TransitData> {
    let family = identify(card)?;
    family.parse(card, &family.context(stations))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuffer;
    use crate::capability::NoStations;
    use crate::selector::{CardDump, CardKind};

    #[test]
    fn test_empty_card_is_unknown() {
        let dump = CardDump::new(CardKind::MifareClassic, ByteBuffer::from_hex("01020304").unwrap());
        match identify(&dump) {
            Err(FareError::UnknownFormat { inconclusive }) => assert!(inconclusive.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse(&dump, &NoStations),
            Err(FareError::UnknownFormat { .. })
        ));
    }

    #[test]
    fn test_unreadable_environment_is_inconclusive() {
        let dump = CardDump::new(CardKind::Iso7816, ByteBuffer::from_hex("0102").unwrap())
            .with_unauthorized(calypso::environment_selector());
        match identify(&dump) {
            Err(FareError::UnknownFormat { inconclusive }) => {
                assert_eq!(inconclusive, vec!["Rav-Kav", "Lisboa Viva"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_names_are_distinct() {
        let mut names: Vec<&str> = Family::ALL.iter().map(Family::name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Family::ALL.len());
    }

    #[test]
    fn test_generic_erg_is_last() {
        assert_eq!(Family::ALL.last(), Some(&Family::Erg(ErgOperator::Generic)));
    }
}
