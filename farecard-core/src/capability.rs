//! Per-family capability set passed into every decode call.
//!
//! Families differ in epoch, UTC offset, currency, and how station ids map to
//! names. Rather than subclassing, each decode receives a `FamilyContext`
//! holding those values; station lookup is a trait object supplied by the caller.

use std::collections::HashMap;

use crate::timestamp::Clock;
use crate::types::{Station, TransitCurrency};

/// ISO 4217 code plus the number of minor-unit digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrencySpec {
    pub code: &'static str,
    pub minor_digits: u8,
}

impl CurrencySpec {
    pub const AUD: CurrencySpec = CurrencySpec::new("AUD", 2);
    pub const NZD: CurrencySpec = CurrencySpec::new("NZD", 2);
    pub const ILS: CurrencySpec = CurrencySpec::new("ILS", 2);
    pub const EUR: CurrencySpec = CurrencySpec::new("EUR", 2);
    /// Placeholder for operators whose currency is not known.
    pub const XXX: CurrencySpec = CurrencySpec::new("XXX", 2);

    pub const fn new(code: &'static str, minor_digits: u8) -> Self {
        CurrencySpec { code, minor_digits }
    }

    pub fn amount(&self, minor_units: i64) -> TransitCurrency {
        TransitCurrency {
            minor_units,
            code: self.code,
            minor_digits: self.minor_digits,
        }
    }
}

/// Maps `(agency, station id)` to a named station.
pub trait StationResolver: Send + Sync {
    fn station(&self, agency: Option<u32>, id: u32) -> Option<Station>;
}

/// Resolver that knows no names.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStations;

impl StationResolver for NoStations {
    fn station(&self, _agency: Option<u32>, _id: u32) -> Option<Station> {
        None
    }
}

/// In-memory station table. Entries registered without an agency match any agency.
#[derive(Debug, Clone, Default)]
pub struct StationTable {
    names: HashMap<(Option<u32>, u32), String>,
}

impl StationTable {
    pub fn new() -> Self {
        StationTable::default()
    }

    pub fn insert(&mut self, agency: Option<u32>, id: u32, name: impl Into<String>) {
        self.names.insert((agency, id), name.into());
    }

    pub fn with(mut self, agency: Option<u32>, id: u32, name: impl Into<String>) -> Self {
        self.insert(agency, id, name);
        self
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl StationResolver for StationTable {
    fn station(&self, agency: Option<u32>, id: u32) -> Option<Station> {
        self.names
            .get(&(agency, id))
            .or_else(|| self.names.get(&(None, id)))
            .map(|name| Station {
                id,
                name: Some(name.clone()),
            })
    }
}

/// Everything a family decoder needs besides the card itself.
#[derive(Clone, Copy)]
pub struct FamilyContext<'a> {
    pub name: &'static str,
    pub clock: Clock,
    pub currency: CurrencySpec,
    pub stations: &'a dyn StationResolver,
    /// Operator or network discriminator, when the family has one.
    pub agency_id: Option<u32>,
}

impl<'a> FamilyContext<'a> {
    pub fn with_clock(&self, clock: Clock) -> FamilyContext<'a> {
        FamilyContext { clock, ..*self }
    }

    /// Named station if the resolver knows it, otherwise a bare id.
    pub fn station(&self, agency: Option<u32>, id: u32) -> Station {
        self.stations
            .station(agency, id)
            .unwrap_or_else(|| Station::unknown(id))
    }

    pub fn amount(&self, minor_units: i64) -> TransitCurrency {
        self.currency.amount(minor_units)
    }
}

impl std::fmt::Debug for FamilyContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilyContext")
            .field("name", &self.name)
            .field("clock", &self.clock)
            .field("currency", &self.currency)
            .field("agency_id", &self.agency_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::{ymd, SubDayUnit};
    use chrono_tz::Tz;

    #[test]
    fn test_station_table_lookup() {
        let table = StationTable::new()
            .with(Some(2), 10, "Circular Quay")
            .with(None, 11, "Manly Wharf");

        assert_eq!(
            table.station(Some(2), 10).and_then(|s| s.name),
            Some("Circular Quay".to_string())
        );
        assert_eq!(table.station(Some(3), 10), None);
        assert_eq!(
            table.station(Some(9), 11).and_then(|s| s.name),
            Some("Manly Wharf".to_string())
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_context_falls_back_to_bare_station() {
        let clock = Clock::new(ymd(2000, 1, 1), Tz::UTC, SubDayUnit::Minute);
        let ctx = FamilyContext {
            name: "Test",
            clock,
            currency: CurrencySpec::AUD,
            stations: &NoStations,
            agency_id: None,
        };
        assert_eq!(ctx.station(None, 0x2a), Station::unknown(0x2a));
        assert_eq!(ctx.amount(250).to_string(), "2.50 AUD");

        let later = ctx.with_clock(clock.rebased(1).unwrap());
        assert_eq!(later.clock.epoch(), ymd(2000, 1, 2));
        assert_eq!(later.name, "Test");
    }
}
