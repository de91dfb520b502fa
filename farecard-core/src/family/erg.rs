//! ERG stored-value cards on MIFARE Classic.
//!
//! Sector 0 block 1 carries a fixed signature, block 2 the metadata record
//! (agency id, per-card epoch, serial). Every other data block holds one typed
//! record: purse transactions or balance snapshots. There is no tap-off, so each
//! purse record is one trip.

use chrono_tz::Tz;
use serde::Serialize;
use tracing::debug;

use super::{FileSpec, Identification};
use crate::capability::{CurrencySpec, FamilyContext, StationResolver};
use crate::codec::decode;
use crate::schema::{DecodedFieldMap, Field};
use crate::selector::{Card, CardKind, Record, Selector};
use crate::timestamp::{ymd, Clock, SubDayUnit};
use crate::trips::{decode_slots, reconstruct, Journey, LogPolicy, RawTransaction, RecordFault};
use crate::types::{
    FareError, InfoValue, Mode, Result, TransitData, TransitIdentity, Trip, TripKind,
};

pub const SIGNATURE: [u8; 7] = [0x32, 0x32, 0x00, 0x00, 0x00, 0x01, 0x01];

pub const PURSE_RECORD: u64 = 0x01;
pub const BALANCE_RECORD: u64 = 0x03;
/// `TransactionType` of a purse credit.
pub const TOP_UP: u64 = 0x08;

const DATA_SECTORS: std::ops::Range<u8> = 1..16;
const MINUTES_PER_DAY: u64 = 1440;

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

pub const PREAMBLE: &[Field] = &[
    Field::int("Signature", 56),
    Field::unknown("PreambleUnknownA", 24),
    Field::int("PreambleSerial", 32),
];

pub const METADATA: &[Field] = &[
    Field::int("Header", 16),
    Field::int("Agency", 16),
    Field::unknown("MetadataUnknownA", 8),
    Field::date("EpochDays", 16),
    Field::int("CardSerial", 32),
    Field::unknown("MetadataUnknownB", 40),
];

const PURSE: &[Field] = &[
    Field::int("Route", 8),
    Field::unknown("PurseUnknownA", 8),
    Field::flags("TransactionType", 8),
    Field::date("Day", 20),
    Field::time("Minute", 12),
    Field::int("Value", 32),
    Field::unknown("PurseUnknownB", 32),
];

const BALANCE: &[Field] = &[
    Field::unknown("BalanceUnknownA", 8),
    Field::int("Version", 16),
    Field::int("Balance", 32),
    Field::unknown("BalanceUnknownB", 64),
];

/// Any data block: a record type byte, then the layout for that type.
pub const DATA_BLOCK: &[Field] = &[
    Field::int("RecordType", 8),
    Field::variant(
        "RecordType",
        &[(PURSE_RECORD, PURSE), (BALANCE_RECORD, BALANCE)],
        Some(&[]),
    ),
];

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// Known ERG deployments. `Generic` accepts any agency id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErgOperator {
    ManlyFastFerry,
    ChristchurchMetrocard,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SerialFormat {
    Hex,
    Decimal,
}

struct Profile {
    name: &'static str,
    agency: Option<u32>,
    currency: CurrencySpec,
    tz: Tz,
    serial: SerialFormat,
    mode: Mode,
}

impl ErgOperator {
    fn profile(self) -> Profile {
        match self {
            ErgOperator::ManlyFastFerry => Profile {
                name: "Manly Fast Ferry",
                agency: Some(0x0227),
                currency: CurrencySpec::AUD,
                tz: chrono_tz::Australia::Sydney,
                serial: SerialFormat::Hex,
                mode: Mode::Ferry,
            },
            ErgOperator::ChristchurchMetrocard => Profile {
                name: "Metrocard",
                agency: Some(0x0136),
                currency: CurrencySpec::NZD,
                tz: chrono_tz::Pacific::Auckland,
                serial: SerialFormat::Decimal,
                mode: Mode::Bus,
            },
            ErgOperator::Generic => Profile {
                name: "ERG",
                agency: None,
                currency: CurrencySpec::XXX,
                tz: Tz::UTC,
                serial: SerialFormat::Hex,
                mode: Mode::Unknown,
            },
        }
    }

    pub fn name(self) -> &'static str {
        self.profile().name
    }

    /// Base clock. The card's own epoch is applied on top with `Clock::rebased`.
    pub fn context(self, stations: &dyn StationResolver) -> FamilyContext<'_> {
        let p = self.profile();
        FamilyContext {
            name: p.name,
            clock: Clock::new(ymd(2000, 1, 1), p.tz, SubDayUnit::Minute),
            currency: p.currency,
            stations,
            agency_id: p.agency,
        }
    }

    /// Signature first, then the agency id straight from the metadata bytes.
    pub fn identify(self, card: &dyn Card) -> Identification {
        if card.kind() != CardKind::MifareClassic {
            return Identification::NoMatch;
        }
        let preamble = card.read(&Selector::sector_block(0, 1));
        match preamble.data() {
            Ok(data) if data.starts_with(&SIGNATURE) => {}
            _ => return Identification::NoMatch,
        }
        let Some(expected) = self.profile().agency else {
            return Identification::Match;
        };
        let metadata = card.read(&metadata_selector());
        let data = match metadata.data() {
            Ok(data) => data,
            Err(_) => return Identification::Inconclusive,
        };
        match data.int_at(2, 2) {
            Ok(agency) if agency == expected as u64 => Identification::Match,
            _ => Identification::NoMatch,
        }
    }

    pub fn parse_identity(self, card: &dyn Card) -> Result<TransitIdentity> {
        let meta = read_metadata(card)?;
        Ok(TransitIdentity {
            name: self.name(),
            serial: Some(self.serial(&meta)?),
        })
    }

    fn serial(self, meta: &DecodedFieldMap) -> Result<String> {
        let raw = meta.require("CardSerial")?;
        Ok(match self.profile().serial {
            SerialFormat::Hex => format!("{raw:08x}"),
            SerialFormat::Decimal => raw.to_string(),
        })
    }

    pub fn parse(self, card: &dyn Card, ctx: &FamilyContext<'_>) -> Result<TransitData> {
        let profile = self.profile();
        let meta = read_metadata(card)?;
        let agency = meta.require("Agency")? as u32;
        let clock = ctx
            .clock
            .rebased(meta.require("EpochDays")?)
            .map_err(|e| FareError::mandatory(&metadata_selector(), e))?;
        let ctx = ctx.with_clock(clock);

        let records = data_records(card);
        let (slots, mut faults) = decode_slots(&records, DATA_BLOCK);

        let mut balance: Option<(u64, i64)> = None;
        let mut txs = Vec::new();
        for slot in &slots {
            match slot.fields.int("RecordType") {
                Some(PURSE_RECORD) => {
                    let day = slot.fields.int_or_zero("Day");
                    let minute = slot.fields.int_or_zero("Minute");
                    match ctx.clock.date_time(day, minute) {
                        Ok(ts) => txs.push(RawTransaction::new(
                            slot,
                            ts,
                            day * MINUTES_PER_DAY + minute,
                        )),
                        Err(error) => faults.push(RecordFault {
                            selector: slot.selector.clone(),
                            slot: slot.slot,
                            error,
                        }),
                    }
                }
                Some(BALANCE_RECORD) => {
                    let version = slot.fields.int_or_zero("Version");
                    if balance.map_or(true, |(v, _)| version > v) {
                        balance = Some((version, slot.fields.int_or_zero("Balance") as i64));
                    }
                }
                other => debug!(selector = %slot.selector, ?other, "ignoring block"),
            }
        }

        let trips = reconstruct(txs, &ErgLog)
            .iter()
            .map(|j| trip(j, &ctx, agency, profile.mode))
            .collect();

        Ok(TransitData {
            name: profile.name,
            serial: Some(self.serial(&meta)?),
            balance: balance.map(|(_, b)| ctx.amount(b)),
            trips,
            subscriptions: Vec::new(),
            info: vec![
                ("Card epoch", ctx.clock.day(0)?.into()),
                ("Agency", format!("{agency:04x}").into()),
            ],
            faults,
        })
    }
}

pub fn metadata_selector() -> Selector {
    Selector::sector_block(0, 2)
}

/// Preamble, metadata, then every data block of sectors 1..16.
pub fn files() -> Vec<FileSpec> {
    let mut files = vec![
        FileSpec {
            selector: Selector::sector_block(0, 1),
            schema: PREAMBLE,
            mandatory: true,
            label: "preamble",
        },
        FileSpec {
            selector: metadata_selector(),
            schema: METADATA,
            mandatory: true,
            label: "metadata",
        },
    ];
    files.extend(data_selectors().map(|selector| FileSpec {
        selector,
        schema: DATA_BLOCK,
        mandatory: false,
        label: "data",
    }));
    files
}

fn data_selectors() -> impl Iterator<Item = Selector> {
    DATA_SECTORS.flat_map(|sector| (0..3).map(move |block| Selector::sector_block(sector, block)))
}

fn data_records(card: &dyn Card) -> Vec<Record> {
    data_selectors().map(|sel| card.read(&sel)).collect()
}

fn read_metadata(card: &dyn Card) -> Result<DecodedFieldMap> {
    let sel = metadata_selector();
    let record = card.read(&sel);
    let data = record.data().map_err(|e| FareError::mandatory(&sel, e))?;
    decode(METADATA, data).map_err(|e| FareError::mandatory(&sel, e))
}

struct ErgLog;

impl LogPolicy for ErgLog {
    fn same_trip(&self, _first: &RawTransaction, _second: &RawTransaction) -> bool {
        false
    }

    fn classify(&self, tx: &RawTransaction) -> TripKind {
        if tx.fields.int("TransactionType") == Some(TOP_UP) {
            TripKind::TopUp
        } else {
            TripKind::Tap
        }
    }
}

fn trip(journey: &Journey, ctx: &FamilyContext<'_>, agency: u32, mode: Mode) -> Trip {
    let tx = &journey.first;
    let value = ctx.amount(tx.fields.int_or_zero("Value") as i64);
    let route = tx.fields.int_or_zero("Route");
    let (fare, mode) = match journey.kind {
        TripKind::TopUp => (value.negate(), Mode::TicketMachine),
        _ => (value, mode),
    };
    Trip {
        start: Some(tx.timestamp),
        end: None,
        origin: None,
        destination: None,
        fare: Some(fare),
        mode,
        kind: journey.kind,
        route: (route != 0).then(|| route.to_string()),
        agency: Some(agency),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuffer;
    use crate::capability::NoStations;
    use crate::codec::encode;
    use crate::family::{self, Family};
    use crate::schema::FieldValue;
    use crate::selector::CardDump;
    use crate::timestamp::Timestamp;

    fn metadata(agency: u64, epoch_days: u64, serial: u64) -> ByteBuffer {
        let map = DecodedFieldMap::new()
            .with("Header", FieldValue::Int(0x0203))
            .with("Agency", FieldValue::Int(agency))
            .with("MetadataUnknownA", FieldValue::Unknown(0))
            .with("EpochDays", FieldValue::Date(epoch_days))
            .with("CardSerial", FieldValue::Int(serial))
            .with("MetadataUnknownB", FieldValue::Unknown(0));
        encode(METADATA, &map).unwrap()
    }

    fn purse(kind: u64, day: u64, minute: u64, value: u64) -> ByteBuffer {
        let map = DecodedFieldMap::new()
            .with("RecordType", FieldValue::Int(PURSE_RECORD))
            .with("Route", FieldValue::Int(3))
            .with("PurseUnknownA", FieldValue::Unknown(0))
            .with("TransactionType", FieldValue::Flags(kind))
            .with("Day", FieldValue::Date(day))
            .with("Minute", FieldValue::Time(minute))
            .with("Value", FieldValue::Int(value))
            .with("PurseUnknownB", FieldValue::Unknown(0));
        encode(DATA_BLOCK, &map).unwrap()
    }

    fn balance(version: u64, amount: u64) -> ByteBuffer {
        let map = DecodedFieldMap::new()
            .with("RecordType", FieldValue::Int(BALANCE_RECORD))
            .with("BalanceUnknownA", FieldValue::Unknown(0))
            .with("Version", FieldValue::Int(version))
            .with("Balance", FieldValue::Int(amount))
            .with("BalanceUnknownB", FieldValue::Unknown(0));
        encode(DATA_BLOCK, &map).unwrap()
    }

    fn card(agency: u64) -> CardDump {
        let mut preamble = SIGNATURE.to_vec();
        preamble.resize(16, 0);
        CardDump::new(CardKind::MifareClassic, ByteBuffer::from_hex("a1b2c3d4").unwrap())
            .with(Selector::sector_block(0, 1), ByteBuffer::new(preamble))
            .with(metadata_selector(), metadata(agency, 100, 0x0012d687))
    }

    #[test]
    fn test_layouts_fill_a_block() {
        use crate::schema::schema_width;
        assert_eq!(schema_width(PREAMBLE), Some(112));
        assert_eq!(schema_width(METADATA), Some(128));
        assert_eq!(schema_width(&[Field::group(PURSE)]), Some(120));
        assert_eq!(schema_width(&[Field::group(BALANCE)]), Some(120));
    }

    #[test]
    fn test_agency_log_scenario() {
        // Purses written out of order, as a circular log would leave them.
        let dump = card(0x1234)
            .with(Selector::sector_block(1, 0), purse(0x09, 0, 130, 300))
            .with(Selector::sector_block(1, 1), purse(0x09, 0, 10, 100))
            .with(Selector::sector_block(2, 2), purse(0x09, 0, 70, 200))
            .with(Selector::sector_block(3, 0), ByteBuffer::zeroed(16));

        let family = family::identify(&dump).unwrap();
        assert_eq!(family, Family::Erg(ErgOperator::Generic));

        let data = family.parse(&dump, &family.context(&NoStations)).unwrap();
        assert_eq!(data.serial.as_deref(), Some("0012d687"));
        assert_eq!(data.trips.len(), 3);

        let epoch = ymd(2000, 4, 10);
        let expected: Vec<i64> = [10, 70, 130]
            .iter()
            .map(|m| {
                epoch
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
                    .timestamp()
                    + m * 60
            })
            .collect();
        let actual: Vec<i64> = data
            .trips
            .iter()
            .map(|t| t.start.unwrap().sort_key())
            .collect();
        assert_eq!(actual, expected);
        assert!(data.trips.iter().all(|t| matches!(t.start, Some(Timestamp::Full(_)))));
        assert_eq!(data.trips[0].fare.map(|f| f.minor_units), Some(100));
        assert!(data.faults.is_empty());
        assert_eq!(
            data.info[0],
            ("Card epoch", InfoValue::Date(Timestamp::Day(epoch)))
        );
    }

    #[test]
    fn test_manly_identified_by_agency() {
        let dump = card(0x0227);
        assert_eq!(ErgOperator::ManlyFastFerry.identify(&dump), Identification::Match);
        assert_eq!(
            ErgOperator::ChristchurchMetrocard.identify(&dump),
            Identification::NoMatch
        );
        assert_eq!(
            family::identify(&dump).unwrap(),
            Family::Erg(ErgOperator::ManlyFastFerry)
        );
        let data = family::parse(&dump, &NoStations).unwrap();
        assert_eq!(data.name, "Manly Fast Ferry");
    }

    #[test]
    fn test_sydney_daylight_saving() {
        let mut preamble = SIGNATURE.to_vec();
        preamble.resize(16, 0);
        // Card epoch 2024-01-01: one ride in January (AEDT), one in July (AEST).
        let dump = CardDump::new(CardKind::MifareClassic, ByteBuffer::zeroed(4))
            .with(Selector::sector_block(0, 1), ByteBuffer::new(preamble))
            .with(metadata_selector(), metadata(0x0227, 8766, 1))
            .with(Selector::sector_block(1, 0), purse(0x09, 0, 40, 100))
            .with(Selector::sector_block(1, 1), purse(0x09, 182, 40, 100));

        let data = family::parse(&dump, &NoStations).unwrap();
        let starts: Vec<String> = data
            .trips
            .iter()
            .map(|t| t.start.unwrap().to_string())
            .collect();
        assert_eq!(starts, ["2024-01-01 00:40 +11:00", "2024-07-01 00:40 +10:00"]);
    }

    #[test]
    fn test_christchurch_decimal_serial() {
        let dump = card(0x0136);
        let identity = family::parse_identity(&dump).unwrap();
        assert_eq!(identity.name, "Metrocard");
        assert_eq!(identity.serial.as_deref(), Some("1234567"));
    }

    #[test]
    fn test_missing_signature() {
        let dump = CardDump::new(CardKind::MifareClassic, ByteBuffer::zeroed(4))
            .with(Selector::sector_block(0, 1), ByteBuffer::zeroed(16));
        assert_eq!(ErgOperator::Generic.identify(&dump), Identification::NoMatch);
    }

    #[test]
    fn test_unreadable_metadata() {
        let mut preamble = SIGNATURE.to_vec();
        preamble.resize(16, 0);
        let dump = CardDump::new(CardKind::MifareClassic, ByteBuffer::zeroed(4))
            .with(Selector::sector_block(0, 1), ByteBuffer::new(preamble))
            .with_unauthorized(metadata_selector());

        assert_eq!(
            ErgOperator::ManlyFastFerry.identify(&dump),
            Identification::Inconclusive
        );
        assert_eq!(ErgOperator::Generic.identify(&dump), Identification::Match);

        let err = family::parse(&dump, &NoStations).unwrap_err();
        match err {
            FareError::Mandatory { selector, source } => {
                assert_eq!(selector, metadata_selector());
                assert!(source.is_placeholder());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_short_metadata_is_fatal() {
        let mut preamble = SIGNATURE.to_vec();
        preamble.resize(16, 0);
        let dump = CardDump::new(CardKind::MifareClassic, ByteBuffer::zeroed(4))
            .with(Selector::sector_block(0, 1), ByteBuffer::new(preamble))
            .with(metadata_selector(), ByteBuffer::from_hex("02031234").unwrap());
        let err = family::parse(&dump, &NoStations).unwrap_err();
        assert!(err.is_overrun());
        assert!(err.to_string().contains("S0B2"));
    }

    #[test]
    fn test_balance_and_top_up() {
        let dump = card(0x0227)
            .with(Selector::sector_block(4, 0), balance(2, 1500))
            .with(Selector::sector_block(4, 1), balance(7, 950))
            .with(Selector::sector_block(4, 2), balance(5, 2000))
            .with(Selector::sector_block(5, 0), purse(TOP_UP, 1, 600, 1000))
            .with_unauthorized(Selector::sector_block(6, 0));

        let data = family::parse(&dump, &NoStations).unwrap();
        assert_eq!(data.balance.map(|b| b.to_string()), Some("9.50 AUD".to_string()));
        assert_eq!(data.trips.len(), 1);
        let top_up = &data.trips[0];
        assert_eq!(top_up.kind, TripKind::TopUp);
        assert_eq!(top_up.mode, Mode::TicketMachine);
        assert_eq!(top_up.fare.map(|f| f.minor_units), Some(-1000));
        assert_eq!(top_up.start.unwrap().to_string(), "2000-04-11 10:00 +10:00");
        assert_eq!(data.faults.len(), 1);
    }

    #[test]
    fn test_files_cover_data_blocks() {
        let files = files();
        assert_eq!(files.len(), 2 + 15 * 3);
        assert!(files.iter().filter(|f| f.mandatory).count() == 2);
    }
}
