//! Calypso (ISO 7816, En1545-style) ticketing applications.
//!
//! All networks share the application layout: an environment record, a cyclic
//! event log, contract records and a counters record. They differ in the event
//! layout, how a tap-on or tap-off is encoded, and currency. Identification reads
//! the 20-bit network id straight from the environment record.

use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, warn};

use super::{FileSpec, Identification};
use crate::capability::{CurrencySpec, FamilyContext, StationResolver};
use crate::codec::decode;
use crate::schema::{Charset, DecodedFieldMap, Field};
use crate::selector::{Card, CardKind, Record, Selector};
use crate::timestamp::{ymd, Clock, SubDayUnit};
use crate::trips::{decode_slots, reconstruct, Journey, LogPolicy, RawTransaction, RecordFault};
use crate::types::{
    FareError, InfoValue, Mode, Result, Station, Subscription, TransitData, TransitIdentity, Trip,
    TripKind,
};

const APPLICATION: u16 = 0x2000;
const ENVIRONMENT_FILE: u16 = 0x2001;
const EVENTS_FILE: u16 = 0x2010;
const CONTRACTS_FILE: u16 = 0x2020;
const COUNTERS_FILE: u16 = 0x2069;

const EVENT_SLOTS: u8 = 6;
const CONTRACT_SLOTS: u8 = 4;
const MINUTES_PER_DAY: u64 = 1440;

const RAVKAV_NETWORKS: [u64; 2] = [0x37602, 0x37603];
/// Portugal, as the top three BCD digits of the network id.
const LISBOA_COUNTRY: u64 = 0x620;

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

const HOLDER_V1: &[Field] = &[
    Field::unknown("EnvUnknownA", 2),
    Field::bcd("HolderBirthDate", 8),
    Field::int("HolderCompany", 8),
    Field::int("HolderIdNumber", 30),
    Field::int("HolderProfile", 6),
];

const HOLDER_V2: &[Field] = &[
    Field::text("HolderName", 12, Charset::Alpha5),
    Field::int("HolderProfile", 6),
];

pub const ENVIRONMENT: &[Field] = &[
    Field::int("EnvApplicationVersionNumber", 3),
    Field::bcd("EnvNetworkId", 5),
    Field::int("EnvApplicationIssuerId", 8),
    Field::date("EnvApplicationValidityEndDate", 14),
    Field::int("EnvPayMethod", 11),
    Field::int("EnvAuthenticator", 16),
    Field::flags("EnvSelectList", 32),
    Field::variant(
        "EnvApplicationVersionNumber",
        &[(1, HOLDER_V1), (2, HOLDER_V2)],
        Some(&[]),
    ),
];

pub const RAVKAV_EVENT: &[Field] = &[
    Field::int("EventVersion", 3),
    Field::int("EventServiceProvider", 8),
    Field::int("EventContractPointer", 4),
    Field::flags("EventCode", 8),
    Field::date_time("Event", 14, 11),
    Field::int("EventTransferFlag", 1),
    Field::date_time("EventFirstStamp", 14, 11),
    Field::flags("EventContractPrefs", 32),
    Field::int("EventLocationId", 16),
    Field::int("EventRouteNumber", 16),
    Field::int("EventVehicleId", 16),
    Field::int("EventPrice", 16),
    Field::unknown("EventUnknownA", 48),
];

pub const LISBOA_EVENT: &[Field] = &[
    Field::date_time("Event", 14, 11),
    Field::unknown("EventUnknownA", 38),
    Field::flags("ContractsUsedBitmap", 4),
    Field::unknown("EventUnknownB", 29),
    Field::int("Transition", 3),
    Field::int("EventServiceProvider", 5),
    Field::unknown("EventUnknownC", 20),
    Field::int("EventDeviceId", 16),
    Field::int("EventRouteNumber", 16),
    Field::int("EventLocationId", 8),
    Field::unknown("EventUnknownD", 63),
];

pub const CONTRACT: &[Field] = &[
    Field::int("ContractProvider", 8),
    Field::int("ContractTariff", 16),
    Field::date("ContractStartDate", 14),
    Field::int("ContractSaleDevice", 12),
    Field::unknown("ContractUnknownA", 10),
    Field::flags("ContractRestrictCode", 5),
    Field::bitmap(
        "ContractExtra",
        &[
            Field::date("ContractEndDate", 14),
            Field::int("ContractJourneys", 8),
            Field::int("ContractZones", 16),
            Field::int("ContractPriceAmount", 16),
        ],
    ),
];

/// Counter 0 is the stored-value purse; counter n belongs to contract record n.
pub const COUNTERS: &[Field] = &[Field::repeat(
    "Counter",
    CONTRACT_SLOTS as u32 + 1,
    &[Field::int("Value", 24)],
)];

pub fn environment_selector() -> Selector {
    Selector::path(&[APPLICATION, ENVIRONMENT_FILE]).record(1)
}

fn file(id: u16) -> Selector {
    Selector::path(&[APPLICATION, id])
}

// ---------------------------------------------------------------------------
// Networks
// ---------------------------------------------------------------------------

/// Direction of one log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    TapOn,
    TapOff,
    TopUp,
    Capping,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CalypsoNetwork {
    RavKav,
    LisboaViva,
}

struct Profile {
    name: &'static str,
    currency: CurrencySpec,
    tz: Tz,
    event: &'static [Field],
    network: fn(u64) -> bool,
    transition: fn(&DecodedFieldMap) -> Transition,
    mode: fn(&DecodedFieldMap) -> Mode,
    price: Option<&'static str>,
    /// Counter 0 holds a stored-value balance.
    purse: bool,
    /// Longest tap-on to tap-off gap that still counts as one trip.
    max_gap_minutes: u64,
}

fn ravkav_transition(fields: &DecodedFieldMap) -> Transition {
    match fields.int_or_zero("EventCode") & 0x0F {
        1 | 6 => Transition::TapOn,
        2 => Transition::TapOff,
        0xD => Transition::TopUp,
        0xE => Transition::Capping,
        _ => Transition::Other,
    }
}

fn ravkav_mode(fields: &DecodedFieldMap) -> Mode {
    match fields.int_or_zero("EventCode") >> 4 {
        1 => Mode::Bus,
        2 => Mode::Train,
        3 => Mode::Tram,
        4 => Mode::Metro,
        0 => Mode::Unknown,
        _ => Mode::Other,
    }
}

fn lisboa_transition(fields: &DecodedFieldMap) -> Transition {
    match fields.int_or_zero("Transition") {
        1 => Transition::TapOn,
        4 => Transition::TapOff,
        _ => Transition::Other,
    }
}

fn lisboa_mode(fields: &DecodedFieldMap) -> Mode {
    match fields.int_or_zero("EventServiceProvider") {
        1 => Mode::Train,
        2 => Mode::Metro,
        3 => Mode::Bus,
        5 => Mode::Ferry,
        15 => Mode::Tram,
        _ => Mode::Unknown,
    }
}

impl CalypsoNetwork {
    fn profile(self) -> Profile {
        match self {
            CalypsoNetwork::RavKav => Profile {
                name: "Rav-Kav",
                currency: CurrencySpec::ILS,
                tz: chrono_tz::Asia::Jerusalem,
                event: RAVKAV_EVENT,
                network: |id| RAVKAV_NETWORKS.contains(&id),
                transition: ravkav_transition,
                mode: ravkav_mode,
                price: Some("EventPrice"),
                purse: true,
                max_gap_minutes: 180,
            },
            CalypsoNetwork::LisboaViva => Profile {
                name: "Lisboa Viva",
                currency: CurrencySpec::EUR,
                tz: chrono_tz::Europe::Lisbon,
                event: LISBOA_EVENT,
                network: |id| id >> 8 == LISBOA_COUNTRY,
                transition: lisboa_transition,
                mode: lisboa_mode,
                price: None,
                purse: false,
                max_gap_minutes: 120,
            },
        }
    }

    pub fn name(self) -> &'static str {
        self.profile().name
    }

    /// En1545 epoch, 1997-01-01, minute resolution.
    pub fn context(self, stations: &dyn StationResolver) -> FamilyContext<'_> {
        let p = self.profile();
        FamilyContext {
            name: p.name,
            clock: Clock::new(ymd(1997, 1, 1), p.tz, SubDayUnit::Minute),
            currency: p.currency,
            stations,
            agency_id: None,
        }
    }

    pub fn identify(self, card: &dyn Card) -> Identification {
        if card.kind() != CardKind::Iso7816 {
            return Identification::NoMatch;
        }
        let record = card.read(&environment_selector());
        let data = match record.data() {
            Ok(data) => data,
            Err(FareError::Unauthorized(_)) => return Identification::Inconclusive,
            Err(_) => return Identification::NoMatch,
        };
        match data.bits_at(3, 20) {
            Ok(network) if (self.profile().network)(network) => Identification::Match,
            _ => Identification::NoMatch,
        }
    }

    pub fn files(self) -> Vec<FileSpec> {
        let mut files = vec![FileSpec {
            selector: environment_selector(),
            schema: ENVIRONMENT,
            mandatory: true,
            label: "environment",
        }];
        files.extend((1..=EVENT_SLOTS).map(|n| FileSpec {
            selector: file(EVENTS_FILE).record(n),
            schema: self.profile().event,
            mandatory: false,
            label: "event",
        }));
        files.extend((1..=CONTRACT_SLOTS).map(|n| FileSpec {
            selector: file(CONTRACTS_FILE).record(n),
            schema: CONTRACT,
            mandatory: false,
            label: "contract",
        }));
        files.push(FileSpec {
            selector: file(COUNTERS_FILE).record(1),
            schema: COUNTERS,
            mandatory: false,
            label: "counters",
        });
        files
    }

    pub fn parse_identity(self, card: &dyn Card) -> Result<TransitIdentity> {
        Ok(TransitIdentity {
            name: self.name(),
            serial: serial(card),
        })
    }

    pub fn parse(self, card: &dyn Card, ctx: &FamilyContext<'_>) -> Result<TransitData> {
        let profile = self.profile();
        let env_sel = environment_selector();
        let env_record = card.read(&env_sel);
        let env = env_record
            .data()
            .and_then(|data| decode(ENVIRONMENT, data))
            .map_err(|e| FareError::mandatory(&env_sel, e))?;
        let network = env.require("EnvNetworkId")?;

        // Event log
        let events: Vec<Record> = (1..=EVENT_SLOTS)
            .map(|n| card.read(&file(EVENTS_FILE).record(n)))
            .collect();
        let (slots, mut faults) = decode_slots(&events, profile.event);
        let mut txs = Vec::with_capacity(slots.len());
        for slot in &slots {
            let (days, minutes) = slot.fields.date_time("Event").unwrap_or((0, 0));
            match ctx.clock.date_time(days, minutes) {
                Ok(ts) => txs.push(RawTransaction::new(slot, ts, days * MINUTES_PER_DAY + minutes)),
                Err(error) => faults.push(RecordFault {
                    selector: slot.selector.clone(),
                    slot: slot.slot,
                    error,
                }),
            }
        }
        let policy = CalypsoLog { profile: &profile };
        let trips = reconstruct(txs, &policy)
            .iter()
            .map(|j| trip(j, &profile, ctx))
            .collect();

        // Counters
        let counters = read_counters(card);
        let balance = match (&counters, profile.purse) {
            (Some(c), true) => c.int("Counter.0.Value").map(|v| ctx.amount(v as i64)),
            _ => None,
        };

        // Contracts
        let contracts: Vec<Record> = (1..=CONTRACT_SLOTS)
            .map(|n| card.read(&file(CONTRACTS_FILE).record(n)))
            .collect();
        let (contract_slots, contract_faults) = decode_slots(&contracts, CONTRACT);
        faults.extend(contract_faults);
        let mut subscriptions = Vec::new();
        for slot in &contract_slots {
            let f = &slot.fields;
            let unused = f.int_or_zero("ContractProvider") == 0 && f.int_or_zero("ContractTariff") == 0;
            if slot.blank || unused {
                continue;
            }
            match subscription(slot.slot, f, counters.as_ref(), ctx) {
                Ok(sub) => subscriptions.push(sub),
                Err(error) => faults.push(RecordFault {
                    selector: slot.selector.clone(),
                    slot: slot.slot,
                    error,
                }),
            }
        }

        let mut info: Vec<(&'static str, InfoValue)> =
            vec![("Network", format!("{network:05x}").into())];
        if let Some(days) = env.int("EnvApplicationValidityEndDate").filter(|&d| d != 0) {
            info.push(("Expires", ctx.clock.day(days)?.into()));
        }
        if let Some(profile_id) = env.int("HolderProfile") {
            info.push(("Holder profile", profile_id.to_string().into()));
        }

        Ok(TransitData {
            name: profile.name,
            serial: serial(card),
            balance,
            trips,
            subscriptions,
            info,
            faults,
        })
    }
}

/// Decimal reading of the chip serial.
fn serial(card: &dyn Card) -> Option<String> {
    let tag = card.tag_id();
    if tag.is_empty() {
        return None;
    }
    tag.int_at(0, tag.len().min(8)).ok().map(|v| v.to_string())
}

fn read_counters(card: &dyn Card) -> Option<DecodedFieldMap> {
    let record = card.read(&file(COUNTERS_FILE).record(1));
    let data = match record.data() {
        Ok(data) => data,
        Err(error) => {
            debug!(%error, "no counters");
            return None;
        }
    };
    match decode(COUNTERS, data) {
        Ok(map) => Some(map),
        Err(error) => {
            warn!(selector = %record.selector, %error, "counters unreadable");
            None
        }
    }
}

fn subscription(
    slot: usize,
    f: &DecodedFieldMap,
    counters: Option<&DecodedFieldMap>,
    ctx: &FamilyContext<'_>,
) -> Result<Subscription> {
    // Slot index is 0-based; contract record n pairs with counter n.
    let id = slot as u32 + 1;
    let valid_to = match f.int("ContractEndDate") {
        Some(days) => Some(ctx.clock.day(days)?),
        None => None,
    };
    let remaining_trips = if f.contains("ContractJourneys") {
        counters
            .and_then(|c| c.int(&format!("Counter.{id}.Value")))
            .map(|v| v as u32)
    } else {
        None
    };
    Ok(Subscription {
        id,
        agency: Some(f.int_or_zero("ContractProvider") as u32),
        tariff: Some(f.int_or_zero("ContractTariff") as u32),
        valid_from: Some(ctx.clock.day(f.int_or_zero("ContractStartDate"))?),
        valid_to,
        remaining_trips,
        balance: f.int("ContractPriceAmount").map(|p| ctx.amount(p as i64)),
    })
}

struct CalypsoLog<'a> {
    profile: &'a Profile,
}

impl LogPolicy for CalypsoLog<'_> {
    fn same_trip(&self, first: &RawTransaction, second: &RawTransaction) -> bool {
        let transition = self.profile.transition;
        transition(&first.fields) == Transition::TapOn
            && transition(&second.fields) == Transition::TapOff
            && first.fields.int("EventServiceProvider") == second.fields.int("EventServiceProvider")
            && first.fields.int("EventRouteNumber") == second.fields.int("EventRouteNumber")
            && second
                .ticks
                .checked_sub(first.ticks)
                .is_some_and(|gap| gap <= self.profile.max_gap_minutes)
    }

    fn classify(&self, tx: &RawTransaction) -> TripKind {
        match (self.profile.transition)(&tx.fields) {
            Transition::TopUp => TripKind::TopUp,
            Transition::Capping => TripKind::Capping,
            _ => TripKind::Tap,
        }
    }
}

fn station(tx: &RawTransaction, ctx: &FamilyContext<'_>) -> Option<Station> {
    let location = tx.fields.int_or_zero("EventLocationId") as u32;
    if location == 0 {
        return None;
    }
    let provider = tx.fields.int("EventServiceProvider").map(|p| p as u32);
    Some(ctx.station(provider, location))
}

fn trip(journey: &Journey, profile: &Profile, ctx: &FamilyContext<'_>) -> Trip {
    let first = &journey.first;
    let lone_tap_off =
        journey.last.is_none() && (profile.transition)(&first.fields) == Transition::TapOff;

    let (start, end, origin, destination) = match (&journey.last, lone_tap_off) {
        (Some(last), _) => (
            Some(first.timestamp),
            Some(last.timestamp),
            station(first, ctx),
            station(last, ctx),
        ),
        (None, true) => (None, Some(first.timestamp), None, station(first, ctx)),
        (None, false) => (Some(first.timestamp), None, station(first, ctx), None),
    };

    let fare = profile.price.map(|field| {
        let total: u64 = journey.entries().map(|tx| tx.fields.int_or_zero(field)).sum();
        let amount = ctx.amount(total as i64);
        if journey.kind == TripKind::TopUp {
            amount.negate()
        } else {
            amount
        }
    });

    let mode = match journey.kind {
        TripKind::TopUp => Mode::TicketMachine,
        _ => (profile.mode)(&first.fields),
    };
    let route = first.fields.int_or_zero("EventRouteNumber");

    Trip {
        start,
        end,
        origin,
        destination,
        fare,
        mode,
        kind: journey.kind,
        route: (route != 0).then(|| route.to_string()),
        agency: first.fields.int("EventServiceProvider").map(|p| p as u32),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
