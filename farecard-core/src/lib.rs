//! farecard-core: Pure decode library for transit-fare card dumps.
//!
//! No async, no I/O. Takes already-fetched card records, identifies the card
//! family, decodes bit-packed records through declarative schemas, and rebuilds
//! ordered trips from the card's transaction log. Used by `farecard-cli`.

pub mod buffer;
pub mod capability;
pub mod codec;
pub mod family;
pub mod obfuscate;
pub mod schema;
pub mod selector;
pub mod timestamp;
pub mod trips;
pub mod types;

// Re-export commonly used types at crate root
pub use buffer::ByteBuffer;
pub use capability::{CurrencySpec, FamilyContext, NoStations, StationResolver, StationTable};
pub use codec::{decode, encode, encode_onto};
pub use family::{identify, parse, parse_identity, Family, Identification};
pub use schema::{schema_width, DecodedFieldMap, Field, FieldValue};
pub use selector::{Card, CardDump, CardKind, Record, RecordContent, Segment, Selector};
pub use timestamp::{Clock, Precision, SubDayUnit, Timestamp};
pub use trips::{Journey, RawTransaction, RecordFault};
pub use types::{
    FareError, InfoValue, Mode, Result, Station, Subscription, TransitCurrency, TransitData,
    TransitIdentity, Trip, TripKind,
};
