//! Transaction-log reconstruction: decode slots, drop sentinels, order, merge.
//!
//! Pure logic. A family decodes its log records with `decode_slots`, turns each
//! surviving field map into a `RawTransaction`, and hands the list to
//! `reconstruct` together with its `LogPolicy`. Bad slots become `RecordFault`s
//! and never stop the rest of the log from decoding.

use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::decode;
use crate::schema::{DecodedFieldMap, Field};
use crate::selector::{Record, Selector};
use crate::timestamp::Timestamp;
use crate::types::{FareError, TripKind};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One log slot after schema decode.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSlot {
    pub slot: usize,
    pub selector: Selector,
    pub fields: DecodedFieldMap,
    /// Payload was entirely zero.
    pub blank: bool,
}

/// A decoded log entry with its resolved time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawTransaction {
    pub fields: DecodedFieldMap,
    pub slot: usize,
    pub timestamp: Timestamp,
    /// Epoch-relative count the timestamp was built from. Zero marks an unused slot.
    pub ticks: u64,
    pub blank: bool,
}

impl RawTransaction {
    pub fn new(slot: &DecodedSlot, timestamp: Timestamp, ticks: u64) -> Self {
        RawTransaction {
            fields: slot.fields.clone(),
            slot: slot.slot,
            timestamp,
            ticks,
            blank: slot.blank,
        }
    }
}

/// A log record that was excluded, and why.
#[derive(Debug, Serialize)]
pub struct RecordFault {
    pub selector: Selector,
    pub slot: usize,
    pub error: FareError,
}

/// Decode each present record of a log with `schema`.
///
/// Absent slots are skipped silently. Unreadable or malformed slots are
/// returned as faults.
pub fn decode_slots(records: &[Record], schema: &[Field]) -> (Vec<DecodedSlot>, Vec<RecordFault>) {
    let mut slots = Vec::with_capacity(records.len());
    let mut faults = Vec::new();

    for (slot, record) in records.iter().enumerate() {
        let data = match record.data() {
            Ok(data) => data,
            Err(FareError::Absent(_)) => continue,
            Err(error) => {
                warn!(selector = %record.selector, slot, %error, "log slot unreadable");
                faults.push(RecordFault {
                    selector: record.selector.clone(),
                    slot,
                    error,
                });
                continue;
            }
        };
        match decode(schema, data) {
            Ok(fields) => slots.push(DecodedSlot {
                slot,
                selector: record.selector.clone(),
                fields,
                blank: data.is_all_zero(),
            }),
            Err(error) => {
                warn!(selector = %record.selector, slot, %error, "log slot excluded");
                faults.push(RecordFault {
                    selector: record.selector.clone(),
                    slot,
                    error,
                });
            }
        }
    }
    (slots, faults)
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Family-specific rules for reading a transaction log.
pub trait LogPolicy {
    /// Unused slot. Default: all-zero payload or zero time.
    fn is_sentinel(&self, tx: &RawTransaction) -> bool {
        tx.blank || tx.ticks == 0
    }

    /// `second` completes the physical trip started by `first`.
    fn same_trip(&self, first: &RawTransaction, second: &RawTransaction) -> bool;

    fn classify(&self, tx: &RawTransaction) -> TripKind;
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// One reconstructed event: a single log entry, or two merged entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Journey {
    pub first: RawTransaction,
    pub last: Option<RawTransaction>,
    pub kind: TripKind,
}

impl Journey {
    pub fn single(tx: RawTransaction, kind: TripKind) -> Self {
        Journey {
            first: tx,
            last: None,
            kind,
        }
    }

    pub fn is_merged(&self) -> bool {
        self.last.is_some()
    }

    /// Entries in log order.
    pub fn entries(&self) -> impl Iterator<Item = &RawTransaction> {
        std::iter::once(&self.first).chain(self.last.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Ascending by time; equal times keep slot order.
pub fn order(mut txs: Vec<RawTransaction>) -> Vec<RawTransaction> {
    txs.sort_by_key(|tx| (tx.timestamp.sort_key(), tx.slot));
    txs
}

/// Merge adjacent single entries the policy pairs up. Idempotent.
pub fn merge<P: LogPolicy + ?Sized>(journeys: Vec<Journey>, policy: &P) -> Vec<Journey> {
    let mut out: Vec<Journey> = Vec::with_capacity(journeys.len());
    for journey in journeys {
        if let Some(prev) = out.last_mut() {
            if !prev.is_merged()
                && !journey.is_merged()
                && policy.same_trip(&prev.first, &journey.first)
            {
                debug!(
                    first = prev.first.slot,
                    second = journey.first.slot,
                    "merging log entries"
                );
                prev.last = Some(journey.first);
                continue;
            }
        }
        out.push(journey);
    }
    out
}

/// Sentinel filter, ordering, classification and merge, in that order.
pub fn reconstruct<P: LogPolicy + ?Sized>(txs: Vec<RawTransaction>, policy: &P) -> Vec<Journey> {
    let live: Vec<RawTransaction> = txs
        .into_iter()
        .filter(|tx| {
            let sentinel = policy.is_sentinel(tx);
            if sentinel {
                debug!(slot = tx.slot, "skipping empty log slot");
            }
            !sentinel
        })
        .collect();

    let singles = order(live)
        .into_iter()
        .map(|tx| {
            let kind = policy.classify(&tx);
            Journey::single(tx, kind)
        })
        .collect();
    merge(singles, policy)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuffer;
    use crate::schema::FieldValue;
    use crate::selector::RecordContent;
    use crate::timestamp::{ymd, Clock, SubDayUnit};
    use chrono_tz::Tz;

    const LOG: &[Field] = &[
        Field::int("Kind", 4),
        Field::int("Route", 4),
        Field::time("Minute", 16),
    ];

    /// Kind 1 = on, 2 = off, 3 = top-up. Same route within 60 minutes merges.
    struct TestPolicy;

    impl LogPolicy for TestPolicy {
        fn same_trip(&self, first: &RawTransaction, second: &RawTransaction) -> bool {
            first.fields.int("Kind") == Some(1)
                && second.fields.int("Kind") == Some(2)
                && first.fields.int("Route") == second.fields.int("Route")
                && second.ticks - first.ticks <= 60
        }

        fn classify(&self, tx: &RawTransaction) -> TripKind {
            match tx.fields.int("Kind") {
                Some(3) => TripKind::TopUp,
                _ => TripKind::Tap,
            }
        }
    }

    fn clock() -> Clock {
        Clock::new(ymd(2000, 1, 1), Tz::UTC, SubDayUnit::Minute)
    }

    fn record(slot: u8, hex: &str) -> Record {
        Record::present(
            Selector::path(&[0x2010]).record(slot),
            ByteBuffer::from_hex(hex).unwrap(),
        )
    }

    fn to_txs(slots: &[DecodedSlot]) -> Vec<RawTransaction> {
        slots
            .iter()
            .map(|s| {
                let minute = s.fields.int_or_zero("Minute");
                RawTransaction::new(s, clock().since_epoch(minute).unwrap(), minute)
            })
            .collect()
    }

    fn tx(slot: usize, kind: u64, route: u64, minute: u64) -> RawTransaction {
        let fields = DecodedFieldMap::new()
            .with("Kind", FieldValue::Int(kind))
            .with("Route", FieldValue::Int(route))
            .with("Minute", FieldValue::Time(minute));
        RawTransaction {
            fields,
            slot,
            timestamp: clock().since_epoch(minute).unwrap(),
            ticks: minute,
            blank: false,
        }
    }

    #[test]
    fn test_decode_slots_isolates_faults() {
        let records = vec![
            record(1, "110064"),
            record(2, "12"), // too short
            record(3, "2100c8"),
            Record {
                selector: Selector::path(&[0x2010]).record(4),
                content: RecordContent::Unauthorized,
            },
            Record {
                selector: Selector::path(&[0x2010]).record(5),
                content: RecordContent::Absent,
            },
            record(6, "000000"),
        ];
        let (slots, faults) = decode_slots(&records, LOG);
        assert_eq!(slots.len(), 3);
        assert_eq!(faults.len(), 2);
        assert!(faults[0].error.is_overrun());
        assert_eq!(faults[0].slot, 1);
        assert!(matches!(faults[1].error, FareError::Unauthorized(_)));
        assert!(slots[2].blank);
    }

    #[test]
    fn test_fault_isolation() {
        // N valid slots plus one overrun slot yields exactly N trips.
        let records = vec![
            record(1, "310010"),
            record(2, "3100"),
            record(3, "310020"),
            record(4, "310030"),
        ];
        let (slots, faults) = decode_slots(&records, LOG);
        let journeys = reconstruct(to_txs(&slots), &TestPolicy);
        assert_eq!(faults.len(), 1);
        assert_eq!(journeys.len(), 3);
        assert!(journeys.iter().all(|j| j.kind == TripKind::TopUp));
        let minutes: Vec<u64> = journeys.iter().map(|j| j.first.ticks).collect();
        assert_eq!(minutes, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn test_sentinels_dropped() {
        let records = vec![record(1, "000000"), record(2, "110000"), record(3, "110005")];
        let (slots, _) = decode_slots(&records, LOG);
        let journeys = reconstruct(to_txs(&slots), &TestPolicy);
        assert_eq!(journeys.len(), 1);
        assert_eq!(journeys[0].first.slot, 2);
    }

    #[test]
    fn test_order_is_stable_on_ties() {
        let sorted = order(vec![tx(4, 1, 1, 50), tx(0, 1, 2, 90), tx(2, 1, 3, 50)]);
        let slots: Vec<usize> = sorted.iter().map(|t| t.slot).collect();
        assert_eq!(slots, vec![2, 4, 0]);
    }

    #[test]
    fn test_circular_log_sorted() {
        // Newest entry sits in slot 0 after wraparound.
        let journeys = reconstruct(
            vec![tx(0, 3, 0, 400), tx(1, 3, 0, 100), tx(2, 3, 0, 200)],
            &TestPolicy,
        );
        let slots: Vec<usize> = journeys.iter().map(|j| j.first.slot).collect();
        assert_eq!(slots, vec![1, 2, 0]);
    }

    #[test]
    fn test_merge_pairs_tap_on_tap_off() {
        let journeys = reconstruct(
            vec![
                tx(0, 1, 5, 10),
                tx(1, 2, 5, 40),
                tx(2, 1, 5, 100),
                tx(3, 2, 6, 110), // different route
                tx(4, 2, 6, 300),
            ],
            &TestPolicy,
        );
        assert_eq!(journeys.len(), 4);
        assert!(journeys[0].is_merged());
        assert_eq!(journeys[0].first.slot, 0);
        assert_eq!(journeys[0].last.as_ref().map(|t| t.slot), Some(1));
        assert!(!journeys[1].is_merged());
        assert_eq!(journeys[0].entries().count(), 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let lists = vec![
            vec![tx(0, 1, 5, 10), tx(1, 2, 5, 40), tx(2, 2, 5, 41)],
            vec![tx(0, 1, 5, 10), tx(1, 1, 5, 20), tx(2, 2, 5, 30), tx(3, 2, 5, 35)],
            vec![tx(0, 2, 1, 1), tx(1, 3, 0, 2)],
            vec![],
        ];
        for list in lists {
            let once = reconstruct(list, &TestPolicy);
            let twice = merge(once.clone(), &TestPolicy);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_merge_never_chains_three() {
        let journeys = merge(
            vec![
                Journey::single(tx(0, 1, 5, 10), TripKind::Tap),
                Journey::single(tx(1, 2, 5, 20), TripKind::Tap),
                Journey::single(tx(2, 2, 5, 30), TripKind::Tap),
            ],
            &TestPolicy,
        );
        assert_eq!(journeys.len(), 2);
        assert!(journeys[0].is_merged());
        assert!(!journeys[1].is_merged());
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_merge_logs_slots_in_log_order() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            reconstruct(vec![tx(7, 1, 5, 10), tx(2, 2, 5, 40)], &TestPolicy)
        });

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("first=7 second=2"), "{logs}");
    }
}
