use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type TripId = u64;

/// `(trip_id, travel_date)`: the unit of concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TripDateKey {
    pub trip_id: TripId,
    pub travel_date: NaiveDate,
}

impl TripDateKey {
    pub fn new(trip_id: TripId, travel_date: NaiveDate) -> Self {
        Self { trip_id, travel_date }
    }
}

impl fmt::Display for TripDateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trip {} on {}", self.trip_id, self.travel_date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Deck {
    Lower,
    Upper,
}

impl Deck {
    pub fn as_str(&self) -> &'static str {
        match self {
            Deck::Lower => "LOWER",
            Deck::Upper => "UPPER",
        }
    }

    pub fn parse(s: &str) -> Option<Deck> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOWER" => Some(Deck::Lower),
            "UPPER" => Some(Deck::Upper),
            _ => None,
        }
    }
}

/// One seat of the vehicle layout. Immutable once provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatTemplate {
    pub code: String,
    pub deck: Deck,
    pub sort_order: i32,
}

/// The full seat universe, shared by every trip of a tenant.
#[derive(Debug, Clone, Default)]
pub struct SeatTemplateRegistry {
    seats: BTreeMap<String, SeatTemplate>,
}

impl SeatTemplateRegistry {
    pub fn len(&self) -> usize {
        self.seats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.seats.contains_key(code)
    }

    pub fn insert(&mut self, seat: SeatTemplate) {
        self.seats.insert(seat.code.clone(), seat);
    }

    /// Seats ordered by deck, then sort order, then code.
    pub fn ordered(&self) -> Vec<&SeatTemplate> {
        let mut seats: Vec<&SeatTemplate> = self.seats.values().collect();
        seats.sort_by(|a, b| {
            a.deck
                .cmp(&b.deck)
                .then(a.sort_order.cmp(&b.sort_order))
                .then_with(|| a.code.cmp(&b.code))
        });
        seats
    }
}

// ── Holds ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldStatus {
    Held,
    Released,
    Booked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldTransition {
    /// Lazily observed: `expires_at` has passed.
    Expire,
    /// Explicit release by the holder.
    Release,
    /// Confirmed into the ledger.
    Book,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: HoldStatus,
    pub transition: HoldTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hold in state {:?} cannot {:?}", self.from, self.transition)
    }
}

impl std::error::Error for InvalidTransition {}

impl HoldStatus {
    /// The whole transition table. RELEASED and BOOKED are terminal.
    pub fn apply(self, transition: HoldTransition) -> Result<HoldStatus, InvalidTransition> {
        match (self, transition) {
            (HoldStatus::Held, HoldTransition::Expire | HoldTransition::Release) => {
                Ok(HoldStatus::Released)
            }
            (HoldStatus::Held, HoldTransition::Book) => Ok(HoldStatus::Booked),
            (from @ (HoldStatus::Released | HoldStatus::Booked), transition) => {
                Err(InvalidTransition { from, transition })
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Held => "HELD",
            HoldStatus::Released => "RELEASED",
            HoldStatus::Booked => "BOOKED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatHold {
    pub id: Ulid,
    pub seat_code: String,
    pub user_id: Option<String>,
    pub expires_at: Ms,
    pub status: HoldStatus,
}

impl SeatHold {
    pub fn new(seat_code: String, user_id: Option<String>, expires_at: Ms) -> Self {
        Self {
            id: Ulid::new(),
            seat_code,
            user_id,
            expires_at,
            status: HoldStatus::Held,
        }
    }

    /// HELD and not yet past its expiry.
    pub fn is_live(&self, now: Ms) -> bool {
        self.status == HoldStatus::Held && self.expires_at > now
    }

    /// HELD but past its expiry, waiting for reconciliation.
    pub fn is_expired(&self, now: Ms) -> bool {
        self.status == HoldStatus::Held && self.expires_at <= now
    }
}

/// A permanently sold seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedSeat {
    pub seat_code: String,
    pub booking_code: String,
}

/// Cached `(reserved, locked)` counts for a key. Created on first hold/confirm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryCounter {
    pub reserved_seats: u32,
    pub locked_seats: u32,
}

// ── Per-key state ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TripDateState {
    pub key: TripDateKey,
    /// Every hold row ever placed for this key, in placement order.
    pub holds: Vec<SeatHold>,
    /// Ledger, keyed by seat code: at most one row per seat.
    pub booked: BTreeMap<String, BookedSeat>,
    pub counter: Option<InventoryCounter>,
}

impl TripDateState {
    pub fn new(key: TripDateKey) -> Self {
        Self {
            key,
            holds: Vec::new(),
            booked: BTreeMap::new(),
            counter: None,
        }
    }

    pub fn live_hold(&self, seat_code: &str, now: Ms) -> Option<&SeatHold> {
        self.holds
            .iter()
            .rev()
            .find(|h| h.seat_code == seat_code && h.is_live(now))
    }

    pub fn live_holds(&self, now: Ms) -> impl Iterator<Item = &SeatHold> {
        self.holds.iter().filter(move |h| h.is_live(now))
    }

    pub fn expired_hold_ids(&self, now: Ms) -> Vec<Ulid> {
        self.holds
            .iter()
            .filter(|h| h.is_expired(now))
            .map(|h| h.id)
            .collect()
    }

    pub fn is_booked(&self, seat_code: &str) -> bool {
        self.booked.contains_key(seat_code)
    }

    /// Move every listed HELD hold through `transition`. Holds already in a
    /// terminal state are left alone. Returns how many holds moved.
    pub fn transition_holds(&mut self, ids: &[Ulid], transition: HoldTransition) -> u32 {
        let mut moved = 0;
        for hold in self.holds.iter_mut().filter(|h| ids.contains(&h.id)) {
            if let Ok(next) = hold.status.apply(transition) {
                hold.status = next;
                moved += 1;
            }
        }
        moved
    }

    pub fn counter_mut(&mut self) -> &mut InventoryCounter {
        self.counter.get_or_insert_with(InventoryCounter::default)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// One committed change to a key. Several changes commit together in one
/// `Event::KeyCommitted` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    HoldsExpired {
        hold_ids: Vec<Ulid>,
    },
    HoldsReleased {
        hold_ids: Vec<Ulid>,
    },
    HoldsPlaced {
        holds: Vec<SeatHold>,
    },
    SeatsBooked {
        hold_ids: Vec<Ulid>,
        seats: Vec<BookedSeat>,
    },
    /// Full snapshot of a key, written by compaction.
    Restored {
        holds: Vec<SeatHold>,
        booked: Vec<BookedSeat>,
        counter: Option<InventoryCounter>,
    },
}

/// The WAL record format. One record per committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TemplateProvisioned {
        seats: Vec<SeatTemplate>,
    },
    KeyCommitted {
        key: TripDateKey,
        changes: Vec<Change>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatStatus {
    Available,
    Held,
    Booked,
}

impl SeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Available => "available",
            SeatStatus::Held => "held",
            SeatStatus::Booked => "booked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatView {
    pub code: String,
    pub status: SeatStatus,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Decks {
    #[serde(rename = "LOWER")]
    pub lower: Vec<SeatView>,
    #[serde(rename = "UPPER")]
    pub upper: Vec<SeatView>,
}

impl Decks {
    pub fn push(&mut self, deck: Deck, seat: SeatView) {
        match deck {
            Deck::Lower => self.lower.push(seat),
            Deck::Upper => self.upper.push(seat),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Deck, &SeatView)> {
        self.lower
            .iter()
            .map(|s| (Deck::Lower, s))
            .chain(self.upper.iter().map(|s| (Deck::Upper, s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatMap {
    pub trip_id: TripId,
    pub date: NaiveDate,
    pub total_seats: usize,
    pub hold_minutes: u32,
    pub decks: Decks,
}

impl SeatMap {
    pub fn status_of(&self, code: &str) -> Option<SeatStatus> {
        self.decks
            .iter()
            .find(|(_, s)| s.code == code)
            .map(|(_, s)| s.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldReceipt {
    pub trip_id: TripId,
    pub date: NaiveDate,
    pub seat_codes: Vec<String>,
    pub user_id: Option<String>,
    pub hold_minutes: u32,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingReceipt {
    pub trip_id: TripId,
    pub date: NaiveDate,
    pub booking_code: String,
    pub seat_codes: Vec<String>,
    pub user_id: Option<String>,
}
