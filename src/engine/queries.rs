use std::collections::HashSet;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Per-seat status for one trip date: booked beats held beats available.
    ///
    /// Reconciles the key first, so holds that just expired show as available.
    /// A key nobody has touched yet is all-available and stays untracked.
    pub async fn seat_map(&self, key: TripDateKey) -> Result<SeatMap, EngineError> {
        let (booked, held): (HashSet<String>, HashSet<String>) = match self.existing_key(&key) {
            None => Default::default(),
            Some(shared) => {
                let mut txn = self.begin(key, shared).await?;
                let now = self.clock.now_ms();
                self.commit_with_expiry(&mut txn.state, now, None).await?;
                (
                    txn.state.booked.keys().cloned().collect(),
                    txn.state.live_holds(now).map(|h| h.seat_code.clone()).collect(),
                )
            }
        };

        let template = self.template.read().await;
        let mut decks = Decks::default();
        for seat in template.ordered() {
            let status = if booked.contains(&seat.code) {
                SeatStatus::Booked
            } else if held.contains(&seat.code) {
                SeatStatus::Held
            } else {
                SeatStatus::Available
            };
            decks.push(
                seat.deck,
                SeatView {
                    code: seat.code.clone(),
                    status,
                    sort_order: seat.sort_order,
                },
            );
        }

        Ok(SeatMap {
            trip_id: key.trip_id,
            date: key.travel_date,
            total_seats: template.len(),
            hold_minutes: self.config.hold_minutes,
            decks,
        })
    }

    pub async fn template(&self) -> Vec<SeatTemplate> {
        self.template.read().await.ordered().into_iter().cloned().collect()
    }

    /// Every hold row recorded for the key, oldest first. No reconciliation:
    /// expired rows may still read HELD.
    pub async fn holds(&self, key: TripDateKey) -> Vec<SeatHold> {
        match self.existing_key(&key) {
            Some(shared) => shared.read().await.holds.clone(),
            None => Vec::new(),
        }
    }

    pub async fn booked_seats(&self, key: TripDateKey) -> Vec<BookedSeat> {
        match self.existing_key(&key) {
            Some(shared) => shared.read().await.booked.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// The cached counter as stored; `None` before the first hold or confirm.
    pub async fn inventory(&self, key: TripDateKey) -> Option<InventoryCounter> {
        let shared = self.existing_key(&key)?;
        let counter = shared.read().await.counter;
        counter
    }

    /// Keys holding at least one HELD row past its expiry. Keys locked right
    /// now are skipped: whoever holds the lock reconciles them.
    pub fn keys_with_expired_holds(&self, now: Ms) -> Vec<TripDateKey> {
        self.keys
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_read()
                    .is_ok_and(|state| state.holds.iter().any(|h| h.is_expired(now)))
            })
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}
