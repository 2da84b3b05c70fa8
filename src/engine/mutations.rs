use std::collections::HashSet;

use crate::limits::*;
use crate::model::*;
use crate::observability::{SEATS_BOOKED_TOTAL, SEATS_HELD_TOTAL, SEATS_RELEASED_TOTAL};

use super::validate::{normalize_booking_code, normalize_seat_codes, normalize_user_id};
use super::{Engine, EngineError, SharedKeyState};

impl Engine {
    /// Add seats to the template. The batch is rejected whole if any code
    /// repeats within it or already exists.
    pub async fn provision_seats(&self, seats: Vec<SeatTemplate>) -> Result<usize, EngineError> {
        if seats.is_empty() {
            return Err(EngineError::InvalidInput("no seats to provision".into()));
        }
        let mut batch = Vec::with_capacity(seats.len());
        let mut seen = HashSet::new();
        for seat in seats {
            let code = seat.code.trim().to_ascii_uppercase();
            if code.is_empty() {
                return Err(EngineError::InvalidInput("empty seat code".into()));
            }
            if code.len() > MAX_SEAT_CODE_LEN {
                return Err(EngineError::LimitExceeded("seat code too long"));
            }
            if !seen.insert(code.clone()) {
                return Err(EngineError::AlreadyExists(code));
            }
            batch.push(SeatTemplate { code, ..seat });
        }

        let _gate = self.commit_gate.read().await;
        let mut template = self.template.write().await;
        if template.len() + batch.len() > MAX_TEMPLATE_SEATS {
            return Err(EngineError::LimitExceeded("too many template seats"));
        }
        if let Some(existing) = batch.iter().find(|s| template.contains(&s.code)) {
            return Err(EngineError::AlreadyExists(existing.code.clone()));
        }

        self.wal_append(Event::TemplateProvisioned { seats: batch.clone() })
            .await?;
        let n = batch.len();
        for seat in batch {
            template.insert(seat);
        }
        tracing::info!("provisioned {n} template seats ({} total)", template.len());
        Ok(n)
    }

    async fn check_known_seats(&self, codes: &[String]) -> Result<(), EngineError> {
        let template = self.template.read().await;
        let unknown: Vec<String> = codes
            .iter()
            .filter(|c| !template.contains(c))
            .cloned()
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(EngineError::UnknownSeats(unknown))
        }
    }

    /// Hold every seat in `seat_codes` for the configured TTL, or none of them.
    pub async fn hold_seats(
        &self,
        key: TripDateKey,
        seat_codes: &[String],
        user_id: Option<String>,
    ) -> Result<HoldReceipt, EngineError> {
        let codes = normalize_seat_codes(seat_codes)?;
        let user_id = normalize_user_id(user_id)?;
        self.check_known_seats(&codes).await?;

        let shared = self.key_or_create(key)?;
        let mut txn = self.begin(key, shared).await?;
        let state = &mut *txn.state;
        let now = self.clock.now_ms();

        let booked: Vec<String> = codes.iter().filter(|c| state.is_booked(c)).cloned().collect();
        if !booked.is_empty() {
            return Err(self.reject(key, "already_booked", EngineError::AlreadyBooked(booked)));
        }
        let held: Vec<String> = codes
            .iter()
            .filter(|c| state.live_hold(c, now).is_some())
            .cloned()
            .collect();
        if !held.is_empty() {
            return Err(self.reject(key, "already_held", EngineError::AlreadyHeld(held)));
        }
        if state.live_holds(now).count() + codes.len() > MAX_HOLDS_PER_KEY {
            return Err(EngineError::LimitExceeded("too many holds on trip date"));
        }

        let expires_at = now + self.config.hold_ttl_ms();
        let holds = codes
            .iter()
            .map(|code| SeatHold::new(code.clone(), user_id.clone(), expires_at))
            .collect();
        self.commit_with_expiry(state, now, Some(Change::HoldsPlaced { holds }))
            .await?;

        metrics::counter!(SEATS_HELD_TOTAL).increment(codes.len() as u64);
        tracing::debug!("{key}: held {} until {expires_at}", codes.join(","));
        Ok(HoldReceipt {
            trip_id: key.trip_id,
            date: key.travel_date,
            seat_codes: codes,
            user_id,
            hold_minutes: self.config.hold_minutes,
            expires_at,
        })
    }

    /// Turn live holds into ledger rows. Every requested seat must have a
    /// live hold the caller may use; liveness is judged now, not at hold time.
    pub async fn confirm_booking(
        &self,
        key: TripDateKey,
        seat_codes: &[String],
        booking_code: &str,
        user_id: Option<String>,
    ) -> Result<BookingReceipt, EngineError> {
        let codes = normalize_seat_codes(seat_codes)?;
        let booking_code = normalize_booking_code(booking_code)?;
        let user_id = normalize_user_id(user_id)?;
        self.check_known_seats(&codes).await?;

        let Some(shared) = self.existing_key(&key) else {
            let err = EngineError::HoldMissing { held: Vec::new(), requested: codes };
            return Err(self.reject(key, "hold_missing", err));
        };
        let mut txn = self.begin(key, shared).await?;
        let state = &mut *txn.state;
        let now = self.clock.now_ms();

        let (held, hold_ids): (Vec<String>, Vec<_>) = codes
            .iter()
            .filter_map(|c| state.live_hold(c, now))
            .filter(|h| {
                self.config
                    .ownership
                    .permits(h.user_id.as_deref(), user_id.as_deref())
            })
            .map(|h| (h.seat_code.clone(), h.id))
            .unzip();
        if held.len() < codes.len() {
            let err = EngineError::HoldMissing { held, requested: codes };
            return Err(self.reject(key, "hold_missing", err));
        }
        let booked: Vec<String> = codes.iter().filter(|c| state.is_booked(c)).cloned().collect();
        if !booked.is_empty() {
            return Err(self.reject(key, "already_booked", EngineError::AlreadyBooked(booked)));
        }

        let seats = codes
            .iter()
            .map(|code| BookedSeat {
                seat_code: code.clone(),
                booking_code: booking_code.clone(),
            })
            .collect();
        self.commit_with_expiry(state, now, Some(Change::SeatsBooked { hold_ids, seats }))
            .await?;

        metrics::counter!(SEATS_BOOKED_TOTAL).increment(codes.len() as u64);
        tracing::debug!("{key}: booked {} as {booking_code}", codes.join(","));
        Ok(BookingReceipt {
            trip_id: key.trip_id,
            date: key.travel_date,
            booking_code,
            seat_codes: codes,
            user_id,
        })
    }

    /// Give back live holds early. Seats without a live hold the caller may
    /// use are skipped. Returns the seats actually released.
    pub async fn release_seats(
        &self,
        key: TripDateKey,
        seat_codes: &[String],
        user_id: Option<String>,
    ) -> Result<Vec<String>, EngineError> {
        let codes = normalize_seat_codes(seat_codes)?;
        let user_id = normalize_user_id(user_id)?;
        let Some(shared) = self.existing_key(&key) else {
            return Ok(Vec::new());
        };
        let mut txn = self.begin(key, shared).await?;
        let state = &mut *txn.state;
        let now = self.clock.now_ms();

        let (released, hold_ids): (Vec<String>, Vec<_>) = codes
            .iter()
            .filter_map(|c| state.live_hold(c, now))
            .filter(|h| {
                self.config
                    .ownership
                    .permits(h.user_id.as_deref(), user_id.as_deref())
            })
            .map(|h| (h.seat_code.clone(), h.id))
            .unzip();
        let change = (!hold_ids.is_empty()).then_some(Change::HoldsReleased { hold_ids });
        self.commit_with_expiry(state, now, change).await?;

        if !released.is_empty() {
            metrics::counter!(SEATS_RELEASED_TOTAL).increment(released.len() as u64);
            tracing::debug!("{key}: released {}", released.join(","));
        }
        Ok(released)
    }

    /// Run reconciliation alone on one key. Returns how many holds expired.
    pub async fn reconcile_key(&self, key: TripDateKey) -> Result<usize, EngineError> {
        let Some(shared) = self.existing_key(&key) else {
            return Ok(0);
        };
        let mut txn = self.begin(key, shared).await?;
        let now = self.clock.now_ms();
        self.commit_with_expiry(&mut txn.state, now, None).await
    }

    /// Rewrite the WAL as a snapshot: the template, then one restore record per
    /// key. RELEASED hold rows are dropped from memory and from the snapshot.
    /// Commits wait until the rewrite is done.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut snapshot = Vec::with_capacity(self.keys.len() + 1);
        {
            let template = self.template.read().await;
            if !template.is_empty() {
                snapshot.push(Event::TemplateProvisioned {
                    seats: template.ordered().into_iter().cloned().collect(),
                });
            }
        }
        let shared: Vec<SharedKeyState> = self.keys.iter().map(|e| e.value().clone()).collect();
        for entry in shared {
            let mut state = entry.write().await;
            state.holds.retain(|h| h.status != HoldStatus::Released);
            snapshot.push(Event::KeyCommitted {
                key: state.key,
                changes: vec![Change::Restored {
                    holds: state.holds.clone(),
                    booked: state.booked.values().cloned().collect(),
                    counter: state.counter,
                }],
            });
        }

        let records = snapshot.len();
        self.wal_rewrite(snapshot).await?;
        tracing::debug!("WAL rewritten as {records} records");
        Ok(())
    }
}
