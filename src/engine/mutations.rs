use std::collections::HashSet;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::serial::next_serial;
use crate::settlement::{Money, Payment, Settlement};
use crate::timeofday::{self, Minutes};

use super::conflict::{check_counter, check_reservation, validate_span};
use super::{Engine, EngineError, OverlapPolicy, WalCommand};

/// Partial edit of a counter booking's monetary fields. `None` keeps the
/// stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentUpdate {
    pub amount: Option<Money>,
    pub discount: Option<Money>,
    pub cash_paid: Option<Money>,
    pub digital_paid: Option<Money>,
}

impl PaymentUpdate {
    pub fn merge(&self, current: &Payment) -> Payment {
        Payment {
            amount: self.amount.unwrap_or(current.amount),
            discount: self.discount.unwrap_or(current.discount),
            cash_paid: self.cash_paid.unwrap_or(current.cash_paid),
            digital_paid: self.digital_paid.unwrap_or(current.digital_paid),
        }
    }
}

fn validate_name(what: &str, name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(super) fn validate_customer_key(key: &str) -> Result<(), EngineError> {
    if key.trim().is_empty() {
        return Err(EngineError::Validation("customer key must not be empty".into()));
    }
    if key.len() > MAX_CUSTOMER_KEY_LEN {
        return Err(EngineError::LimitExceeded("customer key too long"));
    }
    Ok(())
}

fn validate_payment(p: &Payment) -> Result<(), EngineError> {
    if p.amount < 0 || p.discount < 0 || p.cash_paid < 0 || p.digital_paid < 0 {
        return Err(EngineError::Validation("payment fields must not be negative".into()));
    }
    Ok(())
}

fn validate_slot_minutes(slot_minutes: Minutes) -> Result<(), EngineError> {
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&slot_minutes) {
        return Err(EngineError::Validation(format!(
            "slot length must be between {MIN_SLOT_MINUTES} and {MAX_SLOT_MINUTES} minutes"
        )));
    }
    Ok(())
}

fn day_len(rs: &ResourceState, date: &NaiveDate) -> usize {
    rs.day(date).map_or(0, |d| d.reservations.len() + d.counter.len())
}

impl Engine {
    // ── Resources ─────────────────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        hourly_rate: Money,
        base_coins_per_session: u32,
        slot_minutes: Minutes,
    ) -> Result<(), EngineError> {
        validate_name("resource name", &name)?;
        validate_slot_minutes(slot_minutes)?;
        if hourly_rate < 0 {
            return Err(EngineError::Validation("hourly rate must not be negative".into()));
        }
        let _gate = self.compact_gate.read().await;
        if self.state.len() >= MAX_RESOURCES_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let name = name.trim().to_string();
        let key = name.to_lowercase();
        match self.names.entry(key.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateName(name)),
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let resource = Resource {
            id,
            name,
            hourly_rate,
            base_coins_per_session,
            slot_minutes,
            active: true,
        };
        let event = Event::ResourceCreated { resource: resource.clone() };
        if let Err(e) = self.wal_append(&event).await {
            self.names.remove(&key);
            return Err(e);
        }
        self.install_resource(resource);
        self.notify.send(&event);
        Ok(())
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        hourly_rate: Money,
        base_coins_per_session: u32,
        slot_minutes: Minutes,
    ) -> Result<(), EngineError> {
        validate_name("resource name", &name)?;
        validate_slot_minutes(slot_minutes)?;
        if hourly_rate < 0 {
            return Err(EngineError::Validation("hourly rate must not be negative".into()));
        }
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let name = name.trim().to_string();
        let key = name.to_lowercase();
        let renamed = guard.resource.name.to_lowercase() != key;
        if renamed {
            match self.names.entry(key.clone()) {
                Entry::Occupied(_) => return Err(EngineError::DuplicateName(name)),
                Entry::Vacant(v) => {
                    v.insert(id);
                }
            }
        }
        let event = Event::ResourceUpdated { id, name, hourly_rate, base_coins_per_session, slot_minutes };
        let result = self.persist_and_apply(&mut guard, &event).await;
        if result.is_err() && renamed {
            self.names.remove(&key);
        }
        result
    }

    /// Returns `false` when the resource already had that state.
    pub async fn set_resource_active(&self, id: Ulid, active: bool) -> Result<bool, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.resource.active == active {
            return Ok(false);
        }
        let event = Event::ResourceActivation { id, active };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    // ── Reservations ──────────────────────────────────────────

    /// Reserve one grid slot. The slot length is the resource's current
    /// `slot_minutes`; the reservation starts out `Pending`.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        slot_start: Minutes,
        customer_key: String,
        customer_name: String,
    ) -> Result<ReservationReceipt, EngineError> {
        validate_customer_key(&customer_key)?;
        validate_name("customer name", &customer_name)?;
        if self.bookings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        if !guard.resource.active {
            return Err(EngineError::Inactive(resource_id));
        }
        let slot_minutes = guard.resource.slot_minutes;
        if slot_start % slot_minutes != 0 {
            return Err(EngineError::Validation(format!(
                "slot must start on a {slot_minutes}-minute boundary, got {}",
                timeofday::format_time_of_day(slot_start)
            )));
        }
        let slot = Span::starting_at(slot_start, slot_minutes);
        validate_span(&slot)?;
        if day_len(&guard, &date) >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on this date"));
        }
        let warnings = check_reservation(guard.day(&date), &slot, self.policy, None)?;
        if self.bookings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let booking = ReservationBooking {
            id,
            resource_id,
            date,
            slot,
            customer_key: customer_key.trim().to_string(),
            customer_name: customer_name.trim().to_string(),
            status: ReservationStatus::Pending,
            awarded: false,
            awarded_at: None,
        };
        self.persist_and_apply(&mut guard, &Event::ReservationCreated { booking })
            .await?;
        Ok(ReservationReceipt { id, slot, warnings })
    }

    /// Move a reservation to `status`. Setting the current status is a no-op
    /// returning `false`; a cancelled reservation never changes again.
    pub async fn set_reservation_status(&self, id: Ulid, status: ReservationStatus) -> Result<bool, EngineError> {
        let (loc, mut guard) = self.resolve_booking_write(&id).await?;
        if loc.channel != Channel::Reservation {
            return Err(EngineError::Validation(format!("{id} is not a reservation")));
        }
        let from = guard
            .day(&loc.date)
            .and_then(|d| d.reservation(id))
            .map(|r| r.status)
            .ok_or(EngineError::NotFound(id))?;
        if from == status {
            return Ok(false);
        }
        if from == ReservationStatus::Cancelled {
            return Err(EngineError::Immutable { id, status: from });
        }
        let event = Event::ReservationStatusChanged { id, resource_id: loc.resource_id, from, to: status };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    // ── Counter bookings ──────────────────────────────────────

    /// Record a walk-in session: resolve the resource reference, check the
    /// interval, allocate the day's serial and derive settlement.
    pub async fn create_counter_booking(&self, new: NewCounterBooking) -> Result<CounterReceipt, EngineError> {
        validate_name("customer name", &new.customer_name)?;
        if let Some(key) = &new.customer_key {
            validate_customer_key(key)?;
        }
        validate_payment(&new.payment)?;
        validate_span(&new.span)?;
        if self.bookings.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        let resource_id = self.resolve_resource(&new.resource)?;
        let booking = CounterBooking {
            id: new.id,
            resource_id,
            date: new.date,
            span: new.span,
            customer_name: new.customer_name.trim().to_string(),
            customer_key: new.customer_key.map(|k| k.trim().to_string()),
            payment: new.payment,
            serial: 0,
            session: SessionStatus::Open,
            awarded: false,
            awarded_at: None,
        };
        self.insert_counter(booking, self.policy, None).await
    }

    /// Shared by live ingest and legacy import. `serial_hint` is honoured
    /// when that serial is still free on the date.
    async fn insert_counter(
        &self,
        mut booking: CounterBooking,
        policy: OverlapPolicy,
        serial_hint: Option<u32>,
    ) -> Result<CounterReceipt, EngineError> {
        let rs = self
            .get_resource(&booking.resource_id)
            .ok_or(EngineError::NotFound(booking.resource_id))?;
        let mut guard = rs.write().await;
        if !guard.resource.active && booking.session == SessionStatus::Open {
            return Err(EngineError::Inactive(booking.resource_id));
        }
        if day_len(&guard, &booking.date) >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on this date"));
        }
        let warnings = if booking.session == SessionStatus::Open {
            check_counter(guard.day(&booking.date), &booking.span, policy, None)?
        } else {
            Vec::new()
        };
        if self.bookings.contains_key(&booking.id) {
            return Err(EngineError::AlreadyExists(booking.id));
        }

        let _serial_guard = self.lock_serial_day(booking.date).await;
        booking.serial = {
            let used = self.serials.get(&booking.date);
            match (serial_hint, used.as_deref()) {
                (Some(s), Some(used)) if s > 0 && !used.contains(&s) => s,
                (Some(s), None) if s > 0 => s,
                (_, Some(used)) => next_serial(used),
                (_, None) => 1,
            }
        };
        let receipt = CounterReceipt {
            id: booking.id,
            serial: booking.serial,
            settlement: booking.settlement(),
            warnings,
        };
        self.persist_and_apply(&mut guard, &Event::CounterBookingCreated { booking })
            .await?;
        Ok(receipt)
    }

    /// Move an open session to a new interval. Returns overlaps accepted
    /// under the advisory policy.
    pub async fn update_counter_times(&self, id: Ulid, span: Span) -> Result<Vec<ConflictEntry>, EngineError> {
        validate_span(&span)?;
        let (loc, mut guard) = self.resolve_booking_write(&id).await?;
        let current = counter_session(&guard, &loc, id)?;
        if current.session == SessionStatus::Closed {
            return Err(EngineError::Validation(format!("session {id} is closed")));
        }
        if current.span == span {
            return Ok(Vec::new());
        }
        let warnings = check_counter(guard.day(&loc.date), &span, self.policy, Some(id))?;
        let event = Event::CounterTimesChanged { id, resource_id: loc.resource_id, span };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(warnings)
    }

    /// Edit any of the four monetary fields; settlement is re-derived from
    /// the merged values in the same write.
    pub async fn update_counter_payment(&self, id: Ulid, update: PaymentUpdate) -> Result<Settlement, EngineError> {
        let (loc, mut guard) = self.resolve_booking_write(&id).await?;
        let current = counter_session(&guard, &loc, id)?;
        let payment = update.merge(&current.payment);
        validate_payment(&payment)?;
        let settlement = payment.settlement();
        if payment == current.payment {
            return Ok(settlement);
        }
        let event = Event::CounterPaymentUpdated {
            id,
            resource_id: loc.resource_id,
            payment,
            previous: current.payment.settlement(),
            settlement,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(settlement)
    }

    /// Returns `false` when the session was already closed.
    pub async fn close_counter_session(&self, id: Ulid) -> Result<bool, EngineError> {
        let (loc, mut guard) = self.resolve_booking_write(&id).await?;
        if counter_session(&guard, &loc, id)?.session == SessionStatus::Closed {
            return Ok(false);
        }
        let event = Event::CounterSessionClosed { id, resource_id: loc.resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Remove a counter booking; its serial becomes the day's first gap.
    pub async fn delete_counter_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let (loc, mut guard) = self.resolve_booking_write(&id).await?;
        counter_session(&guard, &loc, id)?;
        let _serial_guard = self.lock_serial_day(loc.date).await;
        let event = Event::CounterBookingDeleted { id, resource_id: loc.resource_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Compaction ────────────────────────────────────────────

    /// Rewrite the WAL as a snapshot of current state: one creation event per
    /// resource and booking, then accounts and audit records.
    ///
    /// Holds the compaction gate and every resource write lock until the
    /// rewritten log is in place, so no commit lands between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compact_gate.write().await;
        let mut guards = Vec::new();
        for rs in self.resource_handles() {
            guards.push(rs.write_owned().await);
        }
        guards.sort_by_key(|g| g.resource.id);

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ResourceCreated { resource: guard.resource.clone() });
            for day in guard.days.values() {
                for r in &day.reservations {
                    events.push(Event::ReservationCreated { booking: r.clone() });
                }
                for c in &day.counter {
                    events.push(Event::CounterBookingCreated { booking: c.clone() });
                }
            }
        }
        for account in self.accounts.iter() {
            events.push(Event::AccountRestored { account: account.value().clone() });
        }
        for record in self.audit_log(None) {
            events.push(Event::AuditRestored { record });
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    // ── Legacy import ─────────────────────────────────────────

    /// Import counter bookings exported by the legacy store, which named
    /// resources by id or by display name and kept times as text.
    ///
    /// Fails open per record: anything that cannot be resolved or parsed is
    /// logged and reported, never guessed at. Overlaps are accepted as they
    /// were in the source data. Already-imported ids are skipped so a batch
    /// can be re-run.
    pub async fn migrate_legacy_counter_bookings(
        &self,
        records: Vec<LegacyCounterBooking>,
    ) -> Result<MigrationReport, EngineError> {
        if records.len() > MAX_LEGACY_BATCH {
            return Err(EngineError::LimitExceeded("legacy batch too large"));
        }
        let mut report = MigrationReport::default();
        let mut seen = HashSet::new();
        for record in records {
            let id = record.id;
            if !seen.insert(id) {
                report.skipped.push((id, "duplicate id in batch".to_string()));
                continue;
            }
            let outcome = match self.legacy_to_booking(&record) {
                Ok(booking) => self
                    .insert_counter(booking, OverlapPolicy::Advisory, record.serial)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => report.migrated.push(id),
                Err(EngineError::WalError(e)) => return Err(EngineError::WalError(e)),
                Err(e) => {
                    tracing::warn!("legacy booking {id} skipped: {e}");
                    metrics::counter!(crate::observability::MIGRATION_SKIPPED_TOTAL).increment(1);
                    report.skipped.push((id, e.to_string()));
                }
            }
        }
        tracing::info!(
            "legacy import: {} migrated, {} skipped",
            report.migrated.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn legacy_to_booking(&self, record: &LegacyCounterBooking) -> Result<CounterBooking, EngineError> {
        let resource_id = self.resolve_resource(&ResourceRef::parse(&record.resource))?;
        let date = NaiveDate::parse_from_str(record.date.trim(), "%Y-%m-%d")
            .map_err(|_| EngineError::Validation(format!("bad date {:?}", record.date)))?;
        let span = Span::new(
            timeofday::parse_time_of_day(&record.start_time)?,
            timeofday::parse_time_of_day(&record.end_time)?,
        );
        validate_span(&span)?;
        validate_name("customer name", &record.customer_name)?;
        let customer_key = record
            .customer_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        if let Some(key) = &customer_key {
            validate_customer_key(key)?;
        }
        let payment = Payment::new(record.amount, record.discount, record.cash_paid, record.digital_paid);
        validate_payment(&payment)?;
        Ok(CounterBooking {
            id: record.id,
            resource_id,
            date,
            span,
            customer_name: record.customer_name.trim().to_string(),
            customer_key,
            payment,
            serial: 0,
            session: if record.closed { SessionStatus::Closed } else { SessionStatus::Open },
            awarded: record.awarded,
            awarded_at: None,
        })
    }
}

/// The counter booking at `loc`, or a validation error for a reservation id.
fn counter_session<'a>(rs: &'a ResourceState, loc: &BookingLocation, id: Ulid) -> Result<&'a CounterBooking, EngineError> {
    if loc.channel != Channel::Counter {
        return Err(EngineError::Validation(format!("{id} is not a counter booking")));
    }
    rs.day(&loc.date)
        .and_then(|d| d.counter(id))
        .ok_or(EngineError::NotFound(id))
}
