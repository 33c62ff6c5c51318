use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::serial::next_serial;
use crate::timeofday::{self, MINUTES_PER_DAY, Minutes};

use super::availability::{collect_conflicts, free_slots, slot_is_free};
use super::{Engine, EngineError};

impl Engine {
    /// Map an ingest-time resource reference onto the canonical id.
    /// Names match case-insensitively.
    pub fn resolve_resource(&self, reference: &ResourceRef) -> Result<Ulid, EngineError> {
        match reference {
            ResourceRef::Id(id) if self.state.contains_key(id) => Ok(*id),
            ResourceRef::Id(id) => Err(EngineError::NotFound(*id)),
            ResourceRef::Name(name) => self
                .names
                .get(&name.trim().to_lowercase())
                .map(|e| *e.value())
                .ok_or_else(|| EngineError::UnknownResourceName(name.clone())),
        }
    }

    pub async fn resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.resource.clone())
    }

    /// All resources, ordered by name.
    pub async fn list_resources(&self) -> Vec<Resource> {
        let mut out = Vec::with_capacity(self.state.len());
        for rs in self.resource_handles() {
            out.push(rs.read().await.resource.clone());
        }
        out.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        out
    }

    /// Whether `[slot_start, slot_start + slot_minutes)` on `date` is free of
    /// every active booking of the resource. Pure query.
    pub async fn is_available(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        slot_start: Minutes,
        slot_minutes: Minutes,
    ) -> Result<bool, EngineError> {
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(slot_is_free(guard.day(&date), &Span::starting_at(slot_start, slot_minutes)))
    }

    /// `is_available` with the start given as `HH:MM` or `HH:MM AM/PM`.
    pub async fn is_available_at(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        slot_start: &str,
        slot_minutes: Minutes,
    ) -> Result<bool, EngineError> {
        let start = timeofday::parse_time_of_day(slot_start)?;
        self.is_available(resource_id, date, start, slot_minutes).await
    }

    /// Active bookings overlapping `span`, for display next to a candidate
    /// booking. `exclude` leaves out the booking being edited.
    pub async fn conflicts(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<ConflictEntry>, EngineError> {
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(collect_conflicts(guard.day(&date), &span, exclude))
    }

    /// Grid slot starts still open for a reservation on `date`.
    pub async fn free_slots(&self, resource_id: Ulid, date: NaiveDate) -> Result<Vec<Minutes>, EngineError> {
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if !guard.resource.active {
            return Ok(Vec::new());
        }
        Ok(free_slots(
            guard.day(&date),
            &Span::new(0, MINUTES_PER_DAY),
            guard.resource.slot_minutes,
        ))
    }

    /// Reservations of one resource on `date`, by slot.
    pub async fn reservations(&self, resource_id: Ulid, date: NaiveDate) -> Result<Vec<ReservationBooking>, EngineError> {
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.day(&date).map(|d| d.reservations.clone()).unwrap_or_default())
    }

    /// Every counter booking on `date` across the venue, by serial.
    pub async fn counter_bookings(&self, date: NaiveDate) -> Vec<CounterBooking> {
        let mut out = Vec::new();
        for rs in self.resource_handles() {
            let guard = rs.read().await;
            if let Some(day) = guard.day(&date) {
                out.extend(day.counter.iter().cloned());
            }
        }
        out.sort_by_key(|c| c.serial);
        out
    }

    /// The serial the next counter booking on `date` would get right now.
    /// Informational only; the real allocation happens under the day lock.
    pub fn next_serial_preview(&self, date: NaiveDate) -> u32 {
        self.serials.get(&date).map_or(1, |used| next_serial(&used))
    }

    pub async fn reservation(&self, id: Ulid) -> Result<ReservationBooking, EngineError> {
        let loc = self.locate(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_resource(&loc.resource_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard
            .day(&loc.date)
            .and_then(|d| d.reservation(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn counter_booking(&self, id: Ulid) -> Result<CounterBooking, EngineError> {
        let loc = self.locate(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_resource(&loc.resource_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard
            .day(&loc.date)
            .and_then(|d| d.counter(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
