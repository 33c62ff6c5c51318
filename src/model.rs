use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::settlement::{Money, Payment, Settlement};
use crate::timeofday::{self, Minutes};

/// Unix milliseconds. Wall-clock instants for award and audit times.
pub type Ms = i64;

/// Half-open time-of-day interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub const fn new(start: Minutes, end: Minutes) -> Self {
        Self { start, end }
    }

    pub fn starting_at(start: Minutes, duration: Minutes) -> Self {
        Self { start, end: start.saturating_add(duration) }
    }

    pub fn duration(&self) -> Minutes {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        timeofday::overlaps(self.start, self.end, other.start, other.end)
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            timeofday::format_time_of_day(self.start),
            timeofday::format_time_of_day(self.end)
        )
    }
}

/// Which booking channel a booking came in through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Advance, fixed-duration slot reservation made by a customer.
    Reservation,
    /// Walk-in session recorded by staff.
    Counter,
}

impl Channel {
    pub fn label(&self) -> &'static str {
        match self {
            Channel::Reservation => "reservation",
            Channel::Counter => "counter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }
}

/// A bookable game station or table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    pub hourly_rate: Money,
    /// Coins earned for one hour of play.
    pub base_coins_per_session: u32,
    /// Fixed reservation slot length (default 30).
    pub slot_minutes: Minutes,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationBooking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    /// Slot occupied by this reservation; length fixed at creation from the resource.
    pub slot: Span,
    pub customer_key: String,
    pub customer_name: String,
    pub status: ReservationStatus,
    pub awarded: bool,
    pub awarded_at: Option<Ms>,
}

impl ReservationBooking {
    pub fn is_active(&self) -> bool {
        self.status != ReservationStatus::Cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterBooking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub customer_name: String,
    /// Loyalty identity; walk-ins without one never earn coins.
    pub customer_key: Option<String>,
    pub payment: Payment,
    pub serial: u32,
    pub session: SessionStatus,
    pub awarded: bool,
    pub awarded_at: Option<Ms>,
}

impl CounterBooking {
    pub fn is_active(&self) -> bool {
        self.session != SessionStatus::Closed
    }

    /// Always derived from the current payment fields.
    pub fn settlement(&self) -> Settlement {
        self.payment.settlement()
    }

    pub fn duration_minutes(&self) -> Minutes {
        self.span.duration()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub customer_key: String,
    pub display_name: Option<String>,
    pub balance: i64,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    Award,
    Manual,
}

impl AuditKind {
    pub fn label(&self) -> &'static str {
        match self {
            AuditKind::Award => "award",
            AuditKind::Manual => "manual",
        }
    }
}

/// Immutable ledger entry. Never edited or removed once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Ulid,
    pub kind: AuditKind,
    pub customer_key: String,
    pub coins: i64,
    pub balance_after: i64,
    pub booking_id: Option<Ulid>,
    pub reason: Option<String>,
    pub actor: String,
    pub at: Ms,
}

/// Who is performing a ledger operation. Passed explicitly into every call
/// that writes an audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub actor_id: String,
}

impl ActorContext {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self { actor_id: actor_id.into() }
    }

    pub fn system(component: &str) -> Self {
        Self { actor_id: format!("system:{component}") }
    }
}

// ── Per-resource state ─────────────────────────────────────────

/// Everything booked on one resource for one calendar date.
#[derive(Debug, Clone, Default)]
pub struct DaySheet {
    /// Sorted by `slot.start`.
    pub reservations: Vec<ReservationBooking>,
    /// Sorted by `span.start`.
    pub counter: Vec<CounterBooking>,
}

impl DaySheet {
    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty() && self.counter.is_empty()
    }

    pub fn insert_reservation(&mut self, booking: ReservationBooking) {
        let pos = self
            .reservations
            .partition_point(|r| r.slot.start <= booking.slot.start);
        self.reservations.insert(pos, booking);
    }

    pub fn insert_counter(&mut self, booking: CounterBooking) {
        let pos = self
            .counter
            .partition_point(|c| c.span.start <= booking.span.start);
        self.counter.insert(pos, booking);
    }

    pub fn remove_counter(&mut self, id: Ulid) -> Option<CounterBooking> {
        let pos = self.counter.iter().position(|c| c.id == id)?;
        Some(self.counter.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&ReservationBooking> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut ReservationBooking> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn counter(&self, id: Ulid) -> Option<&CounterBooking> {
        self.counter.iter().find(|c| c.id == id)
    }

    pub fn counter_mut(&mut self, id: Ulid) -> Option<&mut CounterBooking> {
        self.counter.iter_mut().find(|c| c.id == id)
    }

    /// Counter bookings whose span overlaps `query`, active or not.
    /// Binary search skips sessions starting at or after `query.end`.
    pub fn counter_overlapping(&self, query: &Span) -> impl Iterator<Item = &CounterBooking> {
        let right_bound = self.counter.partition_point(|c| c.span.start < query.end);
        self.counter[..right_bound]
            .iter()
            .filter(move |c| c.span.overlaps(query))
    }

    /// Reservations whose slot overlaps `query`, active or not.
    pub fn reservations_overlapping(&self, query: &Span) -> impl Iterator<Item = &ReservationBooking> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.slot.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.slot.overlaps(query))
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    pub days: BTreeMap<NaiveDate, DaySheet>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            days: BTreeMap::new(),
        }
    }

    pub fn day(&self, date: &NaiveDate) -> Option<&DaySheet> {
        self.days.get(date)
    }

    pub fn day_mut(&mut self, date: NaiveDate) -> &mut DaySheet {
        self.days.entry(date).or_default()
    }

    pub fn booking_count(&self) -> usize {
        self.days
            .values()
            .map(|d| d.reservations.len() + d.counter.len())
            .sum()
    }
}

/// Where a booking lives; kept in the engine's booking index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingLocation {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub channel: Channel,
}

// ── WAL records ────────────────────────────────────────────────

/// Every committed state change. This is the WAL record format and the
/// payload broadcast to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        resource: Resource,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        hourly_rate: Money,
        base_coins_per_session: u32,
        slot_minutes: Minutes,
    },
    ResourceActivation {
        id: Ulid,
        active: bool,
    },
    ReservationCreated {
        booking: ReservationBooking,
    },
    ReservationStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    CounterBookingCreated {
        booking: CounterBooking,
    },
    CounterTimesChanged {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
    },
    CounterPaymentUpdated {
        id: Ulid,
        resource_id: Ulid,
        payment: Payment,
        previous: Settlement,
        settlement: Settlement,
    },
    CounterSessionClosed {
        id: Ulid,
        resource_id: Ulid,
    },
    CounterBookingDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Balance credit + `awarded` flag + audit record, committed as one record.
    CoinsAwarded {
        audit_id: Ulid,
        booking_id: Ulid,
        resource_id: Ulid,
        customer_key: String,
        display_name: Option<String>,
        coins: i64,
        at: Ms,
        actor: String,
    },
    BalanceAdjusted {
        operation_id: Ulid,
        customer_key: String,
        coins: i64,
        reason: String,
        at: Ms,
        actor: String,
    },
    /// Compaction snapshot of an account balance.
    AccountRestored {
        account: Account,
    },
    /// Compaction snapshot of one audit record.
    AuditRestored {
        record: AuditRecord,
    },
}

impl Event {
    /// Resource this event belongs to; `None` for venue-wide ledger events.
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::ResourceCreated { resource } => Some(resource.id),
            Event::ResourceUpdated { id, .. } | Event::ResourceActivation { id, .. } => Some(*id),
            Event::ReservationCreated { booking } => Some(booking.resource_id),
            Event::CounterBookingCreated { booking } => Some(booking.resource_id),
            Event::ReservationStatusChanged { resource_id, .. }
            | Event::CounterTimesChanged { resource_id, .. }
            | Event::CounterPaymentUpdated { resource_id, .. }
            | Event::CounterSessionClosed { resource_id, .. }
            | Event::CounterBookingDeleted { resource_id, .. }
            | Event::CoinsAwarded { resource_id, .. } => Some(*resource_id),
            Event::BalanceAdjusted { .. }
            | Event::AccountRestored { .. }
            | Event::AuditRestored { .. } => None,
        }
    }

    /// Short name used as the LISTEN payload tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ResourceCreated { .. } => "resource_created",
            Event::ResourceUpdated { .. } => "resource_updated",
            Event::ResourceActivation { .. } => "resource_activation",
            Event::ReservationCreated { .. } => "reservation_created",
            Event::ReservationStatusChanged { .. } => "reservation_status_changed",
            Event::CounterBookingCreated { .. } => "counter_booking_created",
            Event::CounterTimesChanged { .. } => "counter_times_changed",
            Event::CounterPaymentUpdated { .. } => "counter_payment_updated",
            Event::CounterSessionClosed { .. } => "counter_session_closed",
            Event::CounterBookingDeleted { .. } => "counter_booking_deleted",
            Event::CoinsAwarded { .. } => "coins_awarded",
            Event::BalanceAdjusted { .. } => "balance_adjusted",
            Event::AccountRestored { .. } => "account_restored",
            Event::AuditRestored { .. } => "audit_restored",
        }
    }
}

// ── Inputs and results ─────────────────────────────────────────

/// How a counter booking names its resource at the ingest boundary.
/// Stored bookings always carry the canonical id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    Id(Ulid),
    Name(String),
}

impl ResourceRef {
    /// A ULID-shaped string is an id; anything else is treated as a name.
    pub fn parse(s: &str) -> Self {
        match Ulid::from_string(s.trim()) {
            Ok(id) => ResourceRef::Id(id),
            Err(_) => ResourceRef::Name(s.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCounterBooking {
    pub id: Ulid,
    pub resource: ResourceRef,
    pub date: NaiveDate,
    pub span: Span,
    pub customer_name: String,
    pub customer_key: Option<String>,
    pub payment: Payment,
}

/// An existing booking that overlaps a candidate interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub booking_id: Ulid,
    pub channel: Channel,
    pub customer_name: String,
    pub start: Minutes,
    pub end: Minutes,
}

impl std::fmt::Display for ConflictEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "overlaps {} booking for {} ({}-{})",
            self.channel.label(),
            self.customer_name,
            timeofday::format_time_of_day(self.start),
            timeofday::format_time_of_day(self.end)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterReceipt {
    pub id: Ulid,
    pub serial: u32,
    pub settlement: Settlement,
    /// Overlaps accepted under the advisory policy. Always empty when enforcing.
    pub warnings: Vec<ConflictEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationReceipt {
    pub id: Ulid,
    pub slot: Span,
    pub warnings: Vec<ConflictEntry>,
}

/// Non-sensitive customer view: no balance, no contact fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerProjection {
    pub display_name: Option<String>,
    pub has_balance: bool,
    pub booking_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwardResult {
    pub applied: bool,
}

/// What the award trigger did for one booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwardOutcome {
    Applied { coins: i64 },
    AlreadyAwarded,
    /// Computed coin amount was not positive; no transaction attempted.
    NothingToAward,
    /// The booking is not (or no longer) in a qualifying state.
    NotEligible,
}

/// A counter booking record as exported by the legacy store, with the
/// resource named either by id or by display name and times as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyCounterBooking {
    pub id: Ulid,
    pub resource: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub customer_name: String,
    pub customer_key: Option<String>,
    pub amount: Money,
    pub discount: Money,
    pub cash_paid: Money,
    pub digital_paid: Money,
    pub serial: Option<u32>,
    pub closed: bool,
    /// Coins were already credited by the legacy system.
    #[serde(default)]
    pub awarded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: Vec<Ulid>,
    /// Records left out for manual reconciliation, with the reason.
    pub skipped: Vec<(Ulid, String)>,
}
