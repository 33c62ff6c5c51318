mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{collect_conflicts, reservation_slot_taken, slot_is_free};
pub use error::{EngineError, LedgerError};
pub use ledger::session_coins;
pub use mutations::PaymentUpdate;

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// What the engine does when a write overlaps existing active bookings.
///
/// Two reservations on the same slot are always rejected. The policy decides
/// the remaining cases: counter sessions against anything, and reservations
/// against counter sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Reject the write with `EngineError::Conflict`.
    #[default]
    Enforce,
    /// Accept the write and hand the overlaps back as warnings.
    Advisory,
}

impl OverlapPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enforce" => Some(OverlapPolicy::Enforce),
            "advisory" | "warn" => Some(OverlapPolicy::Advisory),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OverlapPolicy::Enforce => "enforce",
            OverlapPolicy::Advisory => "advisory",
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    InjectFault {
        fault: crate::wal::InjectedFault,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL; batches every append that is already queued into a single
/// fsync and answers all of them with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Flush what we have before compaction or stats see the log.
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so no half-buffered bytes leak into
    // the next batch; the callers of this one are all told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::InjectFault { fault } => wal.inject_fault(fault),
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One venue's booking store.
///
/// Each resource's bookings sit behind their own `RwLock`; every write that
/// decides occupancy holds that resource's write lock from check to commit,
/// so the engine is the single writer for slot decisions. Serials are unique
/// per date across resources and are allocated under a per-date lock.
/// Ledger writes additionally hold a per-customer lock. Lock order is always
/// resource → date → customer, with the compaction gate taken first.
pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedResourceState>,
    /// Lower-cased resource name → id.
    pub(super) names: DashMap<String, Ulid>,
    pub(super) bookings: DashMap<Ulid, BookingLocation>,
    pub(super) serials: DashMap<NaiveDate, BTreeSet<u32>>,
    serial_locks: DashMap<NaiveDate, Arc<Mutex<()>>>,
    pub(super) accounts: DashMap<String, Account>,
    account_locks: DashMap<String, Arc<Mutex<()>>>,
    pub(super) audit: DashMap<Ulid, AuditRecord>,
    /// Writers that take no resource lock hold this shared; compaction
    /// holds it exclusively.
    pub(super) compact_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) policy: OverlapPolicy,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: OverlapPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            names: DashMap::new(),
            bookings: DashMap::new(),
            serials: DashMap::new(),
            serial_locks: DashMap::new(),
            accounts: DashMap::new(),
            account_locks: DashMap::new(),
            audit: DashMap::new(),
            compact_gate: RwLock::new(()),
            wal_tx,
            notify,
            policy,
        };

        // We are the sole owner of every lock during replay, so try_write
        // never fails; blocking_write would panic inside a runtime.
        for event in &events {
            match event {
                Event::ResourceCreated { resource } => engine.install_resource(resource.clone()),
                other => match other.resource_id() {
                    Some(resource_id) => {
                        let Some(rs) = engine.get_resource(&resource_id) else {
                            tracing::warn!("replay: {} for unknown resource {resource_id}", other.kind());
                            continue;
                        };
                        if let Ok(mut guard) = rs.try_write() {
                            engine.apply_to_resource(&mut guard, other);
                        }
                    }
                    None => engine.apply_ledger(other),
                },
            }
        }
        tracing::info!(
            "engine loaded: {} events, {} resources, {} bookings, {} accounts",
            events.len(),
            engine.state.len(),
            engine.bookings.len(),
            engine.accounts.len()
        );

        Ok(engine)
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    pub(super) fn install_resource(&self, resource: Resource) {
        self.names.insert(resource.name.to_lowercase(), resource.id);
        let id = resource.id;
        self.state.insert(id, Arc::new(RwLock::new(ResourceState::new(resource))));
    }

    /// Apply a committed event to a resource the caller has write-locked,
    /// keeping the engine-wide indices in step.
    pub(super) fn apply_to_resource(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ResourceUpdated { id: _, name, hourly_rate, base_coins_per_session, slot_minutes } => {
                if rs.resource.name.to_lowercase() != name.to_lowercase() {
                    self.names.remove(&rs.resource.name.to_lowercase());
                    self.names.insert(name.to_lowercase(), rs.resource.id);
                }
                rs.resource.name = name.clone();
                rs.resource.hourly_rate = *hourly_rate;
                rs.resource.base_coins_per_session = *base_coins_per_session;
                rs.resource.slot_minutes = *slot_minutes;
            }
            Event::ResourceActivation { active, .. } => {
                rs.resource.active = *active;
            }
            Event::ReservationCreated { booking } => {
                self.bookings.insert(
                    booking.id,
                    BookingLocation {
                        resource_id: booking.resource_id,
                        date: booking.date,
                        channel: Channel::Reservation,
                    },
                );
                rs.day_mut(booking.date).insert_reservation(booking.clone());
            }
            Event::ReservationStatusChanged { id, to, .. } => {
                if let Some(r) = self.reservation_in(rs, *id) {
                    r.status = *to;
                }
            }
            Event::CounterBookingCreated { booking } => {
                self.bookings.insert(
                    booking.id,
                    BookingLocation {
                        resource_id: booking.resource_id,
                        date: booking.date,
                        channel: Channel::Counter,
                    },
                );
                self.serials.entry(booking.date).or_default().insert(booking.serial);
                rs.day_mut(booking.date).insert_counter(booking.clone());
            }
            Event::CounterTimesChanged { id, span, .. } => {
                if let Some(loc) = self.locate(id) {
                    let day = rs.day_mut(loc.date);
                    // Re-insert to keep the day sorted by start.
                    if let Some(mut booking) = day.remove_counter(*id) {
                        booking.span = *span;
                        day.insert_counter(booking);
                    }
                }
            }
            Event::CounterPaymentUpdated { id, payment, .. } => {
                if let Some(c) = self.counter_in(rs, *id) {
                    c.payment = *payment;
                }
            }
            Event::CounterSessionClosed { id, .. } => {
                if let Some(c) = self.counter_in(rs, *id) {
                    c.session = SessionStatus::Closed;
                }
            }
            Event::CounterBookingDeleted { id, .. } => {
                if let Some((_, loc)) = self.bookings.remove(id) {
                    let day = rs.day_mut(loc.date);
                    if let Some(removed) = day.remove_counter(*id)
                        && let Some(mut used) = self.serials.get_mut(&loc.date)
                    {
                        used.remove(&removed.serial);
                    }
                    if day.is_empty() {
                        rs.days.remove(&loc.date);
                    }
                }
            }
            Event::CoinsAwarded { booking_id, at, .. } => {
                // A booking is credited at most once, even if the log holds a
                // second award whose first commit was reported as failed.
                let first = match self.locate(booking_id).map(|loc| loc.channel) {
                    Some(Channel::Reservation) => match self.reservation_in(rs, *booking_id) {
                        Some(r) if r.awarded => false,
                        Some(r) => {
                            r.awarded = true;
                            r.awarded_at = Some(*at);
                            true
                        }
                        None => true,
                    },
                    Some(Channel::Counter) => match self.counter_in(rs, *booking_id) {
                        Some(c) if c.awarded => false,
                        Some(c) => {
                            c.awarded = true;
                            c.awarded_at = Some(*at);
                            true
                        }
                        None => true,
                    },
                    None => true,
                };
                if first {
                    self.apply_ledger(event);
                } else {
                    tracing::warn!("duplicate award for booking {booking_id} ignored");
                }
            }
            // Created at the DashMap level; ledger-only events never reach here.
            Event::ResourceCreated { .. }
            | Event::BalanceAdjusted { .. }
            | Event::AccountRestored { .. }
            | Event::AuditRestored { .. } => {}
        }
    }

    /// Apply the account and audit half of a committed ledger event.
    pub(super) fn apply_ledger(&self, event: &Event) {
        match event {
            Event::CoinsAwarded {
                audit_id,
                booking_id,
                customer_key,
                display_name,
                coins,
                at,
                actor,
                ..
            } => {
                let balance_after = self.credit(customer_key, display_name.as_deref(), *coins, *at);
                self.audit.insert(
                    *audit_id,
                    AuditRecord {
                        id: *audit_id,
                        kind: AuditKind::Award,
                        customer_key: customer_key.clone(),
                        coins: *coins,
                        balance_after,
                        booking_id: Some(*booking_id),
                        reason: None,
                        actor: actor.clone(),
                        at: *at,
                    },
                );
            }
            Event::BalanceAdjusted { operation_id, customer_key, coins, reason, at, actor } => {
                if self.audit.contains_key(operation_id) {
                    return;
                }
                let balance_after = self.credit(customer_key, None, *coins, *at);
                self.audit.insert(
                    *operation_id,
                    AuditRecord {
                        id: *operation_id,
                        kind: AuditKind::Manual,
                        customer_key: customer_key.clone(),
                        coins: *coins,
                        balance_after,
                        booking_id: None,
                        reason: Some(reason.clone()),
                        actor: actor.clone(),
                        at: *at,
                    },
                );
            }
            Event::AccountRestored { account } => {
                self.accounts.insert(account.customer_key.clone(), account.clone());
            }
            Event::AuditRestored { record } => {
                self.audit.insert(record.id, record.clone());
            }
            _ => {}
        }
    }

    /// Add `coins` to an account, opening it at zero on first use.
    fn credit(&self, customer_key: &str, display_name: Option<&str>, coins: i64, at: Ms) -> i64 {
        let mut account = self
            .accounts
            .entry(customer_key.to_string())
            .or_insert_with(|| Account {
                customer_key: customer_key.to_string(),
                display_name: None,
                balance: 0,
                updated_at: at,
            });
        account.balance = account.balance.saturating_add(coins);
        account.updated_at = at;
        if let Some(name) = display_name {
            account.display_name = Some(name.to_string());
        }
        account.balance
    }

    fn reservation_in<'a>(&self, rs: &'a mut ResourceState, id: Ulid) -> Option<&'a mut ReservationBooking> {
        let loc = self.locate(&id)?;
        rs.days.get_mut(&loc.date)?.reservation_mut(id)
    }

    fn counter_in<'a>(&self, rs: &'a mut ResourceState, id: Ulid) -> Option<&'a mut CounterBooking> {
        let loc = self.locate(&id)?;
        rs.days.get_mut(&loc.date)?.counter_mut(id)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make the next WAL commit fail at `fault`.
    #[cfg(test)]
    pub(crate) async fn inject_wal_fault(&self, fault: crate::wal::InjectedFault) {
        let _ = self.wal_tx.send(WalCommand::InjectFault { fault }).await;
    }

    /// WAL-append, apply and publish one resource event.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_resource(rs, event);
        self.notify.send(event);
        Ok(())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn locate(&self, booking_id: &Ulid) -> Option<BookingLocation> {
        self.bookings.get(booking_id).map(|e| *e.value())
    }

    /// Lookup booking → resource and take the resource's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(BookingLocation, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let loc = self.locate(booking_id).ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .get_resource(&loc.resource_id)
            .ok_or(EngineError::NotFound(loc.resource_id))?;
        let guard = rs.write_owned().await;
        // The booking may have been deleted while we waited for the lock.
        let loc = self.locate(booking_id).ok_or(EngineError::NotFound(*booking_id))?;
        Ok((loc, guard))
    }

    pub(super) async fn lock_serial_day(&self, date: NaiveDate) -> OwnedMutexGuard<()> {
        let lock = self.serial_locks.entry(date).or_default().clone();
        lock.lock_owned().await
    }

    pub(super) async fn lock_account(&self, customer_key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .account_locks
            .entry(customer_key.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Snapshot every resource handle without holding DashMap shard locks
    /// across awaits.
    pub(super) fn resource_handles(&self) -> Vec<SharedResourceState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }
}
