use ulid::Ulid;

use crate::limits::{MAX_ADJUSTMENT_COINS, MAX_REASON_LEN};
use crate::model::*;
use crate::observability::{ADJUSTMENTS_TOTAL, AWARDS_TOTAL};
use crate::settlement::Settlement;
use crate::timeofday::Minutes;

use super::conflict::now_ms;
use super::mutations::validate_customer_key;
use super::{Engine, LedgerError};

/// Coins earned for a session: `floor(base * minutes / 60)`.
///
/// Integer arithmetic, so 10 coins/hour over 90 minutes is exactly 15.
pub fn session_coins(base_coins_per_session: u32, minutes: Minutes) -> i64 {
    i64::from(base_coins_per_session) * i64::from(minutes) / 60
}

/// What the eligibility step decided, evaluated under the booking's lock.
enum Plan {
    Award { customer_key: String, coins: i64 },
    Skip(AwardOutcome),
}

fn validate_key(customer_key: &str) -> Result<(), LedgerError> {
    validate_customer_key(customer_key).map_err(|e| LedgerError::Validation(e.to_string()))
}

/// `(awarded, customer display name)` of the booking at `loc`.
fn award_state(rs: &ResourceState, loc: &BookingLocation, id: Ulid) -> Option<(bool, String)> {
    let day = rs.day(&loc.date)?;
    match loc.channel {
        Channel::Reservation => day.reservation(id).map(|r| (r.awarded, r.customer_name.clone())),
        Channel::Counter => day.counter(id).map(|c| (c.awarded, c.customer_name.clone())),
    }
}

/// Eligibility and coin amount for the automatic award of one booking.
fn plan_for_booking(rs: &ResourceState, loc: &BookingLocation, id: Ulid) -> Result<Plan, LedgerError> {
    let day = rs
        .day(&loc.date)
        .ok_or_else(|| LedgerError::NotFound(format!("booking {id}")))?;
    let base = rs.resource.base_coins_per_session;
    let (customer_key, minutes) = match loc.channel {
        Channel::Reservation => {
            let r = day
                .reservation(id)
                .ok_or_else(|| LedgerError::NotFound(format!("booking {id}")))?;
            if r.status != ReservationStatus::Confirmed {
                return Ok(Plan::Skip(AwardOutcome::NotEligible));
            }
            (r.customer_key.clone(), r.slot.duration())
        }
        Channel::Counter => {
            let c = day
                .counter(id)
                .ok_or_else(|| LedgerError::NotFound(format!("booking {id}")))?;
            if c.settlement() != Settlement::Settled {
                return Ok(Plan::Skip(AwardOutcome::NotEligible));
            }
            let Some(key) = c.customer_key.clone() else {
                return Err(LedgerError::Validation(format!("counter booking {id} has no customer key")));
            };
            (key, c.duration_minutes())
        }
    };
    let coins = session_coins(base, minutes);
    if coins <= 0 {
        return Ok(Plan::Skip(AwardOutcome::NothingToAward));
    }
    Ok(Plan::Award { customer_key, coins })
}

impl Engine {
    /// Credit `coins` to `customer_key` for `booking_id`, at most once per
    /// booking.
    ///
    /// The `awarded` flag is re-read with the booking's resource write-locked
    /// and the customer's account locked. The credit, the flag and the audit
    /// record are committed as one WAL record, so a duplicate or concurrent
    /// call sees the flag and returns `applied = false`.
    pub async fn award(
        &self,
        ctx: &ActorContext,
        customer_key: &str,
        coins: i64,
        booking_id: Ulid,
    ) -> Result<AwardResult, LedgerError> {
        if coins <= 0 {
            return Err(LedgerError::Validation(format!("award must be positive, got {coins}")));
        }
        validate_key(customer_key)?;
        let customer_key = customer_key.trim().to_string();
        let outcome = self
            .award_txn(ctx, booking_id, move |_, _| Ok(Plan::Award { customer_key, coins }))
            .await?;
        Ok(AwardResult { applied: matches!(outcome, AwardOutcome::Applied { .. }) })
    }

    /// Award a booking that reached its qualifying state: a confirmed
    /// reservation or a settled counter session with a customer key.
    /// Eligibility and the amount are decided inside the transaction.
    pub async fn award_for_booking(&self, ctx: &ActorContext, booking_id: Ulid) -> Result<AwardOutcome, LedgerError> {
        self.award_txn(ctx, booking_id, |rs, loc| plan_for_booking(rs, loc, booking_id))
            .await
    }

    async fn award_txn<F>(&self, ctx: &ActorContext, booking_id: Ulid, plan: F) -> Result<AwardOutcome, LedgerError>
    where
        F: FnOnce(&ResourceState, &BookingLocation) -> Result<Plan, LedgerError>,
    {
        let (loc, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let (customer_key, coins) = match plan(&*guard, &loc)? {
            Plan::Award { customer_key, coins } => (customer_key, coins),
            Plan::Skip(outcome) => {
                metrics::counter!(AWARDS_TOTAL, "outcome" => outcome_label(&outcome)).increment(1);
                return Ok(outcome);
            }
        };
        let _account_guard = self.lock_account(&customer_key).await;

        let (awarded, display_name) = award_state(&guard, &loc, booking_id)
            .ok_or_else(|| LedgerError::NotFound(format!("booking {booking_id}")))?;
        if awarded {
            tracing::debug!("duplicate award for booking {booking_id} ignored");
            metrics::counter!(AWARDS_TOTAL, "outcome" => "duplicate").increment(1);
            return Ok(AwardOutcome::AlreadyAwarded);
        }

        let event = Event::CoinsAwarded {
            audit_id: Ulid::new(),
            booking_id,
            resource_id: loc.resource_id,
            customer_key: customer_key.clone(),
            display_name: Some(display_name),
            coins,
            at: now_ms(),
            actor: ctx.actor_id.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(AWARDS_TOTAL, "outcome" => "applied").increment(1);
        tracing::info!("awarded {coins} coins to {customer_key} for booking {booking_id}");
        Ok(AwardOutcome::Applied { coins })
    }

    /// Staff credit or debit of a customer's balance.
    ///
    /// `operation_id` is the idempotency key and becomes the audit record id:
    /// replaying the same operation returns `applied = false`. A debit may
    /// not take the balance below zero.
    pub async fn adjust_balance(
        &self,
        ctx: &ActorContext,
        operation_id: Ulid,
        customer_key: &str,
        coins: i64,
        reason: &str,
    ) -> Result<AwardResult, LedgerError> {
        if coins == 0 {
            return Err(LedgerError::Validation("adjustment must be non-zero".into()));
        }
        if coins.unsigned_abs() > MAX_ADJUSTMENT_COINS.unsigned_abs() {
            return Err(LedgerError::Validation(format!(
                "adjustment exceeds {MAX_ADJUSTMENT_COINS} coins"
            )));
        }
        validate_key(customer_key)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::Validation("adjustment needs a reason".into()));
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(LedgerError::Validation("reason too long".into()));
        }
        let customer_key = customer_key.trim();

        let _gate = self.compact_gate.read().await;
        let _account_guard = self.lock_account(customer_key).await;
        if let Some(existing) = self.audit.get(&operation_id) {
            if existing.customer_key == customer_key && existing.coins == coins {
                return Ok(AwardResult { applied: false });
            }
            return Err(LedgerError::Validation(format!(
                "operation {operation_id} was already used for a different adjustment"
            )));
        }
        let balance = self.accounts.get(customer_key).map_or(0, |a| a.balance);
        if coins < 0 && balance.checked_add(coins).is_none_or(|b| b < 0) {
            return Err(LedgerError::InsufficientBalance { balance, requested: -coins });
        }

        let event = Event::BalanceAdjusted {
            operation_id,
            customer_key: customer_key.to_string(),
            coins,
            reason: reason.to_string(),
            at: now_ms(),
            actor: ctx.actor_id.clone(),
        };
        self.wal_append(&event).await?;
        self.apply_ledger(&event);
        self.notify.send(&event);
        let direction = if coins > 0 { "credit" } else { "debit" };
        metrics::counter!(ADJUSTMENTS_TOTAL, "direction" => direction).increment(1);
        tracing::info!("{} adjusted {customer_key} by {coins}: {reason}", ctx.actor_id);
        Ok(AwardResult { applied: true })
    }

    pub fn balance(&self, customer_key: &str) -> Option<i64> {
        self.accounts.get(customer_key.trim()).map(|a| a.balance)
    }

    pub fn account(&self, customer_key: &str) -> Option<Account> {
        self.accounts.get(customer_key.trim()).map(|a| a.clone())
    }

    /// Audit records in commit order, optionally for one customer.
    pub fn audit_log(&self, customer_key: Option<&str>) -> Vec<AuditRecord> {
        let mut records: Vec<AuditRecord> = self
            .audit
            .iter()
            .filter(|e| customer_key.is_none_or(|k| e.customer_key == k.trim()))
            .map(|e| e.value().clone())
            .collect();
        records.sort_by_key(|r| (r.at, r.id));
        records
    }

    /// Non-sensitive view of a customer: never the balance itself.
    /// `None` when the key has neither an account nor a booking.
    pub async fn lookup_customer(&self, customer_key: &str) -> Option<CustomerProjection> {
        let key = customer_key.trim();
        if key.is_empty() {
            return None;
        }
        let account = self.account(key);
        let mut display_name = account.as_ref().and_then(|a| a.display_name.clone());
        let mut booking_count = 0usize;
        for rs in self.resource_handles() {
            let guard = rs.read().await;
            for day in guard.days.values() {
                for r in day.reservations.iter().filter(|r| r.customer_key == key) {
                    booking_count += 1;
                    display_name.get_or_insert_with(|| r.customer_name.clone());
                }
                for c in day.counter.iter().filter(|c| c.customer_key.as_deref() == Some(key)) {
                    booking_count += 1;
                    display_name.get_or_insert_with(|| c.customer_name.clone());
                }
            }
        }
        if account.is_none() && booking_count == 0 {
            return None;
        }
        Some(CustomerProjection {
            display_name,
            has_balance: account.is_some_and(|a| a.balance > 0),
            booking_count,
        })
    }

    /// Bookings in a qualifying state whose award has not been committed:
    /// confirmed reservations and settled counter sessions with a key.
    pub async fn unawarded_terminal_bookings(&self) -> Vec<Ulid> {
        let mut out = Vec::new();
        for rs in self.resource_handles() {
            let guard = rs.read().await;
            for day in guard.days.values() {
                out.extend(
                    day.reservations
                        .iter()
                        .filter(|r| !r.awarded && r.status == ReservationStatus::Confirmed)
                        .map(|r| r.id),
                );
                out.extend(
                    day.counter
                        .iter()
                        .filter(|c| {
                            !c.awarded && c.customer_key.is_some() && c.settlement() == Settlement::Settled
                        })
                        .map(|c| c.id),
                );
            }
        }
        out
    }
}

pub(crate) fn outcome_label(outcome: &AwardOutcome) -> &'static str {
    match outcome {
        AwardOutcome::Applied { .. } => "applied",
        AwardOutcome::AlreadyAwarded => "duplicate",
        AwardOutcome::NothingToAward => "nothing",
        AwardOutcome::NotEligible => "not_eligible",
    }
}
