use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use ulid::Ulid;

use crate::engine::{Engine, LedgerError};
use crate::model::*;
use crate::settlement::Settlement;

/// Bounded retry for transient ledger failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base_delay: Duration::from_millis(50) }
    }
}

/// The booking whose award this committed event may unlock: a reservation
/// moving into `Confirmed`, or a counter session whose settlement moves into
/// `Settled` (including one created already settled).
pub fn qualifying_booking(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationStatusChanged { id, from, to, .. }
            if *to == ReservationStatus::Confirmed && *from != ReservationStatus::Confirmed =>
        {
            Some(*id)
        }
        Event::CounterPaymentUpdated { id, previous, settlement, .. }
            if *settlement == Settlement::Settled && *previous != Settlement::Settled =>
        {
            Some(*id)
        }
        Event::CounterBookingCreated { booking }
            if !booking.awarded
                && booking.customer_key.is_some()
                && booking.settlement() == Settlement::Settled =>
        {
            Some(booking.id)
        }
        _ => None,
    }
}

/// Run the award path for one booking, retrying only transient failures with
/// exponential backoff. Safe to repeat: the engine's award is idempotent.
pub async fn award_with_retry(
    engine: &Engine,
    ctx: &ActorContext,
    booking_id: Ulid,
    policy: RetryPolicy,
) -> Result<AwardOutcome, LedgerError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match engine.award_for_booking(ctx, booking_id).await {
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let delay = policy.base_delay * 2u32.saturating_pow(attempt - 1);
                tracing::warn!("award for {booking_id} failed (attempt {attempt}): {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Log the final result of an award attempt. Never propagates.
pub(crate) fn report(booking_id: Ulid, result: &Result<AwardOutcome, LedgerError>) {
    match result {
        Ok(AwardOutcome::Applied { .. }) | Ok(AwardOutcome::NothingToAward) => {}
        Ok(AwardOutcome::AlreadyAwarded) => tracing::debug!("booking {booking_id} already awarded"),
        Ok(AwardOutcome::NotEligible) => tracing::debug!("booking {booking_id} no longer qualifies"),
        Err(LedgerError::Validation(msg)) => tracing::info!("booking {booking_id} not awarded: {msg}"),
        Err(e) => tracing::warn!("award for booking {booking_id} failed: {e}"),
    }
}

/// Background task: watch committed events and award bookings as they reach
/// a qualifying state. Each award runs on its own task so a slow retry never
/// holds up the event stream. Events lost to lag are picked up by the sweeper.
pub async fn run_award_trigger(engine: Arc<Engine>, policy: RetryPolicy) {
    let mut rx = engine.notify.subscribe_all();
    let ctx = ActorContext::system("award-trigger");
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(booking_id) = qualifying_booking(&event) else { continue };
                let engine = engine.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let result = award_with_retry(&engine, &ctx, booking_id, policy).await;
                    report(booking_id, &result);
                });
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("award trigger lagged, {missed} events skipped; sweeper will reconcile");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
