use crate::model::*;
use crate::observability::CONFLICTS_TOTAL;
use crate::timeofday::MINUTES_PER_DAY;

use super::availability::collect_conflicts;
use super::{EngineError, OverlapPolicy};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// A booking interval must be non-empty and end by midnight.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation(format!("end must be after start: {span}")));
    }
    if span.end > MINUTES_PER_DAY {
        return Err(EngineError::Validation("booking must end by midnight".into()));
    }
    Ok(())
}

fn record(channel: Channel, policy: OverlapPolicy) {
    metrics::counter!(CONFLICTS_TOTAL, "channel" => channel.label(), "policy" => policy.label())
        .increment(1);
}

/// Decide whether a reservation slot may be written.
///
/// Another active reservation on the slot is always a conflict. Open counter
/// sessions overlapping it are rejected under `Enforce` and returned as
/// warnings under `Advisory`.
pub(crate) fn check_reservation(
    day: Option<&DaySheet>,
    slot: &Span,
    policy: OverlapPolicy,
    exclude: Option<ulid::Ulid>,
) -> Result<Vec<ConflictEntry>, EngineError> {
    let hits = collect_conflicts(day, slot, exclude);
    if hits.is_empty() {
        return Ok(hits);
    }
    record(Channel::Reservation, policy);
    let (reservations, counter): (Vec<_>, Vec<_>) =
        hits.into_iter().partition(|h| h.channel == Channel::Reservation);
    if !reservations.is_empty() {
        return Err(EngineError::Conflict(reservations));
    }
    match policy {
        OverlapPolicy::Enforce => Err(EngineError::Conflict(counter)),
        OverlapPolicy::Advisory => {
            tracing::warn!("reservation {slot} accepted over {} open session(s)", counter.len());
            Ok(counter)
        }
    }
}

/// Decide whether a counter session may occupy `span`.
pub(crate) fn check_counter(
    day: Option<&DaySheet>,
    span: &Span,
    policy: OverlapPolicy,
    exclude: Option<ulid::Ulid>,
) -> Result<Vec<ConflictEntry>, EngineError> {
    let hits = collect_conflicts(day, span, exclude);
    if hits.is_empty() {
        return Ok(hits);
    }
    record(Channel::Counter, policy);
    match policy {
        OverlapPolicy::Enforce => Err(EngineError::Conflict(hits)),
        OverlapPolicy::Advisory => {
            for hit in &hits {
                tracing::warn!("counter session {span} accepted: {hit}");
            }
            Ok(hits)
        }
    }
}
