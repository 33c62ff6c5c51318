use ulid::Ulid;

use crate::model::*;
use crate::timeofday::{MINUTES_PER_DAY, Minutes};

// ── Slot occupancy ────────────────────────────────────────────────

/// First active reservation whose slot overlaps `slot`.
///
/// On a fixed grid this is the same as "same start time"; comparing by
/// overlap also catches slots laid down before the grid length changed.
pub fn reservation_slot_taken<'a>(
    day: &'a DaySheet,
    slot: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a ReservationBooking> {
    day.reservations_overlapping(slot)
        .find(|r| r.is_active() && Some(r.id) != exclude)
}

/// Whether `slot` on this day sheet is free of every active booking.
///
/// A slot is occupied by a non-cancelled reservation on the same slot or by
/// any open counter session overlapping it. Empty slots are always free.
pub fn slot_is_free(day: Option<&DaySheet>, slot: &Span) -> bool {
    let Some(day) = day else { return true };
    if slot.is_empty() {
        return true;
    }
    if reservation_slot_taken(day, slot, None).is_some() {
        return false;
    }
    !day.counter_overlapping(slot).any(|c| c.is_active())
}

// ── Conflict report ───────────────────────────────────────────────

/// Every active booking that overlaps `span`, reservations first, each
/// channel in start order. `exclude` leaves out the booking being edited.
pub fn collect_conflicts(day: Option<&DaySheet>, span: &Span, exclude: Option<Ulid>) -> Vec<ConflictEntry> {
    let Some(day) = day else { return Vec::new() };
    let mut out: Vec<ConflictEntry> = day
        .reservations_overlapping(span)
        .filter(|r| r.is_active() && Some(r.id) != exclude)
        .map(|r| ConflictEntry {
            booking_id: r.id,
            channel: Channel::Reservation,
            customer_name: r.customer_name.clone(),
            start: r.slot.start,
            end: r.slot.end,
        })
        .collect();
    out.extend(
        day.counter_overlapping(span)
            .filter(|c| c.is_active() && Some(c.id) != exclude)
            .map(|c| ConflictEntry {
                booking_id: c.id,
                channel: Channel::Counter,
                customer_name: c.customer_name.clone(),
                start: c.span.start,
                end: c.span.end,
            }),
    );
    out
}

// ── Free slot listing ─────────────────────────────────────────────

/// Occupied intervals of the day, merged into disjoint spans sorted by start.
pub fn occupied_spans(day: Option<&DaySheet>) -> Vec<Span> {
    let Some(day) = day else { return Vec::new() };
    let mut spans: Vec<Span> = day
        .reservations
        .iter()
        .filter(|r| r.is_active())
        .map(|r| r.slot)
        .chain(day.counter.iter().filter(|c| c.is_active()).map(|c| c.span))
        .filter(|s| !s.is_empty())
        .collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(*span);
    }
    merged
}

/// Start times of every grid slot in `[window.start, window.end)` that is
/// free for a full `slot_minutes`.
pub fn free_slots(day: Option<&DaySheet>, window: &Span, slot_minutes: Minutes) -> Vec<Minutes> {
    if slot_minutes == 0 {
        return Vec::new();
    }
    let busy = occupied_spans(day);
    let end = window.end.min(MINUTES_PER_DAY);
    // First grid point at or after the window start.
    let mut start = window.start.div_ceil(slot_minutes) * slot_minutes;
    let mut free = Vec::new();
    let mut cursor = 0usize;
    while start + slot_minutes <= end {
        let slot = Span::starting_at(start, slot_minutes);
        while cursor < busy.len() && busy[cursor].end <= slot.start {
            cursor += 1;
        }
        let blocked = busy.get(cursor).is_some_and(|b| b.overlaps(&slot));
        if !blocked {
            free.push(start);
        }
        start += slot_minutes;
    }
    free
}
