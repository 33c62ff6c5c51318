use super::*;
use super::conflict::validate_span;
use crate::limits::MAX_ADJUSTMENT_COINS;
use crate::settlement::{Payment, Settlement};
use crate::timeofday::Minutes;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotledger_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_at(path: &PathBuf, policy: OverlapPolicy) -> Engine {
    Engine::new(path.clone(), Arc::new(NotifyHub::new()), policy).unwrap()
}

fn new_engine(name: &str) -> Engine {
    engine_at(&test_wal_path(name), OverlapPolicy::Enforce)
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
}

fn hm(h: u32, m: u32) -> Minutes {
    h * 60 + m
}

fn staff() -> ActorContext {
    ActorContext::new("staff:ravi")
}

async fn add_bay(engine: &Engine, name: &str, base_coins: u32, slot_minutes: Minutes) -> Ulid {
    let id = Ulid::new();
    engine
        .create_resource(id, name.into(), 15_000, base_coins, slot_minutes)
        .await
        .unwrap();
    id
}

fn walk_in(resource: ResourceRef, start: Minutes, end: Minutes) -> NewCounterBooking {
    NewCounterBooking {
        id: Ulid::new(),
        resource,
        date: date(),
        span: Span::new(start, end),
        customer_name: "Walk-in".into(),
        customer_key: None,
        payment: Payment::new(30_000, 0, 0, 0),
    }
}

async fn reserve(engine: &Engine, resource_id: Ulid, start: Minutes, key: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .create_reservation(id, resource_id, date(), start, key.into(), "Anika".into())
        .await
        .unwrap();
    id
}

// ── Pure helpers ─────────────────────────────────────────

#[test]
fn session_coins_floor() {
    assert_eq!(session_coins(10, 90), 15);
    assert_eq!(session_coins(10, 60), 10);
    assert_eq!(session_coins(10, 5), 0);
    assert_eq!(session_coins(7, 30), 3);
    assert_eq!(session_coins(0, 120), 0);
}

#[test]
fn validate_span_bounds() {
    assert!(validate_span(&Span::new(600, 660)).is_ok());
    assert!(validate_span(&Span::new(600, 600)).is_err());
    assert!(validate_span(&Span::new(660, 600)).is_err());
    assert!(validate_span(&Span::new(1410, 1440)).is_ok());
    assert!(validate_span(&Span::new(1410, 1470)).is_err());
}

#[test]
fn overlap_policy_parse() {
    assert_eq!(OverlapPolicy::parse("Enforce"), Some(OverlapPolicy::Enforce));
    assert_eq!(OverlapPolicy::parse("advisory"), Some(OverlapPolicy::Advisory));
    assert_eq!(OverlapPolicy::parse("strict"), None);
    assert_eq!(OverlapPolicy::default(), OverlapPolicy::Enforce);
}

// ── Resources ────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_resources() {
    let engine = new_engine("resources.wal");
    let snooker = add_bay(&engine, "Snooker 1", 10, 30).await;
    add_bay(&engine, "air hockey", 5, 15).await;

    let names: Vec<_> = engine.list_resources().await.into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["air hockey", "Snooker 1"]);

    let r = engine.resource(snooker).await.unwrap();
    assert_eq!(r.slot_minutes, 30);
    assert!(r.active);

    let dup = engine
        .create_resource(Ulid::new(), "SNOOKER 1".into(), 0, 0, 30)
        .await;
    assert!(matches!(dup, Err(EngineError::DuplicateName(_))));
    let same_id = engine.create_resource(snooker, "Other".into(), 0, 0, 30).await;
    assert!(matches!(same_id, Err(EngineError::AlreadyExists(_))));
    let bad_slot = engine.create_resource(Ulid::new(), "Tiny".into(), 0, 0, 1).await;
    assert!(matches!(bad_slot, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn rename_moves_name_index() {
    let engine = new_engine("rename.wal");
    let id = add_bay(&engine, "PS5 Bay", 10, 30).await;
    engine
        .update_resource(id, "PS5 Lounge".into(), 18_000, 12, 30)
        .await
        .unwrap();
    assert_eq!(engine.resolve_resource(&ResourceRef::Name("ps5 lounge".into())).unwrap(), id);
    assert!(matches!(
        engine.resolve_resource(&ResourceRef::Name("PS5 Bay".into())),
        Err(EngineError::UnknownResourceName(_))
    ));
    // The old name is free again.
    add_bay(&engine, "PS5 Bay", 10, 30).await;
}

#[tokio::test]
async fn inactive_resource_rejects_bookings() {
    let engine = new_engine("inactive.wal");
    let id = add_bay(&engine, "Foosball", 10, 30).await;
    assert!(engine.set_resource_active(id, false).await.unwrap());
    assert!(!engine.set_resource_active(id, false).await.unwrap());

    let res = engine
        .create_reservation(Ulid::new(), id, date(), hm(10, 0), "k1".into(), "Lee".into())
        .await;
    assert!(matches!(res, Err(EngineError::Inactive(_))));
    let walk = engine.create_counter_booking(walk_in(ResourceRef::Id(id), 600, 660)).await;
    assert!(matches!(walk, Err(EngineError::Inactive(_))));
    assert!(engine.free_slots(id, date()).await.unwrap().is_empty());
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn counter_session_makes_inner_slot_unavailable() {
    let engine = new_engine("avail_counter.wal");
    let bay = add_bay(&engine, "Pool 2", 10, 30).await;
    engine
        .create_counter_booking(walk_in(ResourceRef::Id(bay), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();

    assert!(!engine.is_available_at(bay, date(), "10:30", 30).await.unwrap());
    assert!(!engine.is_available_at(bay, date(), "10:00 AM", 30).await.unwrap());
    assert!(engine.is_available_at(bay, date(), "11:00", 30).await.unwrap());
    assert!(engine.is_available_at(bay, date(), "09:30", 30).await.unwrap());
    let other_day = date().succ_opt().unwrap();
    assert!(engine.is_available_at(bay, other_day, "10:30", 30).await.unwrap());
}

#[tokio::test]
async fn malformed_time_is_rejected() {
    let engine = new_engine("avail_badtime.wal");
    let bay = add_bay(&engine, "Pool 3", 10, 30).await;
    let err = engine.is_available_at(bay, date(), "half past ten", 30).await;
    assert!(matches!(err, Err(EngineError::BadTime(_))));
}

#[tokio::test]
async fn closed_session_frees_slot() {
    let engine = new_engine("avail_closed.wal");
    let bay = add_bay(&engine, "Darts", 10, 30).await;
    let receipt = engine
        .create_counter_booking(walk_in(ResourceRef::Id(bay), 600, 660))
        .await
        .unwrap();
    assert!(!engine.is_available(bay, date(), 600, 30).await.unwrap());
    assert!(engine.close_counter_session(receipt.id).await.unwrap());
    assert!(!engine.close_counter_session(receipt.id).await.unwrap());
    assert!(engine.is_available(bay, date(), 600, 30).await.unwrap());
}

#[tokio::test]
async fn free_slots_lists_open_grid() {
    let engine = new_engine("free_slots.wal");
    let bay = add_bay(&engine, "Karaoke", 10, 60).await;
    reserve(&engine, bay, hm(18, 0), "k1").await;
    engine
        .create_counter_booking(walk_in(ResourceRef::Id(bay), hm(20, 15), hm(20, 45)))
        .await
        .unwrap();
    let free = engine.free_slots(bay, date()).await.unwrap();
    assert_eq!(free.len(), 24 - 2);
    assert!(!free.contains(&hm(18, 0)));
    assert!(!free.contains(&hm(20, 0)));
    assert!(free.contains(&hm(19, 0)));
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn reservation_slot_is_unique_under_any_policy() {
    for (name, policy) in [("uniq_enforce.wal", OverlapPolicy::Enforce), ("uniq_advisory.wal", OverlapPolicy::Advisory)] {
        let engine = engine_at(&test_wal_path(name), policy);
        let bay = add_bay(&engine, "Table 1", 10, 30).await;
        reserve(&engine, bay, hm(10, 0), "k1").await;
        let second = engine
            .create_reservation(Ulid::new(), bay, date(), hm(10, 0), "k2".into(), "Bo".into())
            .await;
        match second {
            Err(EngineError::Conflict(entries)) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].channel, Channel::Reservation);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn cancelled_reservation_releases_slot() {
    let engine = new_engine("cancel_release.wal");
    let bay = add_bay(&engine, "Table 2", 10, 30).await;
    let first = reserve(&engine, bay, hm(10, 0), "k1").await;
    assert!(engine.set_reservation_status(first, ReservationStatus::Cancelled).await.unwrap());
    reserve(&engine, bay, hm(10, 0), "k2").await;
    assert_eq!(engine.reservations(bay, date()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn reservation_must_sit_on_grid() {
    let engine = new_engine("grid.wal");
    let bay = add_bay(&engine, "Table 3", 10, 30).await;
    let off_grid = engine
        .create_reservation(Ulid::new(), bay, date(), hm(10, 15), "k1".into(), "Jo".into())
        .await;
    assert!(matches!(off_grid, Err(EngineError::Validation(_))));
    let past_midnight = engine
        .create_reservation(Ulid::new(), bay, date(), hm(24, 0), "k1".into(), "Jo".into())
        .await;
    assert!(matches!(past_midnight, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn reservation_status_transitions() {
    let engine = new_engine("status.wal");
    let bay = add_bay(&engine, "Table 4", 10, 30).await;
    let id = reserve(&engine, bay, hm(12, 0), "k1").await;

    assert!(engine.set_reservation_status(id, ReservationStatus::Confirmed).await.unwrap());
    assert!(!engine.set_reservation_status(id, ReservationStatus::Confirmed).await.unwrap());
    assert!(engine.set_reservation_status(id, ReservationStatus::Cancelled).await.unwrap());
    let err = engine.set_reservation_status(id, ReservationStatus::Confirmed).await;
    assert!(matches!(err, Err(EngineError::Immutable { .. })));
    assert_eq!(engine.reservation(id).await.unwrap().status, ReservationStatus::Cancelled);

    let missing = engine.set_reservation_status(Ulid::new(), ReservationStatus::Confirmed).await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));
}

// ── Overlap policy ───────────────────────────────────────

#[tokio::test]
async fn enforce_rejects_cross_channel_overlap() {
    let engine = new_engine("enforce_cross.wal");
    let bay = add_bay(&engine, "VR Pod", 10, 30).await;
    reserve(&engine, bay, hm(10, 0), "k1").await;

    let walk = engine
        .create_counter_booking(walk_in(ResourceRef::Id(bay), hm(9, 45), hm(10, 15)))
        .await;
    match walk {
        Err(EngineError::Conflict(entries)) => {
            assert_eq!(entries[0].customer_name, "Anika");
            assert_eq!((entries[0].start, entries[0].end), (hm(10, 0), hm(10, 30)));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    // Touching is fine.
    engine
        .create_counter_booking(walk_in(ResourceRef::Id(bay), hm(9, 0), hm(10, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn advisory_accepts_overlap_with_warnings() {
    let engine = engine_at(&test_wal_path("advisory.wal"), OverlapPolicy::Advisory);
    let bay = add_bay(&engine, "VR Pod 2", 10, 30).await;
    engine
        .create_counter_booking(walk_in(ResourceRef::Id(bay), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();

    let second = engine
        .create_counter_booking(walk_in(ResourceRef::Id(bay), hm(10, 30), hm(11, 30)))
        .await
        .unwrap();
    assert_eq!(second.warnings.len(), 1);
    assert_eq!(second.warnings[0].channel, Channel::Counter);

    let receipt = engine
        .create_reservation(Ulid::new(), bay, date(), hm(11, 0), "k9".into(), "Sam".into())
        .await
        .unwrap();
    assert_eq!(receipt.warnings.len(), 1);
}

#[tokio::test]
async fn moving_session_ignores_itself() {
    let engine = new_engine("move_self.wal");
    let bay = add_bay(&engine, "Bowling 1", 10, 30).await;
    let receipt = engine
        .create_counter_booking(walk_in(ResourceRef::Id(bay), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();
    let other = engine
        .create_counter_booking(walk_in(ResourceRef::Id(bay), hm(12, 0), hm(13, 0)))
        .await
        .unwrap();

    let warnings = engine
        .update_counter_times(receipt.id, Span::new(hm(10, 30), hm(11, 30)))
        .await
        .unwrap();
    assert!(warnings.is_empty());
    let moved = engine.counter_booking(receipt.id).await.unwrap();
    assert_eq!(moved.span, Span::new(hm(10, 30), hm(11, 30)));

    let clash = engine
        .update_counter_times(other.id, Span::new(hm(11, 0), hm(12, 30)))
        .await;
    assert!(matches!(clash, Err(EngineError::Conflict(_))));
    let hits = engine
        .conflicts(bay, date(), Span::new(hm(11, 0), hm(12, 30)), Some(other.id))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].booking_id, receipt.id);
}

// ── Counter bookings ─────────────────────────────────────

#[tokio::test]
async fn serials_fill_gaps_per_date() {
    let engine = new_engine("serials.wal");
    let a = add_bay(&engine, "Lane A", 10, 30).await;
    let b = add_bay(&engine, "Lane B", 10, 30).await;

    let r1 = engine.create_counter_booking(walk_in(ResourceRef::Id(a), 600, 660)).await.unwrap();
    let r2 = engine.create_counter_booking(walk_in(ResourceRef::Id(b), 600, 660)).await.unwrap();
    let r3 = engine.create_counter_booking(walk_in(ResourceRef::Id(a), 660, 720)).await.unwrap();
    assert_eq!((r1.serial, r2.serial, r3.serial), (1, 2, 3));

    engine.delete_counter_booking(r2.id).await.unwrap();
    assert_eq!(engine.next_serial_preview(date()), 2);
    let r4 = engine.create_counter_booking(walk_in(ResourceRef::Id(b), 720, 780)).await.unwrap();
    assert_eq!(r4.serial, 2);

    let mut tomorrow = walk_in(ResourceRef::Id(a), 600, 660);
    tomorrow.date = date().succ_opt().unwrap();
    assert_eq!(engine.create_counter_booking(tomorrow).await.unwrap().serial, 1);

    let serials: Vec<_> = engine.counter_bookings(date()).await.into_iter().map(|c| c.serial).collect();
    assert_eq!(serials, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_serials_are_distinct() {
    let engine = Arc::new(new_engine("serials_concurrent.wal"));
    let mut bays = Vec::new();
    for i in 0..20 {
        bays.push(add_bay(&engine, &format!("Station {i}"), 10, 30).await);
    }
    let mut handles = Vec::new();
    for bay in bays {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_counter_booking(walk_in(ResourceRef::Id(bay), 600, 660))
                .await
                .unwrap()
                .serial
        }));
    }
    let mut serials = Vec::new();
    for h in handles {
        serials.push(h.await.unwrap());
    }
    serials.sort_unstable();
    assert_eq!(serials, (1..=20).collect::<Vec<u32>>());
}

#[tokio::test]
async fn counter_booking_by_name_stores_canonical_id() {
    let engine = new_engine("by_name.wal");
    let bay = add_bay(&engine, "Pool Table 2", 10, 30).await;
    let receipt = engine
        .create_counter_booking(walk_in(ResourceRef::Name("pool table 2".into()), 600, 660))
        .await
        .unwrap();
    assert_eq!(engine.counter_booking(receipt.id).await.unwrap().resource_id, bay);

    let unknown = engine
        .create_counter_booking(walk_in(ResourceRef::Name("Pool Table 9".into()), 600, 660))
        .await;
    assert!(matches!(unknown, Err(EngineError::UnknownResourceName(_))));
}

#[tokio::test]
async fn settlement_follows_every_payment_edit() {
    let engine = new_engine("settlement.wal");
    let bay = add_bay(&engine, "Snooker 2", 10, 30).await;
    let mut new = walk_in(ResourceRef::Id(bay), 600, 660);
    new.payment = Payment::new(500, 0, 0, 0);
    let receipt = engine.create_counter_booking(new).await.unwrap();
    assert_eq!(receipt.settlement, Settlement::Pending);

    let partial = PaymentUpdate { cash_paid: Some(200), ..Default::default() };
    assert_eq!(engine.update_counter_payment(receipt.id, partial).await.unwrap(), Settlement::Partial);

    let topped = PaymentUpdate { digital_paid: Some(300), ..Default::default() };
    assert_eq!(engine.update_counter_payment(receipt.id, topped).await.unwrap(), Settlement::Settled);

    // Raising the price reopens the balance.
    let repriced = PaymentUpdate { amount: Some(800), ..Default::default() };
    assert_eq!(engine.update_counter_payment(receipt.id, repriced).await.unwrap(), Settlement::Partial);

    let discounted = PaymentUpdate { discount: Some(800), ..Default::default() };
    assert_eq!(engine.update_counter_payment(receipt.id, discounted).await.unwrap(), Settlement::Settled);

    let stored = engine.counter_booking(receipt.id).await.unwrap();
    assert_eq!(stored.payment, Payment::new(800, 800, 200, 300));
    assert_eq!(stored.settlement(), Settlement::Settled);

    let negative = PaymentUpdate { cash_paid: Some(-1), ..Default::default() };
    assert!(matches!(
        engine.update_counter_payment(receipt.id, negative).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn payment_edit_on_reservation_is_rejected() {
    let engine = new_engine("payment_wrong_channel.wal");
    let bay = add_bay(&engine, "Snooker 3", 10, 30).await;
    let id = reserve(&engine, bay, 600, "k1").await;
    let err = engine.update_counter_payment(id, PaymentUpdate::default()).await;
    assert!(matches!(err, Err(EngineError::Validation(_))));
}

// ── Ledger ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_awards_apply_once() {
    let engine = Arc::new(new_engine("award_concurrent.wal"));
    let bay = add_bay(&engine, "Arcade", 10, 30).await;
    let booking = reserve(&engine, bay, 600, "9800000001").await;

    let (a, b) = {
        let e1 = engine.clone();
        let e2 = engine.clone();
        let t1 = tokio::spawn(async move { e1.award(&staff(), "9800000001", 15, booking).await });
        let t2 = tokio::spawn(async move {
            e2.award(&ActorContext::system("trigger"), "9800000001", 15, booking).await
        });
        (t1.await.unwrap().unwrap(), t2.await.unwrap().unwrap())
    };
    assert_eq!([a.applied, b.applied].iter().filter(|x| **x).count(), 1);
    assert_eq!(engine.balance("9800000001"), Some(15));
    assert_eq!(engine.audit_log(Some("9800000001")).len(), 1);
    assert!(engine.reservation(booking).await.unwrap().awarded);
}

#[tokio::test]
async fn confirmed_reservation_awards_fifteen_once() {
    let engine = new_engine("award_e2e.wal");
    let bay = add_bay(&engine, "Racing Sim", 10, 90).await;
    let booking = reserve(&engine, bay, hm(9, 0), "cust-1").await;
    let ctx = ActorContext::system("trigger");

    assert_eq!(engine.award_for_booking(&ctx, booking).await.unwrap(), AwardOutcome::NotEligible);
    engine.set_reservation_status(booking, ReservationStatus::Confirmed).await.unwrap();
    assert_eq!(
        engine.award_for_booking(&ctx, booking).await.unwrap(),
        AwardOutcome::Applied { coins: 15 }
    );
    assert_eq!(engine.award_for_booking(&ctx, booking).await.unwrap(), AwardOutcome::AlreadyAwarded);

    let stored = engine.reservation(booking).await.unwrap();
    assert!(stored.awarded);
    assert!(stored.awarded_at.is_some());
    assert_eq!(engine.balance("cust-1"), Some(15));

    let log = engine.audit_log(None);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, AuditKind::Award);
    assert_eq!(log[0].booking_id, Some(booking));
    assert_eq!(log[0].balance_after, 15);
    assert_eq!(log[0].actor, "system:trigger");
}

#[tokio::test]
async fn settled_counter_session_awards_by_duration() {
    let engine = new_engine("award_counter.wal");
    let bay = add_bay(&engine, "Bowling 2", 12, 30).await;
    let mut new = walk_in(ResourceRef::Id(bay), hm(14, 0), hm(16, 30));
    new.customer_key = Some("cust-2".into());
    new.payment = Payment::new(1_000, 0, 1_000, 0);
    let receipt = engine.create_counter_booking(new).await.unwrap();
    assert_eq!(receipt.settlement, Settlement::Settled);

    let outcome = engine.award_for_booking(&staff(), receipt.id).await.unwrap();
    assert_eq!(outcome, AwardOutcome::Applied { coins: 30 });
    assert!(engine.counter_booking(receipt.id).await.unwrap().awarded);
}

#[tokio::test]
async fn award_short_circuits() {
    let engine = new_engine("award_short.wal");
    let free = add_bay(&engine, "Free Play", 0, 30).await;
    let paid = add_bay(&engine, "Paid Play", 10, 30).await;

    let zero = reserve(&engine, free, 600, "k1").await;
    engine.set_reservation_status(zero, ReservationStatus::Confirmed).await.unwrap();
    assert_eq!(engine.award_for_booking(&staff(), zero).await.unwrap(), AwardOutcome::NothingToAward);
    assert_eq!(engine.balance("k1"), None);

    let mut anon = walk_in(ResourceRef::Id(paid), 600, 660);
    anon.payment = Payment::new(100, 100, 0, 0);
    let anon = engine.create_counter_booking(anon).await.unwrap();
    assert!(matches!(
        engine.award_for_booking(&staff(), anon.id).await,
        Err(LedgerError::Validation(_))
    ));

    assert!(matches!(
        engine.award(&staff(), "k1", 0, zero).await,
        Err(LedgerError::Validation(_))
    ));
    assert!(matches!(
        engine.award(&staff(), "  ", 5, zero).await,
        Err(LedgerError::Validation(_))
    ));
    let missing = engine.award(&staff(), "k1", 5, Ulid::new()).await;
    assert!(matches!(missing, Err(LedgerError::NotFound(_))));
    assert!(!missing.unwrap_err().is_retryable());
}

#[tokio::test]
async fn extreme_adjustments_are_rejected_not_wrapped() {
    let engine = new_engine("adjust_extremes.wal");
    for coins in [i64::MIN, i64::MAX, MAX_ADJUSTMENT_COINS + 1, -MAX_ADJUSTMENT_COINS - 1] {
        let result = engine.adjust_balance(&staff(), Ulid::new(), "cust-x", coins, "typo").await;
        assert!(matches!(result, Err(LedgerError::Validation(_))), "{coins} accepted");
    }
    assert_eq!(engine.balance("cust-x"), None);
    assert!(engine.audit_log(Some("cust-x")).is_empty());
}

#[tokio::test]
async fn manual_adjustments_are_idempotent_and_audited() {
    let engine = new_engine("adjust.wal");
    let op = Ulid::new();
    let ctx = staff();

    assert!(engine.adjust_balance(&ctx, op, "cust-3", 50, "welcome bonus").await.unwrap().applied);
    assert!(!engine.adjust_balance(&ctx, op, "cust-3", 50, "welcome bonus").await.unwrap().applied);
    assert_eq!(engine.balance("cust-3"), Some(50));

    let reused = engine.adjust_balance(&ctx, op, "cust-3", 70, "typo").await;
    assert!(matches!(reused, Err(LedgerError::Validation(_))));

    let overdraw = engine.adjust_balance(&ctx, Ulid::new(), "cust-3", -80, "redeem").await;
    assert!(matches!(
        overdraw,
        Err(LedgerError::InsufficientBalance { balance: 50, requested: 80 })
    ));
    assert!(engine.adjust_balance(&ctx, Ulid::new(), "cust-3", -20, "redeem").await.unwrap().applied);
    assert_eq!(engine.balance("cust-3"), Some(30));

    assert!(engine.adjust_balance(&ctx, Ulid::new(), "cust-3", 0, "noop").await.is_err());
    assert!(engine.adjust_balance(&ctx, Ulid::new(), "cust-3", 5, " ").await.is_err());

    let log = engine.audit_log(Some("cust-3"));
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|r| r.kind == AuditKind::Manual && r.actor == "staff:ravi"));
    assert!(log.iter().any(|r| r.id == op && r.reason.as_deref() == Some("welcome bonus")));
    assert_eq!(log.iter().map(|r| r.coins).sum::<i64>(), 30);
}

#[tokio::test]
async fn lookup_returns_projection_only() {
    let engine = new_engine("lookup.wal");
    let bay = add_bay(&engine, "Table Tennis", 10, 30).await;
    reserve(&engine, bay, 600, "cust-4").await;
    let mut walk = walk_in(ResourceRef::Id(bay), 700, 760);
    walk.customer_key = Some("cust-4".into());
    engine.create_counter_booking(walk).await.unwrap();

    let view = engine.lookup_customer("cust-4").await.unwrap();
    assert_eq!(view.booking_count, 2);
    assert!(!view.has_balance);
    assert_eq!(view.display_name.as_deref(), Some("Anika"));

    engine.adjust_balance(&staff(), Ulid::new(), "cust-4", 5, "promo").await.unwrap();
    assert!(engine.lookup_customer("cust-4").await.unwrap().has_balance);
    assert!(engine.lookup_customer("nobody").await.is_none());
}

#[tokio::test]
async fn unawarded_terminal_bookings_lists_missed_awards() {
    let engine = new_engine("unawarded.wal");
    let bay = add_bay(&engine, "Table 5", 10, 30).await;
    let confirmed = reserve(&engine, bay, 600, "k1").await;
    reserve(&engine, bay, 660, "k2").await;
    engine.set_reservation_status(confirmed, ReservationStatus::Confirmed).await.unwrap();

    let mut settled = walk_in(ResourceRef::Id(bay), 720, 780);
    settled.customer_key = Some("k3".into());
    settled.payment = Payment::new(100, 0, 100, 0);
    let settled = engine.create_counter_booking(settled).await.unwrap();

    let mut pending = engine.unawarded_terminal_bookings().await;
    pending.sort();
    let mut expected = vec![confirmed, settled.id];
    expected.sort();
    assert_eq!(pending, expected);

    engine.award_for_booking(&staff(), confirmed).await.unwrap();
    assert_eq!(engine.unawarded_terminal_bookings().await, vec![settled.id]);
}

// ── Legacy import ────────────────────────────────────────

fn legacy(resource: &str, start: &str, end: &str) -> LegacyCounterBooking {
    LegacyCounterBooking {
        id: Ulid::new(),
        resource: resource.into(),
        date: "2025-06-01".into(),
        start_time: start.into(),
        end_time: end.into(),
        customer_name: "Legacy Guest".into(),
        customer_key: None,
        amount: 400,
        discount: 0,
        cash_paid: 400,
        digital_paid: 0,
        serial: None,
        closed: true,
        awarded: false,
    }
}

#[tokio::test]
async fn legacy_import_resolves_names_and_fails_open() {
    let engine = new_engine("legacy.wal");
    let bay = add_bay(&engine, "Pool Table 1", 10, 30).await;

    let by_name = legacy("pool table 1", "10:00 AM", "11:00 AM");
    let mut by_id = legacy(&bay.to_string(), "13:00", "14:30");
    by_id.serial = Some(7);
    by_id.closed = false;
    let bad_time = legacy("Pool Table 1", "25:00", "26:00");
    let unknown = legacy("Pool Table 9", "10:00", "11:00");
    let mut bad_date = legacy("Pool Table 1", "10:00", "11:00");
    bad_date.date = "01/06/2025".into();
    // Overlaps by_name; kept because the source data already had it.
    let overlapping = legacy("Pool Table 1", "10:30", "11:30");

    let records = vec![
        by_name.clone(),
        by_id.clone(),
        bad_time.clone(),
        unknown.clone(),
        bad_date.clone(),
        overlapping.clone(),
        by_name.clone(),
    ];
    let report = engine.migrate_legacy_counter_bookings(records).await.unwrap();
    assert_eq!(report.migrated, vec![by_name.id, by_id.id, overlapping.id]);
    let skipped: Vec<_> = report.skipped.iter().map(|(id, _)| *id).collect();
    assert_eq!(skipped, vec![bad_time.id, unknown.id, bad_date.id, by_name.id]);

    let imported = engine.counter_booking(by_name.id).await.unwrap();
    assert_eq!(imported.resource_id, bay);
    assert_eq!(imported.span, Span::new(hm(10, 0), hm(11, 0)));
    assert_eq!(imported.session, SessionStatus::Closed);
    assert_eq!(engine.counter_booking(by_id.id).await.unwrap().serial, 7);

    // Re-running the batch migrates nothing new.
    let again = engine.migrate_legacy_counter_bookings(vec![by_name]).await.unwrap();
    assert!(again.migrated.is_empty());
    assert_eq!(again.skipped.len(), 1);
}

#[tokio::test]
async fn legacy_awarded_flag_blocks_second_award() {
    let engine = new_engine("legacy_awarded.wal");
    add_bay(&engine, "Air Hockey 1", 10, 30).await;
    let mut rec = legacy("Air Hockey 1", "10:00", "11:00");
    rec.customer_key = Some("old-1".into());
    rec.awarded = true;
    engine.migrate_legacy_counter_bookings(vec![rec.clone()]).await.unwrap();

    assert_eq!(engine.award_for_booking(&staff(), rec.id).await.unwrap(), AwardOutcome::AlreadyAwarded);
    assert!(engine.unawarded_terminal_bookings().await.is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_bookings_and_ledger() {
    let path = test_wal_path("replay.wal");
    let (bay, reservation, walk) = {
        let engine = engine_at(&path, OverlapPolicy::Enforce);
        let bay = add_bay(&engine, "Console 1", 10, 60).await;
        let reservation = reserve(&engine, bay, hm(15, 0), "cust-5").await;
        engine.set_reservation_status(reservation, ReservationStatus::Confirmed).await.unwrap();
        engine.award_for_booking(&staff(), reservation).await.unwrap();
        engine.adjust_balance(&staff(), Ulid::new(), "cust-5", 3, "birthday").await.unwrap();
        let walk = engine
            .create_counter_booking(walk_in(ResourceRef::Id(bay), hm(10, 0), hm(11, 0)))
            .await
            .unwrap();
        engine
            .update_counter_payment(walk.id, PaymentUpdate { cash_paid: Some(10_000), ..Default::default() })
            .await
            .unwrap();
        (bay, reservation, walk)
    };

    let engine = engine_at(&path, OverlapPolicy::Enforce);
    let r = engine.reservation(reservation).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert!(r.awarded);
    assert_eq!(engine.balance("cust-5"), Some(13));
    assert_eq!(engine.audit_log(None).len(), 2);
    let c = engine.counter_booking(walk.id).await.unwrap();
    assert_eq!(c.settlement(), Settlement::Partial);
    assert_eq!(engine.next_serial_preview(date()), 2);
    assert!(!engine.is_available(bay, date(), hm(10, 0), 60).await.unwrap());
}

fn logged_awards(path: &PathBuf) -> usize {
    crate::wal::Wal::replay(path)
        .unwrap()
        .iter()
        .filter(|e| matches!(e, Event::CoinsAwarded { .. }))
        .count()
}

#[tokio::test]
async fn replay_ignores_repeated_ledger_records() {
    let path = test_wal_path("replay_dup.wal");
    let reservation = {
        let engine = engine_at(&path, OverlapPolicy::Enforce);
        let bay = add_bay(&engine, "Console 4", 10, 60).await;
        let reservation = reserve(&engine, bay, hm(15, 0), "cust-p").await;
        engine.set_reservation_status(reservation, ReservationStatus::Confirmed).await.unwrap();
        engine.award_for_booking(&staff(), reservation).await.unwrap();
        engine.adjust_balance(&staff(), Ulid::new(), "cust-p", 4, "promo").await.unwrap();
        reservation
    };

    // Write every ledger record a second time, as a retried commit would.
    let repeated: Vec<Event> = crate::wal::Wal::replay(&path)
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e, Event::CoinsAwarded { .. } | Event::BalanceAdjusted { .. }))
        .collect();
    assert_eq!(repeated.len(), 2);
    let mut wal = crate::wal::Wal::open(&path).unwrap();
    for event in &repeated {
        wal.append(event).unwrap();
    }
    drop(wal);
    assert_eq!(logged_awards(&path), 2);

    let engine = engine_at(&path, OverlapPolicy::Enforce);
    assert_eq!(engine.balance("cust-p"), Some(14));
    assert_eq!(engine.audit_log(Some("cust-p")).len(), 2);
    assert!(engine.reservation(reservation).await.unwrap().awarded);
}

#[tokio::test]
async fn failed_commit_is_retried_into_one_award() {
    let path = test_wal_path("award_retry.wal");
    let engine = engine_at(&path, OverlapPolicy::Enforce);
    let bay = add_bay(&engine, "Racing Sim", 10, 90).await;
    let booking = reserve(&engine, bay, hm(9, 0), "cust-r").await;
    engine.set_reservation_status(booking, ReservationStatus::Confirmed).await.unwrap();

    // Without a retry the failure surfaces as transient and nothing changes.
    engine.inject_wal_fault(crate::wal::InjectedFault::BeforeWrite).await;
    let failed = engine.award_for_booking(&staff(), booking).await;
    assert!(failed.as_ref().is_err_and(|e| e.is_retryable()), "{failed:?}");
    assert_eq!(engine.balance("cust-r"), None);
    assert!(!engine.reservation(booking).await.unwrap().awarded);

    let policy = crate::trigger::RetryPolicy { attempts: 3, base_delay: std::time::Duration::from_millis(1) };
    engine.inject_wal_fault(crate::wal::InjectedFault::BeforeWrite).await;
    let outcome = crate::trigger::award_with_retry(&engine, &staff(), booking, policy).await.unwrap();
    assert_eq!(outcome, AwardOutcome::Applied { coins: 15 });
    assert_eq!(engine.balance("cust-r"), Some(15));
    assert_eq!(logged_awards(&path), 1);

    let again = crate::trigger::award_with_retry(&engine, &staff(), booking, policy).await.unwrap();
    assert_eq!(again, AwardOutcome::AlreadyAwarded);
    assert_eq!(logged_awards(&path), 1);
}

#[tokio::test]
async fn award_written_before_failed_fsync_is_credited_once() {
    let path = test_wal_path("award_fsync.wal");
    let booking = {
        let engine = engine_at(&path, OverlapPolicy::Enforce);
        let bay = add_bay(&engine, "Racing Sim", 10, 90).await;
        let booking = reserve(&engine, bay, hm(9, 0), "cust-s").await;
        engine.set_reservation_status(booking, ReservationStatus::Confirmed).await.unwrap();

        engine.inject_wal_fault(crate::wal::InjectedFault::AfterWrite).await;
        let policy = crate::trigger::RetryPolicy { attempts: 3, base_delay: std::time::Duration::from_millis(1) };
        let outcome = crate::trigger::award_with_retry(&engine, &staff(), booking, policy).await.unwrap();
        assert_eq!(outcome, AwardOutcome::Applied { coins: 15 });
        assert_eq!(engine.balance("cust-s"), Some(15));
        // Both the reported-failed and the retried record are on disk.
        assert_eq!(logged_awards(&path), 2);
        booking
    };

    let engine = engine_at(&path, OverlapPolicy::Enforce);
    assert_eq!(engine.balance("cust-s"), Some(15));
    assert_eq!(engine.audit_log(Some("cust-s")).len(), 1);
    assert!(engine.reservation(booking).await.unwrap().awarded);
}

#[tokio::test]
async fn compaction_preserves_state_across_restart() {
    let path = test_wal_path("compact.wal");
    let (bay, kept) = {
        let engine = engine_at(&path, OverlapPolicy::Enforce);
        let bay = add_bay(&engine, "Console 2", 10, 30).await;
        for i in 0..10 {
            let r = engine
                .create_counter_booking(walk_in(ResourceRef::Id(bay), 600 + i * 30, 630 + i * 30))
                .await
                .unwrap();
            engine.delete_counter_booking(r.id).await.unwrap();
        }
        let mut kept = walk_in(ResourceRef::Id(bay), 900, 960);
        kept.customer_key = Some("cust-6".into());
        kept.payment = Payment::new(100, 0, 0, 100);
        let kept = engine.create_counter_booking(kept).await.unwrap();
        engine.award_for_booking(&staff(), kept.id).await.unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
        (bay, kept)
    };

    let engine = engine_at(&path, OverlapPolicy::Enforce);
    let c = engine.counter_booking(kept.id).await.unwrap();
    assert!(c.awarded);
    assert_eq!(c.serial, 1);
    assert_eq!(engine.balance("cust-6"), Some(10));
    assert_eq!(engine.audit_log(Some("cust-6")).len(), 1);
    assert_eq!(engine.resource(bay).await.unwrap().name, "Console 2");
}

#[tokio::test]
async fn committed_events_reach_resource_listeners() {
    let engine = new_engine("notify.wal");
    let bay = add_bay(&engine, "Console 3", 10, 30).await;
    let mut rx = engine.notify.subscribe(bay);
    let id = reserve(&engine, bay, 600, "k1").await;

    match rx.recv().await.unwrap() {
        Event::ReservationCreated { booking } => assert_eq!(booking.id, id),
        other => panic!("unexpected {other:?}"),
    }

    // Rejected writes publish nothing.
    let _ = engine
        .create_reservation(Ulid::new(), bay, date(), 600, "k2".into(), "X".into())
        .await;
    assert!(rx.try_recv().is_err());
}
