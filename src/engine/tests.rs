use super::*;
use crate::clock::FixedClock;
use chrono::{NaiveDate, TimeZone, Utc};
use std::path::PathBuf;

// ── Fixtures ─────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("chairtime_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn options_at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> EngineOptions {
    EngineOptions {
        clock: Arc::new(FixedClock(Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap())),
        ..EngineOptions::default()
    }
}

/// Clock pinned well before every date the tests book, so no "today" cutoff applies.
fn quiet_options() -> EngineOptions {
    options_at(2026, 1, 1, 0, 0)
}

fn t(s: &str) -> SlotTime {
    s.parse().unwrap()
}

fn times(list: &[&str]) -> Vec<SlotTime> {
    list.iter().map(|s| t(s)).collect()
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

// 2026-10-19 is a Monday, 2026-10-20 a Tuesday.
const MONDAY: &str = "2026-10-19";
const TUESDAY: &str = "2026-10-20";

fn full_grid() -> Vec<SlotTime> {
    GridSpec::default().slots().times().to_vec()
}

fn open_day(day_of_week: u8, open: &str, close: &str) -> BusinessHours {
    BusinessHours {
        day_of_week,
        is_open: true,
        open_time: Some(t(open)),
        close_time: Some(t(close)),
    }
}

fn closed_day(day_of_week: u8) -> BusinessHours {
    BusinessHours {
        day_of_week,
        is_open: false,
        open_time: None,
        close_time: None,
    }
}

struct Shop {
    engine: Engine,
    tenant: Ulid,
    staff: Ulid,
    service: Ulid,
}

async fn shop(wal: &str, options: EngineOptions) -> Shop {
    let engine = Engine::new(test_wal_path(wal), options).unwrap();
    let tenant = Ulid::new();
    let staff = Ulid::new();
    let service = Ulid::new();
    engine
        .create_tenant(tenant, Some("Navalha".into()), 0, GridSpec::default())
        .await
        .unwrap();
    engine
        .add_staff(staff, tenant, Some("Caio".into()))
        .await
        .unwrap();
    engine
        .add_service(service, tenant, "Corte".into(), 45, 5000)
        .await
        .unwrap();
    Shop {
        engine,
        tenant,
        staff,
        service,
    }
}

fn candidate(shop: &Shop, day: &str, time: &str) -> BookingCandidate {
    BookingCandidate {
        id: Ulid::new(),
        staff_id: shop.staff,
        service_id: shop.service,
        date: date(day),
        time: t(time),
        client: ClientContact {
            name: "Bruno".into(),
            phone: "+55 11 5555-0101".into(),
            email: None,
        },
        payment: Some(PaymentMethod::PendingCash),
        notes: None,
    }
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn unconfigured_tenant_closes_monday_only() {
    let s = shop("fallback.wal", quiet_options()).await;
    assert!(s.engine.compute_available_slots(s.staff, date(MONDAY)).await.unwrap().is_empty());
    assert_eq!(
        s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap(),
        full_grid()
    );
}

#[tokio::test]
async fn configured_closed_day_has_no_slots() {
    let s = shop("closed_day.wal", quiet_options()).await;
    s.engine
        .replace_business_hours(s.tenant, vec![closed_day(2), open_day(1, "10:00", "12:00")])
        .await
        .unwrap();
    assert!(s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap().is_empty());
    // Monday is configured open now, so the fallback no longer applies.
    assert_eq!(
        s.engine.compute_available_slots(s.staff, date(MONDAY)).await.unwrap(),
        times(&["10:30", "11:15", "12:00"])
    );
}

#[tokio::test]
async fn nine_to_six_with_booking_at_ten_thirty() {
    let s = shop("scenario.wal", quiet_options()).await;
    s.engine
        .replace_business_hours(s.tenant, vec![open_day(2, "09:00", "18:00")])
        .await
        .unwrap();
    s.engine
        .create_booking(candidate(&s, TUESDAY, "10:30"))
        .await
        .unwrap();

    let slots = s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap();
    assert_eq!(
        slots,
        times(&[
            "09:00", "09:45", "11:15", "12:00", "12:45", "13:30", "14:15", "15:00", "15:45",
            "16:30", "17:15", "18:00",
        ])
    );
    let grid = GridSpec::default().slots();
    assert!(slots.iter().all(|s| grid.contains(*s)));
    assert!(slots.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn cancelling_frees_the_slot_again() {
    let s = shop("cancel_frees.wal", quiet_options()).await;
    let booking = s
        .engine
        .create_booking(candidate(&s, TUESDAY, "14:15"))
        .await
        .unwrap();
    let slots = s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap();
    assert!(!slots.contains(&t("14:15")));

    let cancelled = s.engine.cancel_booking(booking.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    let slots = s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap();
    assert!(slots.contains(&t("14:15")));
}

#[tokio::test]
async fn today_excludes_past_and_current_slots() {
    let s = shop("today.wal", options_at(2026, 10, 20, 12, 0)).await;
    let slots = s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap();
    assert_eq!(
        slots,
        times(&["12:45", "13:30", "14:15", "15:00", "15:45", "16:30", "17:15", "18:00", "18:45"])
    );
    // Tomorrow is untouched.
    let tomorrow = s
        .engine
        .compute_available_slots(s.staff, date("2026-10-21"))
        .await
        .unwrap();
    assert_eq!(tomorrow, full_grid());
}

#[tokio::test]
async fn today_follows_the_tenant_offset() {
    let engine = Engine::new(test_wal_path("today_offset.wal"), options_at(2026, 10, 20, 12, 0)).unwrap();
    let tenant = Ulid::new();
    let staff = Ulid::new();
    // UTC-3: 12:00 UTC is 09:00 local.
    engine.create_tenant(tenant, None, -180, GridSpec::default()).await.unwrap();
    engine.add_staff(staff, tenant, None).await.unwrap();

    let slots = engine.compute_available_slots(staff, date(TUESDAY)).await.unwrap();
    assert_eq!(slots.first(), Some(&t("09:45")));
    assert_eq!(slots.len(), full_grid().len() - 1);
}

#[tokio::test]
async fn availability_is_idempotent() {
    let s = shop("idempotent.wal", quiet_options()).await;
    s.engine
        .replace_business_hours(s.tenant, vec![open_day(2, "10:00", "16:00")])
        .await
        .unwrap();
    s.engine
        .create_booking(candidate(&s, TUESDAY, "12:00"))
        .await
        .unwrap();
    let a = s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap();
    let b = s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn unknown_or_inactive_staff_get_nothing() {
    let s = shop("inactive.wal", quiet_options()).await;
    assert!(s
        .engine
        .compute_available_slots(Ulid::new(), date(TUESDAY))
        .await
        .unwrap()
        .is_empty());

    s.engine.set_staff_active(s.staff, false).await.unwrap();
    assert!(s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap().is_empty());
    let err = s
        .engine
        .create_booking(candidate(&s, TUESDAY, "09:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    s.engine.set_staff_active(s.staff, true).await.unwrap();
    assert_eq!(
        s.engine.compute_available_slots(s.staff, date(TUESDAY)).await.unwrap(),
        full_grid()
    );
}

#[tokio::test]
async fn custom_grid_drives_availability_and_booking() {
    let engine = Engine::new(test_wal_path("hourly_grid.wal"), quiet_options()).unwrap();
    let tenant = Ulid::new();
    let staff = Ulid::new();
    let service = Ulid::new();
    let hourly = GridSpec {
        start: t("09:00"),
        end: t("17:00"),
        step_minutes: 60,
    };
    engine.create_tenant(tenant, None, 0, hourly).await.unwrap();
    engine.add_staff(staff, tenant, None).await.unwrap();
    engine.add_service(service, tenant, "Barba".into(), 30, 3000).await.unwrap();

    let slots = engine.compute_available_slots(staff, date(TUESDAY)).await.unwrap();
    assert_eq!(slots.len(), 9);

    let shop = Shop {
        engine,
        tenant,
        staff,
        service,
    };
    let err = shop
        .engine
        .create_booking(candidate(&shop, TUESDAY, "09:45"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    shop.engine
        .create_booking(candidate(&shop, TUESDAY, "10:00"))
        .await
        .unwrap();
}

// ── Booking writer ───────────────────────────────────────

#[tokio::test]
async fn booking_starts_confirmed_with_caller_payment() {
    let s = shop("create_booking.wal", quiet_options()).await;
    let mut c = candidate(&s, TUESDAY, "09:45");
    c.payment = Some(PaymentMethod::PaidOnline);
    c.notes = Some("degradê".into());
    let booking = s.engine.create_booking(c.clone()).await.unwrap();

    assert_eq!(booking.id, c.id);
    assert_eq!(booking.tenant_id, s.tenant);
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.payment, PaymentMethod::PaidOnline);
    assert_eq!(booking.created_at, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap().timestamp_millis());
    assert_eq!(s.engine.get_booking(c.id).await, Some(booking));
}

#[tokio::test]
async fn second_booking_for_same_slot_conflicts() {
    let s = shop("conflict.wal", quiet_options()).await;
    let first = s
        .engine
        .create_booking(candidate(&s, TUESDAY, "11:15"))
        .await
        .unwrap();
    match s.engine.create_booking(candidate(&s, TUESDAY, "11:15")).await {
        Err(EngineError::Conflict(existing)) => assert_eq!(existing, first.id),
        other => panic!("expected conflict, got {other:?}"),
    }
    // Neighbouring slot and another day are unaffected.
    s.engine
        .create_booking(candidate(&s, TUESDAY, "12:00"))
        .await
        .unwrap();
    s.engine
        .create_booking(candidate(&s, "2026-10-21", "11:15"))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_for_one_slot_yield_one_winner() {
    let s = shop("race.wal", quiet_options()).await;
    let a = candidate(&s, TUESDAY, "15:00");
    let b = candidate(&s, TUESDAY, "15:00");
    let engine = Arc::new(s.engine);

    let (ra, rb) = tokio::join!(
        tokio::spawn({
            let engine = engine.clone();
            async move { engine.create_booking(a).await }
        }),
        tokio::spawn({
            let engine = engine.clone();
            async move { engine.create_booking(b).await }
        }),
    );
    let results = [ra.unwrap(), rb.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::Conflict(_))))
        .count();
    assert_eq!((wins, conflicts), (1, 1));

    let booked = engine.bookings_for_staff(s.staff, Some(date(TUESDAY))).await;
    assert_eq!(booked.len(), 1);
}

#[tokio::test]
async fn validation_runs_before_any_lookup() {
    let s = shop("validation.wal", quiet_options()).await;
    let mut c = candidate(&s, TUESDAY, "09:00");
    c.staff_id = Ulid::new();
    c.client.phone = String::new();
    assert!(matches!(
        s.engine.create_booking(c).await,
        Err(EngineError::Validation(_))
    ));

    let mut c = candidate(&s, TUESDAY, "09:00");
    c.staff_id = Ulid::new();
    assert!(matches!(
        s.engine.create_booking(c).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn booking_rejects_foreign_or_missing_service() {
    let s = shop("service_check.wal", quiet_options()).await;
    let other_tenant = Ulid::new();
    let other_service = Ulid::new();
    s.engine
        .create_tenant(other_tenant, None, 0, GridSpec::default())
        .await
        .unwrap();
    s.engine
        .add_service(other_service, other_tenant, "Pigmentação".into(), 60, 8000)
        .await
        .unwrap();

    let mut c = candidate(&s, TUESDAY, "09:00");
    c.service_id = other_service;
    assert!(matches!(
        s.engine.create_booking(c).await,
        Err(EngineError::Validation(_))
    ));

    let mut c = candidate(&s, TUESDAY, "09:00");
    c.service_id = Ulid::new();
    assert!(matches!(
        s.engine.create_booking(c).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let s = shop("dup_id.wal", quiet_options()).await;
    let c = candidate(&s, TUESDAY, "09:00");
    s.engine.create_booking(c.clone()).await.unwrap();
    let mut again = c;
    again.time = t("09:45");
    assert!(matches!(
        s.engine.create_booking(again).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn status_transitions_and_revival_conflict() {
    let s = shop("status.wal", quiet_options()).await;
    let first = s
        .engine
        .create_booking(candidate(&s, TUESDAY, "13:30"))
        .await
        .unwrap();

    let done = s
        .engine
        .set_booking_status(first.id, BookingStatus::Completed)
        .await
        .unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    // Completed still holds the slot.
    assert!(matches!(
        s.engine.create_booking(candidate(&s, TUESDAY, "13:30")).await,
        Err(EngineError::Conflict(_))
    ));

    s.engine.cancel_booking(first.id).await.unwrap();
    let second = s
        .engine
        .create_booking(candidate(&s, TUESDAY, "13:30"))
        .await
        .unwrap();

    match s.engine.set_booking_status(first.id, BookingStatus::Confirmed).await {
        Err(EngineError::Conflict(id)) => assert_eq!(id, second.id),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(
        s.engine.get_booking(first.id).await.map(|b| b.status),
        Some(BookingStatus::Cancelled)
    );

    assert!(matches!(
        s.engine.cancel_booking(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Administration ───────────────────────────────────────

#[tokio::test]
async fn business_hours_replace_wholesale() {
    let s = shop("hours.wal", quiet_options()).await;
    let mut closed_with_times = closed_day(0);
    closed_with_times.open_time = Some(t("09:00"));
    s.engine
        .replace_business_hours(s.tenant, vec![open_day(3, "09:00", "12:00"), closed_with_times])
        .await
        .unwrap();
    let hours = s.engine.list_business_hours(s.tenant).await.unwrap();
    assert_eq!(hours, vec![closed_day(0), open_day(3, "09:00", "12:00")]);

    s.engine
        .replace_business_hours(s.tenant, vec![open_day(5, "10:00", "11:00")])
        .await
        .unwrap();
    assert_eq!(
        s.engine.list_business_hours(s.tenant).await.unwrap(),
        vec![open_day(5, "10:00", "11:00")]
    );

    assert!(matches!(
        s.engine
            .replace_business_hours(s.tenant, vec![closed_day(2), closed_day(2)])
            .await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        s.engine.replace_business_hours(s.tenant, vec![closed_day(7)]).await,
        Err(EngineError::Validation(_))
    ));

    // Clearing brings the Monday fallback back.
    s.engine.replace_business_hours(s.tenant, vec![]).await.unwrap();
    assert!(s.engine.compute_available_slots(s.staff, date(MONDAY)).await.unwrap().is_empty());
}

#[tokio::test]
async fn tenant_validation() {
    let engine = Engine::new(test_wal_path("tenant_validation.wal"), quiet_options()).unwrap();
    let id = Ulid::new();
    let bad_grid = GridSpec {
        start: t("10:00"),
        end: t("09:00"),
        step_minutes: 30,
    };
    assert!(matches!(
        engine.create_tenant(id, None, 0, bad_grid).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.create_tenant(id, None, 24 * 60, GridSpec::default()).await,
        Err(EngineError::Validation(_))
    ));
    engine.create_tenant(id, None, 60, GridSpec::default()).await.unwrap();
    assert!(matches!(
        engine.create_tenant(id, None, 0, GridSpec::default()).await,
        Err(EngineError::AlreadyExists(_))
    ));
    let tenants = engine.list_tenants().await;
    assert_eq!(tenants.len(), 1);
    assert_eq!(tenants[0].utc_offset_minutes, 60);
}

#[tokio::test]
async fn staff_with_bookings_cannot_be_removed() {
    let s = shop("remove_staff.wal", quiet_options()).await;
    let booking = s
        .engine
        .create_booking(candidate(&s, TUESDAY, "16:30"))
        .await
        .unwrap();
    s.engine.cancel_booking(booking.id).await.unwrap();
    assert!(matches!(
        s.engine.remove_staff(s.staff).await,
        Err(EngineError::HasBookings(_))
    ));

    let spare = Ulid::new();
    s.engine.add_staff(spare, s.tenant, None).await.unwrap();
    assert_eq!(s.engine.list_staff(Some(s.tenant)).await.len(), 2);
    s.engine.remove_staff(spare).await.unwrap();
    let left = s.engine.list_staff(Some(s.tenant)).await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, s.staff);
}

#[tokio::test]
async fn history_clear_removes_only_older_bookings() {
    let s = shop("history.wal", quiet_options()).await;
    let old = s
        .engine
        .create_booking(candidate(&s, "2026-10-13", "09:00"))
        .await
        .unwrap();
    let old_cancelled = s
        .engine
        .create_booking(candidate(&s, "2026-10-14", "09:00"))
        .await
        .unwrap();
    s.engine.cancel_booking(old_cancelled.id).await.unwrap();
    let kept = s
        .engine
        .create_booking(candidate(&s, TUESDAY, "09:00"))
        .await
        .unwrap();

    let removed = s
        .engine
        .clear_booking_history(s.tenant, date(TUESDAY))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(s.engine.get_booking(old.id).await, None);
    let remaining = s.engine.bookings_for_tenant(s.tenant, None).await;
    assert_eq!(remaining.iter().map(|b| b.id).collect::<Vec<_>>(), vec![kept.id]);
}

#[tokio::test]
async fn deleting_tenant_cascades() {
    let s = shop("delete_tenant.wal", quiet_options()).await;
    let booking = s
        .engine
        .create_booking(candidate(&s, TUESDAY, "09:00"))
        .await
        .unwrap();
    s.engine
        .replace_business_hours(s.tenant, vec![open_day(2, "09:00", "12:00")])
        .await
        .unwrap();

    s.engine.delete_tenant(s.tenant).await.unwrap();
    assert!(s.engine.list_tenants().await.is_empty());
    assert!(s.engine.list_staff(None).await.is_empty());
    assert!(s.engine.list_services(None).is_empty());
    assert_eq!(s.engine.get_booking(booking.id).await, None);
    assert!(matches!(
        s.engine.list_business_hours(s.tenant).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        s.engine.delete_tenant(s.tenant).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn tenant_bookings_ordered_across_staff() {
    let s = shop("tenant_bookings.wal", quiet_options()).await;
    let second_staff = Ulid::new();
    s.engine.add_staff(second_staff, s.tenant, None).await.unwrap();

    let late = s
        .engine
        .create_booking(candidate(&s, TUESDAY, "15:00"))
        .await
        .unwrap();
    let mut c = candidate(&s, TUESDAY, "09:00");
    c.staff_id = second_staff;
    let early = s.engine.create_booking(c).await.unwrap();
    let mut c = candidate(&s, MONDAY, "18:45");
    c.staff_id = second_staff;
    let monday = s.engine.create_booking(c).await.unwrap();

    let all: Vec<Ulid> = s
        .engine
        .bookings_for_tenant(s.tenant, None)
        .await
        .iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(all, vec![monday.id, early.id, late.id]);

    let tuesday = s.engine.bookings_for_tenant(s.tenant, Some(date(TUESDAY))).await;
    assert_eq!(tuesday.len(), 2);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let tenant = Ulid::new();
    let staff = Ulid::new();
    let service = Ulid::new();
    let booking_id;
    let cancelled_id;
    {
        let engine = Engine::new(path.clone(), quiet_options()).unwrap();
        engine.create_tenant(tenant, Some("Navalha".into()), -180, GridSpec::default()).await.unwrap();
        engine.add_staff(staff, tenant, Some("Caio".into())).await.unwrap();
        engine.add_service(service, tenant, "Corte".into(), 45, 5000).await.unwrap();
        engine
            .replace_business_hours(tenant, vec![open_day(2, "09:00", "12:00")])
            .await
            .unwrap();
        let s = Shop {
            engine,
            tenant,
            staff,
            service,
        };
        booking_id = s.engine.create_booking(candidate(&s, TUESDAY, "09:45")).await.unwrap().id;
        let c = s.engine.create_booking(candidate(&s, TUESDAY, "10:30")).await.unwrap();
        cancelled_id = c.id;
        s.engine.cancel_booking(cancelled_id).await.unwrap();
    }

    let engine = Engine::new(path, quiet_options()).unwrap();
    assert_eq!(engine.list_tenants().await[0].utc_offset_minutes, -180);
    assert_eq!(
        engine.compute_available_slots(staff, date(TUESDAY)).await.unwrap(),
        times(&["09:00", "10:30", "11:15", "12:00"])
    );
    assert_eq!(
        engine.get_booking(booking_id).await.map(|b| b.status),
        Some(BookingStatus::Confirmed)
    );
    assert_eq!(
        engine.get_booking(cancelled_id).await.map(|b| b.status),
        Some(BookingStatus::Cancelled)
    );
    assert_eq!(engine.list_services(Some(tenant)).len(), 1);
}

#[tokio::test]
async fn bookings_after_torn_tail_survive_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_then_book.wal");
    let tenant = Ulid::new();
    let staff = Ulid::new();
    let service = Ulid::new();
    let first_id;
    {
        let engine = Engine::new(path.clone(), quiet_options()).unwrap();
        engine.create_tenant(tenant, None, 0, GridSpec::default()).await.unwrap();
        engine.add_staff(staff, tenant, None).await.unwrap();
        engine.add_service(service, tenant, "Corte".into(), 45, 5000).await.unwrap();
        let s = Shop {
            engine,
            tenant,
            staff,
            service,
        };
        first_id = s.engine.create_booking(candidate(&s, TUESDAY, "09:00")).await.unwrap().id;
    }
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[200u8, 0, 0, 0, 7, 7, 7]).unwrap();
    }

    let second_id;
    {
        let engine = Engine::new(path.clone(), quiet_options()).unwrap();
        let s = Shop {
            engine,
            tenant,
            staff,
            service,
        };
        second_id = s.engine.create_booking(candidate(&s, TUESDAY, "10:30")).await.unwrap().id;
    }

    let engine = Engine::new(path, quiet_options()).unwrap();
    assert!(engine.get_booking(first_id).await.is_some());
    assert_eq!(
        engine.get_booking(second_id).await.map(|b| b.time),
        Some(t("10:30"))
    );
    let open = engine.compute_available_slots(staff, date(TUESDAY)).await.unwrap();
    assert!(!open.contains(&t("10:30")));
    assert!(!open.contains(&t("09:00")));
    assert_eq!(open.len(), full_grid().len() - 2);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let staff;
    let tenant;
    {
        let s = shop("compaction.wal", quiet_options()).await;
        staff = s.staff;
        tenant = s.tenant;
        for _ in 0..5 {
            let b = s.engine.create_booking(candidate(&s, TUESDAY, "09:00")).await.unwrap();
            s.engine.cancel_booking(b.id).await.unwrap();
        }
        s.engine.create_booking(candidate(&s, TUESDAY, "09:45")).await.unwrap();
        s.engine.set_staff_active(s.staff, false).await.unwrap();
        assert!(s.engine.wal_appends_since_compact().await >= 13);

        let before = std::fs::metadata(&path).unwrap().len();
        s.engine.compact_wal().await.unwrap();
        assert_eq!(s.engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
    }

    let engine = Engine::new(path, quiet_options()).unwrap();
    let listed = engine.list_staff(Some(tenant)).await;
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].active);
    assert_eq!(engine.bookings_for_staff(staff, None).await.len(), 6);
    engine.set_staff_active(staff, true).await.unwrap();
    let slots = engine.compute_available_slots(staff, date(TUESDAY)).await.unwrap();
    assert!(slots.contains(&t("09:00")));
    assert!(!slots.contains(&t("09:45")));
}
