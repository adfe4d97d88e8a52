use super::*;
use crate::limits::*;

use chrono::{Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use tokio_test::{assert_err, assert_ok};

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("agenda_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// A week ahead: always in the future and always inside the horizon.
fn next_week() -> NaiveDate {
    Utc::now().date_naive() + Days::new(7)
}

fn at(date: NaiveDate, h: u32, m: u32) -> String {
    format!("{date}T{h:02}:{m:02}:00Z")
}

fn settings(scope_mode: ScopeMode) -> EngineSettings {
    EngineSettings {
        scope_mode,
        ..Default::default()
    }
}

/// Open every day 09:00–12:00.
async fn morning_engine(name: &str, scope_mode: ScopeMode) -> Engine {
    let engine = Engine::new(test_wal_path(name), settings(scope_mode)).unwrap();
    for day in WEEK {
        engine
            .set_business_hours(day, DayHours::open(t(9, 0), t(12, 0)))
            .await
            .unwrap();
    }
    engine
}

async fn add_service(engine: &Engine, name: &str, duration_min: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .upsert_service(id, name.into(), duration_min, 5000, true)
        .await
        .unwrap();
    id
}

async fn add_professional(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .upsert_professional(id, name.into(), Some("hair".into()))
        .await
        .unwrap();
    id
}

// ── Slot listing ─────────────────────────────────────────

#[tokio::test]
async fn slots_for_hour_long_service_fill_the_morning() {
    let engine = morning_engine("slots_morning.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 60).await;

    let slots = engine.list_slots(next_week(), svc, None).await.unwrap();
    assert_eq!(
        slots,
        vec!["09:00", "09:15", "09:30", "09:45", "10:00", "10:15", "10:30", "10:45", "11:00"]
    );
}

#[tokio::test]
async fn booking_removes_overlapping_slots() {
    let engine = morning_engine("slots_after_booking.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let day = next_week();

    engine
        .create_appointment("ana", svc, None, &at(day, 10, 0))
        .await
        .unwrap();

    let slots = engine.list_slots(day, svc, None).await.unwrap();
    assert_eq!(slots, vec!["09:00", "11:00"]);
}

#[tokio::test]
async fn closed_day_lists_nothing_and_rejects_booking() {
    let engine = morning_engine("closed_day.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;
    let day = next_week();
    engine
        .set_business_hours(day.weekday(), DayHours::closed())
        .await
        .unwrap();

    assert!(engine.list_slots(day, svc, None).await.unwrap().is_empty());
    let result = engine.create_appointment("ana", svc, None, &at(day, 10, 0)).await;
    assert!(matches!(result, Err(EngineError::OutsideBusinessHours(_))));
}

#[tokio::test]
async fn no_slot_today_at_or_before_now() {
    let engine = Engine::new(test_wal_path("slots_today.wal"), settings(ScopeMode::Global)).unwrap();
    for day in WEEK {
        engine
            .set_business_hours(day, DayHours::open(t(0, 0), t(23, 45)))
            .await
            .unwrap();
    }
    let svc = add_service(&engine, "Escova", 15).await;
    let now = Utc::now();

    let slots = engine.list_slots(now.date_naive(), svc, None).await.unwrap();
    for slot in &slots {
        let time = NaiveTime::parse_from_str(slot, "%H:%M").unwrap();
        assert!(time > now.time(), "{slot} is not after {}", now.time());
    }
}

#[tokio::test]
async fn slots_for_past_day_are_empty() {
    let engine = morning_engine("slots_past_day.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;
    let yesterday = Utc::now().date_naive() - Days::new(1);
    assert!(engine.list_slots(yesterday, svc, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn slots_beyond_horizon_rejected() {
    let engine = morning_engine("slots_horizon.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;
    let far = Utc::now().date_naive() + Days::new(MAX_BOOKING_HORIZON_DAYS as u64 + 2);
    assert!(matches!(
        engine.list_slots(far, svc, None).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn last_listed_slot_on_horizon_day_is_bookable() {
    let engine = Engine::new(test_wal_path("horizon_edge.wal"), settings(ScopeMode::Global)).unwrap();
    for day in WEEK {
        engine
            .set_business_hours(day, DayHours::open(t(0, 0), t(23, 59)))
            .await
            .unwrap();
    }
    let svc = add_service(&engine, "Corte", 30).await;
    let edge = Utc::now().date_naive() + Days::new(MAX_BOOKING_HORIZON_DAYS as u64);

    let slots = engine.list_slots(edge, svc, None).await.unwrap();
    let last = slots.last().unwrap();
    assert_ok!(
        engine
            .create_appointment("ana", svc, None, &format!("{edge}T{last}:00Z"))
            .await
    );
    assert_err!(
        engine
            .create_appointment("ana", svc, None, &at(edge + Days::new(1), 9, 0))
            .await
    );
}

#[tokio::test]
async fn missing_business_hours_is_configuration_error() {
    let engine = Engine::new(test_wal_path("missing_hours.wal"), settings(ScopeMode::Global)).unwrap();
    let svc = add_service(&engine, "Corte", 30).await;
    let day = next_week();

    assert!(matches!(
        engine.list_slots(day, svc, None).await,
        Err(EngineError::MissingBusinessHours(_))
    ));
    assert!(matches!(
        engine.create_appointment("ana", svc, None, &at(day, 10, 0)).await,
        Err(EngineError::MissingBusinessHours(_))
    ));
}

// ── Booking validation ───────────────────────────────────

#[tokio::test]
async fn booking_returns_service_snapshot() {
    let engine = morning_engine("booking_snapshot.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 45).await;
    let day = next_week();

    let info = engine
        .create_appointment("ana", svc, None, &at(day, 9, 15))
        .await
        .unwrap();
    assert_eq!(info.status, AppointmentStatus::Pending);
    assert_eq!(info.client_id, "ana");
    assert_eq!(info.service_name, "Corte");
    assert_eq!(info.end - info.start, 45 * MINUTE_MS);
    assert_eq!(info.created_at, info.updated_at);
    assert_eq!(engine.get_appointment(info.id).await.unwrap(), info);
}

#[tokio::test]
async fn unknown_or_inactive_service_not_found() {
    let engine = morning_engine("service_not_found.wal", ScopeMode::Global).await;
    let day = next_week();
    let missing = Ulid::new();
    assert!(matches!(
        engine.create_appointment("ana", missing, None, &at(day, 10, 0)).await,
        Err(EngineError::ServiceNotFound(id)) if id == missing
    ));

    let svc = Ulid::new();
    engine
        .upsert_service(svc, "Retired".into(), 30, 1000, false)
        .await
        .unwrap();
    assert!(matches!(
        engine.create_appointment("ana", svc, None, &at(day, 10, 0)).await,
        Err(EngineError::ServiceNotFound(_))
    ));
    assert!(matches!(
        engine.list_slots(day, svc, None).await,
        Err(EngineError::ServiceNotFound(_))
    ));
}

#[tokio::test]
async fn past_or_malformed_start_is_invalid_input() {
    let engine = morning_engine("invalid_start.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;
    let yesterday = Utc::now().date_naive() - Days::new(1);

    assert!(matches!(
        engine.create_appointment("ana", svc, None, &at(yesterday, 10, 0)).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create_appointment("ana", svc, None, "next tuesday").await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create_appointment("", svc, None, &at(next_week(), 10, 0)).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn start_outside_hours_rejected() {
    let engine = morning_engine("outside_hours.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let day = next_week();

    for (h, m) in [(8, 45), (11, 15), (12, 0), (9, 10)] {
        let result = engine.create_appointment("ana", svc, None, &at(day, h, m)).await;
        assert!(
            matches!(result, Err(EngineError::OutsideBusinessHours(_))),
            "{h:02}:{m:02} should be outside hours, got {result:?}"
        );
    }
    assert_ok!(engine.create_appointment("ana", svc, None, &at(day, 11, 0)).await);
}

#[tokio::test]
async fn offset_start_is_read_as_an_instant() {
    let engine = morning_engine("offset_start.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let day = next_week();

    // 07:00 at UTC-3 is 10:00 in the canonical UTC clock.
    let info = engine
        .create_appointment("ana", svc, None, &format!("{day}T07:00:00-03:00"))
        .await
        .unwrap();
    assert_eq!(info.start, local_ms(day, t(10, 0), engine.offset()));
}

// ── Conflicts ────────────────────────────────────────────

#[tokio::test]
async fn overlapping_booking_conflicts() {
    let engine = morning_engine("overlap.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let day = next_week();

    let first = engine
        .create_appointment("ana", svc, None, &at(day, 10, 0))
        .await
        .unwrap();
    match engine.create_appointment("bia", svc, None, &at(day, 9, 30)).await {
        Err(EngineError::SlotConflict(id)) => assert_eq!(id, first.id),
        other => panic!("expected SlotConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn back_to_back_bookings_both_succeed() {
    let engine = morning_engine("back_to_back.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let day = next_week();

    assert_ok!(engine.create_appointment("ana", svc, None, &at(day, 9, 0)).await);
    assert_ok!(engine.create_appointment("bia", svc, None, &at(day, 10, 0)).await);
    assert_ok!(engine.create_appointment("caio", svc, None, &at(day, 11, 0)).await);
    assert!(engine.list_slots(day, svc, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_identical_bookings_exactly_one_wins() {
    let engine = Arc::new(morning_engine("race_identical.wal", ScopeMode::Global).await);
    let svc = add_service(&engine, "Corte", 60).await;
    let start = at(next_week(), 10, 0);

    let e1 = engine.clone();
    let s1 = start.clone();
    let e2 = engine.clone();
    let s2 = start.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { e1.create_appointment("ana", svc, None, &s1).await }),
        tokio::spawn(async move { e2.create_appointment("bia", svc, None, &s2).await }),
    );
    let results = [r1.unwrap(), r2.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::SlotConflict(_))))
            .count(),
        1
    );
}

#[tokio::test]
async fn concurrent_overlapping_bookings_never_double_book() {
    let engine = Arc::new(morning_engine("race_many.wal", ScopeMode::Global).await);
    let svc = add_service(&engine, "Corte", 60).await;
    let day = next_week();

    let mut handles = Vec::new();
    for (i, minute) in (0..120u32).step_by(15).enumerate() {
        let engine = engine.clone();
        let start = at(day, 9 + minute / 60, minute % 60);
        handles.push(tokio::spawn(async move {
            engine
                .create_appointment(&format!("client-{i}"), svc, None, &start)
                .await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    let booked = engine.list_appointments().await.unwrap();
    assert!(!booked.is_empty());
    for (i, a) in booked.iter().enumerate() {
        for b in &booked[i + 1..] {
            let overlap = a.start < b.end && b.start < a.end;
            assert!(!overlap, "{} and {} overlap", a.id, b.id);
        }
    }
}

#[tokio::test]
async fn cancelled_appointment_frees_its_slot() {
    let engine = morning_engine("cancel_frees.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let day = next_week();

    let first = engine
        .create_appointment("ana", svc, None, &at(day, 10, 0))
        .await
        .unwrap();
    engine.cancel_appointment(first.id, "ana").await.unwrap();

    assert_ok!(engine.create_appointment("bia", svc, None, &at(day, 10, 0)).await);
}

#[tokio::test]
async fn completed_appointment_keeps_its_slot() {
    let engine = morning_engine("completed_occupies.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let day = next_week();

    let first = engine
        .create_appointment("ana", svc, None, &at(day, 10, 0))
        .await
        .unwrap();
    engine.set_status(first.id, "CONFIRMED").await.unwrap();
    engine.set_status(first.id, "COMPLETED").await.unwrap();

    assert!(matches!(
        engine.create_appointment("bia", svc, None, &at(day, 10, 0)).await,
        Err(EngineError::SlotConflict(_))
    ));
}

// ── Scopes ───────────────────────────────────────────────

#[tokio::test]
async fn per_professional_scopes_are_independent() {
    let engine = morning_engine("per_professional.wal", ScopeMode::PerProfessional).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let joana = add_professional(&engine, "Joana").await;
    let marcos = add_professional(&engine, "Marcos").await;
    let day = next_week();

    let info = engine
        .create_appointment("ana", svc, Some(joana), &at(day, 10, 0))
        .await
        .unwrap();
    assert_eq!(info.professional_name.as_deref(), Some("Joana"));
    assert_ok!(engine.create_appointment("bia", svc, Some(marcos), &at(day, 10, 0)).await);
    assert!(matches!(
        engine.create_appointment("caio", svc, Some(joana), &at(day, 10, 30)).await,
        Err(EngineError::SlotConflict(_))
    ));

    let joana_slots = engine.list_slots(day, svc, Some(joana)).await.unwrap();
    assert_eq!(joana_slots, vec!["09:00", "11:00"]);
}

#[tokio::test]
async fn per_professional_mode_requires_known_professional() {
    let engine = morning_engine("per_professional_required.wal", ScopeMode::PerProfessional).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let day = next_week();

    assert!(matches!(
        engine.create_appointment("ana", svc, None, &at(day, 10, 0)).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create_appointment("ana", svc, Some(Ulid::new()), &at(day, 10, 0)).await,
        Err(EngineError::ProfessionalNotFound(_))
    ));
    assert!(matches!(
        engine.list_slots(day, svc, None).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn global_mode_conflicts_across_professionals() {
    let engine = morning_engine("global_with_professional.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 60).await;
    let joana = add_professional(&engine, "Joana").await;
    let marcos = add_professional(&engine, "Marcos").await;
    let day = next_week();

    let info = engine
        .create_appointment("ana", svc, Some(joana), &at(day, 10, 0))
        .await
        .unwrap();
    assert_eq!(info.professional_id, Some(joana));
    assert!(matches!(
        engine.create_appointment("bia", svc, Some(marcos), &at(day, 10, 0)).await,
        Err(EngineError::SlotConflict(_))
    ));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn client_cancels_own_appointment_only() {
    let engine = morning_engine("cancel_ownership.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;
    let info = engine
        .create_appointment("ana", svc, None, &at(next_week(), 9, 0))
        .await
        .unwrap();

    assert!(matches!(
        engine.cancel_appointment(info.id, "bia").await,
        Err(EngineError::Forbidden(_))
    ));
    let cancelled = engine.cancel_appointment(info.id, "ana").await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert!(cancelled.updated_at >= cancelled.created_at);
}

#[tokio::test]
async fn cancelling_terminal_appointment_always_rejected() {
    let engine = morning_engine("cancel_terminal.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;
    let day = next_week();

    let a = engine
        .create_appointment("ana", svc, None, &at(day, 9, 0))
        .await
        .unwrap();
    engine.cancel_appointment(a.id, "ana").await.unwrap();
    for _ in 0..2 {
        assert!(matches!(
            engine.cancel_appointment(a.id, "ana").await,
            Err(EngineError::InvalidTransition { from: AppointmentStatus::Cancelled, .. })
        ));
    }

    let b = engine
        .create_appointment("ana", svc, None, &at(day, 10, 0))
        .await
        .unwrap();
    engine.set_status(b.id, "CONFIRMED").await.unwrap();
    engine.set_status(b.id, "COMPLETED").await.unwrap();
    assert!(matches!(
        engine.cancel_appointment(b.id, "ana").await,
        Err(EngineError::InvalidTransition { from: AppointmentStatus::Completed, .. })
    ));
}

#[tokio::test]
async fn cancel_unknown_appointment_not_found() {
    let engine = morning_engine("cancel_unknown.wal", ScopeMode::Global).await;
    assert!(matches!(
        engine.cancel_appointment(Ulid::new(), "ana").await,
        Err(EngineError::AppointmentNotFound(_))
    ));
}

#[tokio::test]
async fn staff_status_transitions() {
    let engine = morning_engine("set_status.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;
    let day = next_week();
    let a = engine
        .create_appointment("ana", svc, None, &at(day, 9, 0))
        .await
        .unwrap();

    // PENDING cannot jump straight to COMPLETED.
    assert!(matches!(
        engine.set_status(a.id, "COMPLETED").await,
        Err(EngineError::InvalidTransition { from: AppointmentStatus::Pending, .. })
    ));
    let confirmed = engine.set_status(a.id, "confirmed").await.unwrap();
    assert_eq!(confirmed.status, AppointmentStatus::Confirmed);
    assert!(matches!(
        engine.set_status(a.id, "PENDING").await,
        Err(EngineError::InvalidTransition { .. })
    ));
    let done = engine.set_status(a.id, "COMPLETED").await.unwrap();
    assert_eq!(done.status, AppointmentStatus::Completed);
    assert_err!(engine.set_status(a.id, "CANCELLED").await);

    let b = engine
        .create_appointment("bia", svc, None, &at(day, 10, 0))
        .await
        .unwrap();
    let cancelled = engine.set_status(b.id, "CANCELLED").await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
}

#[tokio::test]
async fn unrecognized_status_is_invalid_transition() {
    let engine = morning_engine("set_status_unknown.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;
    let a = engine
        .create_appointment("ana", svc, None, &at(next_week(), 9, 0))
        .await
        .unwrap();

    match engine.set_status(a.id, "NO_SHOW").await {
        Err(EngineError::InvalidTransition { from, to }) => {
            assert_eq!(from, AppointmentStatus::Pending);
            assert_eq!(to, "NO_SHOW");
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
    // Unknown id wins over an unknown status.
    assert!(matches!(
        engine.set_status(Ulid::new(), "NO_SHOW").await,
        Err(EngineError::AppointmentNotFound(_))
    ));
}

#[tokio::test]
async fn client_listing_only_shows_own_appointments() {
    let engine = morning_engine("client_listing.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;
    let day = next_week();

    engine.create_appointment("ana", svc, None, &at(day, 11, 0)).await.unwrap();
    engine.create_appointment("bia", svc, None, &at(day, 10, 0)).await.unwrap();
    engine.create_appointment("ana", svc, None, &at(day, 9, 0)).await.unwrap();

    let mine = engine.list_client_appointments("ana").await.unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|a| a.client_id == "ana"));
    assert!(mine[0].start < mine[1].start);
    assert_eq!(engine.list_appointments().await.unwrap().len(), 3);
    assert!(engine.list_client_appointments("caio").await.unwrap().is_empty());
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn service_duration_is_immutable() {
    let engine = morning_engine("duration_immutable.wal", ScopeMode::Global).await;
    let svc = add_service(&engine, "Corte", 30).await;

    assert!(matches!(
        engine.upsert_service(svc, "Corte".into(), 45, 5000, true).await,
        Err(EngineError::InvalidInput(_))
    ));
    // Renaming, repricing and deactivating are fine.
    let updated = engine
        .upsert_service(svc, "Corte feminino".into(), 30, 6500, false)
        .await
        .unwrap();
    assert_eq!(updated.price_cents, 6500);
    assert!(engine.list_services(false).is_empty());
    assert_eq!(engine.list_services(true).len(), 1);
}

#[tokio::test]
async fn service_validation() {
    let engine = morning_engine("service_validation.wal", ScopeMode::Global).await;
    assert_err!(engine.upsert_service(Ulid::new(), "Zero".into(), 0, 100, true).await);
    assert_err!(engine.upsert_service(Ulid::new(), "  ".into(), 30, 100, true).await);
    assert_err!(engine.upsert_service(Ulid::new(), "Free".into(), 30, -1, true).await);
    assert!(matches!(
        engine
            .upsert_service(Ulid::new(), "x".repeat(MAX_NAME_LEN + 1), 30, 100, true)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn inverted_business_hours_rejected() {
    let engine = Engine::new(test_wal_path("inverted_hours.wal"), settings(ScopeMode::Global)).unwrap();
    assert!(matches!(
        engine
            .set_business_hours(Weekday::Mon, DayHours::open(t(12, 0), t(9, 0)))
            .await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(engine.business_hours().is_empty());
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let day = next_week();
    let (svc, pro, kept, cancelled) = {
        let engine = Engine::new(path.clone(), settings(ScopeMode::PerProfessional)).unwrap();
        for d in WEEK {
            engine
                .set_business_hours(d, DayHours::open(t(9, 0), t(12, 0)))
                .await
                .unwrap();
        }
        let svc = add_service(&engine, "Corte", 60).await;
        let pro = add_professional(&engine, "Joana").await;
        let kept = engine
            .create_appointment("ana", svc, Some(pro), &at(day, 9, 0))
            .await
            .unwrap();
        engine.set_status(kept.id, "CONFIRMED").await.unwrap();
        let cancelled = engine
            .create_appointment("bia", svc, Some(pro), &at(day, 10, 0))
            .await
            .unwrap();
        engine.cancel_appointment(cancelled.id, "bia").await.unwrap();
        (svc, pro, kept.id, cancelled.id)
    };

    let engine = Engine::new(path, settings(ScopeMode::PerProfessional)).unwrap();
    assert_eq!(engine.business_hours().len(), 7);
    assert_eq!(engine.list_professionals().len(), 1);
    assert_eq!(
        engine.get_appointment(kept).await.unwrap().status,
        AppointmentStatus::Confirmed
    );
    assert_eq!(
        engine.get_appointment(cancelled).await.unwrap().status,
        AppointmentStatus::Cancelled
    );
    let slots = engine.list_slots(day, svc, Some(pro)).await.unwrap();
    assert_eq!(slots, vec!["10:00", "10:15", "10:30", "10:45", "11:00"]);
}

#[tokio::test]
async fn compaction_preserves_state_and_resets_counter() {
    let path = test_wal_path("compact_engine.wal");
    let day = next_week();
    let (svc, kept) = {
        let engine = morning_engine("compact_engine.wal", ScopeMode::Global).await;
        let svc = add_service(&engine, "Corte", 30).await;
        // Churn: book and cancel the same slot repeatedly.
        for _ in 0..5 {
            let a = engine
                .create_appointment("ana", svc, None, &at(day, 9, 0))
                .await
                .unwrap();
            engine.cancel_appointment(a.id, "ana").await.unwrap();
        }
        let kept = engine
            .create_appointment("ana", svc, None, &at(day, 9, 0))
            .await
            .unwrap();
        engine.set_status(kept.id, "CONFIRMED").await.unwrap();

        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (svc, kept.id)
    };

    let engine = Engine::new(path, settings(ScopeMode::Global)).unwrap();
    assert_eq!(engine.list_appointments().await.unwrap().len(), 6);
    assert_eq!(
        engine.get_appointment(kept).await.unwrap().status,
        AppointmentStatus::Confirmed
    );
    let slots = engine.list_slots(day, svc, None).await.unwrap();
    assert_eq!(slots[0], "09:30");
}

#[tokio::test]
async fn booking_after_torn_tail_survives_restart() {
    let path = test_wal_path("torn_restart.wal");
    let day = next_week();
    let svc = {
        let engine = morning_engine("torn_restart.wal", ScopeMode::Global).await;
        add_service(&engine, "Corte", 30).await
    };

    let mut wal = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    std::io::Write::write_all(&mut wal, &[0xFF, 0x00]).unwrap();
    drop(wal);

    let booked = {
        let engine = Engine::new(path.clone(), settings(ScopeMode::Global)).unwrap();
        engine
            .create_appointment("ana", svc, None, &at(day, 10, 0))
            .await
            .unwrap()
    };

    let engine = Engine::new(path, settings(ScopeMode::Global)).unwrap();
    assert_eq!(engine.list_appointments().await.unwrap().len(), 1);
    assert_eq!(engine.get_appointment(booked.id).await.unwrap().client_id, "ana");
    assert!(matches!(
        engine.create_appointment("bia", svc, None, &at(day, 10, 0)).await,
        Err(EngineError::SlotConflict(_))
    ));
}
