use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use ulid::Ulid;

use super::occupancy::now_ms;
use super::*;
use crate::audit::{AuditAction, AuditHub};
use crate::auth::Principal;
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("spotd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_at(path: &PathBuf, options: EngineOptions) -> Engine {
    Engine::new(path.clone(), options, Arc::new(AuditHub::new())).unwrap()
}

fn open(name: &str) -> Engine {
    open_at(&test_wal_path(name), EngineOptions::default())
}

fn days_from_now(days: i64) -> Ms {
    now_ms() + days * DAY_MS
}

fn user() -> Principal {
    Principal::user(Ulid::new())
}

async fn pool(engine: &Engine, day: &str) -> Ulid {
    engine.create_pool(day).await.unwrap().id
}

async fn reserved(engine: &Engine, pool_id: Ulid) -> Vec<u32> {
    engine.get_pool(pool_id).await.unwrap().reserved_slots
}

// ── Registry ─────────────────────────────────────────────

#[tokio::test]
async fn create_pool_uses_capacity_rule() {
    let engine = open("capacity_rule.wal");

    let friday = engine.create_pool("Friday").await.unwrap();
    assert_eq!(friday.capacity, 6);
    assert_eq!(friday.slot_numbers, vec![1, 2, 3, 4, 5, 6]);
    assert!(friday.reserved_slots.is_empty());
    assert_eq!(friday.reserved_count, 0);

    let monday = engine.create_pool("Monday").await.unwrap();
    assert_eq!(monday.capacity, 7);
    assert_eq!(monday.slot_numbers.last(), Some(&7));
}

#[tokio::test]
async fn create_pool_rejects_bad_day_and_duplicates() {
    let engine = open("pool_rejects.wal");

    assert!(matches!(
        engine.create_pool("Funday").await,
        Err(EngineError::InvalidDay(d)) if d == "Funday"
    ));
    assert!(matches!(
        engine.create_pool("friday").await,
        Err(EngineError::InvalidDay(_))
    ));

    engine.create_pool("Friday").await.unwrap();
    assert!(matches!(
        engine.create_pool("Friday").await,
        Err(EngineError::PoolAlreadyExists(_))
    ));
    assert_eq!(engine.list_pools(None).await.len(), 1);
}

#[tokio::test]
async fn concurrent_pool_creation_yields_one_pool() {
    let engine = Arc::new(open("pool_race.wal"));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.create_pool("Wednesday").await }));
    }
    let mut created = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => created += 1,
            Err(e) => assert!(matches!(e, EngineError::PoolAlreadyExists(_)), "{e}"),
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test]
async fn list_pools_filters_by_day() {
    let engine = open("list_pools.wal");
    for day in ["Sunday", "Monday", "Friday"] {
        engine.create_pool(day).await.unwrap();
    }

    let days: Vec<Weekday> = engine.list_pools(None).await.iter().map(|p| p.day).collect();
    assert_eq!(days, vec![Weekday::Monday, Weekday::Friday, Weekday::Sunday]);

    let friday = engine.list_pools(Some("Friday")).await;
    assert_eq!(friday.len(), 1);
    assert_eq!(friday[0].day, Weekday::Friday);

    assert!(engine.list_pools(Some("Tuesday")).await.is_empty());
    assert!(engine.list_pools(Some("Caturday")).await.is_empty());
}

#[tokio::test]
async fn get_pool_unknown_is_not_found() {
    let engine = open("get_pool_missing.wal");
    let id = Ulid::new();
    assert!(matches!(
        engine.get_pool(id).await,
        Err(EngineError::PoolNotFound(x)) if x == id
    ));
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn admit_records_and_claims() {
    let engine = open("admit.wal");
    let pool_id = pool(&engine, "Thursday").await;
    let requester = user();
    let truck = Ulid::new();
    let date = days_from_now(3);

    let r = engine
        .admit_reservation(pool_id, 4, truck, &requester, date)
        .await
        .unwrap();
    assert_eq!(r.pool_id, pool_id);
    assert_eq!(r.slot_number, 4);
    assert_eq!(r.claimant_id, truck);
    assert_eq!(r.requester_id, requester.requester_id);
    assert_eq!(r.date, date);
    assert!(r.created_at <= now_ms());

    assert_eq!(reserved(&engine, pool_id).await, vec![4]);
    assert_eq!(engine.get_reservation(r.id, None).unwrap(), r);
}

#[tokio::test]
async fn admit_checks_in_order() {
    let engine = open("admit_order.wal");
    let pool_id = pool(&engine, "Friday").await;
    let requester = user();

    // A bad date wins over an unknown pool.
    let err = engine
        .admit_reservation(Ulid::new(), 99, Ulid::new(), &requester, days_from_now(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDate { .. }), "{err}");

    let err = engine
        .admit_reservation(pool_id, 1, Ulid::new(), &requester, now_ms() - DAY_MS)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDate { .. }));

    let err = engine
        .admit_reservation(Ulid::new(), 1, Ulid::new(), &requester, days_from_now(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PoolNotFound(_)));

    let err = engine
        .admit_reservation(pool_id, 7, Ulid::new(), &requester, days_from_now(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSlot { slot: 7, .. }));

    engine
        .admit_reservation(pool_id, 2, Ulid::new(), &requester, days_from_now(3))
        .await
        .unwrap();
    let err = engine
        .admit_reservation(pool_id, 2, Ulid::new(), &requester, days_from_now(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SpotUnavailable { slot: 2, .. }));

    // Only the one successful admission left a trace.
    assert_eq!(reserved(&engine, pool_id).await, vec![2]);
    assert_eq!(engine.list_reservations(&requester).len(), 1);
}

#[tokio::test]
async fn friday_scenario() {
    let engine = open("friday.wal");
    let pool_id = pool(&engine, "Friday").await;
    let requester = user();
    let date = days_from_now(2);

    let mut by_slot = Vec::new();
    for slot in 1..=6 {
        let r = engine
            .admit_reservation(pool_id, slot, Ulid::new(), &requester, date)
            .await
            .unwrap();
        by_slot.push(r);
    }
    let info = engine.get_pool(pool_id).await.unwrap();
    assert_eq!(info.reserved_count, 6);

    let err = engine
        .admit_reservation(pool_id, 3, Ulid::new(), &requester, date)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SpotUnavailable { slot: 3, .. }));

    engine
        .release_reservation(by_slot[2].id, &requester)
        .await
        .unwrap();
    assert_eq!(engine.get_pool(pool_id).await.unwrap().reserved_count, 5);

    let again = engine
        .admit_reservation(pool_id, 3, Ulid::new(), &requester, date)
        .await
        .unwrap();
    assert_eq!(again.slot_number, 3);
    assert_eq!(engine.get_pool(pool_id).await.unwrap().reserved_count, 6);
}

#[tokio::test]
async fn monday_scenario() {
    let engine = open("monday.wal");
    let pool_id = pool(&engine, "Monday").await;
    let requester = user();
    let truck = Ulid::new();

    let first = engine
        .admit_reservation(pool_id, 1, truck, &requester, days_from_now(2))
        .await
        .unwrap();

    let err = engine
        .admit_reservation(pool_id, 2, truck, &requester, days_from_now(5))
        .await
        .unwrap_err();
    match err {
        EngineError::DuplicateWeeklyClaim {
            claimant_id,
            existing,
        } => {
            assert_eq!(claimant_id, truck);
            assert_eq!(existing, first.id);
        }
        other => panic!("expected DuplicateWeeklyClaim, got {other}"),
    }

    engine
        .admit_reservation(pool_id, 2, truck, &requester, days_from_now(9))
        .await
        .unwrap();
}

#[tokio::test]
async fn weekly_window_spans_six_days_each_way() {
    let engine = open("weekly_window.wal");
    let pool_id = pool(&engine, "Tuesday").await;
    let requester = user();
    let truck = Ulid::new();
    let anchor = days_from_now(20);

    engine
        .admit_reservation(pool_id, 1, truck, &requester, anchor)
        .await
        .unwrap();

    for offset in -6..=6 {
        let err = engine
            .admit_reservation(pool_id, 2, truck, &requester, anchor + offset * DAY_MS)
            .await
            .unwrap_err();
        assert!(
            matches!(err, EngineError::DuplicateWeeklyClaim { .. }),
            "offset {offset}: {err}"
        );
    }

    engine
        .admit_reservation(pool_id, 2, truck, &requester, anchor - 7 * DAY_MS)
        .await
        .unwrap();
    engine
        .admit_reservation(pool_id, 3, truck, &requester, anchor + 7 * DAY_MS)
        .await
        .unwrap();
}

#[tokio::test]
async fn weekly_uniqueness_spans_pools() {
    let engine = open("weekly_global.wal");
    let monday = pool(&engine, "Monday").await;
    let friday = pool(&engine, "Friday").await;
    let requester = user();
    let truck = Ulid::new();

    engine
        .admit_reservation(monday, 1, truck, &requester, days_from_now(3))
        .await
        .unwrap();
    let err = engine
        .admit_reservation(friday, 1, truck, &requester, days_from_now(4))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateWeeklyClaim { .. }));
}

// ── Contention ───────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_holds_under_contention() {
    let engine = Arc::new(open("contention_capacity.wal"));
    let pool_id = pool(&engine, "Friday").await;
    let date = days_from_now(3);

    let mut handles = Vec::new();
    for i in 0..48u32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .admit_reservation(pool_id, i % 6 + 1, Ulid::new(), &user(), date)
                .await
        }));
    }

    let mut admitted = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(r) => admitted.push(r.slot_number),
            Err(e) => assert!(matches!(e, EngineError::SpotUnavailable { .. }), "{e}"),
        }
    }

    assert_eq!(admitted.len(), 6);
    let distinct: HashSet<u32> = admitted.iter().copied().collect();
    assert_eq!(distinct.len(), 6);

    let info = engine.get_pool(pool_id).await.unwrap();
    assert_eq!(info.reserved_count, 6);
    assert_eq!(info.reserved_slots, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(engine.ledger.len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_winner_per_slot() {
    let engine = Arc::new(open("contention_slot.wal"));
    let pool_id = pool(&engine, "Saturday").await;
    let date = days_from_now(3);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .admit_reservation(pool_id, 5, Ulid::new(), &user(), date)
                .await
        }));
    }
    let mut wins = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(reserved(&engine, pool_id).await, vec![5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_claim_per_week_under_contention() {
    let engine = Arc::new(open("contention_weekly.wal"));
    let pool_id = pool(&engine, "Sunday").await;
    let truck = Ulid::new();

    let mut handles = Vec::new();
    for slot in 1..=7 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .admit_reservation(pool_id, slot, truck, &user(), days_from_now(4))
                .await
        }));
    }
    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(matches!(e, EngineError::DuplicateWeeklyClaim { .. }), "{e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(engine.ledger.find_by_claimant(&truck).len(), 1);
}

// ── Reassign / update ────────────────────────────────────

#[tokio::test]
async fn reassign_moves_the_claim() {
    let engine = open("reassign.wal");
    let pool_id = pool(&engine, "Monday").await;
    let owner = user();

    let r = engine
        .admit_reservation(pool_id, 1, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();
    let moved = engine.reassign_slot(r.id, 5, &owner).await.unwrap();

    assert_eq!(moved.id, r.id);
    assert_eq!(moved.slot_number, 5);
    assert_eq!(moved.date, r.date);
    assert_eq!(moved.created_at, r.created_at);
    assert_eq!(reserved(&engine, pool_id).await, vec![5]);
}

#[tokio::test]
async fn reassign_onto_taken_slot_keeps_original() {
    let engine = open("reassign_taken.wal");
    let pool_id = pool(&engine, "Monday").await;
    let owner = user();

    let mine = engine
        .admit_reservation(pool_id, 1, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();
    engine
        .admit_reservation(pool_id, 2, Ulid::new(), &user(), days_from_now(3))
        .await
        .unwrap();

    let err = engine.reassign_slot(mine.id, 2, &owner).await.unwrap_err();
    assert!(matches!(err, EngineError::SpotUnavailable { slot: 2, .. }));
    assert_eq!(engine.get_reservation(mine.id, None).unwrap().slot_number, 1);
    assert_eq!(reserved(&engine, pool_id).await, vec![1, 2]);
}

#[tokio::test]
async fn reassign_edge_cases() {
    let engine = open("reassign_edges.wal");
    let pool_id = pool(&engine, "Friday").await;
    let owner = user();
    let r = engine
        .admit_reservation(pool_id, 3, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();

    // Same slot is a no-op.
    assert_eq!(engine.reassign_slot(r.id, 3, &owner).await.unwrap(), r);

    let err = engine.reassign_slot(r.id, 7, &owner).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidSlot { slot: 7, .. }));

    let err = engine.reassign_slot(Ulid::new(), 1, &owner).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    assert_eq!(reserved(&engine, pool_id).await, vec![3]);
}

#[tokio::test]
async fn update_date_passes_lead_time_rule() {
    let engine = open("update_date.wal");
    let pool_id = pool(&engine, "Wednesday").await;
    let owner = user();
    let r = engine
        .admit_reservation(pool_id, 2, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();

    let too_soon = ReservationPatch {
        slot_number: None,
        date: Some(now_ms()),
    };
    let err = engine.update_reservation(r.id, too_soon, &owner).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidDate { .. }));

    let later = days_from_now(30);
    let patch = ReservationPatch {
        slot_number: Some(6),
        date: Some(later),
    };
    let updated = engine.update_reservation(r.id, patch, &owner).await.unwrap();
    assert_eq!(updated.placement(), Placement { slot_number: 6, date: later });
    assert_eq!(reserved(&engine, pool_id).await, vec![6]);
}

#[tokio::test]
async fn only_owner_or_admin_may_modify() {
    let engine = open("ownership.wal");
    let pool_id = pool(&engine, "Friday").await;
    let owner = user();
    let stranger = user();
    let r = engine
        .admit_reservation(pool_id, 1, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();

    let err = engine.reassign_slot(r.id, 2, &stranger).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    let err = engine.release_reservation(r.id, &stranger).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    assert_eq!(reserved(&engine, pool_id).await, vec![1]);

    let admin = Principal::admin(Ulid::new());
    let moved = engine.reassign_slot(r.id, 2, &admin).await.unwrap();
    assert_eq!(moved.slot_number, 2);
    assert_eq!(moved.requester_id, owner.requester_id);
}

// ── Release ──────────────────────────────────────────────

#[tokio::test]
async fn release_restores_capacity() {
    let engine = open("release.wal");
    let pool_id = pool(&engine, "Thursday").await;
    let owner = user();
    let r = engine
        .admit_reservation(pool_id, 6, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();
    let before = engine.get_pool(pool_id).await.unwrap().reserved_count;

    engine.release_reservation(r.id, &owner).await.unwrap();

    let info = engine.get_pool(pool_id).await.unwrap();
    assert_eq!(info.reserved_count, before - 1);
    assert!(info.reserved_slots.is_empty());
    assert!(matches!(
        engine.get_reservation(r.id, None),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.release_reservation(r.id, &owner).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn admin_release_needs_admin_role() {
    let engine = open("admin_release.wal");
    let pool_id = pool(&engine, "Friday").await;
    let owner = user();
    let r = engine
        .admit_reservation(pool_id, 4, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();

    let err = engine.admin_release_reservation(r.id, &owner).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    assert_eq!(reserved(&engine, pool_id).await, vec![4]);

    let admin = Principal::admin(Ulid::new());
    engine.admin_release_reservation(r.id, &admin).await.unwrap();
    assert!(reserved(&engine, pool_id).await.is_empty());
    assert!(engine.ledger.is_empty());
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn reads_are_scoped_to_the_requester() {
    let engine = open("scoped_reads.wal");
    let pool_id = pool(&engine, "Monday").await;
    let alice = user();
    let bob = user();
    let truck = Ulid::new();

    let a = engine
        .admit_reservation(pool_id, 1, truck, &alice, days_from_now(3))
        .await
        .unwrap();
    let b = engine
        .admit_reservation(pool_id, 2, Ulid::new(), &bob, days_from_now(3))
        .await
        .unwrap();

    assert_eq!(engine.get_reservation(a.id, Some(alice.requester_id)).unwrap(), a);
    assert!(matches!(
        engine.get_reservation(a.id, Some(bob.requester_id)),
        Err(EngineError::NotFound(_))
    ));

    assert_eq!(engine.list_reservations(&alice), vec![a.clone()]);
    assert_eq!(engine.list_reservations(&bob), vec![b.clone()]);
    let admin = Principal::admin(Ulid::new());
    assert_eq!(engine.list_reservations(&admin).len(), 2);

    assert_eq!(engine.reservations_for_claimant(truck, &alice), vec![a]);
    assert!(engine.reservations_for_claimant(truck, &bob).is_empty());
    assert_eq!(engine.reservations_for_claimant(truck, &admin).len(), 1);
}

#[tokio::test]
async fn everyone_sees_taken_slots_without_owners() {
    let engine = open("anonymized_reads.wal");
    let pool_id = pool(&engine, "Tuesday").await;
    let alice = user();
    let date = days_from_now(4);
    let a = engine
        .admit_reservation(pool_id, 2, Ulid::new(), &alice, date)
        .await
        .unwrap();
    let b = engine
        .admit_reservation(pool_id, 5, Ulid::new(), &user(), date)
        .await
        .unwrap();

    let all = engine.list_reservations_anonymized();
    assert_eq!(all.len(), 2);
    for r in &all {
        assert_eq!(r.claimant_id, Ulid::nil());
        assert_eq!(r.requester_id, Ulid::nil());
        assert_eq!((r.pool_id, r.date), (pool_id, date));
    }
    let mut slots: Vec<(Ulid, u32)> = all.iter().map(|r| (r.id, r.slot_number)).collect();
    slots.sort();
    let mut expected = vec![(a.id, 2), (b.id, 5)];
    expected.sort();
    assert_eq!(slots, expected);

    // The stored records keep their owners.
    assert_eq!(engine.get_reservation(a.id, None).unwrap(), a);
}

#[tokio::test]
async fn claimant_locks_are_dropped_after_admission() {
    let engine = Arc::new(open("claimant_locks.wal"));
    let pool_id = pool(&engine, "Monday").await;
    let owner = user();
    let truck = Ulid::new();

    engine
        .admit_reservation(pool_id, 1, truck, &owner, days_from_now(3))
        .await
        .unwrap();
    assert!(engine
        .admit_reservation(pool_id, 2, truck, &owner, days_from_now(4))
        .await
        .is_err());
    assert!(engine.claimant_locks.is_empty());

    let mut handles = Vec::new();
    for slot in 2..=7 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let _ = engine
                .admit_reservation(pool_id, slot, truck, &owner, days_from_now(10))
                .await;
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert!(engine.claimant_locks.is_empty());
    assert_eq!(engine.reservations_for_claimant(truck, &owner).len(), 2);
}

#[tokio::test]
async fn audit_event_per_outcome() {
    let engine = open("audit.wal");
    let mut rx = engine.audit.subscribe();
    let pool_id = pool(&engine, "Friday").await;
    let owner = user();

    let r = engine
        .admit_reservation(pool_id, 1, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();
    let _ = engine
        .admit_reservation(pool_id, 1, Ulid::new(), &owner, days_from_now(3))
        .await;
    engine.release_reservation(r.id, &owner).await.unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.action, AuditAction::Admit);
    assert_eq!(first.outcome, "ok");
    assert_eq!(first.reservation_id, Some(r.id));
    assert_eq!(first.requester_id, owner.requester_id);

    let second = rx.recv().await.unwrap();
    assert_eq!(second.action, AuditAction::Admit);
    assert_eq!(second.outcome, "spot_unavailable");
    assert_eq!(second.reservation_id, None);

    let third = rx.recv().await.unwrap();
    assert_eq!(third.action, AuditAction::Release);
    assert_eq!(third.pool_id, Some(pool_id));
    assert!(third.succeeded());
}

// ── Replay & compaction ──────────────────────────────────

#[tokio::test]
async fn replay_rebuilds_state() {
    let path = test_wal_path("replay.wal");
    let owner = user();
    let (pool_id, kept, moved_date) = {
        let engine = open_at(&path, EngineOptions::default());
        let pool_id = pool(&engine, "Friday").await;
        engine.create_pool("Monday").await.unwrap();

        let kept = engine
            .admit_reservation(pool_id, 1, Ulid::new(), &owner, days_from_now(3))
            .await
            .unwrap();
        let gone = engine
            .admit_reservation(pool_id, 2, Ulid::new(), &owner, days_from_now(3))
            .await
            .unwrap();
        let moved_date = days_from_now(12);
        engine
            .update_reservation(
                kept.id,
                ReservationPatch {
                    slot_number: Some(4),
                    date: Some(moved_date),
                },
                &owner,
            )
            .await
            .unwrap();
        engine.release_reservation(gone.id, &owner).await.unwrap();
        (pool_id, kept, moved_date)
    };

    let engine = open_at(&path, EngineOptions::default());
    assert_eq!(engine.replayed_events(), 6);
    assert_eq!(engine.list_pools(None).await.len(), 2);

    let info = engine.get_pool(pool_id).await.unwrap();
    assert_eq!(info.reserved_slots, vec![4]);
    assert_eq!(info.reserved_count, 1);

    let restored = engine.get_reservation(kept.id, None).unwrap();
    assert_eq!(restored.placement(), Placement { slot_number: 4, date: moved_date });
    assert_eq!(restored.created_at, kept.created_at);
    assert_eq!(engine.ledger.len(), 1);
    assert!(matches!(
        engine.create_pool("Friday").await,
        Err(EngineError::PoolAlreadyExists(_))
    ));
}

fn logged_reservation(pool_id: Ulid, slot: u32) -> Reservation {
    Reservation {
        id: Ulid::new(),
        pool_id,
        slot_number: slot,
        claimant_id: Ulid::new(),
        requester_id: Ulid::new(),
        date: days_from_now(5),
        created_at: now_ms(),
    }
}

#[tokio::test]
async fn replay_skips_events_that_break_invariants() {
    let path = test_wal_path("replay_skips.wal");
    let pool_id = Ulid::new();
    let first = logged_reservation(pool_id, 1);
    let clash = logged_reservation(pool_id, 1);
    let outside = logged_reservation(pool_id, 9);
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::PoolCreated {
            id: pool_id,
            day: Weekday::Friday,
            capacity: 6,
            slot_numbers: (1..=6).collect(),
        })
        .unwrap();
        wal.append(&Event::ReservationAdmitted { reservation: first.clone() }).unwrap();
        wal.append(&Event::ReservationAdmitted { reservation: clash }).unwrap();
        wal.append(&Event::ReservationAdmitted { reservation: outside }).unwrap();
        wal.append(&Event::ReservationReleased {
            reservation: logged_reservation(pool_id, 2),
        })
        .unwrap();
        wal.append(&Event::ReservationAdmitted {
            reservation: logged_reservation(Ulid::new(), 1),
        })
        .unwrap();
    }

    let engine = open_at(&path, EngineOptions::default());
    assert_eq!(engine.replayed_events(), 6);
    assert_eq!(engine.ledger.find_all(), vec![first]);
    let info = engine.get_pool(pool_id).await.unwrap();
    assert_eq!(info.reserved_slots, vec![1]);
    assert_eq!(info.reserved_count, 1);
}

#[tokio::test]
async fn compensated_pairs_replay_to_nothing() {
    let path = test_wal_path("replay_compensated.wal");
    let pool_id = Ulid::new();
    let admitted = Event::ReservationAdmitted {
        reservation: logged_reservation(pool_id, 3),
    };
    {
        let mut wal = Wal::open(&path).unwrap();
        let created = Event::PoolCreated {
            id: pool_id,
            day: Weekday::Monday,
            capacity: 7,
            slot_numbers: (1..=7).collect(),
        };
        wal.append(&created).unwrap();
        wal.append(&admitted).unwrap();
        wal.append(&admitted.compensation().unwrap()).unwrap();
        // A withdrawn pool disappears with it.
        let other = Event::PoolCreated {
            id: Ulid::new(),
            day: Weekday::Tuesday,
            capacity: 7,
            slot_numbers: (1..=7).collect(),
        };
        wal.append(&other).unwrap();
        wal.append(&other.compensation().unwrap()).unwrap();
    }

    let engine = open_at(&path, EngineOptions::default());
    assert!(engine.ledger.is_empty());
    assert!(reserved(&engine, pool_id).await.is_empty());
    let days: Vec<Weekday> = engine.list_pools(None).await.iter().map(|p| p.day).collect();
    assert_eq!(days, vec![Weekday::Monday]);
}

#[tokio::test]
async fn compaction_on_open_keeps_live_state() {
    let path = test_wal_path("compaction.wal");
    let owner = user();
    let options = EngineOptions {
        compact_threshold: 4,
        ..EngineOptions::default()
    };
    let (pool_id, live) = {
        let engine = open_at(&path, options.clone());
        let pool_id = pool(&engine, "Saturday").await;
        for slot in 1..=3 {
            let r = engine
                .admit_reservation(pool_id, slot, Ulid::new(), &owner, days_from_now(3))
                .await
                .unwrap();
            engine.release_reservation(r.id, &owner).await.unwrap();
        }
        let live = engine
            .admit_reservation(pool_id, 7, Ulid::new(), &owner, days_from_now(3))
            .await
            .unwrap();
        (pool_id, live)
    };
    let before = std::fs::metadata(&path).unwrap().len();

    {
        let engine = open_at(&path, options.clone());
        assert_eq!(engine.replayed_events(), 8);
    }
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before, "compacted WAL should shrink: {after} < {before}");

    let engine = open_at(&path, options);
    assert_eq!(engine.replayed_events(), 2);
    assert_eq!(engine.get_reservation(live.id, None).unwrap(), live);
    assert_eq!(reserved(&engine, pool_id).await, vec![7]);
}

#[tokio::test]
async fn torn_tail_does_not_hide_later_commits() {
    let path = test_wal_path("torn_tail_reopen.wal");
    {
        let engine = open_at(&path, EngineOptions::default());
        engine.create_pool("Friday").await.unwrap();
    }
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut f, &[40u8, 0, 0, 0, 7, 7, 7]).unwrap();
    }
    {
        let engine = open_at(&path, EngineOptions::default());
        assert_eq!(engine.replayed_events(), 1);
        engine.create_pool("Monday").await.unwrap();
    }

    let engine = open_at(&path, EngineOptions::default());
    assert_eq!(engine.replayed_events(), 2);
    assert_eq!(engine.list_pools(None).await.len(), 2);
}

// ── Storage failures (scripted WAL writer) ───────────────

#[derive(Clone, Copy)]
enum Reply {
    Ok,
    Fail,
    /// Never answer.
    Hang,
    /// Answer Ok after a delay.
    Delay(Duration),
}

/// Stand-in WAL writer that answers from a script (Ok once it runs out)
/// and records every event it was asked to write.
fn scripted_engine(script: &[Reply], timeout: Duration) -> (Engine, Arc<StdMutex<Vec<Event>>>) {
    let (tx, mut rx) = mpsc::channel::<WalRequest>(64);
    let written = Arc::new(StdMutex::new(Vec::new()));
    let log = written.clone();
    let mut script: VecDeque<Reply> = script.iter().copied().collect();
    tokio::spawn(async move {
        let mut hung = Vec::new();
        while let Some(request) = rx.recv().await {
            log.lock().unwrap().push(request.event.clone());
            match script.pop_front().unwrap_or(Reply::Ok) {
                Reply::Ok => {
                    let _ = request.response.send(Ok(()));
                }
                Reply::Fail => {
                    let _ = request.response.send(Err(io::Error::other("disk full")));
                }
                Reply::Hang => hung.push(request.response),
                Reply::Delay(d) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(d).await;
                        let _ = request.response.send(Ok(()));
                    });
                }
            }
        }
    });
    let engine = Engine::with_writer(tx, timeout, Arc::new(AuditHub::new()));
    (engine, written)
}

fn labels(written: &StdMutex<Vec<Event>>) -> Vec<&'static str> {
    written.lock().unwrap().iter().map(Event::label).collect()
}

const FAST: Duration = Duration::from_millis(50);

#[tokio::test]
async fn failed_write_leaves_no_trace() {
    let (engine, _) = scripted_engine(&[Reply::Ok, Reply::Fail], FAST);
    let pool_id = pool(&engine, "Friday").await;
    let owner = user();
    let truck = Ulid::new();

    let err = engine
        .admit_reservation(pool_id, 2, truck, &owner, days_from_now(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageError(_)));
    assert!(err.is_retryable());
    assert!(reserved(&engine, pool_id).await.is_empty());
    assert!(engine.ledger.is_empty());

    // Same request again goes through.
    engine
        .admit_reservation(pool_id, 2, truck, &owner, days_from_now(3))
        .await
        .unwrap();
    assert_eq!(reserved(&engine, pool_id).await, vec![2]);
}

#[tokio::test]
async fn failed_pool_creation_can_be_retried() {
    let (engine, _) = scripted_engine(&[Reply::Fail], FAST);
    assert!(matches!(
        engine.create_pool("Monday").await,
        Err(EngineError::StorageError(_))
    ));
    assert!(engine.list_pools(None).await.is_empty());
    engine.create_pool("Monday").await.unwrap();
}

#[tokio::test]
async fn timed_out_admit_is_compensated() {
    let (engine, written) = scripted_engine(&[Reply::Ok, Reply::Hang, Reply::Ok], FAST);
    let pool_id = pool(&engine, "Friday").await;

    let err = engine
        .admit_reservation(pool_id, 3, Ulid::new(), &user(), days_from_now(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageError(_)), "{err}");
    assert!(reserved(&engine, pool_id).await.is_empty());
    assert!(engine.ledger.is_empty());
    assert_eq!(
        labels(&written),
        vec!["pool_created", "reservation_admitted", "reservation_released"]
    );
}

#[tokio::test]
async fn exhausted_compensation_is_partial_failure() {
    let script = [Reply::Ok, Reply::Hang, Reply::Fail, Reply::Fail, Reply::Fail];
    let (engine, written) = scripted_engine(&script, FAST);
    let pool_id = pool(&engine, "Friday").await;

    let err = engine
        .admit_reservation(pool_id, 3, Ulid::new(), &user(), days_from_now(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PartialFailure(_)), "{err}");
    assert!(!err.is_retryable());
    assert_eq!(written.lock().unwrap().len(), 2 + MAX_COMPENSATION_ATTEMPTS);

    // Memory follows the write that may have landed, so the slot stays taken.
    assert_eq!(reserved(&engine, pool_id).await, vec![3]);
    assert_eq!(engine.ledger.len(), 1);
}

#[tokio::test]
async fn queued_compensation_is_written_once() {
    let script = [Reply::Ok, Reply::Hang, Reply::Hang];
    let (engine, written) = scripted_engine(&script, FAST);
    let pool_id = pool(&engine, "Friday").await;

    let err = engine
        .admit_reservation(pool_id, 3, Ulid::new(), &user(), days_from_now(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PartialFailure(_)), "{err}");
    assert_eq!(
        labels(&written),
        vec!["pool_created", "reservation_admitted", "reservation_released"]
    );

    // The inverse is queued behind the admit, so memory already matches the
    // log once both drain.
    assert!(reserved(&engine, pool_id).await.is_empty());
    assert!(engine.ledger.is_empty());

    let path = test_wal_path("queued_compensation.wal");
    {
        let mut wal = Wal::open(&path).unwrap();
        for event in written.lock().unwrap().iter() {
            wal.append(event).unwrap();
        }
    }
    let replayed = open_at(&path, EngineOptions::default());
    assert!(reserved(&replayed, pool_id).await.is_empty());
    assert!(replayed.ledger.is_empty());
}

#[tokio::test]
async fn rejected_compensation_is_queued_again_but_not_twice() {
    let script = [Reply::Ok, Reply::Hang, Reply::Fail, Reply::Hang];
    let (engine, written) = scripted_engine(&script, FAST);
    let pool_id = pool(&engine, "Friday").await;

    let err = engine
        .admit_reservation(pool_id, 4, Ulid::new(), &user(), days_from_now(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PartialFailure(_)), "{err}");
    assert_eq!(
        labels(&written),
        vec![
            "pool_created",
            "reservation_admitted",
            "reservation_released",
            "reservation_released"
        ]
    );
    assert!(reserved(&engine, pool_id).await.is_empty());
}

#[tokio::test]
async fn timed_out_release_keeps_reservation() {
    let script = [Reply::Ok, Reply::Ok, Reply::Hang, Reply::Ok];
    let (engine, written) = scripted_engine(&script, FAST);
    let pool_id = pool(&engine, "Monday").await;
    let owner = user();
    let r = engine
        .admit_reservation(pool_id, 5, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();

    let err = engine.release_reservation(r.id, &owner).await.unwrap_err();
    assert!(matches!(err, EngineError::StorageError(_)), "{err}");
    assert_eq!(engine.get_reservation(r.id, None).unwrap(), r);
    assert_eq!(reserved(&engine, pool_id).await, vec![5]);
    assert_eq!(labels(&written).last(), Some(&"reservation_admitted"));
}

#[tokio::test]
async fn timed_out_reassign_keeps_original_slot() {
    let script = [Reply::Ok, Reply::Ok, Reply::Hang, Reply::Ok];
    let (engine, written) = scripted_engine(&script, FAST);
    let pool_id = pool(&engine, "Monday").await;
    let owner = user();
    let r = engine
        .admit_reservation(pool_id, 1, Ulid::new(), &owner, days_from_now(3))
        .await
        .unwrap();

    let err = engine.reassign_slot(r.id, 6, &owner).await.unwrap_err();
    assert!(matches!(err, EngineError::StorageError(_)));
    assert_eq!(engine.get_reservation(r.id, None).unwrap().slot_number, 1);
    assert_eq!(reserved(&engine, pool_id).await, vec![1]);

    let events = written.lock().unwrap().clone();
    match (&events[2], &events[3]) {
        (
            Event::ReservationUpdated { from: f1, to: t1, .. },
            Event::ReservationUpdated { from: f2, to: t2, .. },
        ) => {
            assert_eq!((f1.slot_number, t1.slot_number), (1, 6));
            assert_eq!((f2.slot_number, t2.slot_number), (6, 1));
        }
        other => panic!("expected an update and its inverse, got {other:?}"),
    }
}

#[tokio::test]
async fn dropped_caller_does_not_abort_commit() {
    let script = [Reply::Ok, Reply::Delay(Duration::from_millis(40))];
    let (engine, _) = scripted_engine(&script, Duration::from_secs(2));
    let pool_id = pool(&engine, "Friday").await;
    let owner = user();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(5),
        engine.admit_reservation(pool_id, 6, Ulid::new(), &owner, days_from_now(3)),
    )
    .await;
    assert!(abandoned.is_err(), "caller should have given up first");

    // The read lock waits for the detached commit to release the pool.
    assert_eq!(reserved(&engine, pool_id).await, vec![6]);
    assert_eq!(engine.list_reservations(&owner).len(), 1);
}
