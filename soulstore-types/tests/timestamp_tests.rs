use soulstore_types::HybridTimestamp;

// ── Construction ─────────────────────────────────────────────────

#[test]
fn now_has_zero_logical() {
    let ts = HybridTimestamp::now();
    assert_eq!(ts.logical(), 0);
    assert!(ts.wall_time() > 0);
}

#[test]
fn zero_is_before_now() {
    assert!(HybridTimestamp::zero() < HybridTimestamp::now());
}

// ── Ordering ─────────────────────────────────────────────────────

#[test]
fn ordering_by_wall_time() {
    assert!(HybridTimestamp::new(100, 0) < HybridTimestamp::new(200, 0));
}

#[test]
fn ordering_by_logical_when_wall_time_equal() {
    assert!(HybridTimestamp::new(100, 0) < HybridTimestamp::new(100, 1));
}

// ── tick / receive ───────────────────────────────────────────────

#[test]
fn tick_is_monotonic_for_future_clock() {
    let future = HybridTimestamp::new(u64::MAX - 1, 3);
    let next = future.tick();
    assert_eq!(next.wall_time(), future.wall_time());
    assert_eq!(next.logical(), 4);
    assert!(next > future);
}

#[test]
fn tick_advances_past_old_timestamp() {
    let old = HybridTimestamp::new(1, 9);
    assert!(old.tick() > old);
}

#[test]
fn receive_exceeds_both_inputs() {
    let local = HybridTimestamp::new(u64::MAX - 10, 2);
    let remote = HybridTimestamp::new(u64::MAX - 10, 7);
    let merged = local.receive(&remote);
    assert!(merged > local);
    assert!(merged > remote);
    assert_eq!(merged.logical(), 8);
}

#[test]
fn serde_uses_compact_field_names() {
    let ts = HybridTimestamp::new(5, 1);
    let json = serde_json::to_string(&ts).unwrap();
    assert_eq!(json, r#"{"w":5,"l":1}"#);
}
