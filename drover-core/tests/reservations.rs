//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::{Value, json};

use drover_core::reservation::{
    Reservation, ReservationManager, ReservationPriority, Task, TaskState,
    TimeSlice,
};

const GRACE: Duration = Duration::from_secs(10);

fn manager() -> ReservationManager {
    ReservationManager::new(GRACE, Duration::from_secs(60), None)
}

fn request(device: &str, start: &str, end: &str) -> Value {
    json!([[device, start, end]])
}

// ===== TimeSlice =====

#[test]
fn test_stretch_to_include_unset_start() {
    let now = Utc::now();
    let mut ts1 = TimeSlice {
        start: None,
        end: Some(now + TimeDelta::hours(2)),
    };
    let ts2 =
        TimeSlice::new(now + TimeDelta::hours(1), now + TimeDelta::hours(3));
    ts1.stretch_to_include(&ts2);
    assert_eq!(ts1.start, ts2.start);
    assert_eq!(ts1.end, Some(now + TimeDelta::hours(3)));
}

#[test]
fn test_stretch_to_include_unset_end() {
    let now = Utc::now();
    let mut ts1 = TimeSlice {
        start: Some(now),
        end: None,
    };
    let ts2 =
        TimeSlice::new(now - TimeDelta::hours(1), now + TimeDelta::hours(1));
    ts1.stretch_to_include(&ts2);
    assert_eq!(ts1.end, ts2.end);
}

#[test]
fn test_stretch_to_include_extends_both_ends() {
    let now = Utc::now();
    let mut ts =
        TimeSlice::new(now + TimeDelta::hours(2), now + TimeDelta::hours(3));
    ts.stretch_to_include(&TimeSlice::new(
        now + TimeDelta::hours(1),
        now + TimeDelta::hours(2),
    ));
    assert_eq!(ts.start, Some(now + TimeDelta::hours(1)));
    ts.stretch_to_include(&TimeSlice::new(
        now + TimeDelta::hours(1),
        now + TimeDelta::hours(4),
    ));
    assert_eq!(ts.end, Some(now + TimeDelta::hours(4)));
}

#[test]
fn test_stretch_to_include_inner_slice_changes_nothing() {
    let now = Utc::now();
    let mut ts = TimeSlice::new(now, now + TimeDelta::hours(4));
    ts.stretch_to_include(&TimeSlice::new(
        now + TimeDelta::hours(1),
        now + TimeDelta::hours(2),
    ));
    assert_eq!(ts.start, Some(now));
    assert_eq!(ts.end, Some(now + TimeDelta::hours(4)));
}

#[test]
fn test_overlap_touching_endpoints_is_not_overlap() {
    let now = Utc::now();
    let first = TimeSlice::new(now, now + TimeDelta::hours(1));
    let second =
        TimeSlice::new(now + TimeDelta::hours(1), now + TimeDelta::hours(2));
    assert!(!first.overlaps(&second));
    assert!(!second.overlaps(&first));
    let overlapping = TimeSlice::new(
        now + TimeDelta::minutes(30),
        now + TimeDelta::minutes(90),
    );
    assert!(first.overlaps(&overlapping));
}

// ===== Reservation =====

#[test]
fn test_reservation_conflict_detection() {
    let now = Utc::now();
    let mut reservation = Reservation::default();
    reservation.reserve_slot(TimeSlice::new(now, now + TimeDelta::hours(1)));
    reservation.reserve_slot(TimeSlice::new(
        now + TimeDelta::hours(2),
        now + TimeDelta::hours(3),
    ));

    let mut other = Reservation::default();
    other.time_slots.push(TimeSlice::new(
        now + TimeDelta::hours(4),
        now + TimeDelta::hours(5),
    ));
    assert!(reservation.get_conflicts(&other).is_empty());

    other.time_slots.push(TimeSlice::new(
        now + TimeDelta::minutes(30),
        now + TimeDelta::minutes(90),
    ));
    assert_eq!(reservation.get_conflicts(&other).len(), 1);
}

#[test]
fn test_reservation_prune_to_current_truncates_to_grace() {
    let now = Utc::now();
    let mut reservation = Reservation::default();
    reservation.reserve_slot(TimeSlice::new(
        now - TimeDelta::minutes(5),
        now + TimeDelta::hours(1),
    ));
    reservation.reserve_slot(TimeSlice::new(
        now + TimeDelta::hours(2),
        now + TimeDelta::hours(3),
    ));
    reservation.prune_to_current(GRACE, now);
    assert_eq!(reservation.time_slots.len(), 1);
    assert_eq!(
        reservation.time_slots[0].end,
        Some(now + TimeDelta::seconds(10))
    );
}

#[test]
fn test_reservation_next_event_time() {
    let now = Utc::now();
    let mut reservation = Reservation::default();
    assert!(reservation.get_next_event_time(now).is_none());
    reservation.reserve_slot(TimeSlice::new(
        now + TimeDelta::hours(1),
        now + TimeDelta::hours(2),
    ));
    assert_eq!(
        reservation.get_next_event_time(now),
        Some(now + TimeDelta::hours(1))
    );
    // During the slot, the next event is its end.
    assert_eq!(
        reservation.get_next_event_time(now + TimeDelta::minutes(90)),
        Some(now + TimeDelta::hours(2))
    );
}

// ===== Task =====

#[test]
fn test_task_state_transitions() {
    let now = Utc::now();
    let mut task = Task::new("agent1", ReservationPriority::High);
    task.populate_reservation(&[(
        "device1".to_owned(),
        now,
        now + TimeDelta::hours(1),
    )])
    .unwrap();

    task.make_current(now - TimeDelta::hours(1));
    assert_eq!(task.state, TaskState::PreRun);
    task.make_current(now + TimeDelta::minutes(30));
    assert_eq!(task.state, TaskState::Running);
    task.make_current(now + TimeDelta::hours(2));
    assert_eq!(task.state, TaskState::Finished);
    // Finished tasks hold nothing.
    assert!(task.devices.is_empty());
}

fn naive(text: &str) -> chrono::DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .unwrap()
        .and_utc()
}

#[test]
fn test_task_aggregate_time_slice() {
    let mut task = Task::new("agent1", ReservationPriority::High);
    let start1 = naive("2022-01-01T12:00:00");
    let end1 = naive("2022-01-01T13:00:00");
    let start2 = naive("2022-01-01T14:00:00");
    let end2 = naive("2022-01-01T15:00:00");
    task.populate_reservation(&[
        ("device1".to_owned(), start1, end1),
        ("device2".to_owned(), start2, end2),
    ])
    .unwrap();
    assert!(task.devices.contains_key("device1"));
    assert_eq!(task.devices["device1"].time_slots.len(), 1);
    assert_eq!(task.time_slice.start, Some(start1));
    assert_eq!(task.time_slice.end, Some(end2));
}

#[test]
fn test_preemption_rules() {
    let now = Utc::now();
    let slice = [(
        "device1".to_owned(),
        now - TimeDelta::minutes(5),
        now + TimeDelta::hours(1),
    )];

    let mut high = Task::new("agent1", ReservationPriority::High);
    high.populate_reservation(&slice).unwrap();

    // HIGH never preempts HIGH.
    let mut other_high = Task::new("agent2", ReservationPriority::High);
    other_high.populate_reservation(&slice).unwrap();
    other_high.make_current(now);
    assert!(!high.check_can_preempt_other(&other_high));

    // A running plain-LOW holder is safe.
    let mut low = Task::new("agent2", ReservationPriority::Low);
    low.populate_reservation(&slice).unwrap();
    low.make_current(now);
    assert_eq!(low.state, TaskState::Running);
    assert!(!high.check_can_preempt_other(&low));

    // A running LOW_PREEMPT holder is not.
    let mut low_preempt = Task::new("agent2", ReservationPriority::LowPreempt);
    low_preempt.populate_reservation(&slice).unwrap();
    low_preempt.make_current(now);
    assert!(high.check_can_preempt_other(&low_preempt));

    // A LOW holder that has not started yet can be displaced.
    let mut pre_run = Task::new("agent2", ReservationPriority::Low);
    pre_run
        .populate_reservation(&[(
            "device1".to_owned(),
            now + TimeDelta::hours(1),
            now + TimeDelta::hours(2),
        )])
        .unwrap();
    pre_run.make_current(now);
    assert_eq!(pre_run.state, TaskState::PreRun);
    assert!(high.check_can_preempt_other(&pre_run));

    // Nothing below HIGH preempts anything.
    assert!(!low_preempt.check_can_preempt_other(&low));
}

// ===== ReservationManager: new_task validation order =====

#[test]
fn test_new_task_valid_inputs() {
    let mut manager = manager();
    let result = manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &request("device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00"),
        Utc::now(),
    );
    assert!(result.success, "{}", result.info_string);
}

#[test]
fn test_new_task_empty_sender() {
    let mut manager = manager();
    let result = manager.new_task(
        Some(""),
        &json!("task1"),
        &json!("HIGH"),
        &request("device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00"),
        Utc::now(),
    );
    assert!(!result.success);
    assert!(result.info_string.starts_with("MALFORMED_REQUEST"));
}

#[test]
fn test_new_task_missing_sender() {
    let mut manager = manager();
    let result = manager.new_task(
        None,
        &json!("task1"),
        &json!("HIGH"),
        &request("device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00"),
        Utc::now(),
    );
    assert_eq!(result.info_string, "MISSING_AGENT_ID");
}

#[test]
fn test_new_task_task_id_shapes() {
    let mut manager = manager();
    let requests =
        request("device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00");

    let result = manager.new_task(
        Some("sender1"),
        &Value::Null,
        &json!("HIGH"),
        &requests,
        Utc::now(),
    );
    assert_eq!(result.info_string, "MISSING_TASK_ID");

    let result = manager.new_task(
        Some("sender1"),
        &json!(""),
        &json!("HIGH"),
        &requests,
        Utc::now(),
    );
    assert!(result.info_string.starts_with("MALFORMED_REQUEST"));

    let result = manager.new_task(
        Some("sender1"),
        &json!(1234),
        &json!("HIGH"),
        &requests,
        Utc::now(),
    );
    assert!(result.info_string.starts_with("MALFORMED_REQUEST"));
}

#[test]
fn test_new_task_empty_requests() {
    let mut manager = manager();
    let result = manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &json!([]),
        Utc::now(),
    );
    assert_eq!(result.info_string, "MALFORMED_REQUEST_EMPTY");
}

#[test]
fn test_new_task_priority_shapes() {
    let mut manager = manager();
    let requests =
        request("device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00");

    let result = manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &Value::Null,
        &requests,
        Utc::now(),
    );
    assert_eq!(result.info_string, "MISSING_PRIORITY");

    // Scenario: MEDIUM is not a priority.
    let result = manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("MEDIUM"),
        &requests,
        Utc::now(),
    );
    assert!(!result.success);
    assert_eq!(result.info_string, "INVALID_PRIORITY");

    // Case-insensitive parse.
    let result = manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("low"),
        &requests,
        Utc::now(),
    );
    assert!(result.success);
}

#[test]
fn test_new_task_duplicate_task_id() {
    let mut manager = manager();
    let requests =
        request("device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00");
    let result = manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &requests,
        Utc::now(),
    );
    assert!(result.success);
    let result = manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &requests,
        Utc::now(),
    );
    assert_eq!(result.info_string, "TASK_ID_ALREADY_EXISTS");
}

// Scenario: two identical slices on the same device conflict with
// themselves.
#[test]
fn test_new_task_self_conflict() {
    let mut manager = manager();
    let result = manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &json!([
            ["device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00"],
            ["device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00"]
        ]),
        Utc::now(),
    );
    assert!(!result.success);
    assert_eq!(result.info_string, "REQUEST_CONFLICTS_WITH_SELF");
}

// Touching at endpoints is allowed, within a request and across tasks.
#[test]
fn test_touching_slices_are_accepted() {
    let mut manager = manager();
    let result = manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("LOW"),
        &json!([
            ["device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00"],
            ["device1", "2022-01-01T01:00:00", "2022-01-01T02:00:00"]
        ]),
        Utc::now(),
    );
    assert!(result.success, "{}", result.info_string);
    let result = manager.new_task(
        Some("sender2"),
        &json!("task2"),
        &json!("LOW"),
        &request("device1", "2022-01-01T02:00:00", "2022-01-01T03:00:00"),
        Utc::now(),
    );
    assert!(result.success, "{}", result.info_string);
}

#[test]
fn test_conflict_with_existing_low_priority_request() {
    let mut manager = manager();
    let requests =
        request("device1", "2022-01-01T00:00:00", "2022-01-01T01:00:00");
    assert!(
        manager
            .new_task(
                Some("sender1"),
                &json!("task1"),
                &json!("LOW"),
                &requests,
                Utc::now(),
            )
            .success
    );
    // A second LOW task on the same slice cannot preempt.
    let result = manager.new_task(
        Some("sender2"),
        &json!("task2"),
        &json!("LOW"),
        &requests,
        Utc::now(),
    );
    assert!(!result.success);
    assert_eq!(result.info_string, "CONFLICTS_WITH_EXISTING_RESERVATIONS");
}

// Scenario: HIGH preempts a running LOW_PREEMPT holder; the preempted
// task keeps its grace window.
#[test]
fn test_preemption_with_grace() {
    let now = Utc::now();
    let start = now - TimeDelta::minutes(5);
    let end = now + TimeDelta::hours(1);
    let requests = json!([[
        "device1",
        start.to_rfc3339(),
        end.to_rfc3339()
    ]]);

    let mut manager = manager();
    let result = manager.new_task(
        Some("agent1"),
        &json!("t1"),
        &json!("LOW_PREEMPT"),
        &requests,
        now,
    );
    assert!(result.success, "{}", result.info_string);

    let result = manager.new_task(
        Some("agent2"),
        &json!("t2"),
        &json!("HIGH"),
        &requests,
        now,
    );
    assert!(result.success, "{}", result.info_string);
    assert_eq!(result.info_string, "TASKS_WERE_PREEMPTED");

    let preempted = &manager.tasks["t1"];
    assert_eq!(preempted.state, TaskState::Preempted);
    assert_eq!(
        preempted.time_slice.end,
        Some(now + TimeDelta::seconds(10))
    );
    assert!(manager.preempted_tasks.contains("t1"));
}

// After any accepted sequence, held slices on one device never overlap.
#[test]
fn test_no_overlap_invariant() {
    let now = Utc::now();
    let mut manager = manager();
    let slices = [
        ("a1", "t1", "LOW", 0i64, 60),
        ("a2", "t2", "LOW", 60, 120),
        ("a3", "t3", "LOW", 30, 90),
        ("a4", "t4", "HIGH", 45, 75),
        ("a5", "t5", "LOW", 120, 180),
    ];
    for (sender, task_id, priority, start_min, end_min) in slices {
        let requests = json!([[
            "device1",
            (now + TimeDelta::minutes(start_min)).to_rfc3339(),
            (now + TimeDelta::minutes(end_min)).to_rfc3339()
        ]]);
        manager.new_task(
            Some(sender),
            &json!(task_id),
            &json!(priority),
            &requests,
            now,
        );
    }
    let mut slots: Vec<TimeSlice> = manager
        .tasks
        .values()
        .filter(|task| task.state != TaskState::Finished)
        .filter_map(|task| task.devices.get("device1"))
        .flat_map(|reservation| reservation.time_slots.iter().copied())
        .collect();
    slots.sort_by_key(|slot| slot.start);
    for pair in slots.windows(2) {
        assert!(
            !pair[0].overlaps(&pair[1]),
            "overlapping slots: {pair:?}"
        );
    }
}

// ===== ReservationManager: cancel / update / state =====

#[test]
fn test_cancel_task_errors() {
    let mut manager = manager();
    let result = manager.cancel_task("sender1", "missing");
    assert_eq!(result.info_string, "TASK_ID_DOES_NOT_EXIST");

    manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &request("device1", "2030-01-01T00:00:00", "2030-01-01T01:00:00"),
        Utc::now(),
    );
    let result = manager.cancel_task("other", "task1");
    assert_eq!(result.info_string, "AGENT_ID_TASK_ID_MISMATCH");
    let result = manager.cancel_task("sender1", "task1");
    assert!(result.success);
    assert!(manager.tasks.is_empty());
}

#[test]
fn test_update_garbage_collects_finished_tasks() {
    let now = Utc::now();
    let mut manager = manager();
    manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &json!([[
            "device1",
            (now - TimeDelta::hours(2)).to_rfc3339(),
            (now - TimeDelta::hours(1)).to_rfc3339()
        ]]),
        now - TimeDelta::hours(2),
    );
    assert_eq!(manager.tasks.len(), 1);
    let next = manager.update(now);
    assert!(manager.tasks.is_empty());
    // With no tasks, the next update is the publish interval.
    assert_eq!(next, now + TimeDelta::seconds(60));
}

#[test]
fn test_update_wakes_for_next_event() {
    let now = Utc::now();
    let mut manager = manager();
    manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &json!([[
            "device1",
            (now + TimeDelta::seconds(30)).to_rfc3339(),
            (now + TimeDelta::hours(1)).to_rfc3339()
        ]]),
        now,
    );
    let next = manager.update(now);
    assert_eq!(next, now + TimeDelta::seconds(30));
}

#[test]
fn test_get_reservation_state() {
    let now = Utc::now();
    let mut manager = manager();
    manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &json!([[
            "device1",
            (now - TimeDelta::minutes(1)).to_rfc3339(),
            (now + TimeDelta::minutes(1)).to_rfc3339()
        ]]),
        now,
    );
    manager.update(now);
    let state = manager.get_reservation_state(now);
    let holder = &state["device1"];
    assert_eq!(holder.agent_id, "sender1");
    assert_eq!(holder.task_id, "task1");
    assert!(holder.time_remaining > 0.0 && holder.time_remaining <= 60.0);

    assert_eq!(
        manager.holder_of("device1", now).map(|(agent, _)| agent),
        Some("sender1")
    );
    assert!(manager.holder_of("device2", now).is_none());
}

// ===== persistence =====

#[test]
fn test_state_survives_reload() {
    let path = std::env::temp_dir().join(format!(
        "drover-reservations-{}.json",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let db = pickledb::PickleDb::new(
        &path,
        pickledb::PickleDbDumpPolicy::AutoDump,
        pickledb::SerializationMethod::Json,
    );
    let db: drover_utils::Database =
        std::sync::Arc::new(std::sync::Mutex::new(db));

    let now = Utc::now();
    let mut manager = ReservationManager::new(
        GRACE,
        Duration::from_secs(60),
        Some(db.clone()),
    );
    manager.new_task(
        Some("sender1"),
        &json!("task1"),
        &json!("HIGH"),
        &json!([[
            "device1",
            now.to_rfc3339(),
            (now + TimeDelta::hours(1)).to_rfc3339()
        ]]),
        now,
    );

    let mut restored =
        ReservationManager::new(GRACE, Duration::from_secs(60), Some(db));
    restored.load_state(now);
    assert!(restored.tasks.contains_key("task1"));
    assert_eq!(restored.tasks["task1"].agent_id, "sender1");

    let _ = std::fs::remove_file(&path);
}
