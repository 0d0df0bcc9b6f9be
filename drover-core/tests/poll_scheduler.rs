//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{Map, Value, json};

use drover_core::config::{
    AgentConfig, EquipmentConfig, ResolvedGroupConfig, SchedulerKind,
};
use drover_core::equipment::{EquipmentTree, TreeDefaults};
use drover_core::events::InternalSender;
use drover_core::poll::{
    self, PollGenerator, PollScheduler, PollSetTable,
    StaticCyclicPollScheduler, find_starting_datetime,
};

fn group_config(minimum: f64, parallel: bool) -> ResolvedGroupConfig {
    ResolvedGroupConfig {
        minimum_polling_interval: Duration::from_secs_f64(minimum),
        start_offset: Duration::ZERO,
        parallel_subgroups: parallel,
        scheduler: SchedulerKind::StaticCyclic,
    }
}

fn internal_tx() -> InternalSender {
    tokio::sync::mpsc::unbounded_channel().0
}

fn row(name: &str, interval: f64) -> Value {
    json!({
        "Volttron Point Name": name,
        "Writable": true,
        "Starting Value": "0",
        "Type": "float",
        "polling_interval": interval
    })
}

// One fake device per remote, points at the given intervals.
fn tree_with_remotes(
    remotes: &[(&str, &[(&str, f64)])],
) -> (EquipmentTree, PollSetTable) {
    let mut tree = EquipmentTree::new(TreeDefaults::from(&AgentConfig::default()));
    for (device, points) in remotes {
        let rows: Vec<Map<String, Value>> = points
            .iter()
            .map(|(name, interval)| {
                row(name, *interval).as_object().unwrap().clone()
            })
            .collect();
        let config =
            EquipmentConfig::load(&json!({ "driver_type": "fake" })).unwrap();
        tree.add_device(
            &format!("devices/{device}"),
            config,
            rows,
            &format!("remote_{device}"),
        )
        .unwrap();
    }
    let table = poll::build_poll_sets(&tree);
    (tree, table)
}

// ===== hyperperiod math =====

#[test]
fn test_separate_coprimes() {
    let result = StaticCyclicPollScheduler::separate_coprimes(&[4, 6, 9, 25]);
    assert_eq!(result, vec![vec![25], vec![9, 6], vec![4]]);
}

// The union of the partition equals the input, and within a subset no two
// distinct elements are coprime.
#[test]
fn test_separate_coprimes_properties() {
    let intervals = [2, 3, 5, 10, 15, 30, 7, 49, 13];
    let partition = StaticCyclicPollScheduler::separate_coprimes(&intervals);
    let mut union: Vec<u64> = partition.iter().flatten().copied().collect();
    union.sort_unstable();
    let mut expected = intervals.to_vec();
    expected.sort_unstable();
    assert_eq!(union, expected);

    fn gcd(a: u64, b: u64) -> u64 {
        if b == 0 { a } else { gcd(b, a % b) }
    }
    for subset in &partition {
        for (i, &a) in subset.iter().enumerate() {
            for &b in &subset[i + 1..] {
                assert!(
                    gcd(a, b) != 1 || a == 1 || b == 1,
                    "coprime pair {a}/{b} within {subset:?}"
                );
            }
        }
    }
}

#[test]
fn test_calculate_hyperperiod() {
    let intervals = [
        Duration::from_secs(10),
        Duration::from_secs(15),
        Duration::from_secs(20),
    ];
    let result = StaticCyclicPollScheduler::calculate_hyperperiod(
        &intervals,
        Duration::from_secs(5),
    );
    // LCM of 2, 3, 4 times 5.
    assert_eq!(result, Duration::from_secs(60));
}

#[test]
fn test_hyperperiod_divides_all_intervals() {
    let intervals = [
        Duration::from_secs(4),
        Duration::from_secs(6),
        Duration::from_secs(10),
    ];
    let hyperperiod = StaticCyclicPollScheduler::calculate_hyperperiod(
        &intervals,
        Duration::from_secs(2),
    );
    for interval in intervals {
        assert_eq!(hyperperiod.as_secs() % interval.as_secs(), 0);
    }
}

// ===== starting datetime =====

#[test]
fn test_find_starting_datetime_unaligned() {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 20, 0).unwrap();
    let start = find_starting_datetime(
        now,
        Duration::from_secs(3600),
        Duration::from_secs(900),
    );
    // Next whole hour past midnight, plus the 15 minute group delay.
    assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 1, 11, 15, 0).unwrap());
}

#[test]
fn test_find_starting_datetime_aligned() {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let start =
        find_starting_datetime(now, Duration::from_secs(3600), Duration::ZERO);
    assert_eq!(start, now);
}

// ===== poll generator =====

#[test]
fn test_poll_generator_wraps_hyperperiods() {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let hyperperiod = Duration::from_secs(50);
    let slots = vec![
        Duration::ZERO,
        Duration::from_secs(5),
        Duration::from_secs(10),
    ];
    let mut generator = PollGenerator::new(base, hyperperiod, slots.clone());
    for cycle in 0..3 {
        for &slot in &slots {
            let expected =
                base + chrono::TimeDelta::seconds(cycle * 50)
                    + chrono::TimeDelta::from_std(slot).unwrap();
            assert_eq!(generator.peek_time(), expected);
            let (time, offset) = generator.next_slot();
            assert_eq!(time, expected);
            assert_eq!(offset, slot);
        }
    }
}

// ===== poll-set table =====

#[test]
fn test_build_poll_sets_groups_by_remote_and_interval() {
    let (_tree, table) = tree_with_remotes(&[
        ("d1", &[("p1", 5.0), ("p2", 10.0)]),
        ("d2", &[("p3", 5.0)]),
    ]);
    let group = &table["default"];
    assert_eq!(group.len(), 2);
    let d1 = &group["remote_d1"];
    assert_eq!(d1.len(), 2);
    assert_eq!(d1[&Duration::from_secs(5)].points.len(), 1);
    assert!(
        d1[&Duration::from_secs(5)]
            .points
            .contains_key("devices/d1/p1")
    );
}

#[test]
fn test_inactive_points_are_not_scheduled() {
    let (mut tree, _) = tree_with_remotes(&[("d1", &[("p1", 5.0)])]);
    let point = tree.get_node("devices/d1/p1").unwrap();
    tree.set_active(point, false);
    let table = poll::build_poll_sets(&tree);
    assert!(table.is_empty());
}

#[test]
fn test_add_to_schedule_reschedule_triggers() {
    let (mut tree, mut table) = tree_with_remotes(&[("d1", &[("p1", 5.0)])]);

    // Same remote, same interval: slots into the existing poll set.
    let config = EquipmentConfig::load(&json!({ "driver_type": "fake" }))
        .unwrap();
    tree.add_device(
        "devices/d1",
        config,
        vec![row("p2", 5.0).as_object().unwrap().clone()],
        "remote_d1",
    )
    .unwrap();
    let p2 = tree.get_node("devices/d1/p2").unwrap();
    assert!(!poll::add_to_schedule(&mut table, &tree, p2));
    assert_eq!(
        table["default"]["remote_d1"][&Duration::from_secs(5)].points.len(),
        2
    );

    // A new interval requires a rebuild.
    let config = EquipmentConfig::load(&json!({ "driver_type": "fake" }))
        .unwrap();
    tree.add_device(
        "devices/d1",
        config,
        vec![row("p3", 7.0).as_object().unwrap().clone()],
        "remote_d1",
    )
    .unwrap();
    let p3 = tree.get_node("devices/d1/p3").unwrap();
    assert!(poll::add_to_schedule(&mut table, &tree, p3));

    // A new remote requires a rebuild.
    let config = EquipmentConfig::load(&json!({ "driver_type": "fake" }))
        .unwrap();
    tree.add_device(
        "devices/d2",
        config,
        vec![row("p4", 5.0).as_object().unwrap().clone()],
        "remote_d2",
    )
    .unwrap();
    let p4 = tree.get_node("devices/d2/p4").unwrap();
    assert!(poll::add_to_schedule(&mut table, &tree, p4));

    // A new group requires a rebuild.
    let config = EquipmentConfig::load(
        &json!({ "driver_type": "fake", "group": "east" }),
    )
    .unwrap();
    tree.add_device(
        "devices/d3",
        config,
        vec![row("p5", 5.0).as_object().unwrap().clone()],
        "remote_d3",
    )
    .unwrap();
    let p5 = tree.get_node("devices/d3/p5").unwrap();
    assert!(poll::add_to_schedule(&mut table, &tree, p5));
}

#[test]
fn test_remove_from_schedule_prunes_empty_levels() {
    let (tree, mut table) = tree_with_remotes(&[("d1", &[("p1", 5.0)])]);
    let p1 = tree.get_node("devices/d1/p1").unwrap();
    assert!(poll::remove_from_schedule(&mut table, &tree, p1));
    // Poll set, interval, remote and group all pruned.
    assert!(table.is_empty());
    // Removing again reports failure.
    assert!(!poll::remove_from_schedule(&mut table, &tree, p1));
}

// ===== cyclic scheduler =====

// Scenario: intervals {5, 10} with a 1-second grid give a 10-second
// hyperperiod; the 5-second interval polls at offsets 0 and 5, the
// 10-second interval once at offset 0.
#[test]
fn test_slot_plan_for_5_and_10_second_intervals() {
    let (_tree, table) = tree_with_remotes(&[
        ("d1", &[("p1", 5.0)]),
        ("d2", &[("p2", 10.0)]),
    ]);
    let mut scheduler =
        StaticCyclicPollScheduler::new("default", group_config(1.0, false));
    scheduler.schedule(&table, &internal_tx(), Utc::now());

    let schedule = scheduler.get_schedule(&table);
    let hyperperiods = schedule.as_object().unwrap();
    assert_eq!(hyperperiods.len(), 1);
    let slots = hyperperiods["0:00:10"].as_object().unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots["0:00:00"]["remote_d1"], json!(["p1"]));
    assert_eq!(slots["0:00:00"]["remote_d2"], json!(["p2"]));
    assert_eq!(slots["0:00:05"]["remote_d1"], json!(["p1"]));
    assert!(slots["0:00:05"].get("remote_d2").is_none());
}

// Slot count per interval is hyperperiod / interval.
#[test]
fn test_slot_counts() {
    let (_tree, table) = tree_with_remotes(&[(
        "d1",
        &[("p1", 4.0), ("p2", 6.0), ("p3", 12.0)],
    )]);
    let mut scheduler =
        StaticCyclicPollScheduler::new("default", group_config(2.0, false));
    scheduler.schedule(&table, &internal_tx(), Utc::now());

    let schedule = scheduler.get_schedule(&table);
    let slots = schedule["0:00:12"].as_object().unwrap();
    let count = |name: &str| {
        slots
            .values()
            .filter(|remotes| {
                remotes["remote_d1"]
                    .as_array()
                    .is_some_and(|points| points.contains(&json!(name)))
            })
            .count()
    };
    assert_eq!(count("p1"), 3);
    assert_eq!(count("p2"), 2);
    assert_eq!(count("p3"), 1);
}

#[test]
fn test_coprime_intervals_produce_separate_hyperperiods() {
    let (_tree, table) = tree_with_remotes(&[(
        "d1",
        &[("p1", 4.0), ("p2", 9.0)],
    )]);
    let mut scheduler =
        StaticCyclicPollScheduler::new("default", group_config(1.0, false));
    scheduler.schedule(&table, &internal_tx(), Utc::now());

    let schedule = scheduler.get_schedule(&table);
    let hyperperiods = schedule.as_object().unwrap();
    assert_eq!(hyperperiods.len(), 2);
    assert!(hyperperiods.contains_key("0:00:04"));
    assert!(hyperperiods.contains_key("0:00:09"));
}

// Parallel subgroups shift each remote's slots by its index times the
// minimum polling interval.
#[test]
fn test_parallel_subgroups_offset_remotes() {
    let (_tree, table) = tree_with_remotes(&[
        ("d1", &[("p1", 10.0)]),
        ("d2", &[("p2", 10.0)]),
    ]);
    let mut scheduler =
        StaticCyclicPollScheduler::new("default", group_config(1.0, true));
    scheduler.schedule(&table, &internal_tx(), Utc::now());

    let schedule = scheduler.get_schedule(&table);
    let slots = schedule["0:00:10"].as_object().unwrap();
    assert_eq!(slots["0:00:00"]["remote_d1"], json!(["p1"]));
    assert_eq!(slots["0:00:01"]["remote_d2"], json!(["p2"]));
}

#[test]
fn test_operate_polling_returns_due_sets_and_rearms() {
    let (_tree, table) = tree_with_remotes(&[("d1", &[("p1", 5.0)])]);
    let mut scheduler =
        StaticCyclicPollScheduler::new("default", group_config(1.0, false));
    let now = Utc::now();
    scheduler.schedule(&table, &internal_tx(), now);

    let hyperperiod = Duration::from_secs(5);
    let keys =
        scheduler.operate_polling(hyperperiod, &internal_tx(), Utc::now());
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].remote_id, "remote_d1");
    assert_eq!(keys[0].interval, hyperperiod);

    // A host that slept through several slots executes only the most
    // recent passed slot and keeps the chain aligned.
    let keys = scheduler.operate_polling(
        hyperperiod,
        &internal_tx(),
        Utc::now() + chrono::TimeDelta::seconds(17),
    );
    assert_eq!(keys.len(), 1);
}

#[test]
fn test_empty_group_produces_empty_schedule() {
    let table = PollSetTable::new();
    let mut scheduler =
        StaticCyclicPollScheduler::new("default", group_config(1.0, false));
    scheduler.schedule(&table, &internal_tx(), Utc::now());
    assert_eq!(scheduler.get_schedule(&table), json!({}));
}

// ===== scheduler selection =====

#[test]
fn test_create_poll_schedulers_per_group() {
    let (_tree, mut table) = tree_with_remotes(&[("d1", &[("p1", 5.0)])]);
    // Fabricate a second group entry.
    let moved = table["default"].clone();
    table.insert("east".to_owned(), moved);

    let config = AgentConfig::default();
    let schedulers = poll::create_poll_schedulers(&table, &config);
    assert_eq!(schedulers.len(), 2);
    assert!(schedulers.contains_key("default"));
    assert!(schedulers.contains_key("east"));
}

#[test]
fn test_group_config_resolution() {
    let config = AgentConfig::load(&json!({
        "group_offset_interval": 2.0,
        "poll_scheduler_configs": {
            "east": { "parallel_subgroups": true, "start_offset": 0.5 }
        }
    }))
    .unwrap();

    let east = config.group_config("east", 3);
    assert!(east.parallel_subgroups);
    assert_eq!(east.start_offset, Duration::from_secs_f64(0.5));

    // Groups without overrides stagger by index.
    let west = config.group_config("west", 3);
    assert!(!west.parallel_subgroups);
    assert_eq!(west.start_offset, Duration::from_secs(6));
    assert_eq!(west.scheduler, SchedulerKind::StaticCyclic);
}

#[test]
fn test_scheduler_kind_parse() {
    assert_eq!(
        SchedulerKind::from_class_name("SerialPollScheduler"),
        SchedulerKind::Serial
    );
    // Unknown names fall back to the cyclic variant.
    assert_eq!(
        SchedulerKind::from_class_name("FancyScheduler"),
        SchedulerKind::StaticCyclic
    );
}
