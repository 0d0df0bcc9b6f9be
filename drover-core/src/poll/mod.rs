//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Poll scheduling: cyclic plans that sample every active point at its
//! configured interval.
//!
//! Points are grouped by group id, then by remote, then by polling
//! interval; each group gets its own scheduler instance over a shared
//! poll-set table. Schedulers compute slot plans and arm one-shot timers;
//! the agent event loop owns the table and dispatches the polls.

pub mod cyclic;
pub mod serial;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub use crate::poll::cyclic::StaticCyclicPollScheduler;
pub use crate::poll::serial::SerialPollScheduler;

use crate::config::{AgentConfig, SchedulerKind};
use crate::equipment::{EquipmentTree, NodeIndex};
use crate::events::InternalSender;

/// Per-slot publication plan: which bus layouts receive the points polled
/// in the slot.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct PublishSetup {
    /// Point-depth topics published individually.
    pub single_depth: BTreeSet<String>,
    /// `(point depth, point breadth)` pairs for breadth-first singles.
    pub single_breadth: BTreeSet<(String, String)>,
    /// Device-depth topic -> point-depth topics.
    pub multi_depth: BTreeMap<String, BTreeSet<String>>,
    /// Device-breadth topic -> point names.
    pub multi_breadth: BTreeMap<String, BTreeSet<String>>,
}

/// The points one remote polls at one interval, plus their precomputed
/// publication plan.
#[derive(Clone, Debug, Default)]
pub struct PollSet {
    pub remote_id: String,
    /// Point handles keyed by topic. Handles are checked at poll time, so
    /// a removed node is skipped rather than pinned.
    pub points: BTreeMap<String, NodeIndex>,
    pub publish_setup: PublishSetup,
}

/// Identifies one poll set in the shared table: `(remote, interval)`
/// within the scheduler's group.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PollSetKey {
    pub remote_id: String,
    pub interval: Duration,
}

/// The shared poll-set table: group -> remote -> interval -> poll set.
pub type PollSetTable =
    HashMap<String, HashMap<String, BTreeMap<Duration, PollSet>>>;

/// Scheduler contract shared by the cyclic and serial variants.
pub trait PollScheduler: Send + std::fmt::Debug {
    fn group(&self) -> &str;

    /// Wall-clock instant after which every point of the group has seen
    /// its first poll.
    fn start_all_datetime(&self) -> DateTime<Utc>;

    /// Full recompute: cancels existing timers, rebuilds the slot plans
    /// from the table and arms fresh timers.
    fn schedule(
        &mut self,
        table: &PollSetTable,
        internal_tx: &InternalSender,
        now: DateTime<Utc>,
    );

    /// Handles a hyperperiod timer fire: advances past slots the host
    /// slept through, re-arms the next one-shot and returns the poll sets
    /// due now.
    fn operate_polling(
        &mut self,
        hyperperiod: Duration,
        internal_tx: &InternalSender,
        now: DateTime<Utc>,
    ) -> Vec<PollSetKey>;

    /// Signals that a dispatched poll finished. The serial variant hands
    /// back the next poll set of its sequence here; the cyclic variant
    /// has nothing to add.
    fn poll_finished(
        &mut self,
        remote_id: &str,
        internal_tx: &InternalSender,
        now: DateTime<Utc>,
    ) -> Vec<PollSetKey>;

    /// Human-readable rendering of the slot plans for diagnostics.
    fn get_schedule(&self, table: &PollSetTable) -> Value;
}

// ===== impl PublishSetup =====

impl PublishSetup {
    /// Publication plan for a set of points.
    pub fn build(tree: &EquipmentTree, points: &[NodeIndex]) -> PublishSetup {
        let mut setup = PublishSetup::default();
        for &point in points {
            setup.add_point(tree, point);
        }
        setup
    }

    pub fn add_point(&mut self, tree: &EquipmentTree, point: NodeIndex) {
        let Some((point_depth, point_breadth)) = tree.get_point_topics(point)
        else {
            return;
        };
        let Some((device_depth, device_breadth)) =
            tree.get_device_topics(point)
        else {
            return;
        };
        if tree.is_published_single_depth(point) {
            self.single_depth.insert(point_depth.clone());
        }
        if tree.is_published_single_breadth(point) {
            self.single_breadth
                .insert((point_depth.clone(), point_breadth));
        }
        if tree.is_published_multi_depth(point) {
            self.multi_depth.entry(device_depth).or_default().insert(
                point_depth,
            );
        }
        if tree.is_published_multi_breadth(point)
            && let Some(node) = tree.node(point)
        {
            self.multi_breadth
                .entry(device_breadth)
                .or_default()
                .insert(node.tag.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.single_depth.is_empty()
            && self.single_breadth.is_empty()
            && self.multi_depth.is_empty()
            && self.multi_breadth.is_empty()
    }
}

// ===== impl PollSet =====

impl PollSet {
    pub fn new(remote_id: &str) -> PollSet {
        PollSet {
            remote_id: remote_id.to_owned(),
            ..Default::default()
        }
    }

    /// Adds a point, updating the publication plan incrementally.
    pub fn add(&mut self, tree: &EquipmentTree, point: NodeIndex) {
        let Some(node) = tree.node(point) else {
            return;
        };
        self.points.insert(node.topic.clone(), point);
        self.publish_setup.add_point(tree, point);
    }

    /// Removes a point by topic, rebuilding the publication plan from the
    /// survivors. Returns whether the point was present.
    pub fn remove(&mut self, tree: &EquipmentTree, point_topic: &str) -> bool {
        let removed = self.points.remove(point_topic).is_some();
        if removed {
            let survivors: Vec<NodeIndex> =
                self.points.values().copied().collect();
            self.publish_setup = PublishSetup::build(tree, &survivors);
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// ===== poll-set table maintenance =====

/// Builds the full poll-set table from the active points of the tree.
pub fn build_poll_sets(tree: &EquipmentTree) -> PollSetTable {
    let mut table = PollSetTable::new();
    for point in tree.points(None) {
        if !tree.is_active(point) {
            continue;
        }
        let Some(remote_id) = tree.remote_id(point).map(str::to_owned) else {
            continue;
        };
        let group = tree.group(point);
        let interval = tree.polling_interval(point);
        table
            .entry(group)
            .or_default()
            .entry(remote_id.clone())
            .or_default()
            .entry(interval)
            .or_insert_with(|| PollSet::new(&remote_id))
            .add(tree, point);
    }
    table
}

/// Adds one point to the table. Returns true when the point introduces a
/// group, remote or interval not present yet, in which case the caller
/// must rebuild the schedule.
pub fn add_to_schedule(
    table: &mut PollSetTable,
    tree: &EquipmentTree,
    point: NodeIndex,
) -> bool {
    let Some(remote_id) = tree.remote_id(point).map(str::to_owned) else {
        return false;
    };
    let group = tree.group(point);
    let interval = tree.polling_interval(point);
    let existing = table
        .get_mut(&group)
        .and_then(|remotes| remotes.get_mut(&remote_id))
        .and_then(|intervals| intervals.get_mut(&interval));
    match existing {
        Some(poll_set) => {
            poll_set.add(tree, point);
            false
        }
        None => {
            table
                .entry(group)
                .or_default()
                .entry(remote_id.clone())
                .or_default()
                .entry(interval)
                .or_insert_with(|| PollSet::new(&remote_id))
                .add(tree, point);
            true
        }
    }
}

/// Removes one point from its poll set and prunes empty table entries.
pub fn remove_from_schedule(
    table: &mut PollSetTable,
    tree: &EquipmentTree,
    point: NodeIndex,
) -> bool {
    let Some(node) = tree.node(point) else {
        return false;
    };
    let Some(remote_id) = tree.remote_id(point).map(str::to_owned) else {
        return false;
    };
    let group = tree.group(point);
    let interval = tree.polling_interval(point);
    let point_topic = node.topic.clone();
    let success = table
        .get_mut(&group)
        .and_then(|remotes| remotes.get_mut(&remote_id))
        .and_then(|intervals| intervals.get_mut(&interval))
        .is_some_and(|poll_set| poll_set.remove(tree, &point_topic));
    prune_poll_sets(table, &group, &remote_id, interval);
    success
}

// Prunes empty poll sets, intervals, remotes and groups after a removal.
fn prune_poll_sets(
    table: &mut PollSetTable,
    group: &str,
    remote_id: &str,
    interval: Duration,
) {
    let Some(remotes) = table.get_mut(group) else {
        return;
    };
    if let Some(intervals) = remotes.get_mut(remote_id) {
        if intervals
            .get(&interval)
            .is_some_and(|poll_set| poll_set.is_empty())
        {
            intervals.remove(&interval);
        }
        if intervals.is_empty() {
            remotes.remove(remote_id);
        }
    }
    if remotes.is_empty() {
        table.remove(group);
        debug!(%group, "poll group emptied");
    }
}

// ===== scheduler creation =====

/// Creates one scheduler per group present in the table. Group indexes
/// (for the default stagger offsets) follow sorted group order.
pub fn create_poll_schedulers(
    table: &PollSetTable,
    config: &AgentConfig,
) -> BTreeMap<String, Box<dyn PollScheduler>> {
    let mut schedulers: BTreeMap<String, Box<dyn PollScheduler>> =
        BTreeMap::new();
    for (index, group) in table.keys().sorted().enumerate() {
        let resolved = config.group_config(group, index);
        let scheduler: Box<dyn PollScheduler> = match resolved.scheduler {
            SchedulerKind::StaticCyclic => {
                Box::new(StaticCyclicPollScheduler::new(group, resolved))
            }
            SchedulerKind::Serial => {
                Box::new(SerialPollScheduler::new(group, resolved))
            }
        };
        schedulers.insert(group.clone(), scheduler);
    }
    schedulers
}

// ===== slot timing =====

/// First start time for a hyperperiod: `now` if it is aligned to the
/// hyperperiod past midnight, else the next such alignment, plus the
/// group's stagger delay.
pub fn find_starting_datetime(
    now: DateTime<Utc>,
    interval: Duration,
    group_delay: Duration,
) -> DateTime<Utc> {
    let delay = to_delta(group_delay);
    let interval_nanos = interval.as_nanos().max(1) as i64;
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc();
    let since_midnight = (now - midnight)
        .num_nanoseconds()
        .unwrap_or_default();
    let offset = since_midnight % interval_nanos;
    if offset == 0 {
        return now + delay;
    }
    let next_from_midnight = since_midnight - offset + interval_nanos;
    midnight + TimeDelta::nanoseconds(next_from_midnight) + delay
}

/// Infinite slot sequence of one hyperperiod: yields `(absolute time,
/// slot offset)` in order, shifting its base by the hyperperiod at the end
/// of each cycle.
#[derive(Debug)]
pub struct PollGenerator {
    base: DateTime<Utc>,
    hyperperiod: Duration,
    slots: Vec<Duration>,
    position: usize,
}

// ===== impl PollGenerator =====

impl PollGenerator {
    /// `slots` must be non-empty and sorted.
    pub fn new(
        start: DateTime<Utc>,
        hyperperiod: Duration,
        slots: Vec<Duration>,
    ) -> PollGenerator {
        debug_assert!(!slots.is_empty());
        PollGenerator {
            base: start,
            hyperperiod,
            slots,
            position: 0,
        }
    }

    /// Absolute time of the next slot without consuming it.
    pub fn peek_time(&self) -> DateTime<Utc> {
        self.base + to_delta(self.slots[self.position])
    }

    /// Consumes and returns the next `(time, slot)` pair.
    pub fn next_slot(&mut self) -> (DateTime<Utc>, Duration) {
        let slot = self.slots[self.position];
        let time = self.base + to_delta(slot);
        self.position += 1;
        if self.position == self.slots.len() {
            self.position = 0;
            self.base += to_delta(self.hyperperiod);
        }
        (time, slot)
    }
}

// ===== global functions =====

pub(crate) fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::zero())
}

/// Renders a duration the way slot plans are keyed in diagnostics
/// (`h:mm:ss`).
pub(crate) fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
