//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The static cyclic poll scheduler.
//!
//! Distinct polling intervals are partitioned into sets with pairwise
//! common factors; each set gets a hyperperiod (the LCM of its intervals
//! on the minimum-interval grid) within which every interval contributes
//! equally spaced slots. One one-shot timer per hyperperiod drives the
//! slot sequence forever.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde_json::{Map, Value, json};
use tracing::info;

use drover_utils::task::TimeoutTask;
use drover_utils::topic;

use crate::config::ResolvedGroupConfig;
use crate::events::InternalSender;
use crate::poll::{
    PollGenerator, PollScheduler, PollSet, PollSetKey, PollSetTable,
    find_starting_datetime, format_duration, to_delta,
};
use crate::tasks;

// Worst-case time for the first poll of every point to complete; the
// first all-publish waits this long past the last chain start.
pub(crate) const FIRST_POLL_TIMEOUT: Duration = Duration::from_secs(30);

type SlotPlans = HashMap<Duration, BTreeMap<Duration, Vec<PollSetKey>>>;

#[derive(Debug)]
pub struct StaticCyclicPollScheduler {
    group: String,
    config: ResolvedGroupConfig,
    /// hyperperiod -> slot offset -> poll sets due at the slot.
    slot_plans: SlotPlans,
    generators: HashMap<Duration, PollGenerator>,
    pollers: HashMap<Duration, TimeoutTask>,
    start_all_datetime: DateTime<Utc>,
}

// ===== impl StaticCyclicPollScheduler =====

impl StaticCyclicPollScheduler {
    pub fn new(
        group: &str,
        config: ResolvedGroupConfig,
    ) -> StaticCyclicPollScheduler {
        StaticCyclicPollScheduler {
            group: group.to_owned(),
            config,
            slot_plans: SlotPlans::new(),
            generators: HashMap::new(),
            pollers: HashMap::new(),
            start_all_datetime: Utc::now(),
        }
    }

    /// An interval expressed in whole steps of the scheduling grid.
    pub fn grid_units(interval: Duration, minimum: Duration) -> u64 {
        let minimum = minimum.as_nanos().max(1);
        (interval.as_nanos() / minimum).max(1) as u64
    }

    /// Partitions intervals (in grid units) into subsets such that within
    /// a subset no pair is coprime. The largest not-yet-placed interval
    /// seeds each subset and pulls in every remaining interval sharing a
    /// common factor with it.
    pub fn separate_coprimes(intervals: &[u64]) -> Vec<Vec<u64>> {
        let mut separated = vec![];
        let mut unseparated: Vec<u64> = intervals.to_vec();
        unseparated.sort_unstable_by(|a, b| b.cmp(a));
        while let Some(first) = unseparated.first().copied() {
            let mut non_coprime = vec![first];
            let mut coprime = vec![];
            for &i in &unseparated[1..] {
                if gcd(first, i) == 1 && first != 1 && i != 1 {
                    coprime.push(i);
                } else {
                    non_coprime.push(i);
                }
            }
            separated.push(non_coprime);
            unseparated = coprime;
        }
        separated
    }

    /// Hyperperiod of a set of intervals on the given grid:
    /// `LCM(interval / minimum) * minimum`.
    pub fn calculate_hyperperiod(
        intervals: &[Duration],
        minimum: Duration,
    ) -> Duration {
        let minimum_nanos = minimum.as_nanos().max(1);
        let units = intervals
            .iter()
            .map(|&interval| Self::grid_units(interval, minimum))
            .fold(1u64, lcm);
        Duration::from_nanos((minimum_nanos as u64).saturating_mul(units))
    }

    // Computes the slot plan for the given remotes. With parallel
    // subgroups each remote's slots shift by its index times the minimum
    // polling interval, keeping simultaneous polls off the wire.
    fn find_slots<'a>(
        &self,
        remotes: impl Iterator<Item = (&'a String, &'a BTreeMap<Duration, PollSet>)>,
        parallel_remote_index: usize,
    ) -> SlotPlans {
        let minimum = self.config.minimum_polling_interval;
        let parallel_offset = Duration::from_nanos(
            (minimum.as_nanos() as u64)
                .saturating_mul(parallel_remote_index as u64),
        );

        // Group remotes by interval, and intervals by grid unit.
        let mut interval_remotes: BTreeMap<Duration, Vec<String>> =
            BTreeMap::new();
        for (remote_id, intervals) in remotes {
            for &interval in intervals.keys() {
                interval_remotes
                    .entry(interval)
                    .or_default()
                    .push(remote_id.clone());
            }
        }
        let mut unit_intervals: BTreeMap<u64, Vec<Duration>> = BTreeMap::new();
        for &interval in interval_remotes.keys() {
            unit_intervals
                .entry(Self::grid_units(interval, minimum))
                .or_default()
                .push(interval);
        }

        let mut plans = SlotPlans::new();
        let units: Vec<u64> = unit_intervals.keys().copied().collect();
        for unit_set in Self::separate_coprimes(&units) {
            let hyper_units = unit_set.iter().copied().fold(1u64, lcm);
            let hyperperiod = Duration::from_nanos(
                (minimum.as_nanos() as u64).saturating_mul(hyper_units),
            );
            let plan = plans.entry(hyperperiod).or_default();
            for unit in unit_set {
                let slot_count = (hyper_units / unit).max(1);
                for &interval in &unit_intervals[&unit] {
                    for i in 0..slot_count {
                        let slot = Duration::from_nanos(
                            (hyperperiod.as_nanos() as u64 / slot_count)
                                .saturating_mul(i),
                        );
                        let keys =
                            plan.entry(slot + parallel_offset).or_default();
                        for remote_id in &interval_remotes[&interval] {
                            keys.push(PollSetKey {
                                remote_id: remote_id.clone(),
                                interval,
                            });
                        }
                    }
                }
            }
        }
        plans
    }

    fn prepare_to_schedule(&mut self, table: &PollSetTable) {
        self.slot_plans.clear();
        let Some(remotes) = table.get(&self.group) else {
            return;
        };
        let plans = if self.config.parallel_subgroups {
            let mut merged = SlotPlans::new();
            for (index, (remote_id, intervals)) in
                remotes.iter().sorted_by_key(|(id, _)| id.clone()).enumerate()
            {
                let plan = self
                    .find_slots(std::iter::once((remote_id, intervals)), index);
                merge_plans(&mut merged, plan);
            }
            merged
        } else {
            self.find_slots(remotes.iter(), 0)
        };
        self.slot_plans = plans;
    }

    // The serial variant reuses the cyclic plans but drives the timer
    // chains itself through these.
    pub(crate) fn armed_hyperperiods(&self) -> Vec<Duration> {
        self.pollers.keys().copied().collect()
    }

    pub(crate) fn idle_chains(
        &self,
        armed: &std::collections::HashSet<Duration>,
    ) -> Vec<(Duration, DateTime<Utc>)> {
        self.generators
            .iter()
            .filter(|(hyperperiod, _)| !armed.contains(hyperperiod))
            .map(|(&hyperperiod, generator)| (hyperperiod, generator.peek_time()))
            .collect()
    }

    pub(crate) fn disarm(&mut self, hyperperiod: Duration) {
        self.pollers.remove(&hyperperiod);
    }

    pub(crate) fn arm_with(&mut self, hyperperiod: Duration, timer: TimeoutTask) {
        self.pollers.insert(hyperperiod, timer);
    }

    fn schedule_polling(
        &mut self,
        internal_tx: &InternalSender,
        now: DateTime<Utc>,
    ) {
        self.pollers.clear();
        self.generators.clear();
        let mut last_start = now;
        for (&hyperperiod, slots) in &self.slot_plans {
            let initial_start = find_starting_datetime(
                now,
                hyperperiod,
                self.config.start_offset,
            );
            last_start = last_start.max(initial_start);
            let offsets: Vec<Duration> = slots.keys().copied().collect();
            let generator =
                PollGenerator::new(initial_start, hyperperiod, offsets);
            let first_fire = generator.peek_time();
            info!(
                group = %self.group,
                hyperperiod = %format_duration(hyperperiod),
                starts_at = %first_fire,
                "scheduled polling"
            );
            self.pollers.insert(
                hyperperiod,
                tasks::poll_timer(
                    &self.group,
                    hyperperiod,
                    first_fire,
                    internal_tx,
                ),
            );
            self.generators.insert(hyperperiod, generator);
        }
        self.start_all_datetime = last_start + to_delta(FIRST_POLL_TIMEOUT);
    }
}

impl PollScheduler for StaticCyclicPollScheduler {
    fn group(&self) -> &str {
        &self.group
    }

    fn start_all_datetime(&self) -> DateTime<Utc> {
        self.start_all_datetime
    }

    fn schedule(
        &mut self,
        table: &PollSetTable,
        internal_tx: &InternalSender,
        now: DateTime<Utc>,
    ) {
        self.prepare_to_schedule(table);
        self.schedule_polling(internal_tx, now);
    }

    fn operate_polling(
        &mut self,
        hyperperiod: Duration,
        internal_tx: &InternalSender,
        now: DateTime<Utc>,
    ) -> Vec<PollSetKey> {
        let Some(generator) = self.generators.get_mut(&hyperperiod) else {
            return vec![];
        };
        // The armed slot is due; if the host slept through further slots,
        // execute only the most recent passed one.
        let (_, mut current_slot) = generator.next_slot();
        while generator.peek_time() <= now {
            (_, current_slot) = generator.next_slot();
        }
        let next_fire = generator.peek_time();
        self.pollers.insert(
            hyperperiod,
            tasks::poll_timer(&self.group, hyperperiod, next_fire, internal_tx),
        );
        self.slot_plans
            .get(&hyperperiod)
            .and_then(|slots| slots.get(&current_slot))
            .cloned()
            .unwrap_or_default()
    }

    fn poll_finished(
        &mut self,
        _remote_id: &str,
        _internal_tx: &InternalSender,
        _now: DateTime<Utc>,
    ) -> Vec<PollSetKey> {
        // Cyclic chains re-arm at fire time; completions carry no work.
        vec![]
    }

    fn get_schedule(&self, table: &PollSetTable) -> Value {
        let mut rendered = Map::new();
        for (&hyperperiod, slots) in
            self.slot_plans.iter().sorted_by_key(|&(&h, _)| h)
        {
            let mut slot_map = Map::new();
            for (&slot, keys) in slots {
                let mut by_remote: std::collections::BTreeMap<
                    String,
                    Vec<Value>,
                > = Default::default();
                for key in keys {
                    let points = by_remote
                        .entry(key.remote_id.clone())
                        .or_default();
                    if let Some(poll_set) = table
                        .get(&self.group)
                        .and_then(|remotes| remotes.get(&key.remote_id))
                        .and_then(|intervals| intervals.get(&key.interval))
                    {
                        points.extend(
                            poll_set
                                .points
                                .keys()
                                .map(|point| json!(topic::tag(point))),
                        );
                    }
                }
                let remote_map: Map<String, Value> = by_remote
                    .into_iter()
                    .map(|(remote_id, points)| (remote_id, points.into()))
                    .collect();
                slot_map
                    .insert(format_duration(slot), Value::Object(remote_map));
            }
            rendered.insert(
                format_duration(hyperperiod),
                Value::Object(slot_map),
            );
        }
        Value::Object(rendered)
    }
}

// ===== global functions =====

fn merge_plans(into: &mut SlotPlans, from: SlotPlans) {
    for (hyperperiod, slots) in from {
        let plan = into.entry(hyperperiod).or_default();
        for (slot, keys) in slots {
            plan.entry(slot).or_default().extend(keys);
        }
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 { 0 } else { a / gcd(a, b) * b }
}
