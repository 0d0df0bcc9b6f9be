//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The serial poll scheduler.
//!
//! An alternative to the cyclic variant for buses that cannot tolerate
//! overlapping transactions: each slot's poll sets are dispatched one at a
//! time, and the next set goes out only when the previous poll has
//! finished. Selected with `poll_scheduler_class_name =
//! "SerialPollScheduler"`.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use drover_utils::task::TimeoutTask;

use crate::config::ResolvedGroupConfig;
use crate::events::InternalSender;
use crate::poll::cyclic::StaticCyclicPollScheduler;
use crate::poll::{PollScheduler, PollSetKey, PollSetTable};
use crate::tasks;

#[derive(Debug)]
pub struct SerialPollScheduler {
    // Slot computation is shared with the cyclic scheduler; only the
    // dispatch discipline differs.
    inner: StaticCyclicPollScheduler,
    pending: VecDeque<PollSetKey>,
    armed: HashSet<Duration>,
}

// ===== impl SerialPollScheduler =====

impl SerialPollScheduler {
    pub fn new(
        group: &str,
        config: ResolvedGroupConfig,
    ) -> SerialPollScheduler {
        SerialPollScheduler {
            inner: StaticCyclicPollScheduler::new(group, config),
            pending: VecDeque::new(),
            armed: HashSet::new(),
        }
    }
}

impl PollScheduler for SerialPollScheduler {
    fn group(&self) -> &str {
        self.inner.group()
    }

    fn start_all_datetime(&self) -> DateTime<Utc> {
        self.inner.start_all_datetime()
    }

    fn schedule(
        &mut self,
        table: &PollSetTable,
        internal_tx: &InternalSender,
        now: DateTime<Utc>,
    ) {
        self.pending.clear();
        self.armed.clear();
        self.inner.schedule(table, internal_tx, now);
        self.armed.extend(self.inner.armed_hyperperiods());
    }

    fn operate_polling(
        &mut self,
        hyperperiod: Duration,
        internal_tx: &InternalSender,
        now: DateTime<Utc>,
    ) -> Vec<PollSetKey> {
        self.armed.remove(&hyperperiod);
        // Take the due slot but hold its sets back; only the head goes
        // out, the rest wait for completions. The cyclic re-arm is undone
        // so the chain resumes from poll_finished instead.
        let due = self.inner.operate_polling(hyperperiod, internal_tx, now);
        self.inner.disarm(hyperperiod);
        self.pending.extend(due);
        match self.pending.pop_front() {
            Some(key) => vec![key],
            None => {
                self.rearm_idle(internal_tx);
                vec![]
            }
        }
    }

    fn poll_finished(
        &mut self,
        _remote_id: &str,
        internal_tx: &InternalSender,
        _now: DateTime<Utc>,
    ) -> Vec<PollSetKey> {
        match self.pending.pop_front() {
            Some(key) => vec![key],
            None => {
                self.rearm_idle(internal_tx);
                vec![]
            }
        }
    }

    fn get_schedule(&self, table: &PollSetTable) -> Value {
        self.inner.get_schedule(table)
    }
}

impl SerialPollScheduler {
    // Arms a one-shot for every hyperperiod chain that is idle.
    fn rearm_idle(&mut self, internal_tx: &InternalSender) {
        let timers: Vec<(Duration, TimeoutTask)> = self
            .inner
            .idle_chains(&self.armed)
            .into_iter()
            .map(|(hyperperiod, next_fire)| {
                let timer = tasks::poll_timer(
                    self.inner.group(),
                    hyperperiod,
                    next_fire,
                    internal_tx,
                );
                (hyperperiod, timer)
            })
            .collect();
        for (hyperperiod, timer) in timers {
            self.armed.insert(hyperperiod);
            self.inner.arm_with(hyperperiod, timer);
        }
    }
}

