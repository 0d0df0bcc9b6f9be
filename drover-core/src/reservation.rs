//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Reservation management: time-bounded exclusive claims on devices.
//!
//! Agents request tasks made of per-device time slices. Slices on the same
//! device never overlap; a HIGH-priority task may preempt lower-priority
//! holders, which then keep access for a configurable grace period. State
//! is serialized to the config store after every accepted mutation and
//! reloaded on startup.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use drover_utils::Database;

// Config-store key holding the serialized task table.
const RESERVATION_STATE_KEY: &str = "_reservation_state";

/// Task priority, ordered weakest to strongest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ReservationPriority {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "LOW_PREEMPT")]
    LowPreempt,
    #[serde(rename = "HIGH")]
    High,
}

/// Lifecycle of a reservation task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum TaskState {
    PreRun,
    Running,
    Preempted,
    Finished,
}

/// A half-open time interval. Unbounded ends are only produced internally
/// while stretching aggregates; validated requests always carry both ends.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct TimeSlice {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// The time slices one task holds on one device.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct Reservation {
    pub time_slots: Vec<TimeSlice>,
}

/// A set of device reservations requested together under one task id.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Task {
    pub agent_id: String,
    pub priority: ReservationPriority,
    pub devices: BTreeMap<String, Reservation>,
    /// Aggregate slice covering the union of all device slices.
    pub time_slice: TimeSlice,
    pub state: TaskState,
}

/// Outcome of a reservation RPC, delivered verbatim to the caller.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct RequestResult {
    pub success: bool,
    pub data: Value,
    pub info_string: String,
}

/// Holder snapshot for one device.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct ReservationState {
    pub agent_id: String,
    pub task_id: String,
    pub time_remaining: f64,
}

pub struct ReservationManager {
    pub tasks: BTreeMap<String, Task>,
    pub running_tasks: BTreeSet<String>,
    pub preempted_tasks: BTreeSet<String>,
    grace_time: Duration,
    publish_interval: Duration,
    db: Option<Database>,
}

// ===== impl ReservationPriority =====

impl ReservationPriority {
    /// Case-insensitive parse of the wire form.
    pub fn parse(value: &str) -> Option<ReservationPriority> {
        match value.to_ascii_uppercase().as_str() {
            "LOW" => Some(ReservationPriority::Low),
            "LOW_PREEMPT" => Some(ReservationPriority::LowPreempt),
            "HIGH" => Some(ReservationPriority::High),
            _ => None,
        }
    }
}

// ===== impl TimeSlice =====

impl TimeSlice {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> TimeSlice {
        TimeSlice {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Half-open containment: `start <= instant < end`.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| start <= instant)
            && self.end.is_none_or(|end| instant < end)
    }

    /// Overlap test; touching at endpoints is not overlap.
    pub fn overlaps(&self, other: &TimeSlice) -> bool {
        let starts_before_other_ends = match (self.start, other.end) {
            (Some(start), Some(end)) => start < end,
            _ => true,
        };
        let other_starts_before_end = match (other.start, self.end) {
            (Some(start), Some(end)) => start < end,
            _ => true,
        };
        starts_before_other_ends && other_starts_before_end
    }

    /// Grows this slice to cover `other`. Unset ends adopt the other
    /// slice's bound.
    pub fn stretch_to_include(&mut self, other: &TimeSlice) {
        self.start = match (self.start, other.start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

// ===== impl Reservation =====

impl Reservation {
    /// Whether a new slot fits without overlapping the existing ones.
    pub fn check_availability(&self, slot: &TimeSlice) -> bool {
        !self.time_slots.iter().any(|existing| existing.overlaps(slot))
    }

    /// Inserts a slot, keeping the list ordered by start time.
    pub fn reserve_slot(&mut self, slot: TimeSlice) {
        let position = self
            .time_slots
            .iter()
            .position(|existing| existing.start > slot.start)
            .unwrap_or(self.time_slots.len());
        self.time_slots.insert(position, slot);
    }

    /// Drops slots that ended at or before `now`.
    pub fn make_current(&mut self, now: DateTime<Utc>) {
        self.time_slots
            .retain(|slot| slot.end.is_none_or(|end| end > now));
    }

    pub fn finished(&self) -> bool {
        self.time_slots.is_empty()
    }

    /// The slot containing `now`, if any.
    pub fn get_current_slot(&self, now: DateTime<Utc>) -> Option<TimeSlice> {
        self.time_slots.iter().find(|slot| slot.contains(now)).copied()
    }

    /// The earliest slot boundary strictly after `now`.
    pub fn get_next_event_time(
        &self,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.time_slots
            .iter()
            .flat_map(|slot| [slot.start, slot.end])
            .flatten()
            .filter(|&instant| instant > now)
            .min()
    }

    /// Keeps only the currently active slot, truncated to `now + grace`.
    pub fn prune_to_current(&mut self, grace: Duration, now: DateTime<Utc>) {
        let deadline = now + to_delta(grace);
        self.time_slots = match self.get_current_slot(now) {
            Some(mut slot) => {
                if slot.end.is_none_or(|end| end > deadline) {
                    slot.end = Some(deadline);
                }
                vec![slot]
            }
            None => vec![],
        };
    }

    /// Slots of `other` that collide with this reservation.
    pub fn get_conflicts(&self, other: &Reservation) -> Vec<TimeSlice> {
        other
            .time_slots
            .iter()
            .filter(|slot| {
                self.time_slots.iter().any(|existing| existing.overlaps(slot))
            })
            .copied()
            .collect()
    }
}

// ===== impl Task =====

impl Task {
    pub fn new(agent_id: &str, priority: ReservationPriority) -> Task {
        Task {
            agent_id: agent_id.to_owned(),
            priority,
            devices: BTreeMap::new(),
            time_slice: TimeSlice::default(),
            state: TaskState::PreRun,
        }
    }

    /// Fills the per-device reservations from validated `(device, start,
    /// end)` triples. Fails if a slice conflicts with another slice of the
    /// same request on the same device.
    pub fn populate_reservation(
        &mut self,
        requests: &[(String, DateTime<Utc>, DateTime<Utc>)],
    ) -> Result<(), String> {
        for (device, start, end) in requests {
            if end < start {
                return Err(format!(
                    "MALFORMED_REQUEST: ValueError: end time {end} is before \
                     start time {start}"
                ));
            }
            let slot = TimeSlice::new(*start, *end);
            let reservation = self.devices.entry(device.clone()).or_default();
            if !reservation.check_availability(&slot) {
                return Err("REQUEST_CONFLICTS_WITH_SELF".to_owned());
            }
            reservation.reserve_slot(slot);
            self.time_slice.stretch_to_include(&slot);
        }
        Ok(())
    }

    /// Recomputes the task's state from `now`, dropping finished device
    /// reservations.
    pub fn make_current(&mut self, now: DateTime<Utc>) {
        if self.state == TaskState::Finished {
            self.devices.clear();
            return;
        }
        for reservation in self.devices.values_mut() {
            reservation.make_current(now);
        }
        self.devices.retain(|_, reservation| !reservation.finished());

        if self.state == TaskState::Preempted {
            if self.devices.is_empty() {
                self.state = TaskState::Finished;
            }
            return;
        }
        self.state = if self.time_slice.end.is_some_and(|end| end <= now)
            || self.devices.is_empty()
        {
            TaskState::Finished
        } else if self.time_slice.start.is_some_and(|start| start > now) {
            TaskState::PreRun
        } else {
            TaskState::Running
        };
    }

    /// Active `(device, slot)` pairs at `now`.
    pub fn get_current_slots(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<(String, TimeSlice)> {
        self.devices
            .iter()
            .filter_map(|(device, reservation)| {
                reservation
                    .get_current_slot(now)
                    .map(|slot| (device.clone(), slot))
            })
            .collect()
    }

    pub fn get_next_event_time(
        &self,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.devices
            .values()
            .filter_map(|reservation| reservation.get_next_event_time(now))
            .min()
    }

    /// Whether this (new) task may preempt `other`. Only HIGH tasks
    /// preempt, never another HIGH task; a running plain-LOW holder is
    /// safe, a LOW_PREEMPT holder is not.
    pub fn check_can_preempt_other(&self, other: &Task) -> bool {
        if self.priority != ReservationPriority::High
            || other.priority == ReservationPriority::High
        {
            return false;
        }
        match other.state {
            TaskState::PreRun | TaskState::Finished => true,
            TaskState::Running | TaskState::Preempted => {
                other.priority == ReservationPriority::LowPreempt
            }
        }
    }

    /// Truncates the task to its grace window and marks it preempted.
    /// Returns false when there was nothing left to preempt.
    pub fn preempt(&mut self, grace: Duration, now: DateTime<Utc>) -> bool {
        match self.state {
            TaskState::Preempted => return true,
            TaskState::Finished => return false,
            _ => {}
        }
        for reservation in self.devices.values_mut() {
            reservation.prune_to_current(grace, now);
        }
        self.devices.retain(|_, reservation| !reservation.finished());
        if self.devices.is_empty() {
            self.state = TaskState::Finished;
            return true;
        }
        let deadline = now + to_delta(grace);
        if self.time_slice.end.is_none_or(|end| end > deadline) {
            self.time_slice.end = Some(deadline);
        }
        self.state = TaskState::Preempted;
        true
    }
}

// ===== impl RequestResult =====

impl RequestResult {
    pub fn success() -> RequestResult {
        RequestResult {
            success: true,
            data: Value::Object(Default::default()),
            info_string: String::new(),
        }
    }

    pub fn success_with_info(info_string: &str) -> RequestResult {
        RequestResult {
            success: true,
            data: Value::Object(Default::default()),
            info_string: info_string.to_owned(),
        }
    }

    pub fn failure(info_string: impl Into<String>) -> RequestResult {
        RequestResult {
            success: false,
            data: Value::Object(Default::default()),
            info_string: info_string.into(),
        }
    }
}

// ===== impl ReservationManager =====

impl std::fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationManager")
            .field("tasks", &self.tasks)
            .field("running_tasks", &self.running_tasks)
            .field("preempted_tasks", &self.preempted_tasks)
            .field("grace_time", &self.grace_time)
            .field("publish_interval", &self.publish_interval)
            .finish()
    }
}

impl ReservationManager {
    pub fn new(
        grace_time: Duration,
        publish_interval: Duration,
        db: Option<Database>,
    ) -> ReservationManager {
        ReservationManager {
            tasks: BTreeMap::new(),
            running_tasks: BTreeSet::new(),
            preempted_tasks: BTreeSet::new(),
            grace_time,
            publish_interval,
            db,
        }
    }

    pub fn grace_time(&self) -> Duration {
        self.grace_time
    }

    /// Restores the task table persisted by a previous run. Anything
    /// unreadable starts the manager empty; in-memory state is
    /// authoritative from then on.
    pub fn load_state(&mut self, now: DateTime<Utc>) {
        let Some(db) = &self.db else {
            return;
        };
        let stored: Option<String> =
            db.lock().unwrap().get(RESERVATION_STATE_KEY);
        if let Some(stored) = stored {
            match serde_json::from_str::<BTreeMap<String, Task>>(&stored) {
                Ok(tasks) => {
                    self.tasks = tasks;
                    self.update_states(now);
                }
                Err(error) => {
                    warn!(%error, "discarding unreadable reservation state");
                    self.tasks = BTreeMap::new();
                }
            }
        }
    }

    /// Persists the task table. Failures are logged; the in-memory table
    /// stays authoritative.
    pub fn save_state(&mut self) {
        let Some(db) = &self.db else {
            return;
        };
        match serde_json::to_string(&self.tasks) {
            Ok(serialized) => {
                if let Err(error) = db
                    .lock()
                    .unwrap()
                    .set(RESERVATION_STATE_KEY, &serialized)
                {
                    warn!(%error, "failed to persist reservation state");
                }
            }
            Err(error) => {
                warn!(%error, "failed to serialize reservation state");
            }
        }
    }

    /// Creates a new reservation task. Validation follows a strict order
    /// so the caller always sees the same failure for the same shape of
    /// bad request.
    pub fn new_task(
        &mut self,
        sender: Option<&str>,
        task_id: &Value,
        priority: &Value,
        requests: &Value,
        now: DateTime<Utc>,
    ) -> RequestResult {
        if let Some(sender) = sender
            && sender.is_empty()
        {
            return RequestResult::failure(
                "MALFORMED_REQUEST: TypeError: agent_id must be a nonempty \
                 string",
            );
        }
        let Some(sender) = sender else {
            return RequestResult::failure("MISSING_AGENT_ID");
        };
        if task_id.is_null() {
            return RequestResult::failure("MISSING_TASK_ID");
        }
        let Some(task_id) = task_id.as_str().filter(|id| !id.is_empty()) else {
            return RequestResult::failure(
                "MALFORMED_REQUEST: TypeError: taskid must be a nonempty \
                 string",
            );
        };
        let request_list = requests.as_array().cloned().unwrap_or_default();
        if request_list.is_empty() {
            return RequestResult::failure("MALFORMED_REQUEST_EMPTY");
        }
        if priority.is_null() {
            return RequestResult::failure("MISSING_PRIORITY");
        }
        let Some(priority) =
            priority.as_str().and_then(ReservationPriority::parse)
        else {
            return RequestResult::failure("INVALID_PRIORITY");
        };
        if self.tasks.contains_key(task_id) {
            return RequestResult::failure("TASK_ID_ALREADY_EXISTS");
        }
        let parsed = match parse_requests(&request_list) {
            Ok(parsed) => parsed,
            Err(info) => return RequestResult::failure(info),
        };
        let mut task = Task::new(sender, priority);
        if let Err(info) = task.populate_reservation(&parsed) {
            return RequestResult::failure(info);
        }
        task.make_current(now);

        // Evaluate conflicts against every existing task. A single
        // non-preemptable conflict rejects the request as a whole.
        let mut preempted = vec![];
        for (existing_id, existing) in &self.tasks {
            if !conflicts_with(&task, existing) {
                continue;
            }
            if !task.check_can_preempt_other(existing) {
                return RequestResult::failure(
                    "CONFLICTS_WITH_EXISTING_RESERVATIONS",
                );
            }
            preempted.push(existing_id.clone());
        }
        for existing_id in &preempted {
            if let Some(existing) = self.tasks.get_mut(existing_id)
                && existing.preempt(self.grace_time, now)
            {
                debug!(task_id = %existing_id, "task preempted");
                self.preempted_tasks.insert(existing_id.clone());
                self.running_tasks.remove(existing_id);
            }
        }
        self.tasks.insert(task_id.to_owned(), task);
        self.update_states(now);
        self.save_state();
        if preempted.is_empty() {
            RequestResult::success()
        } else {
            RequestResult::success_with_info("TASKS_WERE_PREEMPTED")
        }
    }

    pub fn cancel_task(
        &mut self,
        sender: &str,
        task_id: &str,
    ) -> RequestResult {
        let Some(task) = self.tasks.get(task_id) else {
            return RequestResult::failure("TASK_ID_DOES_NOT_EXIST");
        };
        if task.agent_id != sender {
            return RequestResult::failure("AGENT_ID_TASK_ID_MISMATCH");
        }
        self.tasks.remove(task_id);
        self.running_tasks.remove(task_id);
        self.preempted_tasks.remove(task_id);
        self.save_state();
        RequestResult::success()
    }

    /// Advances every task's state machine, garbage-collects finished
    /// tasks, and returns when the next internal update is due.
    pub fn update(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.update_states(now);
        let finished: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.state == TaskState::Finished)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in finished {
            debug!(%task_id, "reservation task finished");
            self.tasks.remove(&task_id);
            self.running_tasks.remove(&task_id);
            self.preempted_tasks.remove(&task_id);
        }
        self.save_state();
        let next_event = self
            .tasks
            .values()
            .filter_map(|task| task.get_next_event_time(now))
            .min();
        let next_publish = now + to_delta(self.publish_interval);
        next_event.map_or(next_publish, |event| event.min(next_publish))
    }

    /// Snapshot of current device holders.
    pub fn get_reservation_state(
        &self,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, ReservationState> {
        let mut state = BTreeMap::new();
        for (task_id, task) in &self.tasks {
            if !matches!(task.state, TaskState::Running | TaskState::Preempted)
            {
                continue;
            }
            for (device, slot) in task.get_current_slots(now) {
                let time_remaining = slot
                    .end
                    .map(|end| (end - now).as_seconds_f64().max(0.0))
                    .unwrap_or(f64::INFINITY);
                state.insert(
                    device,
                    ReservationState {
                        agent_id: task.agent_id.clone(),
                        task_id: task_id.clone(),
                        time_remaining,
                    },
                );
            }
        }
        state
    }

    /// The agent currently holding a device, if any.
    pub fn holder_of(
        &self,
        device: &str,
        now: DateTime<Utc>,
    ) -> Option<(&str, &str)> {
        self.tasks.iter().find_map(|(task_id, task)| {
            if !matches!(task.state, TaskState::Running | TaskState::Preempted)
            {
                return None;
            }
            task.devices
                .get(device)
                .and_then(|reservation| reservation.get_current_slot(now))
                .map(|_| (task.agent_id.as_str(), task_id.as_str()))
        })
    }

    fn update_states(&mut self, now: DateTime<Utc>) {
        for (task_id, task) in &mut self.tasks {
            task.make_current(now);
            match task.state {
                TaskState::Running => {
                    self.running_tasks.insert(task_id.clone());
                }
                TaskState::Preempted => {
                    self.preempted_tasks.insert(task_id.clone());
                    self.running_tasks.remove(task_id);
                }
                _ => {
                    self.running_tasks.remove(task_id);
                    self.preempted_tasks.remove(task_id);
                }
            }
        }
    }
}

// ===== global functions =====

// Parses `[device, start, end]` request triples from their wire form.
fn parse_requests(
    requests: &[Value],
) -> Result<Vec<(String, DateTime<Utc>, DateTime<Utc>)>, String> {
    let mut parsed = vec![];
    for request in requests {
        let Some(triple) = request.as_array().filter(|t| t.len() == 3) else {
            return Err(format!(
                "MALFORMED_REQUEST: ValueError: invalid request: {request}"
            ));
        };
        let Some(device) = triple[0].as_str().filter(|d| !d.is_empty()) else {
            return Err(
                "MALFORMED_REQUEST: TypeError: Device not string.".to_owned()
            );
        };
        let start = parse_timestamp(&triple[1])?;
        let end = parse_timestamp(&triple[2])?;
        parsed.push((device.to_owned(), start, end));
    }
    Ok(parsed)
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    let Some(text) = value.as_str() else {
        return Err(format!(
            "MALFORMED_REQUEST: TypeError: invalid timestamp: {value}"
        ));
    };
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Ok(instant.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|error| {
            format!("MALFORMED_REQUEST: ValueError: {error}: {text}")
        })
}

fn conflicts_with(new: &Task, existing: &Task) -> bool {
    new.devices.iter().any(|(device, reservation)| {
        existing
            .devices
            .get(device)
            .is_some_and(|other| !reservation.get_conflicts(other).is_empty())
    })
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::zero())
}
