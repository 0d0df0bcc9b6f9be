//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Async task and timer handles.
//!
//! The driver core arms three kinds of timers: one-shot poll slots and
//! reservation updates (wall-clock deadlines), and periodic heartbeats and
//! all-publish snapshots. All of them resolve to a handle whose drop
//! cancels the underlying task, so tearing down a schedule is just
//! replacing the handles that carry it. Timers never reset in place; a
//! rescheduled deadline is a new handle.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio::{task, time};
use tracing::Instrument;

/// A handle to an asynchronous task created by [`Task::spawn`].
///
/// Dropping the handle cancels the task unless it was [detached]. Poll
/// workers detach so that an in-flight batch read may finish even after
/// the schedule that issued it is torn down.
///
/// [detached]: Task::detach
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
    detached: bool,
}

/// A one-shot timer created by [`TimeoutTask::new`] or
/// [`TimeoutTask::new_at`]. Fires once, then the task exits; dropping the
/// handle before the deadline cancels the fire.
#[derive(Debug)]
pub struct TimeoutTask {
    #[cfg(not(feature = "testing"))]
    _task: Task<()>,
}

/// A periodic timer created by [`IntervalTask::new`] or
/// [`IntervalTask::new_at`]. Ticks until the handle is dropped.
#[derive(Debug)]
pub struct IntervalTask {
    #[cfg(not(feature = "testing"))]
    _task: Task<()>,
}

/// Remaining time until a wall-clock deadline, saturating at zero.
///
/// Deadlines in the driver core are wall-clock instants (poll slots align
/// to midnight) while the timer wheel runs on the monotonic clock; every
/// absolute deadline funnels through this conversion once, at arm time.
/// Slots the host slept through come out as zero and fire immediately;
/// the poll catch-up logic then decides which of them still runs.
pub fn until_wall(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Spawns a new asynchronous task, returning a handle for it.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
            detached: false,
        }
    }

    /// Detach the task, meaning it will no longer be canceled if its
    /// handle is dropped.
    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, task::JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.join_handle).poll(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.join_handle.abort();
        }
    }
}

// ===== impl TimeoutTask =====

impl TimeoutTask {
    /// Arms a one-shot timer that calls the provided async closure after
    /// the given delay.
    #[cfg(not(feature = "testing"))]
    pub fn new<F, Fut>(delay: Duration, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let task = Task::spawn(
            async move {
                time::sleep(delay).await;
                (cb)().await;
            }
            .in_current_span(),
        );
        TimeoutTask { _task: task }
    }

    /// Arms a one-shot timer at an absolute wall-clock deadline. Poll
    /// slots and reservation updates are scheduled this way.
    #[cfg(not(feature = "testing"))]
    pub fn new_at<F, Fut>(deadline: DateTime<Utc>, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        TimeoutTask::new(until_wall(deadline), cb)
    }
}

// ===== impl IntervalTask =====

impl IntervalTask {
    /// Arms a periodic timer. With `tick_on_start` the first tick fires
    /// immediately, otherwise one full period in. Remote heartbeats run on
    /// this form.
    #[cfg(not(feature = "testing"))]
    pub fn new<F, Fut>(
        period: Duration,
        tick_on_start: bool,
        cb: F,
    ) -> IntervalTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let first = if tick_on_start {
            Duration::ZERO
        } else {
            period
        };
        IntervalTask::start(Instant::now() + first, period, cb)
    }

    /// Arms a periodic timer whose first tick fires at an absolute
    /// wall-clock instant. All-publish timers start this way so that the
    /// first snapshot sees first-poll values of every point.
    #[cfg(not(feature = "testing"))]
    pub fn new_at<F, Fut>(
        start: DateTime<Utc>,
        period: Duration,
        cb: F,
    ) -> IntervalTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        IntervalTask::start(Instant::now() + until_wall(start), period, cb)
    }

    // Both constructors resolve to a first tick on the monotonic clock;
    // from there the tick loop is identical.
    #[cfg(not(feature = "testing"))]
    fn start<F, Fut>(first: Instant, period: Duration, mut cb: F) -> IntervalTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let task = Task::spawn(
            async move {
                let mut ticks = time::interval_at(first, period);
                loop {
                    ticks.tick().await;
                    (cb)().await;
                }
            }
            .in_current_span(),
        );
        IntervalTask { _task: task }
    }
}
