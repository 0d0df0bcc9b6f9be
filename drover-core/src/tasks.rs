//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use chrono::{DateTime, Utc};

use drover_utils::task::{IntervalTask, TimeoutTask};

use crate::events::{InternalMsg, InternalSender};

//
// Driver service tasks diagram:
//                                +--------------+
//                                |  bus / RPC   |
//                                +--------------+
//                                      | ^
//                                      | |
//                       rpc / config   V | publications
//                                +--------------+
//          poll_timer (Nx)    -> |              | -> poll workers (Nx)
//          all_publish (Nx)   -> |    agent     | <- poll_done
//          reservation_update -> |              |
//          heartbeat (Nx)     -> |              |
//                                +--------------+
//                                      | ^
//                                      V |
//                                +--------------+
//                                |   remotes    |
//                                +--------------+
//

// ===== Driver service tasks =====

// One-shot poll timer for one hyperperiod chain of a group.
pub(crate) fn poll_timer(
    group: &str,
    hyperperiod: Duration,
    at: DateTime<Utc>,
    internal_tx: &InternalSender,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let group = group.to_owned();
        let internal_tx = internal_tx.clone();
        TimeoutTask::new_at(at, move || async move {
            let _ = internal_tx.send(InternalMsg::PollTimer {
                group,
                hyperperiod,
            });
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Periodic all-publish timer for one device. The first fire lands after
// every point has seen its first poll.
pub(crate) fn all_publish_timer(
    device: &str,
    start: DateTime<Utc>,
    interval: Duration,
    internal_tx: &InternalSender,
) -> IntervalTask {
    #[cfg(not(feature = "testing"))]
    {
        let device = device.to_owned();
        let internal_tx = internal_tx.clone();
        IntervalTask::new_at(start, interval, move || {
            let device = device.clone();
            let internal_tx = internal_tx.clone();
            async move {
                let _ = internal_tx
                    .send(InternalMsg::AllPublishTimer { device });
            }
        })
    }
    #[cfg(feature = "testing")]
    {
        IntervalTask {}
    }
}

// Reservation-manager internal update timer.
pub(crate) fn reservation_update(
    at: DateTime<Utc>,
    internal_tx: &InternalSender,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let internal_tx = internal_tx.clone();
        TimeoutTask::new_at(at, move || async move {
            let _ = internal_tx.send(InternalMsg::ReservationUpdate);
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Periodic heartbeat toggle for one remote.
pub(crate) fn heartbeat(
    remote_id: &str,
    interval: Duration,
    internal_tx: &InternalSender,
) -> IntervalTask {
    #[cfg(not(feature = "testing"))]
    {
        let remote_id = remote_id.to_owned();
        let internal_tx = internal_tx.clone();
        IntervalTask::new(interval, false, move || {
            let remote_id = remote_id.clone();
            let internal_tx = internal_tx.clone();
            async move {
                let _ =
                    internal_tx.send(InternalMsg::Heartbeat { remote_id });
            }
        })
    }
    #[cfg(feature = "testing")]
    {
        IntervalTask {}
    }
}
