// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Per-CPU lightweight scheduling.
//!
//! Every logical CPU owns a [`PerCpu`] context with a 32-level priority run
//! queue, a free-unit cache, an inbound message queue and a systimer queue.
//! Units never move between CPUs on their own: cross-CPU wakeups, spawns,
//! timer deletions and migrations are messages ([`IpiMsg`]) processed by the
//! target CPU at its next interrupt point.
//!
//! Scheduling is cooperative. A unit runs until it blocks, yields, reaches a
//! [`preempt_point`] with a reschedule pending, or exits. The periodic clock
//! interrupt charges the running unit and requests a reschedule when its
//! quantum is used up and equal-priority work is waiting.
//!
//! On a hosted target every unit is carried by a host thread that only
//! executes while it holds its CPU's baton, so each CPU runs exactly one unit
//! at a time.
//!
//! # Cargo Features
//!
//! - `tracing-switch`: log run queue state on every context switch.

#[cfg(target_os = "none")]
compile_error!("ktask only has the hosted backend; units are carried by host threads");

#[macro_use]
extern crate log;

extern crate alloc;

cfg_if::cfg_if! {
    if #[cfg(feature = "tracing-switch")] {
        macro_rules! switch_trace {
            ($($arg:tt)*) => { debug!($($arg)*) };
        }
    } else {
        macro_rules! switch_trace {
            ($($arg:tt)*) => {};
        }
    }
}

mod api;
mod callout;
mod config;
mod crit;
mod host;
mod ipi;
mod percpu;
mod registry;
mod run_queue;
mod sched;
mod systimer;
mod time;
mod unit;
mod wait_queue;

pub mod future;

pub use self::{
    api::*,
    config::*,
    host::HostClock,
    time::{ClockSource, deadline_after, hz, now_ns, ticks_to_ns},
};
