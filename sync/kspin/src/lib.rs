// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

//! Spinlocks for the scheduler core.
//!
//! # Architecture
//!
//! ## Guards (`guard` module)
//!
//! RAII guards that bracket a critical section on the running unit:
//! - [`NoOp`]: no protection, for code already inside a critical section
//! - [`NoPreempt`]: the holder cannot be switched away
//! - [`NoPreemptIrqSave`]: additionally masks interrupt-context work
//!   (IPI processing and systimer dispatch)
//!
//! The guards reach the scheduler through [`KernelGuardIf`], which the task
//! crate implements with `crate_interface`. The spinning itself is always
//! atomic; there is no uniprocessor build.
//!
//! ## Backoff
//!
//! [`Backoff`] is the bounded exponential pause used while a lock word is
//! contended, both here and by the blocking mutex's spin path.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kspin::SpinNoIrq;
//!
//! static COUNTER: SpinNoIrq<u32> = SpinNoIrq::new(0);
//!
//! fn increment() {
//!     *COUNTER.lock() += 1;
//! }
//! ```

mod backoff;
mod guard;
mod lock;

pub use backoff::Backoff;
pub use guard::{BaseGuard, KernelGuardIf, NoOp, NoPreempt, NoPreemptIrqSave};
pub use lock::{SpinLock, SpinLockGuard};

/// Raw spinlock with no guards.
///
/// **Warning**: only for data touched exclusively from inside an existing
/// critical section.
pub type SpinRaw<T> = SpinLock<NoOp, T>;

/// Guard for [`SpinRaw`].
pub type SpinRawGuard<'a, T> = SpinLockGuard<'a, NoOp, T>;

/// Spinlock whose holder cannot be switched away.
pub type SpinNoPreempt<T> = SpinLock<NoPreempt, T>;

/// Guard for [`SpinNoPreempt`].
pub type SpinNoPreemptGuard<'a, T> = SpinLockGuard<'a, NoPreempt, T>;

/// Spinlock usable from interrupt context as well as from units.
pub type SpinNoIrq<T> = SpinLock<NoPreemptIrqSave, T>;

/// Guard for [`SpinNoIrq`].
pub type SpinNoIrqGuard<'a, T> = SpinLockGuard<'a, NoPreemptIrqSave, T>;
