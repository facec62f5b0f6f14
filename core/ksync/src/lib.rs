// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Kernel synchronization primitives.
//!
//! This crate provides blocking synchronization primitives for `ktask` units:
//!
//! - [`Mtx`]: exclusive/shared mutex with queued waiter links, timeouts,
//!   interruptible waits and asynchronous lock requests
//! - [`Mutex`] and [`RwLock`]: `lock_api` front-ends over [`Mtx`]
//! - [`TokenRwLock`]: recursive exclusive / counting shared lock
//! - [`KRef`]: reference count with a one-time finalizer
//! - [`SysRef`] and [`SysRefRegistry`]: phase-tracking reference counts for
//!   objects that can be looked up by id
//! - [`spin`]: Re-export of `kspin` for spinlocks
//!
//! # Examples
//!
//! ## Mutex
//! ```no_run
//! use ksync::Mutex;
//!
//! static DATA: Mutex<Vec<u8>> = Mutex::new(Vec::new());
//!
//! fn task() {
//!     let mut data = DATA.lock();
//!     data.push(42);
//! }
//! ```
//!
//! ## Timed and interruptible locking
//! ```no_run
//! use core::time::Duration;
//!
//! use kerrno::KError;
//! use ksync::Mtx;
//!
//! static LOCK: Mtx = Mtx::new("table");
//!
//! fn task() {
//!     match LOCK.lock_exclusive(Some(Duration::from_millis(10)), true) {
//!         Ok(()) => LOCK.unlock(),
//!         Err(KError::WouldBlock) => { /* timed out */ }
//!         Err(KError::Interrupted) => { /* signalled */ }
//!         Err(_) => unreachable!(),
//!     }
//! }
//! ```
//!
//! ## RwLock
//! ```no_run
//! use ksync::RwLock;
//!
//! static CONFIG: RwLock<u32> = RwLock::new(0);
//!
//! fn reader() {
//!     let config = CONFIG.read();
//!     // multiple readers allowed
//! }
//!
//! fn writer() {
//!     let mut config = CONFIG.write();
//!     // exclusive writer
//! }
//! ```
//!
//! # Features
//!
//! - `stats`: Enable mutex contention counters

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

extern crate alloc;

pub use kspin as spin;

mod kref;
mod mtx;
mod mutex;
mod rwlock;
mod sysref;
mod token_rwlock;
mod util;

#[cfg(feature = "stats")]
pub use self::mtx::MtxStats;
pub use self::{
    kref::KRef,
    mtx::{LinkState, Mtx, MtxLink, MtxSpinGuard},
    mutex::{Mutex, MutexGuard, RawMutex},
    rwlock::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard},
    sysref::{SysRef, SysRefAction, SysRefClass, SysRefRegistry, SysRefState},
    token_rwlock::TokenRwLock,
    util::SpinConfig,
};
