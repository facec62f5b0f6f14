// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Error codes returned by the scheduler and synchronization core.
//!
//! Only conditions a caller is expected to handle are errors. Broken
//! invariants (double unlock, refcount underflow, cross-CPU mutation) panic.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use strum::{EnumCount, IntoEnumIterator};

/// The kind of a recoverable error.
///
/// Discriminants are the BSD errno values, so a [`KError`] can be handed to
/// errno-speaking collaborators unchanged.
#[repr(i32)]
#[non_exhaustive]
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, EnumCount, strum::EnumIter,
)]
pub enum KErrorKind {
    /// The call should be restarted from the top after a signal (ERESTART).
    Restart = -1,
    /// The referenced unit is dead (ESRCH).
    NoSuchProcess = 3,
    /// A blocking wait was interrupted (EINTR).
    Interrupted = 4,
    /// Acquiring would deadlock on a lock the caller already holds (EDEADLK).
    Deadlock = 11,
    /// Not enough memory for a primitive's bookkeeping (ENOMEM).
    NoMemory = 12,
    /// The primitive is busy and cannot be reconfigured (EBUSY).
    ResourceBusy = 16,
    /// Invalid or uninitialized argument (EINVAL).
    InvalidInput = 22,
    /// A timeout expired or a non-blocking attempt failed (EWOULDBLOCK).
    WouldBlock = 35,
    /// The request was queued and will complete asynchronously (EINPROGRESS).
    InProgress = 36,
    /// A timed operation expired (ETIMEDOUT).
    TimedOut = 60,
    /// A queued lock request was aborted (ENOLCK).
    NoLock = 77,
}

impl KErrorKind {
    /// Returns the error description.
    pub fn as_str(&self) -> &'static str {
        use KErrorKind::*;
        match *self {
            Restart => "Restart system call",
            NoSuchProcess => "No such process",
            Interrupted => "Interrupted system call",
            Deadlock => "Resource deadlock avoided",
            NoMemory => "Cannot allocate memory",
            ResourceBusy => "Device busy",
            InvalidInput => "Invalid argument",
            WouldBlock => "Resource temporarily unavailable",
            InProgress => "Operation now in progress",
            TimedOut => "Operation timed out",
            NoLock => "No locks available",
        }
    }

    /// Returns the errno value.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for KErrorKind {
    type Error = i32;

    #[inline]
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        KErrorKind::iter()
            .find(|kind| kind.code() == value)
            .ok_or(value)
    }
}

impl fmt::Display for KErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recoverable error, carried as its errno value.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct KError(i32);

impl KError {
    const fn new(kind: KErrorKind) -> Self {
        KError(kind.code())
    }

    /// Returns the errno value.
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Returns the kind of this error.
    pub fn kind(self) -> KErrorKind {
        // every KError is built from a KErrorKind
        KErrorKind::try_from(self.0).unwrap_or(KErrorKind::InvalidInput)
    }

    /// Builds an error from a raw errno value, if it is one this crate knows.
    pub fn try_from_i32(value: i32) -> Result<Self, i32> {
        KErrorKind::try_from(value).map(KError::new)
    }
}

impl<E: Into<KErrorKind>> From<E> for KError {
    fn from(e: E) -> Self {
        KError::new(e.into())
    }
}

impl fmt::Debug for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KErrorKind::{:?}", self.kind())
    }
}

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

macro_rules! kerror_consts {
    ($($name:ident),*) => {
        #[allow(non_upper_case_globals)]
        impl KError {
            $(
                #[doc = concat!("An [`KError`] with kind [`KErrorKind::", stringify!($name), "`].")]
                pub const $name: Self = Self::new(KErrorKind::$name);
            )*
        }
    };
}

kerror_consts!(
    Restart,
    NoSuchProcess,
    Interrupted,
    Deadlock,
    NoMemory,
    ResourceBusy,
    InvalidInput,
    WouldBlock,
    InProgress,
    TimedOut,
    NoLock
);

/// A specialized [`Result`] type with [`KError`] as the error type.
pub type KResult<T = ()> = Result<T, KError>;

/// Constructs a [`KError`] while logging a warning.
///
/// # Examples
///
/// ```
/// # use kerrno::{k_err_type, KError};
/// assert_eq!(k_err_type!(WouldBlock), KError::WouldBlock);
/// assert_eq!(k_err_type!(NoSuchProcess, "unit 7 is dead"), KError::NoSuchProcess);
/// ```
#[macro_export]
macro_rules! k_err_type {
    ($err:ident) => {{
        use $crate::KErrorKind::*;
        let err = $crate::KError::from($err);
        $crate::__priv::warn!("[{:?}]", err);
        err
    }};
    ($err:ident, $msg:expr) => {{
        use $crate::KErrorKind::*;
        let err = $crate::KError::from($err);
        $crate::__priv::warn!("[{:?}] {}", err, $msg);
        err
    }};
}

/// Returns early with the given value unless the condition holds.
///
/// ```rust
/// # use kerrno::{ensure, k_err, KResult};
/// fn set_priority(prio: usize) -> KResult {
///     ensure!(prio < 32, k_err!(InvalidInput));
///     Ok(())
/// }
/// assert!(set_priority(40).is_err());
/// ```
#[macro_export]
macro_rules! ensure {
    ($predicate:expr, $context_selector:expr $(,)?) => {
        if !$predicate {
            return $context_selector;
        }
    };
}

/// Constructs an `Err(KError)` while logging a warning.
///
/// ```
/// # use kerrno::{k_err, KResult, KError};
/// assert_eq!(k_err!(InvalidInput), KResult::<()>::Err(KError::InvalidInput));
/// ```
#[macro_export]
macro_rules! k_err {
    ($err:ident) => {
        Err($crate::k_err_type!($err))
    };
    ($err:ident, $msg:expr) => {
        Err($crate::k_err_type!($err, $msg))
    };
}

/// Returns `Err(KError)` from the enclosing function, optionally with a message.
#[macro_export]
macro_rules! k_bail {
    ($($t:tt)*) => {
        return $crate::k_err!($($t)*);
    };
}

#[doc(hidden)]
pub mod __priv {
    pub use log::warn;
}
