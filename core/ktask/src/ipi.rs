//! Inter-processor messages.
//!
//! A CPU never edits another CPU's run queue or timers. It pushes an
//! [`IpiMsg`] onto the target's inbound queue and kicks the target, which
//! drains the queue in FIFO order at its next interrupt point.

use alloc::{boxed::Box, collections::VecDeque};

use kerrno::{KResult, ensure, k_err};

use crate::{UnitRef, percpu};

/// A function that runs once on the target CPU, in interrupt context.
pub struct Callback(Box<dyn FnOnce() + Send>);

impl Callback {
    /// Wraps `callback`.
    pub fn new<F: FnOnce() + Send + 'static>(callback: F) -> Self {
        Self(Box::new(callback))
    }

    /// Runs the callback.
    pub fn call(self) {
        (self.0)()
    }
}

impl<T: FnOnce() + Send + 'static> From<T> for Callback {
    fn from(callback: T) -> Self {
        Self::new(callback)
    }
}

/// A message to another CPU.
pub enum IpiMsg {
    /// Put a runnable unit owned by the target on its run queue.
    Schedule(UnitRef),
    /// Run a function on the target.
    Call(Callback),
}

impl core::fmt::Debug for IpiMsg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Schedule(unit) => f.debug_tuple("Schedule").field(&unit.id()).finish(),
            Self::Call(_) => f.write_str("Call"),
        }
    }
}

/// A message together with the CPU that sent it.
pub(crate) struct IpiEvent {
    pub src_cpu: Option<usize>,
    pub msg: IpiMsg,
}

/// FIFO of pending messages for one CPU.
#[derive(Default)]
pub(crate) struct IpiQueue {
    events: VecDeque<IpiEvent>,
}

impl IpiQueue {
    pub fn push(&mut self, src_cpu: Option<usize>, msg: IpiMsg) {
        self.events.push_back(IpiEvent { src_cpu, msg });
    }

    pub fn pop_one(&mut self) -> Option<IpiEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Runs `callback` on `dest_cpu`.
///
/// On the calling CPU it runs immediately; elsewhere it is queued on the
/// target and runs at the target's next interrupt point.
pub fn run_on_cpu<T: Into<Callback>>(dest_cpu: usize, callback: T) -> KResult {
    ensure!(
        dest_cpu < percpu::ncpus(),
        k_err!(InvalidInput, "no such cpu")
    );
    if percpu::current_cpu_id() == Some(dest_cpu) {
        callback.into().call();
    } else {
        percpu::cpu(dest_cpu).send(IpiMsg::Call(callback.into()));
    }
    Ok(())
}

/// Runs `callback` on every CPU, the calling one first.
pub fn run_on_each_cpu<F: Fn() + Send + Sync + 'static>(callback: F) {
    let callback = alloc::sync::Arc::new(callback);
    let here = percpu::current_cpu_id();
    if here.is_some() {
        callback();
    }
    for id in (0..percpu::ncpus()).filter(|&id| Some(id) != here) {
        let cb = callback.clone();
        percpu::cpu(id).send(IpiMsg::Call(Callback::new(move || cb())));
    }
}
