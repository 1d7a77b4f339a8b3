//! Dispose-once state machine shared by every disposable type in the crate.
//!
//! A [`Lifecycle`] moves strictly forward through
//! `NotStarted -> InProgress -> Completed`. Exactly one caller wins
//! [`Lifecycle::try_begin_dispose`] and receives a [`DisposeTicket`]; the
//! ticket is the only way to reach `Completed`, so the end of disposal can
//! only be signalled by the caller that started it.

use crate::error::{BoxError, DisposeError, Result};
use crossbeam_channel::{Receiver, bounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisposalState {
    NotStarted,
    InProgress,
    Completed,
}

type Listener = Box<dyn FnOnce() + Send>;

struct LifecycleState {
    state: DisposalState,
    reason: Option<String>,
    listeners: Vec<Listener>,
}

pub struct Lifecycle {
    owner: &'static str,
    inner: Mutex<LifecycleState>,
}

impl Lifecycle {
    /// Create a lifecycle in `NotStarted`; `owner` names the object in errors and logs.
    pub fn new(owner: &'static str) -> Self {
        Lifecycle {
            owner,
            inner: Mutex::new(LifecycleState {
                state: DisposalState::NotStarted,
                reason: None,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn for_type<T: ?Sized>() -> Self {
        Self::new(std::any::type_name::<T>())
    }

    pub fn owner(&self) -> &'static str {
        self.owner
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> DisposalState {
        self.lock().state
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == DisposalState::Completed
    }

    pub fn is_dispose_started(&self) -> bool {
        self.state() != DisposalState::NotStarted
    }

    /// Reason recorded by the caller that started disposal, if any.
    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    /// Fails with [`DisposeError::AlreadyDisposed`] once disposal has completed.
    pub fn ensure_not_disposed(&self) -> Result<()> {
        match self.state() {
            DisposalState::Completed => Err(DisposeError::AlreadyDisposed { object: self.owner }),
            _ => Ok(()),
        }
    }

    /// Fails as soon as disposal has started; an in-flight disposal is reported
    /// as [`DisposeError::DisposeInProgress`].
    pub fn ensure_not_dispose_started(&self) -> Result<()> {
        match self.state() {
            DisposalState::NotStarted => Ok(()),
            DisposalState::InProgress => Err(DisposeError::DisposeInProgress { object: self.owner }),
            DisposalState::Completed => Err(DisposeError::AlreadyDisposed { object: self.owner }),
        }
    }

    /// Claim the right to run cleanup.
    ///
    /// Returns `None` without blocking if disposal was already started by
    /// anyone, including a concurrent caller. Dropping or ending the returned
    /// ticket completes disposal.
    pub fn try_begin_dispose(&self) -> Option<DisposeTicket<'_>> {
        let mut inner = self.lock();
        if inner.state != DisposalState::NotStarted {
            return None;
        }
        inner.state = DisposalState::InProgress;
        drop(inner);
        log::trace!("{}: dispose started", self.owner);
        Some(DisposeTicket { lifecycle: self })
    }

    /// Register a listener for the end of disposal.
    ///
    /// Listeners run exactly once, in registration order, after both cleanup
    /// phases. A listener registered after completion runs immediately on the
    /// calling thread.
    pub fn on_disposed<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.state != DisposalState::Completed {
            inner.listeners.push(Box::new(listener));
            return;
        }
        drop(inner);
        self.notify(Box::new(listener));
    }

    /// A receiver that gets a single `()` once disposal completes.
    pub fn completion(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.on_disposed(move || {
            let _ = tx.send(());
        });
        rx
    }

    fn end_dispose(&self) {
        // Listeners added while earlier ones run are drained too; the state only
        // flips to Completed once nothing is left to notify.
        loop {
            let batch = {
                let mut inner = self.lock();
                if inner.listeners.is_empty() {
                    inner.state = DisposalState::Completed;
                    break;
                }
                std::mem::take(&mut inner.listeners)
            };
            for listener in batch {
                self.notify(listener);
            }
        }
        log::trace!("{}: dispose completed", self.owner);
    }

    fn notify(&self, listener: Listener) {
        if catch_unwind(AssertUnwindSafe(listener)).is_err() {
            log::error!("{}: disposed listener panicked", self.owner);
        }
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Lifecycle")
            .field("owner", &self.owner)
            .field("state", &inner.state)
            .field("reason", &inner.reason)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// Proof that the holder won [`Lifecycle::try_begin_dispose`].
///
/// Disposal completes when the ticket is ended or dropped, which also covers
/// unwinding out of a panicking cleanup hook.
#[must_use = "dropping the ticket immediately completes disposal"]
pub struct DisposeTicket<'a> {
    lifecycle: &'a Lifecycle,
}

impl<'a> DisposeTicket<'a> {
    pub fn lifecycle(&self) -> &'a Lifecycle {
        self.lifecycle
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::debug!("{}: disposing ({reason})", self.lifecycle.owner);
        self.lifecycle.lock().reason = Some(reason);
    }

    /// Mark disposal completed and notify listeners.
    pub fn end(self) {}
}

impl Drop for DisposeTicket<'_> {
    fn drop(&mut self) {
        self.lifecycle.end_dispose();
    }
}

/// Native cleanup that runs exactly once: explicitly through [`NativePhase::run`],
/// or on drop if the managed phase unwound or its future was abandoned.
pub(crate) struct NativePhase<F>
where
    F: FnOnce() -> std::result::Result<(), BoxError>,
{
    owner: &'static str,
    hook: Option<F>,
}

impl<F> NativePhase<F>
where
    F: FnOnce() -> std::result::Result<(), BoxError>,
{
    pub(crate) fn new(owner: &'static str, hook: F) -> Self {
        NativePhase { owner, hook: Some(hook) }
    }

    pub(crate) fn run(mut self) -> Result<()> {
        match self.hook.take() {
            Some(hook) => hook().map_err(|source| crate::cleanup_error!(self.owner, source)),
            None => Ok(()),
        }
    }
}

impl<F> Drop for NativePhase<F>
where
    F: FnOnce() -> std::result::Result<(), BoxError>,
{
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            log::warn!("{}: managed cleanup did not finish, running native cleanup", self.owner);
            if let Err(source) = hook() {
                let err = DisposeError::Finalization { object: self.owner, source };
                log::warn!("{err}");
            }
        }
    }
}
