//! Synchronous dispose-once wrapper and the release capability used by scopes
//! and disposable stacks.

use crate::error::{BoxError, DisposeError, Result};
use crate::lifecycle::{Lifecycle, NativePhase};
use std::rc::Rc;
use std::sync::Arc;

/// Cleanup hooks of a synchronously disposable resource.
///
/// `dispose_managed` releases higher-level resources and only runs on explicit
/// disposal. `dispose_native` releases low-level resources; it always runs,
/// also when the wrapper is dropped without being disposed, so it must not
/// depend on other objects still being usable.
pub trait Dispose {
    fn dispose_managed(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn dispose_native(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Releasing a value held by a scope or a disposable stack.
///
/// Only types implementing this trait can be handed over with ownership;
/// everything else has to be opened as a borrowed (non-owning) scope.
pub trait Release {
    fn release(&self) -> Result<()>;
}

impl<T: Release + ?Sized> Release for Box<T> {
    fn release(&self) -> Result<()> {
        (**self).release()
    }
}

impl<T: Release + ?Sized> Release for Rc<T> {
    fn release(&self) -> Result<()> {
        (**self).release()
    }
}

impl<T: Release + ?Sized> Release for Arc<T> {
    fn release(&self) -> Result<()> {
        (**self).release()
    }
}

/// A value whose [`Dispose`] hooks run at most once.
pub struct Disposable<T: Dispose> {
    lifecycle: Lifecycle,
    value: T,
}

impl<T: Dispose> Disposable<T> {
    pub fn new(value: T) -> Self {
        Disposable {
            lifecycle: Lifecycle::for_type::<T>(),
            value,
        }
    }

    /// Access the wrapped value; fails once disposal has started.
    pub fn get(&self) -> Result<&T> {
        self.lifecycle.ensure_not_dispose_started()?;
        Ok(&self.value)
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }

    pub fn is_dispose_started(&self) -> bool {
        self.lifecycle.is_dispose_started()
    }

    pub fn on_disposed<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lifecycle.on_disposed(listener);
    }

    /// Run the managed phase, then the native phase, then complete.
    ///
    /// Returns `Ok(false)` if disposal was already started elsewhere. A failure
    /// of the managed phase is returned only after the native phase ran and
    /// listeners were notified.
    pub fn dispose(&self, reason: Option<&str>) -> Result<bool> {
        let owner = self.lifecycle.owner();
        let Some(mut ticket) = self.lifecycle.try_begin_dispose() else {
            log::trace!("{owner}: already disposed");
            return Ok(false);
        };
        if let Some(reason) = reason {
            ticket.set_reason(reason);
        }

        let native = NativePhase::new(owner, || self.value.dispose_native());
        let managed = self
            .value
            .dispose_managed()
            .map_err(|source| crate::cleanup_error!(owner, source));
        let native = native.run();
        ticket.end();

        DisposeError::merge(managed, native)?;
        Ok(true)
    }
}

impl<T: Dispose> Release for Disposable<T> {
    fn release(&self) -> Result<()> {
        self.dispose(None).map(|_| ())
    }
}

impl<T: Dispose + std::fmt::Debug> std::fmt::Debug for Disposable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposable")
            .field("state", &self.lifecycle.state())
            .field("value", &self.value)
            .finish()
    }
}

impl<T: Dispose> Drop for Disposable<T> {
    fn drop(&mut self) {
        finalize(&self.lifecycle, || self.value.dispose_native());
    }
}

/// Drop-path safety net: native cleanup only, errors logged and swallowed.
pub(crate) fn finalize<F>(lifecycle: &Lifecycle, native: F)
where
    F: FnOnce() -> std::result::Result<(), BoxError>,
{
    let Some(ticket) = lifecycle.try_begin_dispose() else {
        return;
    };
    let owner = lifecycle.owner();
    log::warn!("{owner}: dropped without being disposed, running native cleanup only");
    if let Err(source) = native() {
        let err = DisposeError::Finalization { object: owner, source };
        log::warn!("{err}");
    }
    ticket.end();
}
