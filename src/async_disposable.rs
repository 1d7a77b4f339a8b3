//! Asynchronous counterpart of [`Disposable`](crate::Disposable).
//!
//! The managed phase is a future; the native phase stays synchronous so the
//! drop path never needs an executor.

use crate::disposable::{Release, finalize};
use crate::error::{BoxError, DisposeError, Result};
use crate::lifecycle::{Lifecycle, NativePhase};
use std::future::Future;
use std::sync::Arc;

pub trait AsyncDispose {
    fn dispose_managed_async(&self) -> impl Future<Output = std::result::Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    fn dispose_native(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Async flavour of [`Release`], used by
/// [`AsyncDisposableStack`](crate::AsyncDisposableStack).
pub trait AsyncRelease {
    fn release_async(&self) -> impl Future<Output = Result<()>> + Send;
}

impl<T: AsyncRelease + ?Sized + Sync + Send> AsyncRelease for Arc<T> {
    fn release_async(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).release_async()
    }
}

pub struct AsyncDisposable<T: AsyncDispose> {
    lifecycle: Lifecycle,
    value: T,
}

impl<T: AsyncDispose> AsyncDisposable<T> {
    pub fn new(value: T) -> Self {
        AsyncDisposable {
            lifecycle: Lifecycle::for_type::<T>(),
            value,
        }
    }

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

    /// Await the managed phase, then run the native phase and complete.
    ///
    /// Dropping the returned future after disposal started does not cancel
    /// it: the native phase still runs and listeners are still notified.
    pub async fn dispose_async(&self, reason: Option<&str>) -> Result<bool> {
        let owner = self.lifecycle.owner();
        let Some(mut ticket) = self.lifecycle.try_begin_dispose() else {
            log::trace!("{owner}: already disposed");
            return Ok(false);
        };
        if let Some(reason) = reason {
            ticket.set_reason(reason);
        }

        let native = NativePhase::new(owner, || AsyncDispose::dispose_native(&self.value));
        let managed = self
            .value
            .dispose_managed_async()
            .await
            .map_err(|source| crate::cleanup_error!(owner, source));
        let native = native.run();
        ticket.end();

        DisposeError::merge(managed, native)?;
        Ok(true)
    }

    /// Blocks the calling thread until [`dispose_async`](Self::dispose_async) finishes.
    pub fn dispose(&self, reason: Option<&str>) -> Result<bool> {
        pollster::block_on(self.dispose_async(reason))
    }
}

impl<T: AsyncDispose> Release for AsyncDisposable<T> {
    fn release(&self) -> Result<()> {
        self.dispose(None).map(|_| ())
    }
}

impl<T: AsyncDispose + Sync> AsyncRelease for AsyncDisposable<T> {
    fn release_async(&self) -> impl Future<Output = Result<()>> + Send {
        async move { self.dispose_async(None).await.map(|_| ()) }
    }
}

impl<T: AsyncDispose + std::fmt::Debug> std::fmt::Debug for AsyncDisposable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDisposable")
            .field("state", &self.lifecycle.state())
            .field("value", &self.value)
            .finish()
    }
}

impl<T: AsyncDispose> Drop for AsyncDisposable<T> {
    fn drop(&mut self) {
        finalize(&self.lifecycle, || AsyncDispose::dispose_native(&self.value));
    }
}
