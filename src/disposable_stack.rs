/// DisposableStack and AsyncDisposableStack
/// Collects resources and cleanup callbacks and releases them in reverse order.
use crate::async_disposable::AsyncRelease;
use crate::disposable::Release;
use crate::error::{BoxError, DisposeError, Result};
use crate::lifecycle::Lifecycle;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct Entry {
    kind: &'static str,
    run: Box<dyn FnOnce() -> Result<()> + Send>,
}

enum AsyncRun {
    Ready(Box<dyn FnOnce() -> Result<()> + Send>),
    Suspending(Box<dyn FnOnce() -> BoxFuture + Send>),
}

struct AsyncEntry {
    kind: &'static str,
    run: AsyncRun,
}

/// Entries of an [`AsyncDisposableStack`] not yet run by `dispose_async`.
///
/// If the dispose future is dropped before draining them, the synchronous
/// entries still run here and the skipped asynchronous ones are reported.
struct PendingEntries(Vec<AsyncEntry>);

impl Drop for PendingEntries {
    fn drop(&mut self) {
        if self.0.is_empty() {
            return;
        }
        log::warn!("AsyncDisposableStack: dispose abandoned with {} entries left", self.0.len());
        let mut skipped = 0;
        while let Some(entry) = self.0.pop() {
            match entry.run {
                AsyncRun::Ready(run) => {
                    if let Err(err) = run() {
                        log::warn!("AsyncDisposableStack: '{}' entry failed: {err}", entry.kind);
                    }
                }
                AsyncRun::Suspending(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!("AsyncDisposableStack: {skipped} asynchronous entries were not run");
        }
    }
}

fn lock_entries<E>(entries: &Mutex<Vec<E>>) -> MutexGuard<'_, Vec<E>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

// Registration checks the lifecycle while holding the entry lock, so an entry
// is either rejected or seen by the disposal that takes the list.
fn push_entry<E>(lifecycle: &Lifecycle, entries: &Mutex<Vec<E>>, entry: E) -> Result<()> {
    let mut entries = lock_entries(entries);
    lifecycle.ensure_not_dispose_started()?;
    entries.push(entry);
    Ok(())
}

fn take_for_move<E>(lifecycle: &Lifecycle, entries: &Mutex<Vec<E>>) -> Result<Vec<E>> {
    lifecycle.ensure_not_dispose_started()?;
    let ticket = lifecycle
        .try_begin_dispose()
        .ok_or(DisposeError::DisposeInProgress { object: lifecycle.owner() })?;
    let moved = std::mem::take(&mut *lock_entries(entries));
    ticket.end();
    Ok(moved)
}

fn callback_error(kind: &'static str, source: BoxError) -> DisposeError {
    crate::cleanup_error!(kind, source)
}

// =========================================================================
// DisposableStack
// =========================================================================

pub struct DisposableStack {
    lifecycle: Lifecycle,
    entries: Mutex<Vec<Entry>>,
}

impl Default for DisposableStack {
    fn default() -> Self {
        Self::new()
    }
}

impl DisposableStack {
    pub fn new() -> Self {
        DisposableStack {
            lifecycle: Lifecycle::for_type::<DisposableStack>(),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn from_entries(entries: Vec<Entry>) -> Self {
        DisposableStack {
            lifecycle: Lifecycle::for_type::<DisposableStack>(),
            entries: Mutex::new(entries),
        }
    }

    /// Take ownership of `value` and release it when the stack is disposed.
    pub fn use_resource<T>(&self, value: T) -> Result<()>
    where
        T: Release + Send + 'static,
    {
        let run = Box::new(move || value.release());
        push_entry(&self.lifecycle, &self.entries, Entry { kind: "use", run })
    }

    /// Hand `value` to `on_dispose` when the stack is disposed.
    pub fn adopt<V, F>(&self, value: V, on_dispose: F) -> Result<()>
    where
        V: Send + 'static,
        F: FnOnce(V) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let run = Box::new(move || on_dispose(value).map_err(|source| callback_error("DisposableStack::adopt", source)));
        push_entry(&self.lifecycle, &self.entries, Entry { kind: "adopt", run })
    }

    pub fn defer<F>(&self, on_dispose: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let run = Box::new(move || on_dispose().map_err(|source| callback_error("DisposableStack::defer", source)));
        push_entry(&self.lifecycle, &self.entries, Entry { kind: "defer", run })
    }

    /// Move every registered entry into a new stack and mark this one disposed
    /// without running anything.
    pub fn move_out(&self) -> Result<DisposableStack> {
        take_for_move(&self.lifecycle, &self.entries).map(Self::from_entries)
    }

    /// Run every entry in reverse registration order.
    ///
    /// All entries run even if some fail; failures are chained so that the
    /// last failure wraps the earlier ones as suppressed errors.
    pub fn dispose(&self) -> Result<bool> {
        let Some(ticket) = self.lifecycle.try_begin_dispose() else {
            return Ok(false);
        };
        let entries = std::mem::take(&mut *lock_entries(&self.entries));
        log::debug!("DisposableStack: disposing {} entries", entries.len());

        let mut completion_error = None;
        for entry in entries.into_iter().rev() {
            if let Err(err) = (entry.run)() {
                log::debug!("DisposableStack: '{}' entry failed: {err}", entry.kind);
                completion_error = Some(DisposeError::suppressing(err, completion_error.take()));
            }
        }
        ticket.end();

        match completion_error {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl Release for DisposableStack {
    fn release(&self) -> Result<()> {
        self.dispose().map(|_| ())
    }
}

impl Drop for DisposableStack {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            log::warn!("DisposableStack dropped with failing entries: {err}");
        }
    }
}

impl std::fmt::Debug for DisposableStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisposableStack")
            .field("state", &self.lifecycle.state())
            .field("entries", &self.len())
            .finish()
    }
}

// =========================================================================
// AsyncDisposableStack
// =========================================================================

pub struct AsyncDisposableStack {
    lifecycle: Lifecycle,
    entries: Mutex<Vec<AsyncEntry>>,
}

impl Default for AsyncDisposableStack {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncDisposableStack {
    pub fn new() -> Self {
        AsyncDisposableStack {
            lifecycle: Lifecycle::for_type::<AsyncDisposableStack>(),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, kind: &'static str, run: AsyncRun) -> Result<()> {
        push_entry(&self.lifecycle, &self.entries, AsyncEntry { kind, run })
    }

    pub fn use_resource<T>(&self, value: T) -> Result<()>
    where
        T: Release + Send + 'static,
    {
        self.push("use", AsyncRun::Ready(Box::new(move || value.release())))
    }

    pub fn use_async_resource<T>(&self, value: T) -> Result<()>
    where
        T: AsyncRelease + Send + Sync + 'static,
    {
        self.push(
            "use",
            AsyncRun::Suspending(Box::new(move || -> BoxFuture { Box::pin(async move { value.release_async().await }) })),
        )
    }

    pub fn adopt<V, F>(&self, value: V, on_dispose: F) -> Result<()>
    where
        V: Send + 'static,
        F: FnOnce(V) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let run = move || on_dispose(value).map_err(|source| callback_error("AsyncDisposableStack::adopt", source));
        self.push("adopt", AsyncRun::Ready(Box::new(run)))
    }

    pub fn defer<F>(&self, on_dispose: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let run = move || on_dispose().map_err(|source| callback_error("AsyncDisposableStack::defer", source));
        self.push("defer", AsyncRun::Ready(Box::new(run)))
    }

    pub fn defer_async<F, Fut>(&self, on_dispose: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.push(
            "defer",
            AsyncRun::Suspending(Box::new(move || -> BoxFuture {
                Box::pin(async move {
                    on_dispose()
                        .await
                        .map_err(|source| callback_error("AsyncDisposableStack::defer_async", source))
                })
            })),
        )
    }

    pub fn move_out(&self) -> Result<AsyncDisposableStack> {
        let entries = take_for_move(&self.lifecycle, &self.entries)?;
        Ok(AsyncDisposableStack {
            lifecycle: Lifecycle::for_type::<AsyncDisposableStack>(),
            entries: Mutex::new(entries),
        })
    }

    /// Await every entry in reverse registration order, chaining failures like
    /// [`DisposableStack::dispose`].
    ///
    /// Dropping the returned future part way still completes disposal: the
    /// remaining synchronous entries run and skipped asynchronous ones are
    /// logged.
    pub async fn dispose_async(&self) -> Result<bool> {
        let Some(ticket) = self.lifecycle.try_begin_dispose() else {
            return Ok(false);
        };
        // Declared after the ticket so it is dropped, and drained, first.
        let mut pending = PendingEntries(std::mem::take(&mut *lock_entries(&self.entries)));
        log::debug!("AsyncDisposableStack: disposing {} entries", pending.0.len());

        let mut completion_error = None;
        while let Some(entry) = pending.0.pop() {
            let outcome = match entry.run {
                AsyncRun::Ready(run) => run(),
                AsyncRun::Suspending(run) => run().await,
            };
            if let Err(err) = outcome {
                log::debug!("AsyncDisposableStack: '{}' entry failed: {err}", entry.kind);
                completion_error = Some(DisposeError::suppressing(err, completion_error.take()));
            }
        }
        drop(pending);
        ticket.end();

        match completion_error {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// Blocks the calling thread until [`dispose_async`](Self::dispose_async) finishes.
    pub fn dispose(&self) -> Result<bool> {
        pollster::block_on(self.dispose_async())
    }

    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl Release for AsyncDisposableStack {
    fn release(&self) -> Result<()> {
        self.dispose().map(|_| ())
    }
}

impl AsyncRelease for AsyncDisposableStack {
    fn release_async(&self) -> impl Future<Output = Result<()>> + Send {
        async move { self.dispose_async().await.map(|_| ()) }
    }
}

impl Drop for AsyncDisposableStack {
    // Entries may need an executor that is gone by now, so nothing is awaited here.
    fn drop(&mut self) {
        if self.lifecycle.is_dispose_started() {
            return;
        }
        let pending = self.len();
        if pending > 0 {
            log::warn!("AsyncDisposableStack dropped without being disposed, {pending} entries were not run");
        }
    }
}

impl std::fmt::Debug for AsyncDisposableStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDisposableStack")
            .field("state", &self.lifecycle.state())
            .field("entries", &self.len())
            .finish()
    }
}
