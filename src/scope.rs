//! Thread-scoped ambient values.
//!
//! Opening a [`Scope`] makes its value the *current* value of type `T` on the
//! calling thread until the scope is disposed. Scopes of the same type nest
//! strictly: each entry remembers the entry that was on top when it was
//! opened, and only the top entry may be disposed.
//!
//! Dropping a [`Scope`] handle out of order cannot be reported to a caller.
//! The entry is then marked abandoned: it stays on the stack until every
//! entry above it is closed, at which point it is popped and its value
//! released, with an error logged.
//!
//! The current entry is tracked per thread and is never propagated to other
//! threads. [`Scope`] and [`ScopeRef`] are `!Send`, so a scope cannot be held
//! across an `.await` inside a `Send` future or moved to another thread.
//!
//! # Example
//!
//! ```
//! use disposable::Scope;
//!
//! struct RequestId(u64);
//!
//! let outer = Scope::open_borrowed(RequestId(1));
//! {
//!     let inner = Scope::open_borrowed(RequestId(2));
//!     assert_eq!(Scope::<RequestId>::current().unwrap().value().0, 2);
//!     inner.dispose().unwrap();
//! }
//! assert_eq!(Scope::<RequestId>::current().unwrap().value().0, 1);
//! outer.dispose().unwrap();
//! assert!(Scope::<RequestId>::current().is_none());
//! ```

use crate::disposable::Release;
use crate::error::{DisposeError, Result};
use crate::lifecycle::Lifecycle;
use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

thread_local! {
    /// Innermost open entry per value type on this thread.
    static SCOPE_TOPS: RefCell<HashMap<TypeId, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

struct ScopeNode<T: 'static> {
    value: T,
    release: Option<fn(&T) -> Result<()>>,
    parent: Option<Rc<ScopeNode<T>>>,
    depth: usize,
    lifecycle: Lifecycle,
    abandoned: Cell<bool>,
}

impl<T: 'static> ScopeNode<T> {
    fn release_value(&self) -> Result<()> {
        match self.release {
            Some(release) => release(&self.value),
            None => Ok(()),
        }
    }
}

// Closes an entry whose handle was dropped while it was not on top.
fn close_abandoned<T: 'static>(node: &ScopeNode<T>) {
    let Some(ticket) = node.lifecycle.try_begin_dispose() else {
        return;
    };
    log::error!(
        "{}: closing abandoned scope at depth {}",
        std::any::type_name::<T>(),
        node.depth
    );
    if let Err(err) = node.release_value() {
        log::error!("{err}");
    }
    ticket.end();
}

fn top<T: 'static>() -> Option<Rc<ScopeNode<T>>> {
    SCOPE_TOPS
        .try_with(|tops| tops.borrow().get(&TypeId::of::<T>()).cloned())
        .ok()
        .flatten()
        .and_then(|node| node.downcast::<ScopeNode<T>>().ok())
}

fn set_top<T: 'static>(node: Option<Rc<ScopeNode<T>>>) {
    let result = SCOPE_TOPS.try_with(|tops| {
        let mut tops = tops.borrow_mut();
        match node {
            Some(node) => {
                tops.insert(TypeId::of::<T>(), node as Rc<dyn Any>);
            }
            None => {
                tops.remove(&TypeId::of::<T>());
            }
        }
    });
    if result.is_err() {
        log::warn!("{}: thread-local scope storage already destroyed", std::any::type_name::<T>());
    }
}

/// Handle of an open scope entry. Disposing it (explicitly or by dropping it)
/// pops the entry and, for owning scopes, releases the value.
#[must_use = "the scope is closed when the handle is dropped"]
pub struct Scope<T: 'static> {
    node: Rc<ScopeNode<T>>,
}

/// Shared view of a scope entry, as returned by [`Scope::current`].
pub struct ScopeRef<T: 'static> {
    node: Rc<ScopeNode<T>>,
}

impl<T: 'static> Scope<T> {
    fn push(value: T, release: Option<fn(&T) -> Result<()>>) -> Self {
        let parent = top::<T>();
        let depth = parent.as_ref().map_or(1, |p| p.depth + 1);
        let node = Rc::new(ScopeNode {
            value,
            release,
            parent,
            depth,
            lifecycle: Lifecycle::for_type::<Scope<T>>(),
            abandoned: Cell::new(false),
        });
        set_top(Some(Rc::clone(&node)));
        log::trace!("{}: scope opened at depth {depth}", std::any::type_name::<T>());
        Scope { node }
    }

    /// Open an owning scope: disposing it releases `value`.
    pub fn open(value: T) -> Self
    where
        T: Release,
    {
        Self::push(value, Some(<T as Release>::release))
    }

    /// Open a scope that only references `value` and never releases it.
    pub fn open_borrowed(value: T) -> Self {
        Self::push(value, None)
    }

    /// Like [`open`](Self::open), rejecting an absent value before any
    /// thread-local state is touched.
    pub fn try_open(value: Option<T>) -> Result<Self>
    where
        T: Release,
    {
        match value {
            Some(value) => Ok(Self::open(value)),
            None => Err(DisposeError::InvalidArgument {
                name: "value",
                message: format!("cannot open a scope of {} without a value", std::any::type_name::<T>()),
            }),
        }
    }

    /// Innermost open entry of `T` on this thread.
    pub fn current() -> Option<ScopeRef<T>> {
        top::<T>().map(|node| ScopeRef { node })
    }

    /// Every open entry of `T` on this thread, outermost first.
    pub fn all_ancestors() -> Vec<ScopeRef<T>> {
        let mut chain = Vec::new();
        let mut cursor = top::<T>();
        while let Some(node) = cursor {
            cursor = node.parent.clone();
            chain.push(ScopeRef { node });
        }
        chain.reverse();
        chain
    }

    /// Number of open entries of `T` on this thread, abandoned entries still
    /// below the current one included.
    pub fn depth() -> usize {
        top::<T>().map_or(0, |node| node.depth)
    }

    /// Run `f` with an owning scope around `value`; the scope is disposed when
    /// `f` returns or unwinds.
    pub fn with<R>(value: T, f: impl FnOnce(&Scope<T>) -> R) -> Result<R>
    where
        T: Release,
    {
        let scope = Self::open(value);
        let result = f(&scope);
        scope.close_or_abandon()?;
        Ok(result)
    }

    pub fn with_borrowed<R>(value: T, f: impl FnOnce(&Scope<T>) -> R) -> Result<R> {
        let scope = Self::open_borrowed(value);
        let result = f(&scope);
        scope.close_or_abandon()?;
        Ok(result)
    }

    pub fn value(&self) -> &T {
        &self.node.value
    }

    pub fn owns_value(&self) -> bool {
        self.node.release.is_some()
    }

    pub fn parent(&self) -> Option<ScopeRef<T>> {
        self.node.parent.clone().map(|node| ScopeRef { node })
    }

    /// 1 for an outermost entry.
    pub fn nesting_depth(&self) -> usize {
        self.node.depth
    }

    pub fn entry(&self) -> ScopeRef<T> {
        ScopeRef {
            node: Rc::clone(&self.node),
        }
    }

    pub fn is_current(&self) -> bool {
        top::<T>().is_some_and(|top| Rc::ptr_eq(&top, &self.node))
    }

    pub fn is_disposed(&self) -> bool {
        self.node.lifecycle.is_disposed()
    }

    pub fn is_dispose_started(&self) -> bool {
        self.node.lifecycle.is_dispose_started()
    }

    pub fn ensure_not_disposed(&self) -> Result<()> {
        self.node.lifecycle.ensure_not_disposed()
    }

    pub fn ensure_not_dispose_started(&self) -> Result<()> {
        self.node.lifecycle.ensure_not_dispose_started()
    }

    pub fn on_disposed<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.node.lifecycle.on_disposed(listener);
    }

    /// Pop this entry and release its value if the scope owns it.
    ///
    /// Returns `Ok(false)` if the entry was already disposed. Fails with
    /// [`DisposeError::OutOfOrderDisposal`] if another entry of `T` is open on
    /// top of this one; the stack is left untouched in that case.
    pub fn dispose(&self) -> Result<bool> {
        if self.node.lifecycle.is_dispose_started() {
            return Ok(false);
        }
        let current = top::<T>();
        if !current.as_ref().is_some_and(|top| Rc::ptr_eq(top, &self.node)) {
            return Err(DisposeError::OutOfOrderDisposal {
                scope: std::any::type_name::<T>(),
                depth: self.node.depth,
                top_depth: current.map(|top| top.depth),
            });
        }
        let Some(ticket) = self.node.lifecycle.try_begin_dispose() else {
            return Ok(false);
        };

        // Abandoned entries directly below this one are popped along with it.
        let mut parent = self.node.parent.clone();
        let mut abandoned = Vec::new();
        while let Some(node) = parent.clone().filter(|node| node.abandoned.get()) {
            parent = node.parent.clone();
            abandoned.push(node);
        }
        set_top(parent);
        log::trace!("{}: scope closed at depth {}", std::any::type_name::<T>(), self.node.depth);
        let released = self.node.release_value();
        ticket.end();
        for node in abandoned {
            close_abandoned(&node);
        }
        released.map(|()| true)
    }

    // Disposes, or marks the entry abandoned when it is not on top so that
    // closing the entries above it also closes this one.
    fn close_or_abandon(&self) -> Result<bool> {
        self.dispose().inspect_err(|err| {
            if matches!(err, DisposeError::OutOfOrderDisposal { .. }) {
                self.node.abandoned.set(true);
            }
        })
    }
}

impl<T: 'static> Drop for Scope<T> {
    fn drop(&mut self) {
        if self.node.abandoned.get() {
            return;
        }
        if let Err(err) = self.close_or_abandon() {
            log::error!("{err}");
        }
    }
}

impl<T: std::fmt::Debug + 'static> std::fmt::Debug for Scope<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.entry().fmt(f)
    }
}

impl<T: 'static> ScopeRef<T> {
    pub fn value(&self) -> &T {
        &self.node.value
    }

    pub fn owns_value(&self) -> bool {
        self.node.release.is_some()
    }

    pub fn parent(&self) -> Option<ScopeRef<T>> {
        self.node.parent.clone().map(|node| ScopeRef { node })
    }

    pub fn nesting_depth(&self) -> usize {
        self.node.depth
    }

    pub fn is_disposed(&self) -> bool {
        self.node.lifecycle.is_disposed()
    }

    pub fn is_dispose_started(&self) -> bool {
        self.node.lifecycle.is_dispose_started()
    }
}

impl<T: 'static> Clone for ScopeRef<T> {
    fn clone(&self) -> Self {
        ScopeRef {
            node: Rc::clone(&self.node),
        }
    }
}

impl<T: 'static> PartialEq for ScopeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }
}

impl<T: 'static> Eq for ScopeRef<T> {}

impl<T: 'static> PartialEq<Scope<T>> for ScopeRef<T> {
    fn eq(&self, other: &Scope<T>) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }
}

impl<T: std::fmt::Debug + 'static> std::fmt::Debug for ScopeRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("value", &self.node.value)
            .field("depth", &self.node.depth)
            .field("owns_value", &self.owns_value())
            .field("state", &self.node.lifecycle.state())
            .finish()
    }
}
