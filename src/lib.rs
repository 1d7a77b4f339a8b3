//! Dispose-once lifecycles and thread-scoped ambient values.
//!
//! - [`Lifecycle`] is the `NotStarted -> InProgress -> Completed` state
//!   machine that guarantees cleanup runs at most once.
//! - [`Disposable`] and [`AsyncDisposable`] run the managed and native
//!   cleanup phases of a [`Dispose`] / [`AsyncDispose`] value on top of it.
//! - [`Scope`] keeps a per-thread stack of "current" values of a type.
//! - [`DisposableStack`] and [`AsyncDisposableStack`] release a collection of
//!   resources in reverse order.
pub(crate) mod async_disposable;
pub(crate) mod disposable;
pub(crate) mod disposable_stack;
pub(crate) mod error;
pub(crate) mod lifecycle;
pub(crate) mod scope;

pub use async_disposable::{AsyncDispose, AsyncDisposable, AsyncRelease};
pub use disposable::{Dispose, Disposable, Release};
pub use disposable_stack::{AsyncDisposableStack, DisposableStack};
pub use error::{BoxError, DisposeError, Result};
pub use lifecycle::{DisposalState, DisposeTicket, Lifecycle};
pub use scope::{Scope, ScopeRef};
