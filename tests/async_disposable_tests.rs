use disposable::{AsyncDispose, AsyncDisposable, AsyncRelease, BoxError, DisposeError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

// Initialize logger for tests
#[ctor::ctor]
fn __init_test_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default()).is_test(true).try_init();
}

/// Returns `Pending` once before completing, so the managed phase really suspends.
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            return Poll::Ready(());
        }
        self.0 = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

struct Connection {
    log: Arc<Mutex<Vec<&'static str>>>,
    managed: Arc<AtomicUsize>,
    fail_managed: bool,
}

impl Connection {
    fn new(log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
        Connection {
            log: Arc::clone(log),
            managed: Arc::new(AtomicUsize::new(0)),
            fail_managed: false,
        }
    }
}

impl AsyncDispose for Connection {
    async fn dispose_managed_async(&self) -> Result<(), BoxError> {
        self.log.lock().unwrap().push("managed:start");
        YieldOnce(false).await;
        self.managed.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("managed:end");
        if self.fail_managed {
            return Err("flush failed".into());
        }
        Ok(())
    }

    fn dispose_native(&self) -> Result<(), BoxError> {
        self.log.lock().unwrap().push("native");
        Ok(())
    }
}

#[test]
fn dispose_async_awaits_managed_before_native() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let conn = AsyncDisposable::new(Connection::new(&log));
    let listener_log = Arc::clone(&log);
    conn.on_disposed(move || listener_log.lock().unwrap().push("disposed"));

    assert!(pollster::block_on(conn.dispose_async(Some("idle timeout"))).unwrap());
    assert_eq!(*log.lock().unwrap(), vec!["managed:start", "managed:end", "native", "disposed"]);
    assert_eq!(conn.lifecycle().reason().as_deref(), Some("idle timeout"));
    assert!(!pollster::block_on(conn.dispose_async(None)).unwrap());
}

#[test]
fn sync_dispose_blocks_until_async_sequence_completes() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let conn = AsyncDisposable::new(Connection::new(&log));
    assert!(conn.dispose(None).unwrap());
    assert!(conn.is_disposed());
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn async_managed_failure_surfaces_after_native() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let conn = AsyncDisposable::new(Connection {
        fail_managed: true,
        ..Connection::new(&log)
    });
    let err = pollster::block_on(conn.dispose_async(None)).unwrap_err();
    assert!(matches!(err, DisposeError::Cleanup { .. }));
    assert_eq!(log.lock().unwrap().last(), Some(&"native"));
    assert!(conn.is_disposed());
}

#[test]
fn abandoned_dispose_future_still_completes_disposal() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let conn = AsyncDisposable::new(Connection::new(&log));
    {
        let mut fut = Box::pin(conn.dispose_async(None));
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        assert!(fut.as_mut().poll(&mut cx).is_pending());
        assert!(conn.is_dispose_started());
    }
    assert!(conn.is_disposed());
    assert_eq!(*log.lock().unwrap(), vec!["managed:start", "native"]);
    assert!(matches!(conn.get(), Err(DisposeError::AlreadyDisposed { .. })));
}

#[test]
fn drop_without_dispose_skips_managed_phase() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let conn = AsyncDisposable::new(Connection::new(&log));
    let managed = Arc::clone(&conn.get().unwrap().managed);
    drop(conn);
    assert_eq!(managed.load(Ordering::SeqCst), 0);
    assert_eq!(*log.lock().unwrap(), vec!["native"]);
}

#[test]
fn release_async_through_arc() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let conn = Arc::new(AsyncDisposable::new(Connection::new(&log)));
    pollster::block_on(conn.release_async()).unwrap();
    assert!(conn.is_disposed());
    pollster::block_on(conn.release_async()).unwrap();
    assert_eq!(conn.get().err().map(|e| e.is_use_after_dispose()), Some(true));
}
