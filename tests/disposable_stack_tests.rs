use disposable::{AsyncDispose, AsyncDisposable, AsyncDisposableStack, BoxError, Dispose, DisposeError, Disposable, DisposableStack};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

// Initialize logger for this integration test binary so `RUST_LOG` is honored.
// Using `ctor` ensures initialization runs before tests start.
#[ctor::ctor]
fn __init_test_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default()).is_test(true).try_init();
}

type Journal = Arc<Mutex<Vec<String>>>;

struct Named {
    name: &'static str,
    journal: Journal,
}

impl Dispose for Named {
    fn dispose_managed(&self) -> Result<(), BoxError> {
        self.journal.lock().unwrap().push(format!("use:{}", self.name));
        Ok(())
    }
}

impl AsyncDispose for Named {
    async fn dispose_managed_async(&self) -> Result<(), BoxError> {
        self.journal.lock().unwrap().push(format!("async:{}", self.name));
        Ok(())
    }
}

/// Pending on the first poll, ready on the second.
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

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

#[test]
fn entries_run_in_reverse_registration_order() {
    let log = journal();
    let stack = DisposableStack::new();
    stack
        .use_resource(Disposable::new(Named {
            name: "db",
            journal: Arc::clone(&log),
        }))
        .unwrap();
    let adopt_log = Arc::clone(&log);
    stack
        .adopt(42_u32, move |v| {
            adopt_log.lock().unwrap().push(format!("adopt:{v}"));
            Ok(())
        })
        .unwrap();
    let defer_log = Arc::clone(&log);
    stack
        .defer(move || {
            defer_log.lock().unwrap().push("defer".to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(stack.len(), 3);

    assert!(stack.dispose().unwrap());
    assert_eq!(*log.lock().unwrap(), vec!["defer", "adopt:42", "use:db"]);
    assert!(stack.is_disposed());
    assert!(!stack.dispose().unwrap());
}

#[test]
fn registration_after_dispose_is_rejected() {
    let stack = DisposableStack::new();
    stack.dispose().unwrap();
    let err = stack.defer(|| Ok(())).unwrap_err();
    assert!(matches!(err, DisposeError::AlreadyDisposed { .. }));
    assert!(stack.is_empty());
}

#[test]
fn failures_are_chained_and_every_entry_runs() {
    let ran = Arc::new(AtomicUsize::new(0));
    let stack = DisposableStack::new();
    for label in ["first", "second"] {
        let ran = Arc::clone(&ran);
        stack
            .defer(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Err(format!("{label} failed").into())
            })
            .unwrap();
    }
    let ok = Arc::clone(&ran);
    stack
        .defer(move || {
            ok.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    match stack.dispose() {
        Err(DisposeError::Suppressed { error, suppressed }) => {
            // "second" runs first, so "first" is the newest failure.
            assert!(error.to_string().contains("first failed"));
            assert!(suppressed.to_string().contains("second failed"));
        }
        other => panic!("expected chained failure, got {other:?}"),
    }
    assert_eq!(ran.load(Ordering::SeqCst), 3);
}

#[test]
fn move_out_transfers_entries_without_running_them() {
    let ran = Arc::new(AtomicUsize::new(0));
    let stack = DisposableStack::new();
    let counter = Arc::clone(&ran);
    stack
        .defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let moved = stack.move_out().unwrap();
    assert!(stack.is_disposed());
    assert!(stack.move_out().is_err());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(moved.len(), 1);

    drop(stack);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    drop(moved);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn nested_stack_is_released_as_a_resource() {
    let log = journal();
    let inner = DisposableStack::new();
    let inner_log = Arc::clone(&log);
    inner
        .defer(move || {
            inner_log.lock().unwrap().push("inner".to_string());
            Ok(())
        })
        .unwrap();
    let outer = DisposableStack::new();
    outer.use_resource(inner).unwrap();
    outer.dispose().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["inner"]);
}

#[test]
fn async_stack_awaits_entries_in_reverse() {
    let log = journal();
    let stack = AsyncDisposableStack::new();
    stack
        .use_async_resource(Arc::new(AsyncDisposable::new(Named {
            name: "socket",
            journal: Arc::clone(&log),
        })))
        .unwrap();
    stack
        .use_resource(Disposable::new(Named {
            name: "file",
            journal: Arc::clone(&log),
        }))
        .unwrap();
    let deferred = Arc::clone(&log);
    stack
        .defer_async(move || async move {
            deferred.lock().unwrap().push("deferred".to_string());
            Ok(())
        })
        .unwrap();

    assert!(pollster::block_on(stack.dispose_async()).unwrap());
    assert_eq!(*log.lock().unwrap(), vec!["deferred", "use:file", "async:socket"]);
    assert!(!stack.dispose().unwrap());
}

#[test]
fn async_stack_chains_failures() {
    let stack = AsyncDisposableStack::new();
    stack.defer(|| Err("sync entry failed".into())).unwrap();
    stack
        .defer_async(|| async { Err::<(), BoxError>("async entry failed".into()) })
        .unwrap();
    match stack.dispose() {
        Err(DisposeError::Suppressed { error, suppressed }) => {
            assert!(error.to_string().contains("sync entry failed"));
            assert!(suppressed.to_string().contains("async entry failed"));
        }
        other => panic!("expected chained failure, got {other:?}"),
    }
}

#[test]
fn dropping_async_stack_does_not_run_entries() {
    let ran = Arc::new(AtomicUsize::new(0));
    let stack = AsyncDisposableStack::new();
    let counter = Arc::clone(&ran);
    stack
        .defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    drop(stack);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn abandoned_async_dispose_still_runs_sync_entries() {
    let log = journal();
    let stack = AsyncDisposableStack::new();
    let first = Arc::clone(&log);
    stack
        .defer(move || {
            first.lock().unwrap().push("first".to_string());
            Ok(())
        })
        .unwrap();
    let slow_start = Arc::clone(&log);
    stack
        .defer_async(|| async {
            YieldOnce(false).await;
            Ok(())
        })
        .unwrap();
    stack
        .defer_async(move || async move {
            slow_start.lock().unwrap().push("slow".to_string());
            YieldOnce(false).await;
            Ok(())
        })
        .unwrap();

    {
        let mut fut = Box::pin(stack.dispose_async());
        let mut cx = Context::from_waker(Waker::noop());
        assert!(fut.as_mut().poll(&mut cx).is_pending());
        assert!(stack.lifecycle().is_dispose_started());
        assert!(!stack.is_disposed());
    }
    assert!(stack.is_disposed());
    assert_eq!(*log.lock().unwrap(), vec!["slow", "first"]);
    assert!(!stack.dispose().unwrap());
}
