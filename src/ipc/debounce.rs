//! Leading + trailing edge debouncer for bursty broadcasts.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct Window<T> {
    open: bool,
    deadline: Instant,
    pending: Option<T>,
}

struct Inner<T> {
    delay: Duration,
    sink: Box<dyn Fn(T) + Send + Sync>,
    window: Mutex<Window<T>>,
}

/// Collapses a burst of calls into at most two sink invocations: the first
/// value immediately, then the latest value once `delay` has passed with no
/// further calls.
///
/// Outside a tokio runtime every call goes straight to the sink.
pub struct Debounced<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Debounced<T> {
    pub fn new<F>(delay: Duration, sink: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                delay,
                sink: Box::new(sink),
                window: Mutex::new(Window {
                    open: false,
                    deadline: Instant::now(),
                    pending: None,
                }),
            }),
        }
    }

    pub fn call(&self, value: T) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            (self.inner.sink)(value);
            return;
        };

        {
            let mut window = self.inner.window.lock();
            window.deadline = Instant::now() + self.inner.delay;
            if window.open {
                window.pending = Some(value);
                return;
            }
            window.open = true;
        }

        (self.inner.sink)(value);
        runtime.spawn(trailing_edge(self.inner.clone()));
    }

    /// Emit the pending value now instead of waiting for the trailing edge.
    pub fn flush(&self) {
        let pending = self.inner.window.lock().pending.take();
        if let Some(value) = pending {
            (self.inner.sink)(value);
        }
    }
}

async fn trailing_edge<T: Send + 'static>(inner: Arc<Inner<T>>) {
    loop {
        let deadline = inner.window.lock().deadline;
        tokio::time::sleep_until(deadline).await;

        let pending = {
            let mut window = inner.window.lock();
            if Instant::now() < window.deadline {
                continue;
            }
            match window.pending.take() {
                Some(value) => {
                    window.deadline = Instant::now() + inner.delay;
                    value
                }
                None => {
                    window.open = false;
                    return;
                }
            }
        };
        (inner.sink)(pending);
    }
}
