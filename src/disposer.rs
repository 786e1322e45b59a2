//! Cleanup callbacks and the LIFO stack that runs them.

use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;

type DisposeFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A one-shot cleanup action (unsubscribe a listener, drop a registration...).
pub struct Disposer(Option<DisposeFn>);

impl Disposer {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self(Some(Box::new(f)))
    }

    /// Infallible convenience wrapper.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move || {
            f();
            Ok(())
        })
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn dispose(mut self) -> anyhow::Result<()> {
        match self.0.take() {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Disposer").field(&self.0.is_some()).finish()
    }
}

/// Disposers collected while an extension runs, released newest first.
#[derive(Default)]
pub struct DisposerStack {
    items: Mutex<Vec<Disposer>>,
}

impl DisposerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, disposer: Disposer) {
        self.items.lock().push(disposer);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Run every disposer in LIFO order. A failing or panicking disposer is
    /// logged and the rest still run. Returns the number of failures.
    pub fn dispose_all(&self, owner: &str) -> usize {
        let drained: Vec<Disposer> = std::mem::take(&mut *self.items.lock());
        let mut failures = 0;
        for disposer in drained.into_iter().rev() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| disposer.dispose())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::error!(extension = %owner, error = %e, "Disposer failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::error!(extension = %owner, "Disposer panicked");
                }
            }
        }
        failures
    }
}
