//! Test helpers shared by the ledger's unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::Level;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

/// Counts events per level while installed.
#[derive(Clone, Default)]
pub(crate) struct LevelCounter {
    error: Arc<AtomicUsize>,
    warn: Arc<AtomicUsize>,
    info: Arc<AtomicUsize>,
    debug: Arc<AtomicUsize>,
}

impl LevelCounter {
    fn slot(&self, level: Level) -> Option<&AtomicUsize> {
        match level {
            Level::ERROR => Some(&self.error),
            Level::WARN => Some(&self.warn),
            Level::INFO => Some(&self.info),
            Level::DEBUG => Some(&self.debug),
            _ => None,
        }
    }

    pub(crate) fn count(&self, level: Level) -> usize {
        self.slot(level).map_or(0, |n| n.load(Ordering::SeqCst))
    }

    /// Install the counter as this thread's default subscriber until the guard
    /// is dropped. Works across `.await` on a current-thread runtime.
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }
}

impl<S: tracing::Subscriber> Layer<S> for LevelCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if let Some(n) = self.slot(*event.metadata().level()) {
            n.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Run `f` with a [`LevelCounter`] installed and return its `WARN` count.
pub(crate) fn with_warn_counter<T>(f: impl FnOnce() -> T) -> (T, usize) {
    let counter = LevelCounter::default();
    let out = {
        let _guard = counter.install();
        f()
    };
    (out, counter.count(Level::WARN))
}
