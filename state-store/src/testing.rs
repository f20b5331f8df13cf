//! Test helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// Number of WARN events seen by the current thread's subscriber.
#[derive(Debug, Clone, Default)]
pub(crate) struct WarningCount(Arc<AtomicUsize>);

impl WarningCount {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for WarningCount {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Count warnings logged on this thread until the guard drops.
pub(crate) fn count_warnings() -> (WarningCount, DefaultGuard) {
    let count = WarningCount::default();
    let subscriber = tracing_subscriber::registry().with(count.clone());
    (count, tracing::subscriber::set_default(subscriber))
}
