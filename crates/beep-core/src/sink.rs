use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::audio::{AudioChunk, Sink};

/// Insertion-ordered set of audio sinks.
///
/// The registry only holds weak references: whoever registers a sink keeps it
/// alive. Sinks that have been dropped are pruned on the next broadcast.
///
/// `add`, `remove` and `broadcast` all take the same lock, so a broadcast
/// delivers to exactly the membership that existed when it started and a
/// `remove` that returns is never followed by a delivery to that sink. The
/// flip side is that a slow sink stalls the producer and anyone waiting to
/// change membership.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Mutex<Vec<Weak<dyn Sink>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink`. Returns `false` if it was already registered.
    pub fn add(&self, sink: &Arc<dyn Sink>) -> bool {
        let mut guard = self.sinks.lock();
        if guard.iter().any(|existing| same_sink(existing, sink)) {
            return false;
        }
        guard.push(Arc::downgrade(sink));
        true
    }

    /// Unregisters `sink`. Unknown sinks are ignored; returns whether anything
    /// was removed.
    pub fn remove(&self, sink: &Arc<dyn Sink>) -> bool {
        let mut guard = self.sinks.lock();
        let before = guard.len();
        guard.retain(|existing| !same_sink(existing, sink));
        guard.len() != before
    }

    /// Delivers `chunk` to every live sink in registration order and returns
    /// how many received it.
    pub fn broadcast(&self, chunk: &AudioChunk) -> usize {
        let mut guard = self.sinks.lock();
        let mut delivered = 0;
        guard.retain(|weak| match weak.upgrade() {
            Some(sink) => {
                sink.deliver(chunk);
                delivered += 1;
                true
            }
            None => false,
        });
        trace!(
            target = "beep::sink",
            delivered,
            frames = chunk.frames(),
            "broadcast chunk"
        );
        delivered
    }

    /// Number of registered sinks that are still alive.
    pub fn len(&self) -> usize {
        self.sinks
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("sinks", &self.sinks.lock().len())
            .finish()
    }
}

fn same_sink(weak: &Weak<dyn Sink>, sink: &Arc<dyn Sink>) -> bool {
    std::ptr::addr_eq(weak.as_ptr(), Arc::as_ptr(sink))
}
