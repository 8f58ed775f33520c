//! Event emitter abstraction for decoupling the engine from transport.
//!
//! Subsystems depend on the [`EventEmitter`] trait rather than a concrete
//! channel type, so the session owner can wire events to an mpsc channel, a
//! callback, or a platform bridge without touching engine internals.

use tokio::sync::broadcast;

use super::EngineEvent;

/// Trait for emitting [`EngineEvent`]s without knowledge of transport.
///
/// # Example
///
/// ```ignore
/// struct MyPipeline {
///     emitter: Arc<dyn EventEmitter>,
/// }
///
/// impl MyPipeline {
///     fn on_rumble(&self, event: RumbleEvent) {
///         self.emitter.emit(event.into());
///     }
/// }
/// ```
pub trait EventEmitter: Send + Sync {
    /// Emits an engine event.
    fn emit(&self, event: EngineEvent);
}

/// No-op emitter for headless use or testing.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: EngineEvent) {}
}

/// Logging emitter for debugging and development.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: EngineEvent) {
        tracing::debug!(?event, "engine_event");
    }
}

/// Bridges [`EngineEvent`]s to a `tokio::sync::broadcast` channel so a
/// session owner can subscribe to them from any number of tasks.
///
/// Every [`TakionSession`](crate::session::TakionSession) owns one of these
/// internally; [`TakionSessionHandle::subscribe_events`](crate::session::TakionSessionHandle::subscribe_events)
/// hands out receivers against it. A session can additionally be configured
/// with another [`EventEmitter`] (a logging emitter, a platform callback)
/// that receives the same events alongside the broadcast.
#[derive(Clone)]
pub struct BroadcastEventEmitter {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastEventEmitter {
    /// Creates a new bridge with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns a new receiver for the broadcast channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl EventEmitter for BroadcastEventEmitter {
    fn emit(&self, event: EngineEvent) {
        if let Err(err) = self.tx.send(event) {
            tracing::trace!(?err, "no event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FrameStatus, RumbleEvent, StreamHealthEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Test emitter that counts events by kind.
    struct CountingEventEmitter {
        rumble_count: AtomicUsize,
        health_count: AtomicUsize,
    }

    impl CountingEventEmitter {
        fn new() -> Self {
            Self {
                rumble_count: AtomicUsize::new(0),
                health_count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, event: EngineEvent) {
            match event {
                EngineEvent::Rumble(_) => {
                    self.rumble_count.fetch_add(1, Ordering::SeqCst);
                }
                EngineEvent::Health(_) => {
                    self.health_count.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter::new());

        emitter.emit(EngineEvent::Rumble(RumbleEvent { left: 0, right: 0 }));
        emitter.emit(EngineEvent::Health(StreamHealthEvent {
            ts: 0,
            frame_index: 0,
            status: FrameStatus::Success,
            consecutive_failures: 0,
            reused_last_frame: false,
            recovered_by_fec: false,
            message: String::new(),
        }));
        emitter.emit(EngineEvent::Rumble(RumbleEvent { left: 1, right: 1 }));

        assert_eq!(emitter.rumble_count.load(Ordering::SeqCst), 2);
        assert_eq!(emitter.health_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_emitter_accepts_everything() {
        let emitter = NoopEventEmitter;
        emitter.emit(EngineEvent::Disconnect {
            reason: None,
            timestamp: 0,
        });
    }
}
