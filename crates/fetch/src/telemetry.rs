use crate::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

/// Structured request telemetry. Events are emitted for every attempt the
/// client makes, including retries, so a handler can account for wasted work
/// as well as successes.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    RequestStarted {
        url: String,
        method: &'static str,
    },
    RequestCompleted {
        url: String,
        status: u16,
        duration: Duration,
        bytes: u64,
    },
    RequestRetried {
        url: String,
        attempt: u32,
        reason: String,
        backoff: Duration,
    },
    RequestFailed {
        url: String,
        kind: ErrorKind,
        duration: Duration,
    },
}

pub trait TelemetryHandler: Send + Sync {
    fn on_event(&self, event: &TelemetryEvent);
}

impl<F> TelemetryHandler for F
where
    F: Fn(&TelemetryEvent) + Send + Sync,
{
    fn on_event(&self, event: &TelemetryEvent) {
        self(event)
    }
}

/// The single registration path for telemetry handlers. Handlers are invoked
/// inline on the requesting task and must be fast.
#[derive(Default)]
pub(crate) struct Registry {
    handlers: std::sync::RwLock<Vec<Arc<dyn TelemetryHandler>>>,
}

impl Registry {
    pub(crate) fn subscribe(&self, handler: Arc<dyn TelemetryHandler>) {
        self.handlers.write().unwrap().push(handler);
    }

    pub(crate) fn emit(&self, event: TelemetryEvent) {
        for handler in self.handlers.read().unwrap().iter() {
            handler.on_event(&event);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handlers_receive_events_in_registration_order() {
        let registry = Registry::default();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        registry.subscribe(Arc::new(move |_: &TelemetryEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(TelemetryEvent::RequestStarted {
            url: "https://example.org/".into(),
            method: "GET",
        });
        registry.emit(TelemetryEvent::RequestFailed {
            url: "https://example.org/".into(),
            kind: ErrorKind::Transport,
            duration: Duration::from_millis(5),
        });

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
