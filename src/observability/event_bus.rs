//! Tokio broadcast event bus for run notifications.

use crate::models::{DedupEvent, RunId};
use tokio::sync::broadcast;

/// Default buffer capacity.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

/// Event bus broadcasting [`DedupEvent`]s to any number of subscribers.
///
/// Publishing never blocks; slow subscribers lag and miss events rather than
/// holding up the run.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DedupEvent>,
}

/// Filtered receiver that yields events matching a predicate.
pub struct FilteredReceiver<F> {
    receiver: broadcast::Receiver<DedupEvent>,
    predicate: F,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Creates a new event bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers (best effort).
    #[allow(clippy::cast_precision_loss)]
    pub fn publish(&self, event: DedupEvent) {
        metrics::counter!("dedup_events_published_total", "event_type" => event.event_type())
            .increment(1);
        // No subscribers is normal for library use.
        if self.sender.send(event).is_ok() {
            metrics::gauge!("dedup_event_bus_queue_depth").set(self.sender.len() as f64);
        }
    }

    /// Subscribes to every event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DedupEvent> {
        self.sender.subscribe()
    }

    /// Subscribes with a predicate to filter events by type or attributes.
    #[must_use]
    pub fn subscribe_filtered<F>(&self, predicate: F) -> FilteredReceiver<F>
    where
        F: Fn(&DedupEvent) -> bool,
    {
        FilteredReceiver {
            receiver: self.sender.subscribe(),
            predicate,
        }
    }

    /// Subscribes to events matching the provided event type.
    #[must_use]
    pub fn subscribe_event_type(
        &self,
        event_type: &'static str,
    ) -> FilteredReceiver<impl Fn(&DedupEvent) -> bool + use<>> {
        self.subscribe_filtered(move |event| event.event_type() == event_type)
    }

    /// Subscribes to the events of one run.
    #[must_use]
    pub fn subscribe_run(&self, run_id: RunId) -> FilteredReceiver<impl Fn(&DedupEvent) -> bool + use<>> {
        self.subscribe_filtered(move |event| event.run_id() == &run_id)
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&DedupEvent) -> bool,
{
    /// Receives the next event that matches the predicate.
    pub async fn recv(&mut self) -> Result<DedupEvent, broadcast::error::RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if (self.predicate)(&event) => return Ok(event),
                Ok(_) => {},
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    metrics::counter!("dedup_event_bus_lagged_total").increment(skipped);
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the next matching event already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<DedupEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if (self.predicate)(&event) => return Some(event),
                Ok(_) => {},
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    metrics::counter!("dedup_event_bus_lagged_total").increment(skipped);
                },
                Err(_) => return None,
            }
        }
    }
}
