//! Typed publish/subscribe used by caches, transmitters and sessions.
//!
//! Each component owns one [`EventBus`] for its own event enum. Subscribers
//! receive every event emitted after they subscribed, in emission order.
//! A subscription ends when the bus is closed or the owning component's
//! cancellation token fires; events already queued are still delivered.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fan-out event emitter.
pub struct EventBus<E> {
    senders: Mutex<Vec<mpsc::UnboundedSender<E>>>,
    cancel: CancellationToken,
}

impl<E: Clone> EventBus<E> {
    /// Creates a bus with its own cancellation token.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Creates a bus whose subscriptions end when `cancel` fires.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
            cancel,
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.cancel.is_cancelled() {
            self.senders.lock().push(tx);
        }
        Subscription {
            rx,
            cancel: self.cancel.clone(),
        }
    }

    /// Delivers `event` to every live subscriber, pruning dropped ones.
    pub fn emit(&self, event: E) {
        let mut senders = self.senders.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut senders = self.senders.lock();
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    /// Ends every subscription once its queue is drained.
    pub fn close(&self) {
        self.senders.lock().clear();
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.senders.lock().len())
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Receiving half of an [`EventBus`] subscription.
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
    cancel: CancellationToken,
}

impl<E> Subscription<E> {
    /// Waits for the next event; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<E> {
        tokio::select! {
            biased;
            event = self.rx.recv() => event,
            _ = self.cancel.cancelled() => self.rx.try_recv().ok(),
        }
    }

    /// Returns a queued event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(1);
        bus.emit(2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn close_delivers_queued_then_ends() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit("last");
        bus.close();
        assert_eq!(sub.recv().await, Some("last"));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn owner_token_ends_subscriptions() {
        let token = CancellationToken::new();
        let bus: EventBus<u8> = EventBus::with_token(token.clone());
        let mut sub = bus.subscribe();
        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        let _keep = bus.subscribe();
        drop(sub);
        bus.emit(());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn subscribe_after_close_ends_immediately() {
        let bus: EventBus<u8> = EventBus::new();
        bus.close();
        let mut sub = bus.subscribe();
        assert_eq!(sub.recv().await, None);
    }
}
