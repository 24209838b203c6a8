//! Per-unit subscriber set with best-effort fan-out.

use tracing::debug;

use crate::address::{Address, Recipient};

/// The set of units currently interested in an owning unit's events.
///
/// - Owned by exactly one unit, never shared
/// - Not persisted: subscribers re-subscribe after their own restart
/// - Best-effort fan-out; dead subscribers are dropped while publishing
#[derive(Debug)]
pub struct SubscriberSet<M> {
    subscribers: Vec<Recipient<M>>,
}

impl<M> Default for SubscriberSet<M> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<M: Clone + Send + 'static> SubscriberSet<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. Subscribing the same address twice replaces the
    /// earlier recipient, so every event is still delivered once.
    ///
    /// Returns `true` if the address was not subscribed before.
    pub fn subscribe(&mut self, recipient: Recipient<M>) -> bool {
        match self
            .subscribers
            .iter_mut()
            .find(|r| r.address() == recipient.address())
        {
            Some(existing) => {
                *existing = recipient;
                false
            }
            None => {
                self.subscribers.push(recipient);
                true
            }
        }
    }

    /// Returns `true` if the address was subscribed.
    pub fn unsubscribe(&mut self, address: Address) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|r| r.address() != address);
        before != self.subscribers.len()
    }

    /// Deliver `message` to every subscriber and return how many accepted it.
    pub fn publish(&mut self, message: &M) -> usize {
        self.subscribers.retain(|r| {
            let delivered = r.tell(message.clone());
            if !delivered {
                debug!(subscriber = %r.address(), "dropping dead subscriber");
            }
            delivered
        });
        self.subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
