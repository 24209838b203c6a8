//! Unit addresses and reply channels.
//!
//! Units never hold references to each other's state. They hold a
//! [`Recipient`], a cloneable sink that wraps a message into the receiving
//! unit's own inbox type, plus an [`Address`] that identifies the receiver for
//! equality (unsubscribe, deduplication).
//!
//! ## Fire-and-ask
//!
//! A unit that needs an answer without blocking its own inbox passes a
//! `Reply::To(recipient)` pointing back at itself; the answer then arrives as
//! an ordinary inbox message. Callers outside the unit tree (tests, the bridge)
//! use `Reply::Once` with a `oneshot` channel instead.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Stable identity of a running unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(Uuid);

impl Address {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A cloneable, type-erased sink for messages of type `M`.
pub struct Recipient<M> {
    address: Address,
    deliver: Arc<dyn Fn(M) -> bool + Send + Sync>,
}

impl<M> Clone for Recipient<M> {
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            deliver: Arc::clone(&self.deliver),
        }
    }
}

impl<M> core::fmt::Debug for Recipient<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Recipient").field("address", &self.address).finish()
    }
}

impl<M: Send + 'static> Recipient<M> {
    /// Deliver into an unbounded inbox, wrapping each message with `wrap`.
    pub fn from_sender<T, F>(address: Address, sender: mpsc::UnboundedSender<T>, wrap: F) -> Self
    where
        T: Send + 'static,
        F: Fn(M) -> T + Send + Sync + 'static,
    {
        Self {
            address,
            deliver: Arc::new(move |message| sender.send(wrap(message)).is_ok()),
        }
    }

    /// Like [`Recipient::from_sender`], but does not keep the inbox alive.
    ///
    /// Units use this to hand out addresses of themselves without creating a
    /// reference cycle through their own channel.
    pub fn from_weak<T, F>(address: Address, sender: mpsc::WeakUnboundedSender<T>, wrap: F) -> Self
    where
        T: Send + 'static,
        F: Fn(M) -> T + Send + Sync + 'static,
    {
        Self {
            address,
            deliver: Arc::new(move |message| match sender.upgrade() {
                Some(tx) => tx.send(wrap(message)).is_ok(),
                None => false,
            }),
        }
    }

    /// Deliver through an arbitrary function. Returning `false` marks the
    /// recipient as gone.
    pub fn from_fn<F>(address: Address, deliver: F) -> Self
    where
        F: Fn(M) -> bool + Send + Sync + 'static,
    {
        Self {
            address,
            deliver: Arc::new(deliver),
        }
    }

    /// Fire-and-forget delivery. Returns `false` once the receiver is gone.
    pub fn tell(&self, message: M) -> bool {
        (self.deliver)(message)
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

/// Where the answer to a request should go.
#[derive(Debug)]
pub enum Reply<M> {
    /// Nobody is waiting.
    Ignore,
    /// A caller outside the unit tree awaits a single answer.
    Once(oneshot::Sender<M>),
    /// Another unit wants the answer in its inbox.
    To(Recipient<M>),
}

impl<M: Send + 'static> Reply<M> {
    pub fn none() -> Self {
        Reply::Ignore
    }

    /// Deliver the answer. Returns `false` when someone was waiting but is gone.
    pub fn send(self, message: M) -> bool {
        match self {
            Reply::Ignore => true,
            Reply::Once(tx) => tx.send(message).is_ok(),
            Reply::To(recipient) => recipient.tell(message),
        }
    }
}

impl<M> From<oneshot::Sender<M>> for Reply<M> {
    fn from(tx: oneshot::Sender<M>) -> Self {
        Reply::Once(tx)
    }
}

impl<M> From<Recipient<M>> for Reply<M> {
    fn from(recipient: Recipient<M>) -> Self {
        Reply::To(recipient)
    }
}
