//! Run loop shared by persistent units.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use steward_core::Aggregate;
use steward_events::LoggedCommand;

use super::persistent::{Persistent, RecoveryStep};
use super::{Flow, Stash};

/// A unit whose state lives in a [`Persistent`] core.
pub(crate) trait PersistentUnit: Send + 'static {
    type State: Aggregate<Command: LoggedCommand> + Serialize + DeserializeOwned + Send;
    type Message: Send + 'static;

    fn core(&mut self) -> &mut Persistent<Self::State>;

    /// Handle one message in CommandProcessing.
    fn handle(&mut self, message: Self::Message) -> Flow;

    /// The stash is full: answer `message` without processing it.
    fn refuse(&mut self, message: Self::Message);

    /// The inbox stayed empty for the configured inactivity period.
    fn on_idle(&mut self) -> Flow {
        Flow::Continue
    }

    /// Last call before an idle unit exits, after its queued messages were handled.
    fn on_passivate(&mut self) {}
}

/// Drive `unit` until it stops or every sender is dropped.
///
/// Recovery is stepped one entry at a time, yielding in between, and anything
/// arriving meanwhile is stashed and released in arrival order once recovery
/// completes.
pub(crate) async fn run_persistent<U: PersistentUnit>(
    mut unit: U,
    mut inbox: mpsc::UnboundedReceiver<U::Message>,
) {
    let mut stash = Stash::new(unit.core().config.stash_capacity);
    let mut replay = unit.core().load();

    while let Some(item) = replay.pop_front() {
        park_incoming(&mut unit, &mut inbox, &mut stash);
        match unit.core().recover(item) {
            Ok(RecoveryStep::Continue) => tokio::task::yield_now().await,
            Ok(RecoveryStep::Completed) => break,
            Err(aborted) => {
                error!(error = %aborted, "refusing to start");
                return;
            }
        }
    }

    park_incoming(&mut unit, &mut inbox, &mut stash);
    let stashed = stash.take_all();
    if !stashed.is_empty() {
        debug!(
            persistence_id = %unit.core().persistence_id,
            count = stashed.len(),
            "unstashing"
        );
    }
    for message in stashed {
        if unit.handle(message) == Flow::Stop {
            return;
        }
    }

    loop {
        let idle = unit.core().config.inactivity_flush;
        match tokio::time::timeout(idle, inbox.recv()).await {
            Ok(Some(message)) => {
                if unit.handle(message) == Flow::Stop {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                if unit.on_idle() == Flow::Stop {
                    close_and_drain(&mut unit, &mut inbox);
                    unit.on_passivate();
                    break;
                }
            }
        }
    }
}

/// Refuse new messages, then handle the ones already queued.
///
/// Senders see the unit as gone from here on, so anything sent after this
/// point goes to a fresh incarnation instead of being dropped.
pub(crate) fn close_and_drain<U: PersistentUnit>(
    unit: &mut U,
    inbox: &mut mpsc::UnboundedReceiver<U::Message>,
) -> usize {
    inbox.close();
    let mut handled = 0;
    while let Ok(message) = inbox.try_recv() {
        handled += 1;
        if unit.handle(message) == Flow::Stop {
            break;
        }
    }
    if handled > 0 {
        debug!(persistence_id = %unit.core().persistence_id, handled, "handled queued messages before stopping");
    }
    handled
}

fn park_incoming<U: PersistentUnit>(
    unit: &mut U,
    inbox: &mut mpsc::UnboundedReceiver<U::Message>,
    stash: &mut Stash<U::Message>,
) {
    while let Ok(message) = inbox.try_recv() {
        if let Err(message) = stash.push(message) {
            debug!(persistence_id = %unit.core().persistence_id, "stash full, refusing message");
            unit.refuse(message);
        }
    }
}

/// Deliver `message` to a unit's own inbox after `delay`.
///
/// Holds only a weak sender, so a pending timer never keeps a stopped unit
/// alive. Abort the returned handle to cancel.
pub(crate) fn schedule<T: Send + 'static>(
    inbox: mpsc::WeakUnboundedSender<T>,
    delay: Duration,
    message: T,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(sender) = inbox.upgrade() {
            let _ = sender.send(message);
        }
    })
}
