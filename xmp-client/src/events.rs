//! Listeners for notifications the tester pushes without being asked.
use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use bytes::Bytes;
use tokio::sync::mpsc;
use xmp_protocol::{Address, Frame};

use crate::error::Result;

/// An unsolicited frame with an ok status for a command that supports pushing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub code: u16,
    pub address: Address,
    pub payload: Bytes,
}

impl From<Frame> for PushEvent {
    fn from(frame: Frame) -> Self {
        PushEvent {
            code: frame.code,
            address: frame.address,
            payload: frame.payload,
        }
    }
}

pub(crate) type Listener = Arc<dyn Fn(&PushEvent) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_code: BTreeMap<u16, Vec<(u64, Listener)>>,
}

/// Listeners keyed by command code.
#[derive(Default)]
pub(crate) struct Subscriptions {
    listeners: Mutex<Listeners>,
}

impl Subscriptions {
    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(self: &Arc<Self>, code: u16, listener: Listener) -> Subscription {
        let id = {
            let mut listeners = self.lock();
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.by_code.entry(code).or_default().push((id, listener));
            id
        };
        Subscription {
            code,
            id,
            subscriptions: Arc::downgrade(self),
        }
    }

    fn remove(&self, code: u16, id: u64) {
        let mut listeners = self.lock();
        if let Some(list) = listeners.by_code.get_mut(&code) {
            list.retain(|(other, _)| *other != id);
            if list.is_empty() {
                listeners.by_code.remove(&code);
            }
        }
    }

    /// Calls every listener of `event.code` in registration order.
    ///
    /// Listeners run outside the lock so they may subscribe or unsubscribe. A
    /// failing or panicking listener is logged and skipped.
    pub(crate) fn dispatch(&self, event: &PushEvent) -> usize {
        let listeners: Vec<Listener> = match self.lock().by_code.get(&event.code) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return 0,
        };
        for listener in &listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!(
                    "Listener for {:#06x} on {} failed: {}",
                    event.code,
                    event.address,
                    e
                ),
                Err(_) => log::warn!(
                    "Listener for {:#06x} on {} panicked",
                    event.code,
                    event.address
                ),
            }
        }
        listeners.len()
    }

    /// Drops every listener. Channel listeners see their stream end.
    pub(crate) fn clear(&self) {
        let removed = std::mem::take(&mut self.lock().by_code);
        drop(removed);
    }

    pub(crate) fn count(&self, code: u16) -> usize {
        self.lock().by_code.get(&code).map_or(0, Vec::len)
    }
}

/// Keeps a listener registered. The listener is removed when this is dropped.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    code: u16,
    id: u64,
    subscriptions: Weak<Subscriptions>,
}

impl Subscription {
    pub fn code(&self) -> u16 {
        self.code
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscriptions) = self.subscriptions.upgrade() {
            subscriptions.remove(self.code, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("code", &self.code)
            .field("id", &self.id)
            .finish()
    }
}

/// Pushed events of one command code, delivered through a channel.
pub struct Events {
    receiver: mpsc::UnboundedReceiver<PushEvent>,
    _subscription: Subscription,
}

impl Events {
    pub(crate) fn new(subscriptions: &Arc<Subscriptions>, code: u16) -> Events {
        let (tx, receiver) = mpsc::unbounded_channel();
        let subscription = subscriptions.add(
            code,
            Arc::new(move |event: &PushEvent| {
                // A closed receiver means the `Events` is being dropped.
                let _ = tx.send(event.clone());
                Ok(())
            }),
        );
        Events {
            receiver,
            _subscription: subscription,
        }
    }

    /// Waits for the next event. Returns `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.receiver.recv().await
    }

    /// Returns an already received event without waiting.
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.receiver.try_recv().ok()
    }
}
