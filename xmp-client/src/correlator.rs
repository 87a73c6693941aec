//! Matching replies to the requests that caused them.
//!
//! XMP frames carry no request identifier. A reply can only be attributed by its
//! command code and address, so every outstanding request waits in a FIFO queue
//! keyed by `(code, address)` and an arriving reply completes the oldest waiter
//! of its key. The tester answers requests for one key in order, which makes
//! this sound, but it also means a single lost or misattributed reply shifts
//! every later reply for that key onto the wrong waiter.
//!
//! Two rules keep the queues aligned with the wire:
//!
//! - a waiter is queued under the connection's outbox lock, right before its
//!   frame is handed to the writer task, so queue order equals wire order. A
//!   frame handed over is always written in full;
//! - a waiter that is abandoned after its frame may have reached the wire stays
//!   in the queue as a placeholder. The late reply consumes the placeholder and
//!   is dropped instead of being handed to the next waiter.
//!
//! A waiter is removed outright only when its frame was never written.
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use tokio::sync::oneshot;
use xmp_protocol::{Frame, Key};

use crate::error::{Error, Result};

struct Waiter {
    id: u64,
    /// `None` once the waiter has been abandoned.
    reply: Option<oneshot::Sender<Frame>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    queues: HashMap<Key, VecDeque<Waiter>>,
    closed: bool,
}

/// What happened to a frame handed to [`Correlator::deliver`].
#[derive(Debug)]
pub(crate) enum Delivery {
    /// The oldest waiter of the key received the frame.
    Completed,
    /// The oldest waiter of the key had been abandoned, the frame was dropped.
    Discarded,
    /// Nobody waits for this key.
    Unmatched(Frame),
}

#[derive(Default)]
pub(crate) struct Correlator {
    state: Mutex<State>,
}

impl Correlator {
    pub(crate) fn new() -> Correlator {
        Correlator::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a waiter for `key` and returns the token that resolves with its reply.
    pub(crate) fn register(self: &Arc<Self>, key: Key, command: &'static str) -> Result<Token> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::NotConnected);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.queues.entry(key.clone()).or_default().push_back(Waiter {
                id,
                reply: Some(tx),
            });
            id
        };
        Ok(Token {
            key,
            id,
            command,
            reply: rx,
            correlator: Arc::clone(self),
            finished: false,
        })
    }

    /// Hands `frame` to the oldest waiter of its key.
    pub(crate) fn deliver(&self, frame: Frame) -> Delivery {
        let key = frame.key();
        let waiter = {
            let mut state = self.lock();
            let Some(queue) = state.queues.get_mut(&key) else {
                return Delivery::Unmatched(frame);
            };
            let waiter = queue.pop_front();
            if queue.is_empty() {
                state.queues.remove(&key);
            }
            waiter
        };
        match waiter {
            Some(Waiter {
                reply: Some(tx), ..
            }) => {
                // The receiver may be going away concurrently, the reply is
                // consumed either way.
                let _ = tx.send(frame);
                Delivery::Completed
            }
            Some(Waiter { reply: None, id }) => {
                log::debug!(
                    "Dropping late reply for abandoned request {} ({:#06x} on {})",
                    id,
                    key.0,
                    key.1
                );
                Delivery::Discarded
            }
            None => Delivery::Unmatched(frame),
        }
    }

    /// Turns the waiter into a placeholder that swallows its late reply.
    fn abandon(&self, key: &Key, id: u64) {
        let mut state = self.lock();
        if let Some(waiter) = state
            .queues
            .get_mut(key)
            .and_then(|queue| queue.iter_mut().find(|w| w.id == id))
        {
            waiter.reply = None;
        }
    }

    /// Removes a waiter whose frame never reached the wire.
    fn withdraw(&self, key: &Key, id: u64) {
        let mut state = self.lock();
        if let Some(queue) = state.queues.get_mut(key) {
            queue.retain(|w| w.id != id);
            if queue.is_empty() {
                state.queues.remove(key);
            }
        }
    }

    /// Fails every waiter and refuses new ones. Returns the number of waiters
    /// that were still queued, placeholders included.
    pub(crate) fn close(&self) -> usize {
        let queues = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.queues)
        };
        // Dropping the senders resolves every token with `ConnectionClosed`.
        queues.into_values().map(|queue| queue.len()).sum()
    }

    /// Number of queued waiters, placeholders included.
    pub(crate) fn pending(&self) -> usize {
        self.lock().queues.values().map(VecDeque::len).sum()
    }
}

/// The outstanding reply to one request.
///
/// Resolves with the reply frame, with [`Error::Status`] if the tester rejected
/// the request, or with [`Error::ConnectionClosed`] if the connection went away
/// first. Dropping an unresolved token is safe: its eventual reply is discarded
/// and does not reach any later request.
#[must_use = "the reply is only observed by awaiting the token"]
pub struct Token {
    key: Key,
    id: u64,
    command: &'static str,
    reply: oneshot::Receiver<Frame>,
    correlator: Arc<Correlator>,
    finished: bool,
}

impl Token {
    /// The `(code, address)` pair the reply is matched on.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Removes the waiter entirely. Only valid while its frame is unwritten.
    pub(crate) fn withdraw(mut self) {
        self.finished = true;
        self.correlator.withdraw(&self.key, self.id);
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("command", &self.command)
            .field("key", &self.key)
            .finish()
    }
}

impl Future for Token {
    type Output = Result<Frame>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let frame = match Pin::new(&mut this.reply).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => {
                this.finished = true;
                match result {
                    Ok(frame) => frame,
                    Err(_) => return Poll::Ready(Err(Error::ConnectionClosed)),
                }
            }
        };
        if frame.status.is_ok() {
            Poll::Ready(Ok(frame))
        } else {
            Poll::Ready(Err(Error::Status {
                command: this.command,
                address: frame.address,
                status: frame.status,
            }))
        }
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        if !self.finished {
            self.correlator.abandon(&self.key, self.id);
        }
    }
}
