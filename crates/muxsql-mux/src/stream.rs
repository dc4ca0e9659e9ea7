//! One logical request/response channel inside a connection.
//!
//! ```text
//! START ──(first non-data message handled)──▶ ESTABLISHED
//!   │                                             │
//!   └────────── close / error / loss ─────────────┴──▶ CLOSED (terminal)
//! ```

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use muxsql_frame::{Frame, FrameError, Message, DEFAULT_MAX_PAYLOAD};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{MuxError, Result};

/// Lifecycle state of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Start,
    Established,
    Closed,
}

type Observer = Box<dyn FnMut(StreamState) + Send>;

/// Handle to a stream. Clones share the same state.
///
/// Sending enqueues onto the connection's bounded outgoing queue and blocks
/// while it is full, so the send methods must run on a blocking thread
/// (a `spawn_blocking` task or a plain OS thread), never inside async code.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<Inner>,
}

struct Inner {
    id: u32,
    state: Mutex<StreamState>,
    observers: Mutex<Vec<Observer>>,
    outgoing: mpsc::Sender<Frame>,
    max_payload: usize,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Stream {
    /// A fresh stream in `Start` whose frames go to `outgoing`.
    ///
    /// Connections create their own streams; this is public for handlers
    /// driven outside a connection.
    pub fn new(id: u32, outgoing: mpsc::Sender<Frame>) -> Self {
        Self::with_max_payload(id, outgoing, DEFAULT_MAX_PAYLOAD)
    }

    /// Like [`Stream::new`], refusing messages that encode to more than
    /// `max_payload` bytes.
    pub fn with_max_payload(id: u32, outgoing: mpsc::Sender<Frame>, max_payload: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(StreamState::Start),
                observers: Mutex::new(Vec::new()),
                outgoing,
                max_payload,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.inner.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Send a message to the client.
    ///
    /// A message too large for one frame is refused here and nothing is
    /// queued; the stream stays usable.
    pub fn send(&self, message: &Message) -> Result<()> {
        let payload = message.encode();
        if payload.len() > self.inner.max_payload {
            return Err(MuxError::Frame(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.inner.max_payload,
            }));
        }
        self.enqueue(Frame::message(self.id(), payload))
    }

    /// Send a data chunk; `fin` marks the end of a logical batch.
    pub fn send_data(&self, payload: impl Into<Bytes>, fin: bool) -> Result<()> {
        self.send(&Message::data(payload, fin))
    }

    /// Report an error to the client and close the stream.
    ///
    /// No-op on a closed stream.
    pub fn error(&self, code: u32, message: &str) {
        if self.mark_closed() {
            trace!(stream = self.id(), code, "resetting stream");
            self.push_final(Frame::reset(self.id(), code, message));
            self.notify_closed();
        }
    }

    /// Close the stream gracefully. No-op on a closed stream.
    pub fn close(&self) {
        if self.mark_closed() {
            self.push_final(Frame::close(self.id()));
            self.notify_closed();
        }
    }

    /// Close without telling the client (connection loss, remote reset).
    ///
    /// Returns `true` if this call performed the transition. Safe to call
    /// from async code.
    pub fn close_local(&self) -> bool {
        if self.mark_closed() {
            self.notify_closed();
            true
        } else {
            false
        }
    }

    /// `Start → Established`; no-op in any other state.
    pub fn establish(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state != StreamState::Start {
                return;
            }
            *state = StreamState::Established;
        }

        let mut current = mem::take(&mut *lock(&self.inner.observers));
        for observer in current.iter_mut() {
            observer(StreamState::Established);
        }
        {
            let mut observers = lock(&self.inner.observers);
            current.append(&mut observers);
            *observers = current;
        }
        // A close that raced with the notification above found the list empty.
        if self.is_closed() {
            self.notify_closed();
        }
    }

    /// Register a callback for state transitions.
    ///
    /// Every observer sees `Closed` exactly once and is dropped afterwards.
    /// Registering on a closed stream runs the observer immediately.
    pub fn observe_lifecycle(&self, observer: impl FnMut(StreamState) + Send + 'static) {
        let mut observer: Observer = Box::new(observer);
        {
            let mut observers = lock(&self.inner.observers);
            if !self.is_closed() {
                observers.push(observer);
                return;
            }
        }
        observer(StreamState::Closed);
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(MuxError::StreamClosed(self.id()));
        }
        self.inner
            .outgoing
            .blocking_send(frame)
            .map_err(|_| MuxError::Disconnected("connection writer stopped".to_string()))
    }

    // A gone writer means the connection is shutting down and the client
    // will not see this frame anyway.
    fn push_final(&self, frame: Frame) {
        let _ = self.inner.outgoing.blocking_send(frame);
    }

    fn mark_closed(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if *state == StreamState::Closed {
            return false;
        }
        *state = StreamState::Closed;
        true
    }

    fn notify_closed(&self) {
        let observers = mem::take(&mut *lock(&self.inner.observers));
        for mut observer in observers {
            observer(StreamState::Closed);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
